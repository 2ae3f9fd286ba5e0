//! Delivery of enriched records to the aggregation service.
//!
//! Each record is POSTed as an `alpr_group` JSON document. The idempotency key
//! `{agent_uid}-{camera_id}-{event_id}` is sent as the group's `best_uuid` and
//! as an `Idempotency-Key` header, so a retry after a lost response collapses
//! into the record the service already stored. Attached images are shrunk
//! to JPEG thumbnails before they are base64-encoded into the document.

use crate::config::UploadConfig;
use crate::model::{EnrichedRecord, PlateCandidate, VehicleAttributes};
use crate::retry::{RetryError, RetryPolicy, Transient};
use crate::thumbnail::jpeg_thumbnail;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Longest response body kept in error messages
const MAX_ERROR_BODY: usize = 512;

/// Errors surfaced to the pipeline after delivery gave up
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Transient failures outlasted the retry budget
    #[error("Delivery failed after {attempts} attempts: {message}")]
    Failed { attempts: u32, message: String },

    /// The service refused the record; retrying cannot help
    #[error("Delivery rejected (status {status:?}): {message}")]
    Rejected {
        status: Option<u16>,
        message: String,
    },
}

impl Transient for DeliveryError {
    fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Failed { .. })
    }
}

/// Outcome of a single HTTP attempt
#[derive(Debug, Error)]
enum AttemptError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Server returned {status}: {body}")]
    Retryable { status: u16, body: String },

    #[error("Server returned {status}: {body}")]
    Refused { status: u16, body: String },
}

impl Transient for AttemptError {
    fn is_transient(&self) -> bool {
        !matches!(self, AttemptError::Refused { .. })
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

/// Successful delivery
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryReceipt {
    pub status: u16,
    pub attempts: u32,
}

/// Delivers enriched records to the aggregation service
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn deliver(&self, record: &EnrichedRecord) -> Result<DeliveryReceipt, DeliveryError>;

    /// Whether records should carry their images
    fn wants_images(&self) -> bool {
        false
    }
}

/// `alpr_group` upload document
#[derive(Debug, Serialize)]
pub struct GroupPayload<'a> {
    pub data_type: &'static str,
    pub version: u32,
    pub company_id: &'a str,
    pub agent_uid: &'a str,
    pub camera_id: i64,
    pub camera_name: &'a str,
    pub gps_latitude: f64,
    pub gps_longitude: f64,
    pub event_id: i64,
    pub capture_time: DateTime<Utc>,
    pub epoch_start: i64,
    pub epoch_end: i64,
    pub best_uuid: String,
    pub uuids: Vec<String>,
    pub best_plate_number: &'a str,
    pub best_confidence: f32,
    pub best_region: Option<&'a str>,
    pub best_region_confidence: Option<f32>,
    pub candidates: &'a [PlateCandidate],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_plate_number: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vehicle: Option<&'a VehicleAttributes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_plate_crop_jpeg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vehicle_crop_jpeg: Option<String>,
}

/// Base64 JPEG thumbnails attached to a payload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Thumbnails {
    pub plate_crop: Option<String>,
    pub vehicle_crop: Option<String>,
}

impl<'a> GroupPayload<'a> {
    pub fn new(company_id: &'a str, record: &'a EnrichedRecord, thumbnails: Thumbnails) -> Self {
        let key = record.idempotency_key();
        let epoch_ms = record.event.captured_at.timestamp_millis();

        Self {
            data_type: "alpr_group",
            version: 2,
            company_id,
            agent_uid: &record.agent_uid,
            camera_id: record.camera.camera_id,
            camera_name: &record.camera.name,
            gps_latitude: record.camera.latitude,
            gps_longitude: record.camera.longitude,
            event_id: record.event.event_id,
            capture_time: record.event.captured_at,
            epoch_start: epoch_ms,
            epoch_end: epoch_ms,
            uuids: vec![key.clone()],
            best_uuid: key,
            best_plate_number: &record.reading.plate,
            best_confidence: record.reading.confidence,
            best_region: record.reading.region.as_deref(),
            best_region_confidence: record.reading.region_confidence,
            candidates: &record.reading.candidates,
            source_plate_number: record.event.source_plate.as_deref(),
            vehicle: record.vehicle.as_ref(),
            best_plate_crop_jpeg: thumbnails.plate_crop,
            vehicle_crop_jpeg: thumbnails.vehicle_crop,
        }
    }
}

/// Shrink and encode one image; an undecodable image is left out.
fn encode_thumbnail(bytes: &[u8], width: u32, kind: &str) -> Option<String> {
    match jpeg_thumbnail(bytes, width) {
        Ok(jpeg) => Some(STANDARD.encode(jpeg)),
        Err(e) => {
            warn!(image = kind, error = %e, "Dropping image from upload");
            metrics::counter!("importer.upload.images_dropped").increment(1);
            None
        }
    }
}

/// HTTP uploader with bounded exponential-backoff retry
pub struct HttpUploader {
    http: Client,
    url: String,
    company_id: String,
    include_images: bool,
    plate_width: u32,
    vehicle_width: u32,
    retry: RetryPolicy,
    shutdown: CancellationToken,
}

impl HttpUploader {
    pub fn new(config: &UploadConfig) -> Result<Self, reqwest::Error> {
        let http = Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.timeout())
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;

        let retry = RetryPolicy::new(
            config.max_attempts,
            config.backoff_initial(),
            config.backoff_max(),
        );

        info!(url = %config.url, max_attempts = config.max_attempts, "HTTP uploader initialized");

        Ok(Self {
            http,
            url: config.url.clone(),
            company_id: config.company_id.clone(),
            include_images: config.include_images,
            plate_width: config.plate_thumbnail_width,
            vehicle_width: config.vehicle_thumbnail_width,
            retry,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Abandon backoff waits once shutdown is requested
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    async fn thumbnails(&self, record: &EnrichedRecord) -> Thumbnails {
        if record.plate_image.is_none() && record.overview_image.is_none() {
            return Thumbnails::default();
        }

        let plate = record.plate_image.clone();
        let overview = record.overview_image.clone();
        let (plate_width, vehicle_width) = (self.plate_width, self.vehicle_width);

        let encoded = tokio::task::spawn_blocking(move || Thumbnails {
            plate_crop: plate.and_then(|b| encode_thumbnail(&b, plate_width, "plate_crop")),
            vehicle_crop: overview.and_then(|b| encode_thumbnail(&b, vehicle_width, "vehicle_crop")),
        })
        .await;

        encoded.unwrap_or_else(|e| {
            warn!(error = %e, "Thumbnail task failed");
            Thumbnails::default()
        })
    }

    async fn attempt(&self, key: &str, body: &[u8]) -> Result<u16, AttemptError> {
        let response = self
            .http
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header(IDEMPOTENCY_HEADER, key)
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| AttemptError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(status.as_u16());
        }

        let mut text = response.text().await.unwrap_or_default();
        if text.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
        }

        if is_retryable_status(status) {
            Err(AttemptError::Retryable {
                status: status.as_u16(),
                body: text,
            })
        } else {
            Err(AttemptError::Refused {
                status: status.as_u16(),
                body: text,
            })
        }
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    #[instrument(
        skip(self, record),
        fields(camera = %record.camera.name, event_id = record.event.event_id)
    )]
    async fn deliver(&self, record: &EnrichedRecord) -> Result<DeliveryReceipt, DeliveryError> {
        let key = record.idempotency_key();
        let thumbnails = self.thumbnails(record).await;
        let payload = GroupPayload::new(&self.company_id, record, thumbnails);
        let body = serde_json::to_vec(&payload).map_err(|e| {
            DeliveryError::Rejected {
                status: None,
                message: format!("Failed to serialize payload: {}", e),
            }
        })?;

        debug!(key = %key, size_bytes = body.len(), "Uploading record");

        let started = Instant::now();
        let mut attempts = 0u32;
        let result = self
            .retry
            .run("upload", &self.shutdown, |attempt| {
                attempts = attempt;
                if attempt > 1 {
                    metrics::counter!("importer.delivery.retries").increment(1);
                }
                self.attempt(&key, &body)
            })
            .await;

        metrics::histogram!("importer.upload.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(status) => {
                debug!(key = %key, status = status, attempts = attempts, "Record delivered");
                Ok(DeliveryReceipt { status, attempts })
            }
            Err(RetryError::Permanent(e)) => {
                let status = match &e {
                    AttemptError::Refused { status, .. } => Some(*status),
                    _ => None,
                };
                metrics::counter!("importer.delivery.rejected").increment(1);
                error!(key = %key, status = ?status, error = %e, "Aggregation service rejected record");
                Err(DeliveryError::Rejected {
                    status,
                    message: e.to_string(),
                })
            }
            Err(RetryError::Exhausted { attempts, last }) | Err(RetryError::Cancelled { attempts, last }) => {
                Err(DeliveryError::Failed {
                    attempts,
                    message: last.to_string(),
                })
            }
        }
    }

    fn wants_images(&self) -> bool {
        self.include_images
    }
}
