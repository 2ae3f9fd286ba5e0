//! Fakes shared by the unit tests.

use crate::capture_source::{CaptureSource, SourceError};
use crate::image_store::{ImageError, ImageStore};
use crate::model::{
    CameraProfile, CaptureEvent, EnrichedRecord, EventId, PlateReading, RecognitionResult,
};
use crate::recognition::{PlateRecognizer, RecognitionError};
use crate::uploader::IDEMPOTENCY_HEADER;
use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub fn lane_profile() -> CameraProfile {
    CameraProfile {
        name: "Lane 1".to_string(),
        camera_id: 101,
        latitude: 47.6062,
        longitude: -122.3321,
    }
}

pub fn sample_event(camera: &str, event_id: EventId) -> CaptureEvent {
    CaptureEvent {
        event_id,
        camera_name: camera.to_string(),
        captured_at: Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap()
            + chrono::Duration::seconds(event_id),
        image_ref: format!("img-{}", event_id),
        overview_ref: None,
        source_plate: None,
    }
}

pub fn sample_reading(plate: &str) -> PlateReading {
    PlateReading {
        plate: plate.to_string(),
        confidence: 0.91,
        region: Some("ca".to_string()),
        region_confidence: Some(0.8),
        candidates: vec![],
    }
}

/// Encoded JPEG of the given size with a simple gradient
pub fn jpeg_image(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    });
    let mut out = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut out, image::ImageFormat::Jpeg)
        .unwrap();
    out.into_inner()
}

pub fn sample_record(event_id: EventId) -> EnrichedRecord {
    EnrichedRecord {
        agent_uid: "agent-1".to_string(),
        camera: lane_profile(),
        event: sample_event("Lane 1", event_id),
        reading: sample_reading("7ABC123"),
        plate_image: None,
        overview_image: None,
        vehicle: None,
    }
}

#[derive(Default)]
struct AggregatorState {
    records: Vec<(String, Value)>,
    keys: Vec<String>,
    requests: u32,
    failures: u32,
    failure_status: u16,
    lost_responses: u32,
}

/// In-process aggregation service that deduplicates by idempotency key
#[derive(Clone)]
pub struct FakeAggregator {
    addr: std::net::SocketAddr,
    state: Arc<Mutex<AggregatorState>>,
}

async fn push(
    State(state): State<Arc<Mutex<AggregatorState>>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    let mut state = state.lock();
    state.requests += 1;

    let Some(key) = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        return StatusCode::BAD_REQUEST;
    };
    state.keys.push(key.clone());

    if state.failures > 0 {
        state.failures -= 1;
        return StatusCode::from_u16(state.failure_status)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    }

    if !state.records.iter().any(|(k, _)| *k == key) {
        state.records.push((key, body));
    }

    if state.lost_responses > 0 {
        state.lost_responses -= 1;
        return StatusCode::BAD_GATEWAY;
    }

    StatusCode::OK
}

impl FakeAggregator {
    pub async fn start() -> Self {
        let state = Arc::new(Mutex::new(AggregatorState::default()));
        let app = Router::new()
            .route("/push", post(push))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}/push", self.addr)
    }

    /// Answer the next `count` requests with `status` without storing them
    pub fn fail_next(&self, count: u32, status: u16) {
        let mut state = self.state.lock();
        state.failures = count;
        state.failure_status = status;
    }

    /// Store the next `count` records but answer with a 502
    pub fn lose_responses(&self, count: u32) {
        self.state.lock().lost_responses = count;
    }

    pub fn records(&self) -> Vec<Value> {
        self.state.lock().records.iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn event_ids(&self) -> Vec<i64> {
        self.records()
            .iter()
            .filter_map(|r| r["event_id"].as_i64())
            .collect()
    }

    pub fn idempotency_keys(&self) -> Vec<String> {
        self.state.lock().keys.clone()
    }

    pub fn request_count(&self) -> u32 {
        self.state.lock().requests
    }
}

/// Capture source serving fixed events per camera
#[derive(Default)]
pub struct StaticSource {
    events: Mutex<HashMap<String, Vec<CaptureEvent>>>,
    fetches: Mutex<Vec<(String, Option<EventId>)>>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, event: CaptureEvent) {
        self.events
            .lock()
            .entry(event.camera_name.clone())
            .or_default()
            .push(event);
    }

    /// `after` values seen by `fetch_new`, in call order
    pub fn fetches(&self, camera: &str) -> Vec<Option<EventId>> {
        self.fetches
            .lock()
            .iter()
            .filter(|(c, _)| c == camera)
            .map(|(_, after)| *after)
            .collect()
    }
}

#[async_trait]
impl CaptureSource for StaticSource {
    async fn cameras(&self) -> Result<Vec<String>, SourceError> {
        let mut cameras: Vec<String> = self.events.lock().keys().cloned().collect();
        cameras.sort();
        Ok(cameras)
    }

    async fn fetch_new(
        &self,
        camera: &str,
        after: Option<EventId>,
    ) -> Result<Vec<CaptureEvent>, SourceError> {
        self.fetches.lock().push((camera.to_string(), after));

        let mut events: Vec<CaptureEvent> = self
            .events
            .lock()
            .get(camera)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| after.map_or(true, |a| e.event_id > a))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        events.sort_by_key(|e| e.event_id);
        Ok(events)
    }
}

/// Image store over an in-memory map; absent references are missing
#[derive(Default)]
pub struct MapImageStore {
    images: Mutex<HashMap<String, Vec<u8>>>,
    unavailable: Mutex<u32>,
}

impl MapImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, reference: &str, bytes: &[u8]) {
        self.images.lock().insert(reference.to_string(), bytes.to_vec());
    }

    /// Fail the next `count` loads as if the share were down
    pub fn go_offline(&self, count: u32) {
        *self.unavailable.lock() = count;
    }
}

#[async_trait]
impl ImageStore for MapImageStore {
    async fn load(&self, reference: &str) -> Result<Vec<u8>, ImageError> {
        {
            let mut unavailable = self.unavailable.lock();
            if *unavailable > 0 {
                *unavailable -= 1;
                return Err(ImageError::Unavailable {
                    reference: reference.to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::TimedOut, "share offline"),
                });
            }
        }

        self.images
            .lock()
            .get(reference)
            .cloned()
            .ok_or_else(|| ImageError::Missing {
                reference: reference.to_string(),
            })
    }
}

/// Recognizer that reads the image bytes as `PLATE[;delay_ms]`.
///
/// `NOPLATE` yields an empty result, `BADIMAGE` a rejection and
/// `ENGINEDOWN` an unavailable engine.
#[derive(Default)]
pub struct ScriptedRecognizer;

#[async_trait]
impl PlateRecognizer for ScriptedRecognizer {
    async fn recognize(
        &self,
        image: &[u8],
        _region_hint: Option<&str>,
    ) -> Result<RecognitionResult, RecognitionError> {
        let text = String::from_utf8_lossy(image).to_string();
        let (plate, delay_ms) = match text.split_once(';') {
            Some((plate, delay)) => (plate.to_string(), delay.parse().unwrap_or(0)),
            None => (text, 0),
        };

        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        match plate.as_str() {
            "NOPLATE" => Ok(RecognitionResult::default()),
            "BADIMAGE" => Err(RecognitionError::Rejected("corrupt image".to_string())),
            "ENGINEDOWN" => Err(RecognitionError::Unavailable("engine not loaded".to_string())),
            _ => Ok(RecognitionResult::new(vec![sample_reading(&plate)])),
        }
    }
}
