//! Per-camera import workers.
//!
//! Each camera runs its own loop: fetch the events after the camera's
//! checkpoint, then for each event in ascending order load the image,
//! recognize the plate, enrich it with the camera profile and, when a
//! classifier is configured, the vehicle attributes, then deliver it and
//! advance the checkpoint. An event that can never succeed is skipped and the
//! checkpoint moves past it. A transient failure stops the pass without
//! advancing, so the same event is fetched again on the next pass.

use crate::camera_directory::{CameraDirectory, UnknownCamera};
use crate::capture_source::{CaptureSource, SourceError};
use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::config::PipelineConfig;
use crate::image_store::{ImageError, ImageStore};
use crate::model::{CaptureEvent, EnrichedRecord, EventId};
use crate::recognition::{PlateRecognizer, RecognitionError};
use crate::retry::Transient;
use crate::uploader::{DeliveryError, Uploader};
use crate::vehicle::VehicleClassifier;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Why a single event could not be uploaded
#[derive(Debug, Error)]
pub enum EventError {
    #[error(transparent)]
    UnknownCamera(#[from] UnknownCamera),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Recognition(#[from] RecognitionError),

    #[error("No plate found in image")]
    NoPlate,

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

impl EventError {
    /// Short failure kind for logs and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            EventError::UnknownCamera(_) => "unknown_camera",
            EventError::Image(e) if e.is_transient() => "image_unavailable",
            EventError::Image(ImageError::Unreadable { .. }) => "image_unreadable",
            EventError::Image(_) => "image_missing",
            EventError::Recognition(e) if e.is_transient() => "recognition_unavailable",
            EventError::Recognition(_) => "recognition_error",
            EventError::NoPlate => "no_plate",
            EventError::Delivery(DeliveryError::Failed { .. }) => "delivery_failed",
            EventError::Delivery(DeliveryError::Rejected { .. }) => "delivery_rejected",
        }
    }

    /// The event can be passed over: no later attempt would succeed
    pub fn is_skippable(&self) -> bool {
        match self {
            EventError::UnknownCamera(_) | EventError::NoPlate => true,
            EventError::Image(e) => e.is_permanent(),
            EventError::Recognition(e) => e.is_permanent(),
            EventError::Delivery(_) => false,
        }
    }

    /// Needs an operator; the importer cannot resolve it by retrying
    pub fn needs_operator(&self) -> bool {
        matches!(self, EventError::Delivery(DeliveryError::Rejected { .. }))
    }
}

/// Result of processing one event
#[derive(Debug)]
pub enum EventOutcome {
    Uploaded,
    Skipped(EventError),
    Failed(EventError),
}

/// Errors that end a pass before any event is processed, or mid-batch
#[derive(Debug, Error)]
pub enum PassError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// What one pass over a camera achieved
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassSummary {
    pub fetched: usize,
    pub uploaded: usize,
    pub skipped: usize,
    /// A transient failure or rejection stopped the pass early
    pub stopped: bool,
}

/// Running totals for one camera
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerStats {
    pub passes: u64,
    pub uploaded: u64,
    pub skipped: u64,
    pub failed: u64,
    pub source_errors: u64,
    pub last_event_id: Option<EventId>,
}

/// Loop timing shared by all workers
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    pub source_retry: Duration,
    pub discovery_interval: Duration,
}

impl From<&PipelineConfig> for WorkerSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            source_retry: config.source_retry(),
            discovery_interval: config.discovery_interval(),
        }
    }
}

/// Collaborators shared by every camera worker
pub struct PipelineComponents {
    pub source: Arc<dyn CaptureSource>,
    pub images: Arc<dyn ImageStore>,
    pub recognizer: Arc<dyn PlateRecognizer>,
    pub directory: Arc<CameraDirectory>,
    pub uploader: Arc<dyn Uploader>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub classifier: Option<Arc<dyn VehicleClassifier>>,
    /// Identity of this importer instance at the aggregation service
    pub agent_uid: String,
}

type SharedStats = Arc<RwLock<BTreeMap<String, WorkerStats>>>;

/// Import loop for a single camera
pub struct CameraWorker {
    camera: String,
    components: Arc<PipelineComponents>,
    settings: WorkerSettings,
    shutdown: CancellationToken,
    stats: SharedStats,
}

impl CameraWorker {
    pub fn new(
        camera: impl Into<String>,
        components: Arc<PipelineComponents>,
        settings: WorkerSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            camera: camera.into(),
            components,
            settings,
            shutdown,
            stats: Arc::default(),
        }
    }

    fn with_stats(mut self, stats: SharedStats) -> Self {
        self.stats = stats;
        self
    }

    pub fn camera(&self) -> &str {
        &self.camera
    }

    fn record_stats(&self, update: impl FnOnce(&mut WorkerStats)) {
        let mut stats = self.stats.write();
        update(stats.entry(self.camera.clone()).or_default());
    }

    /// Poll until shutdown is requested.
    #[instrument(skip(self), fields(camera = %self.camera))]
    pub async fn run(self) {
        info!(camera = %self.camera, "Camera worker started");

        while !self.shutdown.is_cancelled() {
            let wait = match self.run_pass().await {
                // More rows may be waiting behind a batch that made progress
                Ok(summary) if summary.uploaded + summary.skipped > 0 && !summary.stopped => {
                    Duration::ZERO
                }
                Ok(_) => self.settings.poll_interval,
                Err(PassError::Source(e)) if !e.is_transient() => {
                    error!(
                        camera = %self.camera,
                        error = %e,
                        alarm = true,
                        retry_in_secs = self.settings.source_retry.as_secs(),
                        "Capture store rows do not match the expected schema"
                    );
                    metrics::counter!("importer.source.schema_errors", "camera" => self.camera.clone())
                        .increment(1);
                    self.record_stats(|s| s.source_errors += 1);
                    self.settings.source_retry
                }
                Err(PassError::Source(e)) => {
                    warn!(
                        camera = %self.camera,
                        error = %e,
                        retry_in_secs = self.settings.source_retry.as_secs(),
                        "Capture store unavailable"
                    );
                    self.record_stats(|s| s.source_errors += 1);
                    self.settings.source_retry
                }
                Err(PassError::Checkpoint(e)) => {
                    error!(camera = %self.camera, error = %e, "Checkpoint update failed");
                    self.settings.poll_interval
                }
            };

            if wait.is_zero() {
                continue;
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!(camera = %self.camera, "Camera worker stopped");
    }

    /// Fetch and process one batch for this camera.
    pub async fn run_pass(&self) -> Result<PassSummary, PassError> {
        let checkpoints = &self.components.checkpoints;
        let mut last = checkpoints.get(&self.camera).await?;
        let events = self
            .components
            .source
            .fetch_new(&self.camera, last)
            .await?;

        let mut summary = PassSummary {
            fetched: events.len(),
            ..PassSummary::default()
        };
        self.record_stats(|s| s.passes += 1);

        if events.is_empty() {
            return Ok(summary);
        }
        debug!(camera = %self.camera, after = ?last, count = events.len(), "Processing batch");

        for event in events {
            if self.shutdown.is_cancelled() {
                summary.stopped = true;
                break;
            }

            if last.map_or(false, |l| event.event_id <= l) {
                warn!(
                    camera = %self.camera,
                    event_id = event.event_id,
                    checkpoint = ?last,
                    "Ignoring event at or below checkpoint"
                );
                continue;
            }

            match self.process(&event).await {
                EventOutcome::Uploaded => {
                    checkpoints.advance(&self.camera, event.event_id).await?;
                    summary.uploaded += 1;
                    metrics::counter!("importer.events.uploaded", "camera" => self.camera.clone())
                        .increment(1);
                    self.record_stats(|s| {
                        s.uploaded += 1;
                        s.last_event_id = Some(event.event_id);
                    });
                }
                EventOutcome::Skipped(e) => {
                    warn!(
                        camera = %self.camera,
                        event_id = event.event_id,
                        kind = e.kind(),
                        error = %e,
                        "Skipping event"
                    );
                    checkpoints.advance(&self.camera, event.event_id).await?;
                    summary.skipped += 1;
                    metrics::counter!(
                        "importer.events.skipped",
                        "camera" => self.camera.clone(),
                        "kind" => e.kind()
                    )
                    .increment(1);
                    self.record_stats(|s| {
                        s.skipped += 1;
                        s.last_event_id = Some(event.event_id);
                    });
                }
                EventOutcome::Failed(e) => {
                    if e.needs_operator() {
                        error!(
                            camera = %self.camera,
                            event_id = event.event_id,
                            kind = e.kind(),
                            error = %e,
                            alarm = true,
                            "Event rejected by aggregation service, camera halted at this event"
                        );
                    } else {
                        warn!(
                            camera = %self.camera,
                            event_id = event.event_id,
                            kind = e.kind(),
                            error = %e,
                            "Event failed, will retry next pass"
                        );
                    }
                    summary.stopped = true;
                    metrics::counter!(
                        "importer.events.failed",
                        "camera" => self.camera.clone(),
                        "kind" => e.kind()
                    )
                    .increment(1);
                    self.record_stats(|s| s.failed += 1);
                    break;
                }
            }

            last = Some(event.event_id);
        }

        Ok(summary)
    }

    /// Run one event through the pipeline.
    #[instrument(skip(self, event), fields(camera = %self.camera, event_id = event.event_id))]
    pub async fn process(&self, event: &CaptureEvent) -> EventOutcome {
        match self.deliver_event(event).await {
            Ok(()) => EventOutcome::Uploaded,
            Err(e) if e.is_skippable() => EventOutcome::Skipped(e),
            Err(e) => EventOutcome::Failed(e),
        }
    }

    async fn deliver_event(&self, event: &CaptureEvent) -> Result<(), EventError> {
        let c = &self.components;

        // Resolved first: an unknown camera skips without touching the share.
        let camera = c.directory.resolve(&event.camera_name)?.clone();

        let image = c.images.load(&event.image_ref).await?;
        let reading = c
            .recognizer
            .recognize(&image, None)
            .await?
            .into_best()
            .ok_or(EventError::NoPlate)?;

        let with_images = c.uploader.wants_images();
        let wants_overview = with_images || c.classifier.is_some();
        let overview_image = match (&event.overview_ref, wants_overview) {
            (Some(reference), true) if *reference != event.image_ref => {
                match c.images.load(reference).await {
                    Ok(bytes) => Some(bytes),
                    Err(e) => {
                        debug!(error = %e, "Overview image unavailable, uploading without it");
                        None
                    }
                }
            }
            _ => None,
        };

        let vehicle = match &c.classifier {
            Some(classifier) => {
                let subject = overview_image.as_deref().unwrap_or(image.as_slice());
                match classifier.classify(subject).await {
                    Ok(attributes) => Some(attributes),
                    Err(e) => {
                        warn!(error = %e, "Vehicle classification failed, uploading without it");
                        metrics::counter!("importer.vehicle.failures").increment(1);
                        None
                    }
                }
            }
            None => None,
        };

        let record = EnrichedRecord {
            agent_uid: c.agent_uid.clone(),
            camera,
            event: event.clone(),
            reading,
            plate_image: with_images.then_some(image),
            overview_image: overview_image.filter(|_| with_images),
            vehicle,
        };

        let receipt = c.uploader.deliver(&record).await?;
        debug!(
            plate = %record.reading.plate,
            attempts = receipt.attempts,
            "Event uploaded"
        );
        Ok(())
    }
}

/// Starts a worker per camera and keeps discovering new ones
pub struct PipelineOrchestrator {
    components: Arc<PipelineComponents>,
    settings: WorkerSettings,
    shutdown: CancellationToken,
    stats: SharedStats,
}

impl PipelineOrchestrator {
    pub fn new(
        components: PipelineComponents,
        settings: WorkerSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            components: Arc::new(components),
            settings,
            shutdown,
            stats: Arc::default(),
        }
    }

    /// Per-camera totals so far
    pub fn stats(&self) -> BTreeMap<String, WorkerStats> {
        self.stats.read().clone()
    }

    fn spawn_worker(
        &self,
        camera: &str,
        started: &mut HashSet<String>,
        workers: &mut JoinSet<()>,
    ) {
        if !started.insert(camera.to_string()) {
            return;
        }

        if self.components.directory.resolve(camera).is_err() {
            warn!(camera = camera, "Camera has no configured profile, its events will be skipped");
        }

        let worker = CameraWorker::new(
            camera,
            self.components.clone(),
            self.settings.clone(),
            self.shutdown.clone(),
        )
        .with_stats(self.stats.clone());

        workers.spawn(worker.run());
    }

    /// Run until shutdown, then wait for every worker to finish its event.
    pub async fn run(&self) {
        let mut started = HashSet::new();
        let mut workers = JoinSet::new();

        for camera in self.components.directory.camera_names() {
            self.spawn_worker(&camera, &mut started, &mut workers);
        }
        info!(workers = workers.len(), "Configured camera workers started");

        while !self.shutdown.is_cancelled() {
            match self.components.source.cameras().await {
                Ok(cameras) => {
                    for camera in cameras {
                        if !started.contains(&camera) {
                            info!(camera = %camera, "Discovered camera");
                            self.spawn_worker(&camera, &mut started, &mut workers);
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Camera discovery failed"),
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.settings.discovery_interval) => {}
            }
        }

        info!(workers = workers.len(), "Waiting for camera workers to stop");
        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Camera worker terminated abnormally");
            }
        }
    }
}
