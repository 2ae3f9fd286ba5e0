//! Plate Importer
//!
//! Imports license-plate captures recorded by on-site camera controllers into
//! a central aggregation service. For every camera the importer polls the
//! controllers' capture database for rows newer than its checkpoint, loads the
//! capture image from the image share, re-recognizes the plate with a local
//! recognition engine, attaches the camera's static metadata and uploads the
//! result over HTTP. The checkpoint advances one event at a time, only after
//! the upload is confirmed or the event is permanently skipped.
//!
//! ## Features
//!
//! - **Per-camera workers**: cameras are polled independently; a stall or
//!   failure on one camera never delays another
//! - **At-least-once delivery**: uploads carry an idempotency key so retries
//!   after a lost response do not duplicate records
//! - **Bounded retry**: transient share and network failures are retried with
//!   exponential backoff, interrupted on shutdown
//! - **Durable checkpoints**: a JSON state file rewritten atomically on every
//!   advance
//! - **Vehicle attributes**: an optional classifier adds color, make and body
//!   type read from the overview image
//!
//! ## Architecture
//!
//! ```text
//!  PostgreSQL           Image share           alpr
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ reads        │     │ {image_ref}  │     │ Plate        │
//! │ images       │     │              │     │ Recognizer   │
//! └──────────────┘     └──────────────┘     └──────────────┘
//!        │                    │                    ▲
//!        ▼                    ▼                    │
//! ┌──────────────┐     ┌──────────────┐            │
//! │ Capture      │────▶│ Camera       │────────────┘
//! │ Source       │     │ Worker (xN)  │
//! └──────────────┘     └──────────────┘
//!        ▲                │        │
//!        │                ▼        ▼
//! ┌──────────────┐  ┌────────────┐ ┌──────────────┐     Aggregation
//! │ Checkpoint   │◀─│ Camera     │ │ HTTP         │────▶ service
//! │ Store        │  │ Directory  │ │ Uploader     │
//! └──────────────┘  └────────────┘ └──────────────┘
//! ```

pub mod camera_directory;
pub mod capture_source;
pub mod checkpoint;
pub mod config;
pub mod image_store;
pub mod model;
pub mod orchestrator;
pub mod recognition;
pub mod retry;
pub mod thumbnail;
pub mod uploader;
pub mod vehicle;

#[cfg(test)]
mod test_support;

pub use camera_directory::{CameraDirectory, UnknownCamera};
pub use capture_source::{CaptureSource, PgCaptureSource, SourceError};
pub use checkpoint::{CheckpointError, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use config::Config;
pub use image_store::{FsImageStore, ImageError, ImageStore};
pub use model::{
    CameraProfile, CaptureEvent, EnrichedRecord, EventId, PlateReading, RecognitionResult,
    VehicleAttributes,
};
pub use orchestrator::{CameraWorker, EventOutcome, PipelineComponents, PipelineOrchestrator, WorkerSettings};
pub use recognition::{AlprCommand, PlateRecognizer, RecognitionError};
pub use retry::RetryPolicy;
pub use uploader::{DeliveryError, HttpUploader, Uploader};
pub use vehicle::{ClassificationError, VehicleClassifier, VehicleCommand};
