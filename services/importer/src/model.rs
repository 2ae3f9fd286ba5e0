//! Shared data model for the import pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-camera monotonically increasing capture identifier
pub type EventId = i64;

/// One license-plate observation read from the capture store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureEvent {
    /// Source row id, unique within the camera
    pub event_id: EventId,
    /// Camera name as recorded by the controller
    pub camera_name: String,
    /// When the controller captured the plate
    pub captured_at: DateTime<Utc>,
    /// Reference to the plate crop image on the image share
    pub image_ref: String,
    /// Reference to the whole-vehicle overview image, if recorded
    pub overview_ref: Option<String>,
    /// Plate text the controller itself recognized
    pub source_plate: Option<String>,
}

/// Static per-camera metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraProfile {
    pub name: String,
    pub camera_id: i64,
    pub latitude: f64,
    pub longitude: f64,
}

/// Alternate reading of a plate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateCandidate {
    pub plate: String,
    /// Confidence score (0.0 - 1.0)
    pub confidence: f32,
}

/// One plate found in an image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlateReading {
    /// Best plate text
    pub plate: String,
    /// Confidence score (0.0 - 1.0)
    pub confidence: f32,
    /// Plate region code (state/province), when the engine detects one
    pub region: Option<String>,
    /// Region confidence (0.0 - 1.0)
    pub region_confidence: Option<f32>,
    /// Alternate readings, best first
    #[serde(default)]
    pub candidates: Vec<PlateCandidate>,
}

/// Output of the recognition engine for one image, best reading first
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecognitionResult {
    pub readings: Vec<PlateReading>,
}

impl RecognitionResult {
    /// Build a result, ordering readings best-first.
    pub fn new(mut readings: Vec<PlateReading>) -> Self {
        readings.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Self { readings }
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn best(&self) -> Option<&PlateReading> {
        self.readings.first()
    }

    pub fn into_best(self) -> Option<PlateReading> {
        self.readings.into_iter().next()
    }

    /// Drop readings and candidates below `min_confidence`.
    pub fn above(mut self, min_confidence: f32) -> Self {
        self.readings.retain(|r| r.confidence >= min_confidence);
        for reading in &mut self.readings {
            reading.candidates.retain(|c| c.confidence >= min_confidence);
        }
        self
    }
}

/// One ranked guess for a vehicle attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleCandidate {
    pub name: String,
    /// Confidence as reported by the classifier
    pub confidence: f32,
}

/// Vehicle attributes recognized from the overview image
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VehicleAttributes {
    #[serde(default)]
    pub color: Vec<VehicleCandidate>,
    #[serde(default)]
    pub make: Vec<VehicleCandidate>,
    #[serde(default)]
    pub make_model: Vec<VehicleCandidate>,
    #[serde(default)]
    pub body_type: Vec<VehicleCandidate>,
    #[serde(default)]
    pub year: Vec<VehicleCandidate>,
}

/// A capture event ready for upload
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedRecord {
    pub agent_uid: String,
    pub camera: CameraProfile,
    pub event: CaptureEvent,
    pub reading: PlateReading,
    /// Plate crop image, attached when image upload is enabled
    pub plate_image: Option<Vec<u8>>,
    /// Overview image, attached when image upload is enabled
    pub overview_image: Option<Vec<u8>>,
    /// Vehicle attributes, when a classifier is configured and succeeded
    pub vehicle: Option<VehicleAttributes>,
}

impl EnrichedRecord {
    /// Key the aggregation service uses to collapse duplicate deliveries.
    ///
    /// Format: `{agent_uid}-{camera_id}-{event_id}`
    pub fn idempotency_key(&self) -> String {
        format!(
            "{}-{}-{}",
            self.agent_uid, self.camera.camera_id, self.event.event_id
        )
    }
}
