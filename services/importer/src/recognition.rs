//! Plate recognition adapter.
//!
//! The engine is consumed as a black box: image bytes in, ranked plate
//! readings out. [`AlprCommand`] drives the OpenALPR command-line engine
//! (`alpr -j`), writing the image to its stdin and parsing the JSON report it
//! prints. Tests substitute their own [`PlateRecognizer`].
//!
//! An engine failure is blamed on the image only when the image does not
//! decode; a failing engine on a readable image is reported as unavailable.

use crate::config::RecognitionConfig;
use crate::model::{PlateCandidate, PlateReading, RecognitionResult};
use crate::retry::Transient;
use async_trait::async_trait;
use serde::Deserialize;
use std::process::{Output, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

/// Errors that can occur during recognition
#[derive(Debug, Error)]
pub enum RecognitionError {
    /// The image is corrupt or in an unsupported format
    #[error("Recognition engine rejected the image: {0}")]
    Rejected(String),

    #[error("Recognition engine unavailable: {0}")]
    Unavailable(String),

    #[error("Recognition engine timed out after {0:?}")]
    Timeout(Duration),
}

impl RecognitionError {
    /// Re-running the same bytes would fail the same way
    pub fn is_permanent(&self) -> bool {
        matches!(self, RecognitionError::Rejected(_))
    }
}

impl Transient for RecognitionError {
    fn is_transient(&self) -> bool {
        !self.is_permanent()
    }
}

/// Plate recognition capability
#[async_trait]
pub trait PlateRecognizer: Send + Sync {
    /// Recognize plates in an encoded image; readings are best-first and may
    /// be empty when no plate is found
    async fn recognize(
        &self,
        image: &[u8],
        region_hint: Option<&str>,
    ) -> Result<RecognitionResult, RecognitionError>;
}

/// JSON report printed by `alpr -j`
#[derive(Debug, Deserialize)]
struct AlprReport {
    #[serde(default)]
    results: Vec<AlprPlate>,
}

#[derive(Debug, Deserialize)]
struct AlprPlate {
    plate: String,
    confidence: f32,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    region_confidence: Option<f32>,
    #[serde(default)]
    candidates: Vec<AlprCandidate>,
}

#[derive(Debug, Deserialize)]
struct AlprCandidate {
    plate: String,
    confidence: f32,
}

/// Spawn `command`, write `input` to its stdin and collect its output.
pub(crate) async fn run_with_stdin(
    mut command: Command,
    input: &[u8],
) -> std::io::Result<Output> {
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn()?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "stdin not captured"))?;

    let feed = async move {
        let result = stdin.write_all(input).await;
        drop(stdin);
        result
    };

    let (fed, output) = tokio::join!(feed, child.wait_with_output());
    // The engine may stop reading once it has a decodable image.
    if let Err(e) = fed {
        debug!(error = %e, "Engine closed stdin early");
    }
    output
}

/// Whether the bytes decode as an image at all
pub(crate) fn is_decodable_image(bytes: &[u8]) -> bool {
    image::load_from_memory(bytes).is_ok()
}

/// Engine confidences are percentages
fn normalize_confidence(percent: f32) -> f32 {
    (percent / 100.0).clamp(0.0, 1.0)
}

/// Parse an `alpr -j` report into readings, best first
pub fn parse_alpr_report(output: &[u8]) -> Result<RecognitionResult, RecognitionError> {
    let report: AlprReport = serde_json::from_slice(output).map_err(|e| {
        RecognitionError::Rejected(format!("Unparseable engine output: {}", e))
    })?;

    let readings = report
        .results
        .into_iter()
        .map(|p| PlateReading {
            plate: p.plate,
            confidence: normalize_confidence(p.confidence),
            region: p.region.filter(|r| !r.is_empty()),
            region_confidence: p.region_confidence.map(normalize_confidence),
            candidates: p
                .candidates
                .into_iter()
                .map(|c| PlateCandidate {
                    plate: c.plate,
                    confidence: normalize_confidence(c.confidence),
                })
                .collect(),
        })
        .collect();

    Ok(RecognitionResult::new(readings))
}

/// OpenALPR command-line engine run as a child process per image
pub struct AlprCommand {
    config: RecognitionConfig,
    permits: Semaphore,
}

impl AlprCommand {
    pub fn new(config: RecognitionConfig) -> Self {
        let permits = Semaphore::new(config.max_concurrent.max(1));
        Self { config, permits }
    }

    fn base_command(&self) -> Command {
        let mut command = Command::new(&self.config.command);
        command.args(&self.config.args);
        command
    }

    fn build_command(&self, region_hint: Option<&str>) -> Command {
        let mut command = self.base_command();
        command
            .arg("-j")
            .arg("-c")
            .arg(&self.config.country)
            .arg("-n")
            .arg(self.config.top_n.to_string());

        if let Some(region) = region_hint.or(self.config.region_hint.as_deref()) {
            command.arg("-p").arg(region);
        }
        if let Some(ref config_file) = self.config.config_file {
            command.arg("--config").arg(config_file);
        }

        // Image is read from stdin
        command.arg("-");
        command
    }

    /// Confirm the engine starts and reports its version.
    pub async fn check(&self) -> Result<String, RecognitionError> {
        let mut command = self.base_command();
        command.arg("--version");

        let output = tokio::time::timeout(self.config.timeout(), run_with_stdin(command, b""))
            .await
            .map_err(|_| RecognitionError::Timeout(self.config.timeout()))?
            .map_err(|e| {
                RecognitionError::Unavailable(format!(
                    "Failed to start {}: {}",
                    self.config.command, e
                ))
            })?;

        if !output.status.success() {
            return Err(RecognitionError::Unavailable(format!(
                "{} --version exited with {}: {}",
                self.config.command,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(command = %self.config.command, version = %version, "Recognition engine ready");
        Ok(version)
    }

    /// The engine failed on `image`: the image is to blame only if it does
    /// not decode; otherwise the engine itself is broken.
    fn engine_failure(image: &[u8], message: String) -> RecognitionError {
        if is_decodable_image(image) {
            RecognitionError::Unavailable(message)
        } else {
            RecognitionError::Rejected(message)
        }
    }

    async fn run_engine(
        &self,
        image: &[u8],
        region_hint: Option<&str>,
    ) -> Result<RecognitionResult, RecognitionError> {
        let output = run_with_stdin(self.build_command(region_hint), image)
            .await
            .map_err(|e| {
                RecognitionError::Unavailable(format!(
                    "Failed to run {}: {}",
                    self.config.command, e
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Self::engine_failure(
                image,
                format!("Engine exited with {}: {}", output.status, stderr.trim()),
            ));
        }

        parse_alpr_report(&output.stdout)
            .map_err(|e| Self::engine_failure(image, e.to_string()))
    }
}

#[async_trait]
impl PlateRecognizer for AlprCommand {
    #[instrument(skip(self, image), fields(size_bytes = image.len()))]
    async fn recognize(
        &self,
        image: &[u8],
        region_hint: Option<&str>,
    ) -> Result<RecognitionResult, RecognitionError> {
        if image.is_empty() {
            return Err(RecognitionError::Rejected("Empty image".to_string()));
        }

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| RecognitionError::Unavailable("Engine pool closed".to_string()))?;

        let timeout = self.config.timeout();
        let result = tokio::time::timeout(timeout, self.run_engine(image, region_hint))
            .await
            .map_err(|_| {
                warn!(timeout_secs = timeout.as_secs(), "Recognition engine timed out");
                RecognitionError::Timeout(timeout)
            })??
            .above(self.config.min_confidence);

        debug!(
            readings = result.readings.len(),
            best = ?result.best().map(|r| &r.plate),
            "Recognition complete"
        );

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = r#"{
        "version": 2,
        "data_type": "alpr_results",
        "epoch_time": 1705314600000,
        "img_width": 320,
        "img_height": 240,
        "processing_time_ms": 41.2,
        "regions_of_interest": [],
        "results": [
            {
                "plate": "7ABC123",
                "confidence": 91.5,
                "matches_template": 1,
                "plate_index": 0,
                "region": "ca",
                "region_confidence": 84,
                "processing_time_ms": 12.1,
                "requested_topn": 10,
                "coordinates": [],
                "candidates": [
                    {"plate": "7ABC123", "confidence": 91.5, "matches_template": 1},
                    {"plate": "7A8C123", "confidence": 80.25, "matches_template": 0}
                ]
            },
            {
                "plate": "XYZ",
                "confidence": 20.0,
                "region": "",
                "candidates": []
            }
        ]
    }"#;

    #[test]
    fn test_parse_report() {
        let result = parse_alpr_report(REPORT.as_bytes()).unwrap();
        assert_eq!(result.readings.len(), 2);

        let best = result.best().unwrap();
        assert_eq!(best.plate, "7ABC123");
        assert!((best.confidence - 0.915).abs() < 1e-6);
        assert_eq!(best.region.as_deref(), Some("ca"));
        assert!((best.region_confidence.unwrap() - 0.84).abs() < 1e-6);
        assert_eq!(best.candidates.len(), 2);
        assert_eq!(result.readings[1].region, None);
    }

    #[test]
    fn test_parse_report_without_plates() {
        let result = parse_alpr_report(br#"{"version": 2, "results": []}"#).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_parse_garbage_is_rejection() {
        let err = parse_alpr_report(b"Error loading image").unwrap_err();
        assert!(err.is_permanent());
    }

    #[test]
    fn test_confidence_clamped() {
        assert_eq!(normalize_confidence(150.0), 1.0);
        assert_eq!(normalize_confidence(-3.0), 0.0);
    }

    fn engine_config(command: &str, args: Vec<String>) -> RecognitionConfig {
        RecognitionConfig {
            command: command.to_string(),
            args,
            timeout_secs: 10,
            ..RecognitionConfig::default()
        }
    }

    #[tokio::test]
    async fn test_empty_image_rejected_without_engine() {
        let engine = AlprCommand::new(engine_config("definitely-not-installed-alpr", vec![]));
        let err = engine.recognize(b"", None).await.unwrap_err();
        assert!(matches!(err, RecognitionError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_missing_engine_is_transient() {
        let engine = AlprCommand::new(engine_config("definitely-not-installed-alpr", vec![]));
        let err = engine.recognize(b"\xff\xd8", None).await.unwrap_err();
        assert!(matches!(err, RecognitionError::Unavailable(_)));
        assert!(!err.is_permanent());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_engine_process_output_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-alpr.sh");
        std::fs::write(
            &script,
            format!("cat > /dev/null\ncat <<'EOF'\n{}\nEOF\n", REPORT),
        )
        .unwrap();

        let mut config = engine_config("sh", vec![script.display().to_string()]);
        config.min_confidence = 0.5;
        let engine = AlprCommand::new(config);

        let result = engine.recognize(b"\xff\xd8fake", Some("ca")).await.unwrap();
        assert_eq!(result.readings.len(), 1);
        assert_eq!(result.best().unwrap().plate, "7ABC123");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_broken_engine_with_valid_image_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("broken-alpr.sh");
        std::fs::write(
            &script,
            "cat > /dev/null\necho 'Error loading OpenALPR' >&2\nexit 1\n",
        )
        .unwrap();

        let engine = AlprCommand::new(engine_config("sh", vec![script.display().to_string()]));
        let err = engine
            .recognize(&crate::test_support::jpeg_image(64, 32), None)
            .await
            .unwrap_err();
        assert!(matches!(err, RecognitionError::Unavailable(_)));
        assert!(err.is_transient());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_engine_check_reports_version() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("alpr-version.sh");
        std::fs::write(&script, "[ \"$1\" = \"--version\" ] && echo 'alpr version: 2.3.0' && exit 0\nexit 1\n")
            .unwrap();

        let engine = AlprCommand::new(engine_config("sh", vec![script.display().to_string()]));
        assert_eq!(engine.check().await.unwrap(), "alpr version: 2.3.0");
    }

    #[tokio::test]
    async fn test_engine_check_fails_without_engine() {
        let engine = AlprCommand::new(engine_config("definitely-not-installed-alpr", vec![]));
        assert!(matches!(
            engine.check().await,
            Err(RecognitionError::Unavailable(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_engine_failure_on_undecodable_image_is_rejection() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("failing-alpr.sh");
        std::fs::write(&script, "cat > /dev/null\necho 'Invalid image' >&2\nexit 1\n").unwrap();

        let engine = AlprCommand::new(engine_config("sh", vec![script.display().to_string()]));
        let err = engine.recognize(b"\x00\x01", None).await.unwrap_err();
        match err {
            RecognitionError::Rejected(message) => assert!(message.contains("Invalid image")),
            other => panic!("Expected Rejected, got {:?}", other),
        }
    }
}
