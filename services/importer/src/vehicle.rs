//! Vehicle attribute classification.
//!
//! Optional companion to plate recognition. [`VehicleCommand`] runs an
//! external classifier with the overview image on stdin and reads a JSON
//! document of ranked color, make, model, body type and year guesses.

use crate::config::VehicleConfig;
use crate::model::VehicleAttributes;
use crate::recognition::run_with_stdin;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum ClassificationError {
    #[error("Vehicle classifier unavailable: {0}")]
    Unavailable(String),

    #[error("Vehicle classifier failed: {0}")]
    Failed(String),

    #[error("Vehicle classifier timed out after {0:?}")]
    Timeout(Duration),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VehicleClassifier: Send + Sync {
    async fn classify(&self, image: &[u8]) -> Result<VehicleAttributes, ClassificationError>;
}

/// Parse the classifier's JSON report
pub fn parse_vehicle_report(output: &[u8]) -> Result<VehicleAttributes, ClassificationError> {
    serde_json::from_slice(output)
        .map_err(|e| ClassificationError::Failed(format!("Unparseable classifier output: {}", e)))
}

/// External classifier run as a child process per image
pub struct VehicleCommand {
    config: VehicleConfig,
    country: String,
}

impl VehicleCommand {
    pub fn new(config: VehicleConfig, country: impl Into<String>) -> Self {
        Self {
            config,
            country: country.into(),
        }
    }

    fn build_command(&self) -> Command {
        let mut command = Command::new(&self.config.command);
        command
            .args(&self.config.args)
            .arg("-c")
            .arg(&self.country)
            .arg("-");
        command
    }
}

#[async_trait]
impl VehicleClassifier for VehicleCommand {
    #[instrument(skip(self, image), fields(size_bytes = image.len()))]
    async fn classify(&self, image: &[u8]) -> Result<VehicleAttributes, ClassificationError> {
        let timeout = self.config.timeout();
        let output = tokio::time::timeout(timeout, run_with_stdin(self.build_command(), image))
            .await
            .map_err(|_| ClassificationError::Timeout(timeout))?
            .map_err(|e| {
                ClassificationError::Unavailable(format!(
                    "Failed to run {}: {}",
                    self.config.command, e
                ))
            })?;

        if !output.status.success() {
            return Err(ClassificationError::Failed(format!(
                "Classifier exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let attributes = parse_vehicle_report(&output.stdout)?;
        debug!(
            make = ?attributes.make.first().map(|c| &c.name),
            color = ?attributes.color.first().map(|c| &c.name),
            "Vehicle classified"
        );
        Ok(attributes)
    }
}
