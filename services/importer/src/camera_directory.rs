use crate::config::CameraConfig;
use crate::model::CameraProfile;
use std::collections::HashMap;
use thiserror::Error;
use tracing::info;

/// Camera name has no configured profile
#[derive(Debug, Clone, Error, PartialEq)]
#[error("Unknown camera: {0}")]
pub struct UnknownCamera(pub String);

/// Read-only mapping from camera name to its static profile
#[derive(Debug, Clone, Default)]
pub struct CameraDirectory {
    profiles: HashMap<String, CameraProfile>,
}

impl CameraDirectory {
    /// Build the directory from configured cameras.
    ///
    /// Duplicate names are rejected by `Config::validate`.
    pub fn new(cameras: &[CameraConfig]) -> Self {
        let profiles: HashMap<String, CameraProfile> = cameras
            .iter()
            .map(|c| {
                (
                    c.name.clone(),
                    CameraProfile {
                        name: c.name.clone(),
                        camera_id: c.camera_id,
                        latitude: c.gps_latitude,
                        longitude: c.gps_longitude,
                    },
                )
            })
            .collect();

        info!(cameras = profiles.len(), "Camera directory loaded");

        Self { profiles }
    }

    pub fn resolve(&self, camera_name: &str) -> Result<&CameraProfile, UnknownCamera> {
        self.profiles
            .get(camera_name)
            .ok_or_else(|| UnknownCamera(camera_name.to_string()))
    }

    /// Configured camera names, sorted
    pub fn camera_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.profiles.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
