use crate::retry::{RetryError, RetryPolicy, Transient};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

/// Errors that can occur loading capture images
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("Image {reference} not found")]
    Missing { reference: String },

    #[error("Image reference {reference:?} is not a path inside the image share")]
    InvalidReference { reference: String },

    /// The share is reachable but the file cannot be read as an image file
    #[error("Image {reference} is unreadable: {source}")]
    Unreadable {
        reference: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Image share unavailable while reading {reference}: {source}")]
    Unavailable {
        reference: String,
        #[source]
        source: std::io::Error,
    },
}

impl ImageError {
    /// The image will never be readable; the event should be skipped
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

impl Transient for ImageError {
    fn is_transient(&self) -> bool {
        matches!(self, ImageError::Unavailable { .. })
    }
}

/// Read-only access to capture images by reference
#[async_trait]
pub trait ImageStore: Send + Sync {
    async fn load(&self, reference: &str) -> Result<Vec<u8>, ImageError>;
}

/// Errors that mean the share itself could not be reached
fn is_share_error(e: &std::io::Error) -> bool {
    // ESTALE, EHOSTDOWN, EHOSTUNREACH, ENOTCONN on Linux network mounts
    const NETWORK_ERRNOS: [i32; 4] = [116, 112, 113, 107];

    matches!(
        e.kind(),
        ErrorKind::TimedOut
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    ) || e.raw_os_error().map_or(false, |code| NETWORK_ERRNOS.contains(&code))
}

/// Images stored as files under a shared directory
pub struct FsImageStore {
    base_path: PathBuf,
    share_marker: Option<PathBuf>,
    retry: RetryPolicy,
    shutdown: CancellationToken,
}

impl FsImageStore {
    pub fn new(base_path: impl Into<PathBuf>, retry: RetryPolicy) -> Self {
        Self {
            base_path: base_path.into(),
            share_marker: None,
            retry,
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop retrying an unreachable share once shutdown is requested
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// File relative to the base path that only exists while the share is mounted
    pub fn with_share_marker(mut self, marker: Option<impl Into<PathBuf>>) -> Self {
        self.share_marker = marker.map(Into::into);
        self
    }

    /// Resolve a reference to a path under the base directory.
    pub fn resolve(&self, reference: &str) -> Result<PathBuf, ImageError> {
        let relative = Path::new(reference);
        let is_plain = !reference.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));

        if !is_plain {
            return Err(ImageError::InvalidReference {
                reference: reference.to_string(),
            });
        }

        Ok(self.base_path.join(relative))
    }

    /// Confirm the share is mounted: the marker file exists, or without a
    /// marker, the base directory exists and is not an empty mountpoint.
    async fn check_share(&self) -> std::io::Result<()> {
        if let Some(ref marker) = self.share_marker {
            tokio::fs::metadata(self.base_path.join(marker)).await?;
            return Ok(());
        }

        let mut entries = tokio::fs::read_dir(&self.base_path).await?;
        if entries.next_entry().await?.is_none() {
            return Err(std::io::Error::new(
                ErrorKind::NotFound,
                format!("{} is empty, share not mounted", self.base_path.display()),
            ));
        }
        Ok(())
    }

    async fn read_once(&self, reference: &str, path: &Path) -> Result<Vec<u8>, ImageError> {
        let error = match tokio::fs::read(path).await {
            Ok(bytes) => return Ok(bytes),
            Err(e) => e,
        };

        if is_share_error(&error) {
            return Err(ImageError::Unavailable {
                reference: reference.to_string(),
                source: error,
            });
        }

        // A file-level error only counts once the share is known to be there.
        if let Err(share_err) = self.check_share().await {
            return Err(ImageError::Unavailable {
                reference: reference.to_string(),
                source: share_err,
            });
        }

        if error.kind() == ErrorKind::NotFound {
            Err(ImageError::Missing {
                reference: reference.to_string(),
            })
        } else {
            Err(ImageError::Unreadable {
                reference: reference.to_string(),
                source: error,
            })
        }
    }
}

#[async_trait]
impl ImageStore for FsImageStore {
    #[instrument(skip(self))]
    async fn load(&self, reference: &str) -> Result<Vec<u8>, ImageError> {
        let path = self.resolve(reference)?;

        let bytes = self
            .retry
            .run("image_load", &self.shutdown, |_| self.read_once(reference, &path))
            .await
            .map_err(RetryError::into_inner)?;

        debug!(path = %path.display(), size_bytes = bytes.len(), "Image loaded");
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn store(base: &Path) -> FsImageStore {
        FsImageStore::new(
            base,
            RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(1)),
        )
    }

    /// A share with one unrelated image on it
    fn mounted_share() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("0001"), b"\xff\xd8other").unwrap();
        dir
    }

    #[tokio::test]
    async fn test_load_existing_image() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("1001"), b"\xff\xd8jpeg").unwrap();

        let bytes = store(dir.path()).load("1001").await.unwrap();
        assert_eq!(bytes, b"\xff\xd8jpeg");
    }

    #[tokio::test]
    async fn test_missing_image_is_permanent() {
        let dir = mounted_share();

        let err = store(dir.path()).load("1002").await.unwrap_err();
        assert!(matches!(err, ImageError::Missing { .. }));
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn test_unreachable_share_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let share = dir.path().join("offline-share");

        let err = store(&share).load("1003").await.unwrap_err();
        assert!(matches!(err, ImageError::Unavailable { .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_empty_mountpoint_is_transient() {
        let dir = tempfile::tempdir().unwrap();

        let err = store(dir.path()).load("1004").await.unwrap_err();
        assert!(matches!(err, ImageError::Unavailable { .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_missing_share_marker_is_transient() {
        let dir = mounted_share();
        let store = store(dir.path()).with_share_marker(Some(".mounted"));

        let err = store.load("1005").await.unwrap_err();
        assert!(err.is_transient());

        std::fs::write(dir.path().join(".mounted"), b"").unwrap();
        let err = store.load("1005").await.unwrap_err();
        assert!(matches!(err, ImageError::Missing { .. }));
    }

    #[tokio::test]
    async fn test_directory_in_place_of_image_is_permanent() {
        let dir = mounted_share();
        std::fs::create_dir(dir.path().join("1006")).unwrap();

        let err = store(dir.path()).load("1006").await.unwrap_err();
        assert!(matches!(err, ImageError::Unreadable { .. }));
        assert!(err.is_permanent());
    }

    #[test]
    fn test_network_errors_are_share_errors() {
        assert!(is_share_error(&std::io::Error::from(ErrorKind::TimedOut)));
        assert!(is_share_error(&std::io::Error::from_raw_os_error(116)));
        assert!(!is_share_error(&std::io::Error::from(ErrorKind::PermissionDenied)));
        assert!(!is_share_error(&std::io::Error::from(ErrorKind::InvalidData)));
    }

    #[test]
    fn test_reference_cannot_escape_share() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        assert!(store.resolve("2024/01/1001.jpg").is_ok());
        assert!(matches!(
            store.resolve("../etc/passwd"),
            Err(ImageError::InvalidReference { .. })
        ));
        assert!(store.resolve("/etc/passwd").is_err());
        assert!(store.resolve("").is_err());
    }
}
