use crate::config::DatabaseConfig;
use crate::model::{CaptureEvent, EventId};
use crate::retry::Transient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors that can occur reading capture rows
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Capture store unavailable: {0}")]
    Unavailable(String),

    /// Rows do not match the expected schema; refetching returns the same rows
    #[error("Capture rows do not match the expected schema: {0}")]
    Schema(String),
}

impl Transient for SourceError {
    fn is_transient(&self) -> bool {
        matches!(self, SourceError::Unavailable(_))
    }
}

/// SQLSTATE class 42: syntax error or access rule violation (undefined table/column)
const SQLSTATE_SCHEMA_CLASS: &str = "42";

impl From<sqlx::Error> for SourceError {
    fn from(e: sqlx::Error) -> Self {
        let is_schema = match &e {
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::ColumnIndexOutOfBounds { .. }
            | sqlx::Error::TypeNotFound { .. } => true,
            sqlx::Error::Database(db) => db
                .code()
                .map_or(false, |code| code.starts_with(SQLSTATE_SCHEMA_CLASS)),
            _ => false,
        };

        if is_schema {
            SourceError::Schema(e.to_string())
        } else {
            SourceError::Unavailable(e.to_string())
        }
    }
}

/// Incremental reader of capture events
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CaptureSource: Send + Sync {
    /// Distinct camera names that have recorded captures
    async fn cameras(&self) -> Result<Vec<String>, SourceError>;

    /// Events for `camera` with an id greater than `after`, ascending by id.
    /// Returns an empty vector when there is nothing new.
    async fn fetch_new(
        &self,
        camera: &str,
        after: Option<EventId>,
    ) -> Result<Vec<CaptureEvent>, SourceError>;
}

/// Image kinds recorded in the `images` table
const OVERVIEW_IMAGE_TYPE: i32 = 1;
const CROP_IMAGE_TYPE: i32 = 2;

/// A `reads` row joined with its image ids
#[derive(Debug, Clone, FromRow)]
struct CaptureRow {
    read_id: i64,
    camera: String,
    read_date: DateTime<Utc>,
    plate: Option<String>,
    crop_image_id: Option<i64>,
    overview_image_id: Option<i64>,
}

impl CaptureRow {
    fn into_event(self) -> CaptureEvent {
        // Without a crop the engine searches the overview image for plates.
        let image_ref = self
            .crop_image_id
            .or(self.overview_image_id)
            .map(|id| id.to_string())
            .unwrap_or_default();

        if image_ref.is_empty() {
            warn!(
                camera = %self.camera,
                event_id = self.read_id,
                "Capture row has no images"
            );
        }

        CaptureEvent {
            event_id: self.read_id,
            camera_name: self.camera,
            captured_at: self.read_date,
            image_ref,
            overview_ref: self.overview_image_id.map(|id| id.to_string()),
            source_plate: self.plate.filter(|p| !p.trim().is_empty()),
        }
    }
}

/// Capture store backed by the controllers' PostgreSQL database
pub struct PgCaptureSource {
    pool: PgPool,
    batch_size: i64,
}

impl PgCaptureSource {
    /// Create the connection pool. Connections are opened on first use so the
    /// service starts even while the database is unreachable.
    pub fn connect_lazy(config: &DatabaseConfig) -> Result<Self, SourceError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect_lazy(&config.url)?;

        info!(
            batch_size = config.batch_size,
            "Capture store pool created"
        );

        Ok(Self {
            pool,
            batch_size: config.batch_size,
        })
    }
}

#[async_trait]
impl CaptureSource for PgCaptureSource {
    async fn cameras(&self) -> Result<Vec<String>, SourceError> {
        let cameras: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT camera FROM reads ORDER BY camera")
                .fetch_all(&self.pool)
                .await?;

        Ok(cameras.into_iter().map(|(c,)| c).collect())
    }

    #[instrument(skip(self))]
    async fn fetch_new(
        &self,
        camera: &str,
        after: Option<EventId>,
    ) -> Result<Vec<CaptureEvent>, SourceError> {
        let rows = sqlx::query_as::<_, CaptureRow>(
            r#"
            SELECT r.read_id, r.camera, r.read_date, r.plate,
                   (SELECT MIN(i.image_id) FROM images i
                     WHERE i.read_id = r.read_id AND i.plate_image_type = $4) AS crop_image_id,
                   (SELECT MIN(i.image_id) FROM images i
                     WHERE i.read_id = r.read_id AND i.plate_image_type = $5) AS overview_image_id
            FROM reads r
            WHERE r.camera = $1 AND r.read_id > $2
            ORDER BY r.read_id ASC
            LIMIT $3
            "#,
        )
        .bind(camera)
        .bind(after.unwrap_or(EventId::MIN))
        .bind(self.batch_size)
        .bind(CROP_IMAGE_TYPE)
        .bind(OVERVIEW_IMAGE_TYPE)
        .fetch_all(&self.pool)
        .await?;

        debug!(count = rows.len(), "Fetched capture rows");

        Ok(rows.into_iter().map(CaptureRow::into_event).collect())
    }
}
