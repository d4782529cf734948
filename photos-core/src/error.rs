use thiserror::Error;

use crate::model::{PhotoId, SurfaceId};

/// Errors surfaced by the photo index and its stores.
///
/// Download failures are not errors: they are reported as
/// [`DownloadOutcome`](crate::download::DownloadOutcome) variants.
#[derive(Error, Debug)]
pub enum PhotoError {
    /// Malformed caller input (name too long, bad URL, unknown color).
    #[error("Invalid input: {0}")]
    Validation(String),

    /// The referenced photo is not registered in the index.
    #[error("Photo not found: {0}")]
    NotFound(PhotoId),

    /// The photo exists but its runtime handle is not usable.
    #[error("Photo {0} is not ready")]
    NotReady(PhotoId),

    /// A store read or write failed.
    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// Identity mapping collision or dangling surface binding.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Schema or startup failure. Aborts boot.
    #[error("Bootstrap error: {0}")]
    Bootstrap(String),

    /// The coordinator task is gone.
    #[error("Photo index has shut down")]
    Shutdown,
}

impl PhotoError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        Self::Integrity(message.into())
    }

    pub fn identity_collision(photo_id: PhotoId, surface_id: SurfaceId) -> Self {
        Self::Integrity(format!(
            "identity collision binding photo {photo_id} to surface {surface_id}"
        ))
    }
}

/// Errors raised by store backends (Authoritative and Identity).
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Query error: {0}")]
    Query(String),

    /// A unique constraint rejected the write.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::Conflict(db.message().to_string())
            }
            _ => Self::Query(e.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        Self::Migration(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PhotoError>;
