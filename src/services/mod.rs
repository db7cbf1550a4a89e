//! Service layer: bucket policy, guest sessions, upload ingestion, gallery
//! aggregation, archive export and scan tracking. Every service is cheap to
//! clone and shares the SQLite pool and the object store.

pub mod archive_service;
pub mod bucket_service;
pub mod gallery_service;
pub mod naming;
pub mod object_store;
pub mod scan_service;
pub mod session_service;
pub mod upload_service;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use object_store::ObjectStoreError;
use rand::RngCore;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),
    #[error("caller does not own this resource")]
    NotAuthorized,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("bucket unavailable: {0}")]
    BucketUnavailable(&'static str),
    #[error("nothing to export")]
    NoContent,
    #[error(transparent)]
    Storage(#[from] ObjectStoreError),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Map `RowNotFound` to a domain `NotFound`, keeping other errors.
pub(crate) fn not_found(what: &'static str) -> impl FnOnce(sqlx::Error) -> ServiceError {
    move |err| match err {
        sqlx::Error::RowNotFound => ServiceError::NotFound(what),
        other => ServiceError::Database(other),
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

/// Return true if SQLx error indicates a foreign key violation, i.e. the
/// parent row disappeared underneath the write.
pub(crate) fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("foreign key")
    )
}

/// 32 bytes from the OS-seeded RNG, base64url encoded without padding.
pub(crate) fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
