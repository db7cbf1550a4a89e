//! Represents one stored guest photo.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A photo stored in the object store and recorded against a session.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Upload {
    pub id: Uuid,

    pub session_id: Uuid,

    /// Filename as sent by the guest's device.
    pub original_filename: String,

    /// Object store path of the payload.
    pub object_path: String,

    /// Retrievable URL returned by the object store.
    pub url: String,

    pub thumbnail_url: Option<String>,

    pub content_type: Option<String>,

    pub file_size_bytes: i64,

    /// Admission order within the session, strictly increasing.
    pub upload_order: i64,

    pub created_at: DateTime<Utc>,
}
