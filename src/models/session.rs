//! Represents a guest's resumable upload session within a bucket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One guest's upload context. Identified within its bucket by
/// `guest_contact`; the display name is informational only.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct GuestSession {
    pub id: Uuid,

    pub bucket_id: Uuid,

    pub guest_name: String,

    /// Normalized (trimmed, lower-cased) contact used as the resumption key.
    pub guest_contact: String,

    /// Opaque token the guest client presents when uploading.
    pub session_token: String,

    /// Number of photos currently held by (or reserved for) this session.
    pub total_images: i64,

    /// Next `upload_order` value to hand out. Never decreases.
    #[serde(skip)]
    pub next_upload_order: i64,

    pub created_at: DateTime<Utc>,
}
