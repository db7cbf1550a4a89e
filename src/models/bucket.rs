//! Represents a bucket: a policy-governed photo collection endpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A collection policy scoped to one event/project.
///
/// Guests reach a bucket through its `access_token`; the owner controls the
/// per-guest quota, the size limit, the expiry and the active flag.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Bucket {
    /// Unique identifier for this bucket.
    pub id: Uuid,

    /// Owning project.
    pub project_id: Uuid,

    /// Account that owns the project (and therefore the bucket).
    pub owner_id: Uuid,

    /// Display name shown to guests and used for archive filenames.
    pub name: String,

    pub description: Option<String>,

    /// Maximum number of photos a single guest session may hold (>= 1).
    pub max_images_per_guest: i64,

    /// Maximum size of a single photo in bytes (> 0).
    pub max_file_size_bytes: i64,

    /// Object store prefix under which every upload of this bucket lives.
    pub storage_prefix: String,

    /// Opaque, unguessable token embedded in share links and QR codes.
    pub access_token: String,

    pub is_active: bool,

    /// Optional instant after which guests can no longer upload.
    pub expires_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl Bucket {
    /// Whether guests may use this bucket at `now`.
    pub fn is_available_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at.is_none_or(|expires| expires > now)
    }

    /// Why the bucket is unusable at `now`, if it is.
    pub fn unavailable_reason(&self, now: DateTime<Utc>) -> Option<&'static str> {
        if !self.is_active {
            Some("this collection is no longer accepting photos")
        } else if self.expires_at.is_some_and(|expires| expires <= now) {
            Some("this collection has expired")
        } else {
            None
        }
    }
}
