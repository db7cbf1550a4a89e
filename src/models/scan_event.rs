//! Append-only access record written when a share link or QR code is opened.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ScanEvent {
    pub id: Uuid,
    pub bucket_id: Uuid,
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
    /// Free-form source tag (e.g. `qr`, `link`).
    pub source: Option<String>,
    pub scanned_at: DateTime<Utc>,
}

/// Coarse client signal captured by the landing page.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct ScanSignal {
    pub user_agent: Option<String>,
    pub referrer: Option<String>,
    pub source: Option<String>,
}
