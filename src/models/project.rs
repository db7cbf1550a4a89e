//! Owner-side project reference. Buckets are always scoped to one project.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// An event or project owned by a host account.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Project {
    pub id: Uuid,

    /// Account supplied by the owner auth layer.
    pub owner_id: Uuid,

    pub name: String,

    pub created_at: DateTime<Utc>,
}
