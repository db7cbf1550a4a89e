//! Gallery Aggregator: per-guest grouped view of a bucket for its host.
//!
//! Read-only. Statistics are derived from the rows returned, never cached,
//! so they always agree with the upload set shown.

use crate::{
    models::{bucket::Bucket, session::GuestSession, upload::Upload},
    services::{
        ServiceResult,
        bucket_service::BUCKET_COLUMNS,
        not_found,
        session_service::{SESSION_COLUMNS, UPLOAD_COLUMNS},
    },
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::{collections::HashMap, sync::Arc};
use uuid::Uuid;

#[derive(Debug, Serialize)]
pub struct BucketSummary {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub access_token: String,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_images_per_guest: i64,
    pub max_file_size_bytes: i64,
}

impl From<Bucket> for BucketSummary {
    fn from(bucket: Bucket) -> Self {
        Self {
            id: bucket.id,
            name: bucket.name,
            description: bucket.description,
            access_token: bucket.access_token,
            is_active: bucket.is_active,
            expires_at: bucket.expires_at,
            max_images_per_guest: bucket.max_images_per_guest,
            max_file_size_bytes: bucket.max_file_size_bytes,
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq, Serialize)]
pub struct GalleryStats {
    pub total_guests: usize,
    pub total_images: usize,
    pub total_size_bytes: i64,
}

#[derive(Debug, Serialize)]
pub struct GuestGallery {
    pub session_id: Uuid,
    pub guest_name: String,
    pub guest_contact: String,
    /// Number of uploads listed below.
    pub total_images: usize,
    pub total_size_bytes: i64,
    pub created_at: DateTime<Utc>,
    pub uploads: Vec<Upload>,
}

#[derive(Debug, Serialize)]
pub struct Gallery {
    pub bucket: BucketSummary,
    pub stats: GalleryStats,
    pub guests: Vec<GuestGallery>,
}

#[derive(Clone)]
pub struct GalleryService {
    db: Arc<SqlitePool>,
}

impl GalleryService {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Guests newest first, each with uploads in upload order. Sessions that
    /// hold no photos are left out.
    pub async fn build_gallery(&self, bucket_id: Uuid) -> ServiceResult<Gallery> {
        // One read transaction gives a consistent snapshot of both tables.
        let mut tx = self.db.begin().await?;

        let bucket = sqlx::query_as::<_, Bucket>(&format!(
            "SELECT {} FROM buckets WHERE id = ?",
            BUCKET_COLUMNS
        ))
        .bind(bucket_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(not_found("bucket"))?;

        let mut sessions = sqlx::query_as::<_, GuestSession>(&format!(
            "SELECT {} FROM guest_sessions WHERE bucket_id = ? ORDER BY rowid DESC",
            SESSION_COLUMNS
        ))
        .bind(bucket_id)
        .fetch_all(&mut *tx)
        .await?;

        let uploads = sqlx::query_as::<_, Upload>(&format!(
            "SELECT {} FROM uploads
             WHERE session_id IN (SELECT id FROM guest_sessions WHERE bucket_id = ?)
             ORDER BY upload_order ASC",
            UPLOAD_COLUMNS
        ))
        .bind(bucket_id)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        // Stable sort keeps insertion order (rowid DESC) for equal timestamps.
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let mut by_session: HashMap<Uuid, Vec<Upload>> = HashMap::new();
        for upload in uploads {
            by_session.entry(upload.session_id).or_default().push(upload);
        }

        let guests: Vec<GuestGallery> = sessions
            .into_iter()
            .filter_map(|session| {
                let uploads = by_session.remove(&session.id)?;
                Some(GuestGallery {
                    session_id: session.id,
                    guest_name: session.guest_name,
                    guest_contact: session.guest_contact,
                    total_images: uploads.len(),
                    total_size_bytes: uploads.iter().map(|u| u.file_size_bytes).sum(),
                    created_at: session.created_at,
                    uploads,
                })
            })
            .collect();

        let stats = GalleryStats {
            total_guests: guests.len(),
            total_images: guests.iter().map(|g| g.total_images).sum(),
            total_size_bytes: guests.iter().map(|g| g.total_size_bytes).sum(),
        };

        Ok(Gallery {
            bucket: bucket.into(),
            stats,
            guests,
        })
    }
}
