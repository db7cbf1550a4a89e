//! Shared handler state: one instance of every service over the same pool
//! and object store.

use crate::services::{
    archive_service::ArchiveService,
    bucket_service::BucketService,
    gallery_service::GalleryService,
    object_store::{ObjectStore, StorePolicy},
    scan_service::ScanTracker,
    session_service::SessionService,
    upload_service::UploadService,
};
use sqlx::SqlitePool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SqlitePool>,
    pub objects: Arc<dyn ObjectStore>,
    pub buckets: BucketService,
    pub sessions: SessionService,
    pub uploads: UploadService,
    pub gallery: GalleryService,
    pub archives: ArchiveService,
    pub scans: ScanTracker,
}

impl AppState {
    pub fn new(db: Arc<SqlitePool>, objects: Arc<dyn ObjectStore>, policy: StorePolicy) -> Self {
        Self {
            buckets: BucketService::new(db.clone(), objects.clone(), policy),
            sessions: SessionService::new(db.clone()),
            uploads: UploadService::new(db.clone(), objects.clone(), policy),
            gallery: GalleryService::new(db.clone()),
            archives: ArchiveService::new(db.clone(), objects.clone(), policy),
            scans: ScanTracker::new(db.clone()),
            db,
            objects,
        }
    }
}
