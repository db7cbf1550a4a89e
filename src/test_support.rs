//! Shared fixtures for service tests: a temp-file SQLite database with the
//! schema applied and a temp-dir object store.

use crate::{
    models::{bucket::Bucket, session::GuestSession},
    services::{
        bucket_service::NewBucket,
        object_store::{LocalObjectStore, ObjectStore, StorePolicy},
        session_service::GuestIdentity,
        upload_service::IncomingFile,
    },
    state::AppState,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};
use tempfile::TempDir;
use uuid::Uuid;

pub struct TestContext {
    _dir: TempDir,
    pub db: Arc<SqlitePool>,
    pub state: AppState,
    pub owner_id: Uuid,
    pub project_id: Uuid,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_store(None).await
    }

    /// Build a context whose services use `store` instead of the local one.
    pub async fn with_store(store: Option<Arc<dyn ObjectStore>>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("meta.db");
        let pool = crate::db::connect(&format!("sqlite://{}", db_path.display()), 8)
            .await
            .unwrap();
        crate::db::run_migrations(&pool).await.unwrap();
        let db = Arc::new(pool);

        let storage_dir = dir.path().join("objects");
        let store: Arc<dyn ObjectStore> = match store {
            Some(store) => store,
            None => Arc::new(LocalObjectStore::new(&storage_dir, "http://localhost/objects")),
        };
        let policy = StorePolicy {
            timeout: Duration::from_secs(5),
            attempts: 2,
        };
        let state = AppState::new(db.clone(), store, policy);

        let owner_id = Uuid::new_v4();
        let project = state
            .buckets
            .register_project(owner_id, "Summer wedding")
            .await
            .unwrap();

        Self {
            _dir: dir,
            db,
            state,
            owner_id,
            project_id: project.id,
        }
    }

    pub async fn bucket(&self, max_images_per_guest: i64) -> Bucket {
        self.bucket_with(max_images_per_guest, 1024 * 1024, None).await
    }

    pub async fn bucket_with(
        &self,
        max_images_per_guest: i64,
        max_file_size_bytes: i64,
        expires_at: Option<DateTime<Utc>>,
    ) -> Bucket {
        self.state
            .buckets
            .create_bucket(
                self.owner_id,
                self.project_id,
                NewBucket {
                    name: "Anna & Tom's Wedding".into(),
                    description: Some("Reception photos".into()),
                    max_images_per_guest,
                    max_file_size_bytes,
                    expires_at,
                },
            )
            .await
            .unwrap()
    }

    pub async fn guest(&self, bucket: &Bucket, name: &str, contact: &str) -> GuestSession {
        let (session, _, _) = self
            .state
            .sessions
            .get_or_create_session(bucket, GuestIdentity::new(name, contact))
            .await
            .unwrap();
        session
    }
}

pub fn jpeg(name: &str) -> IncomingFile {
    IncomingFile {
        filename: name.to_string(),
        content_type: Some("image/jpeg".into()),
        bytes: Bytes::from(format!("jpeg-bytes-of-{}", name)),
    }
}
