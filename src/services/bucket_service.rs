//! src/services/bucket_service.rs
//!
//! Bucket Manager: owns collection policy (quotas, size limits, expiry,
//! active flag) and issues access tokens. All mutations are owner-only; the
//! caller-supplied owner id is trusted as coming from the auth layer.

use crate::{
    models::{bucket::Bucket, project::Project},
    services::{
        ServiceError, ServiceResult, generate_token, is_unique_violation, not_found,
        object_store::{ObjectStore, StorePolicy},
    },
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub(crate) const BUCKET_COLUMNS: &str = "id, project_id, owner_id, name, description, max_images_per_guest, \
     max_file_size_bytes, storage_prefix, access_token, is_active, expires_at, created_at";

const MAX_NAME_LEN: usize = 200;
const TOKEN_ATTEMPTS: usize = 3;

/// Policy values supplied when creating a bucket.
#[derive(Debug, Clone, Deserialize)]
pub struct NewBucket {
    pub name: String,
    pub description: Option<String>,
    pub max_images_per_guest: i64,
    pub max_file_size_bytes: i64,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Partial policy update. `expires_at: Some(None)` clears the expiry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BucketPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub max_images_per_guest: Option<i64>,
    pub max_file_size_bytes: Option<i64>,
    #[serde(default, deserialize_with = "double_option")]
    pub expires_at: Option<Option<DateTime<Utc>>>,
    pub is_active: Option<bool>,
}

/// Distinguish an explicit `null` (clear) from an absent field (keep).
fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[derive(Clone)]
pub struct BucketService {
    db: Arc<SqlitePool>,
    objects: Arc<dyn ObjectStore>,
    policy: StorePolicy,
}

fn validate_policy(name: &str, max_images: i64, max_bytes: i64) -> ServiceResult<()> {
    if name.trim().is_empty() {
        return Err(ServiceError::Validation("bucket name must not be empty".into()));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(ServiceError::Validation(format!(
            "bucket name must be at most {} characters",
            MAX_NAME_LEN
        )));
    }
    if max_images < 1 {
        return Err(ServiceError::Validation(
            "max_images_per_guest must be at least 1".into(),
        ));
    }
    if max_bytes <= 0 {
        return Err(ServiceError::Validation(
            "max_file_size_bytes must be greater than 0".into(),
        ));
    }
    Ok(())
}

impl BucketService {
    pub fn new(db: Arc<SqlitePool>, objects: Arc<dyn ObjectStore>, policy: StorePolicy) -> Self {
        Self {
            db,
            objects,
            policy,
        }
    }

    /// Record a project for `owner_id`. Projects are owned by the account
    /// layer; this keeps the reference row bucket ownership checks rely on.
    pub async fn register_project(&self, owner_id: Uuid, name: &str) -> ServiceResult<Project> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ServiceError::Validation("project name must not be empty".into()));
        }
        let project = Project {
            id: Uuid::new_v4(),
            owner_id,
            name: name.to_string(),
            created_at: Utc::now(),
        };
        sqlx::query("INSERT INTO projects (id, owner_id, name, created_at) VALUES (?, ?, ?, ?)")
            .bind(project.id)
            .bind(project.owner_id)
            .bind(&project.name)
            .bind(project.created_at)
            .execute(&*self.db)
            .await?;
        Ok(project)
    }

    async fn ensure_project_owner(&self, owner_id: Uuid, project_id: Uuid) -> ServiceResult<()> {
        let owner: Uuid = sqlx::query_scalar("SELECT owner_id FROM projects WHERE id = ?")
            .bind(project_id)
            .fetch_one(&*self.db)
            .await
            .map_err(not_found("project"))?;
        if owner != owner_id {
            return Err(ServiceError::NotAuthorized);
        }
        Ok(())
    }

    /// Create a bucket with a fresh access token and storage prefix.
    pub async fn create_bucket(
        &self,
        owner_id: Uuid,
        project_id: Uuid,
        new: NewBucket,
    ) -> ServiceResult<Bucket> {
        validate_policy(&new.name, new.max_images_per_guest, new.max_file_size_bytes)?;
        self.ensure_project_owner(owner_id, project_id).await?;

        let id = Uuid::new_v4();
        let mut bucket = Bucket {
            id,
            project_id,
            owner_id,
            name: new.name.trim().to_string(),
            description: new.description.filter(|d| !d.trim().is_empty()),
            max_images_per_guest: new.max_images_per_guest,
            max_file_size_bytes: new.max_file_size_bytes,
            storage_prefix: format!("buckets/{}", id.simple()),
            access_token: generate_token(),
            is_active: true,
            expires_at: new.expires_at,
            created_at: Utc::now(),
        };

        // Regenerate the token on a unique collision.
        let mut attempt = 1;
        loop {
            let result = sqlx::query(
                "INSERT INTO buckets (id, project_id, owner_id, name, description,
                    max_images_per_guest, max_file_size_bytes, storage_prefix, access_token,
                    is_active, expires_at, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(bucket.id)
            .bind(bucket.project_id)
            .bind(bucket.owner_id)
            .bind(&bucket.name)
            .bind(&bucket.description)
            .bind(bucket.max_images_per_guest)
            .bind(bucket.max_file_size_bytes)
            .bind(&bucket.storage_prefix)
            .bind(&bucket.access_token)
            .bind(bucket.is_active)
            .bind(bucket.expires_at)
            .bind(bucket.created_at)
            .execute(&*self.db)
            .await;

            match result {
                Ok(_) => {
                    info!(bucket_id = %bucket.id, project_id = %project_id, "bucket created");
                    return Ok(bucket);
                }
                Err(err) if is_unique_violation(&err) && attempt < TOKEN_ATTEMPTS => {
                    warn!(attempt, "access token collision, regenerating");
                    bucket.access_token = generate_token();
                    attempt += 1;
                }
                Err(err) => return Err(ServiceError::Database(err)),
            }
        }
    }

    /// Fetch a bucket by id without ownership checks.
    pub async fn fetch_bucket(&self, bucket_id: Uuid) -> ServiceResult<Bucket> {
        sqlx::query_as::<_, Bucket>(&format!(
            "SELECT {} FROM buckets WHERE id = ?",
            BUCKET_COLUMNS
        ))
        .bind(bucket_id)
        .fetch_one(&*self.db)
        .await
        .map_err(not_found("bucket"))
    }

    /// Fetch a bucket the caller owns.
    pub async fn get_bucket(&self, owner_id: Uuid, bucket_id: Uuid) -> ServiceResult<Bucket> {
        let bucket = self.fetch_bucket(bucket_id).await?;
        if bucket.owner_id != owner_id {
            return Err(ServiceError::NotAuthorized);
        }
        Ok(bucket)
    }

    /// Buckets of one project, newest first.
    pub async fn list_buckets(&self, owner_id: Uuid, project_id: Uuid) -> ServiceResult<Vec<Bucket>> {
        self.ensure_project_owner(owner_id, project_id).await?;
        let mut buckets = sqlx::query_as::<_, Bucket>(&format!(
            "SELECT {} FROM buckets WHERE project_id = ? ORDER BY rowid DESC",
            BUCKET_COLUMNS
        ))
        .bind(project_id)
        .fetch_all(&*self.db)
        .await?;
        buckets.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(buckets)
    }

    /// Look a bucket up by its share token.
    ///
    /// Does not check activity or expiry: host-side and guest-side callers
    /// report those differently.
    pub async fn resolve_by_token(&self, access_token: &str) -> ServiceResult<Bucket> {
        sqlx::query_as::<_, Bucket>(&format!(
            "SELECT {} FROM buckets WHERE access_token = ?",
            BUCKET_COLUMNS
        ))
        .bind(access_token)
        .fetch_one(&*self.db)
        .await
        .map_err(not_found("bucket"))
    }

    /// Guest landing flow: resolve the token and require a usable bucket.
    pub async fn resolve_upload_entry(&self, access_token: &str) -> ServiceResult<Bucket> {
        let bucket = self.resolve_by_token(access_token).await?;
        if let Some(reason) = bucket.unavailable_reason(Utc::now()) {
            return Err(ServiceError::BucketUnavailable(reason));
        }
        Ok(bucket)
    }

    /// Apply a policy patch. Validation matches bucket creation.
    pub async fn update_policy(
        &self,
        owner_id: Uuid,
        bucket_id: Uuid,
        patch: BucketPatch,
    ) -> ServiceResult<Bucket> {
        let mut bucket = self.get_bucket(owner_id, bucket_id).await?;

        if let Some(name) = patch.name {
            bucket.name = name.trim().to_string();
        }
        if let Some(description) = patch.description {
            bucket.description = Some(description).filter(|d| !d.trim().is_empty());
        }
        if let Some(max_images) = patch.max_images_per_guest {
            bucket.max_images_per_guest = max_images;
        }
        if let Some(max_bytes) = patch.max_file_size_bytes {
            bucket.max_file_size_bytes = max_bytes;
        }
        if let Some(expires_at) = patch.expires_at {
            bucket.expires_at = expires_at;
        }
        if let Some(is_active) = patch.is_active {
            bucket.is_active = is_active;
        }
        validate_policy(
            &bucket.name,
            bucket.max_images_per_guest,
            bucket.max_file_size_bytes,
        )?;

        sqlx::query(
            "UPDATE buckets SET name = ?, description = ?, max_images_per_guest = ?,
                max_file_size_bytes = ?, expires_at = ?, is_active = ?
             WHERE id = ?",
        )
        .bind(&bucket.name)
        .bind(&bucket.description)
        .bind(bucket.max_images_per_guest)
        .bind(bucket.max_file_size_bytes)
        .bind(bucket.expires_at)
        .bind(bucket.is_active)
        .bind(bucket.id)
        .execute(&*self.db)
        .await?;

        info!(bucket_id = %bucket.id, "bucket policy updated");
        Ok(bucket)
    }

    pub async fn deactivate(&self, owner_id: Uuid, bucket_id: Uuid) -> ServiceResult<Bucket> {
        self.update_policy(
            owner_id,
            bucket_id,
            BucketPatch {
                is_active: Some(false),
                ..Default::default()
            },
        )
        .await
    }

    /// Delete a bucket. Sessions, uploads and scan events cascade in the
    /// metadata store; stored objects are removed best-effort afterwards.
    pub async fn delete_bucket(&self, owner_id: Uuid, bucket_id: Uuid) -> ServiceResult<()> {
        let bucket = self.get_bucket(owner_id, bucket_id).await?;

        let object_paths: Vec<String> = sqlx::query_scalar(
            "SELECT u.object_path FROM uploads u
             JOIN guest_sessions s ON s.id = u.session_id
             WHERE s.bucket_id = ?",
        )
        .bind(bucket.id)
        .fetch_all(&*self.db)
        .await?;

        let result = sqlx::query("DELETE FROM buckets WHERE id = ?")
            .bind(bucket.id)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::NotFound("bucket"));
        }
        info!(
            bucket_id = %bucket.id,
            objects = object_paths.len(),
            "bucket deleted, removing stored objects"
        );

        let mut orphaned = 0usize;
        for path in &object_paths {
            let objects = &self.objects;
            if let Err(err) = self
                .policy
                .run("object delete", || objects.delete(path))
                .await
            {
                orphaned += 1;
                warn!(bucket_id = %bucket.id, path = %path, error = %err, "orphaned object after bucket delete");
            }
        }
        if orphaned > 0 {
            warn!(bucket_id = %bucket.id, orphaned, "bucket delete left orphaned objects");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TestContext, jpeg};
    use chrono::Duration;

    fn new_bucket(max_images: i64, max_bytes: i64) -> NewBucket {
        NewBucket {
            name: "Birthday".into(),
            description: None,
            max_images_per_guest: max_images,
            max_file_size_bytes: max_bytes,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn create_rejects_bad_policy_values() {
        let ctx = TestContext::new().await;
        let buckets = &ctx.state.buckets;

        for (images, bytes) in [(0, 10), (-1, 10), (1, 0), (1, -5)] {
            let err = buckets
                .create_bucket(ctx.owner_id, ctx.project_id, new_bucket(images, bytes))
                .await
                .unwrap_err();
            assert!(matches!(err, ServiceError::Validation(_)), "{images}/{bytes}");
        }
    }

    #[tokio::test]
    async fn create_requires_project_ownership() {
        let ctx = TestContext::new().await;
        let err = ctx
            .state
            .buckets
            .create_bucket(Uuid::new_v4(), ctx.project_id, new_bucket(3, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotAuthorized));

        let err = ctx
            .state
            .buckets
            .create_bucket(ctx.owner_id, Uuid::new_v4(), new_bucket(3, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::NotFound("project")));
    }

    #[tokio::test]
    async fn create_issues_unique_tokens_and_prefixes() {
        let ctx = TestContext::new().await;
        let a = ctx.bucket(3).await;
        let b = ctx.bucket(3).await;
        assert_ne!(a.access_token, b.access_token);
        assert_eq!(a.storage_prefix, format!("buckets/{}", a.id.simple()));
        assert!(a.is_active);

        let resolved = ctx.state.buckets.resolve_by_token(&b.access_token).await.unwrap();
        assert_eq!(resolved.id, b.id);
        assert!(matches!(
            ctx.state.buckets.resolve_by_token("nope").await,
            Err(ServiceError::NotFound("bucket"))
        ));

        let listed = ctx
            .state
            .buckets
            .list_buckets(ctx.owner_id, ctx.project_id)
            .await
            .unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[tokio::test]
    async fn resolve_by_token_ignores_expiry_but_upload_entry_does_not() {
        let ctx = TestContext::new().await;
        let bucket = ctx
            .bucket_with(3, 1024, Some(Utc::now() - Duration::hours(1)))
            .await;

        assert!(ctx.state.buckets.resolve_by_token(&bucket.access_token).await.is_ok());
        assert!(matches!(
            ctx.state
                .buckets
                .resolve_upload_entry(&bucket.access_token)
                .await,
            Err(ServiceError::BucketUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn update_policy_validates_and_persists() {
        let ctx = TestContext::new().await;
        let bucket = ctx.bucket(3).await;
        let buckets = &ctx.state.buckets;

        let err = buckets
            .update_policy(
                ctx.owner_id,
                bucket.id,
                BucketPatch {
                    max_images_per_guest: Some(0),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));

        let expires = Utc::now() + Duration::days(2);
        let updated = buckets
            .update_policy(
                ctx.owner_id,
                bucket.id,
                BucketPatch {
                    name: Some("  Reception ".into()),
                    max_images_per_guest: Some(10),
                    expires_at: Some(Some(expires)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "Reception");
        assert_eq!(updated.max_images_per_guest, 10);

        let stored = buckets.fetch_bucket(bucket.id).await.unwrap();
        assert_eq!(stored.max_images_per_guest, 10);
        assert!(stored.expires_at.is_some());

        let cleared = buckets
            .update_policy(
                ctx.owner_id,
                bucket.id,
                BucketPatch {
                    expires_at: Some(None),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(cleared.expires_at.is_none());

        let deactivated = buckets.deactivate(ctx.owner_id, bucket.id).await.unwrap();
        assert!(!deactivated.is_active);

        assert!(matches!(
            buckets.deactivate(Uuid::new_v4(), bucket.id).await,
            Err(ServiceError::NotAuthorized)
        ));
    }

    #[test]
    fn patch_distinguishes_null_from_absent_expiry() {
        let absent: BucketPatch = serde_json::from_str(r#"{"name":"x"}"#).unwrap();
        assert!(absent.expires_at.is_none());
        let cleared: BucketPatch = serde_json::from_str(r#"{"expires_at":null}"#).unwrap();
        assert_eq!(cleared.expires_at, Some(None));
    }

    #[tokio::test]
    async fn delete_cascades_rows_and_removes_objects() {
        let ctx = TestContext::new().await;
        let bucket = ctx.bucket(5).await;
        let session = ctx.guest(&bucket, "Ann", "ann@example.com").await;
        let report = ctx
            .state
            .uploads
            .ingest_uploads(&session.session_token, vec![jpeg("a.jpg"), jpeg("b.jpg")])
            .await
            .unwrap();
        assert_eq!(report.accepted_count, 2);
        ctx.state
            .scans
            .record_scan(bucket.id, Default::default())
            .await;

        assert!(matches!(
            ctx.state.buckets.delete_bucket(Uuid::new_v4(), bucket.id).await,
            Err(ServiceError::NotAuthorized)
        ));
        ctx.state
            .buckets
            .delete_bucket(ctx.owner_id, bucket.id)
            .await
            .unwrap();

        for table in ["guest_sessions", "uploads", "scan_events"] {
            let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
                .fetch_one(&*ctx.db)
                .await
                .unwrap();
            assert_eq!(count, 0, "{table} should be empty");
        }
        for upload in &report.uploads {
            assert!(ctx.state.objects.get(&upload.object_path).await.is_err());
        }
        assert!(matches!(
            ctx.state.buckets.fetch_bucket(bucket.id).await,
            Err(ServiceError::NotFound("bucket"))
        ));
    }
}
