//! src/services/session_service.rs
//!
//! Session Manager: resolves or creates the resumable upload session of a
//! guest within a bucket. The guest contact is the identity key; creation is
//! idempotent under concurrent identical requests by relying on the
//! `(bucket_id, guest_contact)` unique constraint.

use crate::{
    models::{bucket::Bucket, session::GuestSession, upload::Upload},
    services::{ServiceError, ServiceResult, generate_token, is_unique_violation, not_found},
};
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

pub(crate) const SESSION_COLUMNS: &str =
    "id, bucket_id, guest_name, guest_contact, session_token, total_images, next_upload_order, created_at";

pub(crate) const UPLOAD_COLUMNS: &str = "id, session_id, original_filename, object_path, url, \
     thumbnail_url, content_type, file_size_bytes, upload_order, created_at";

const MAX_GUEST_FIELD_LEN: usize = 254;

/// Who the guest says they are.
#[derive(Debug, Clone)]
pub struct GuestIdentity {
    pub name: String,
    pub contact: String,
}

impl GuestIdentity {
    pub fn new(name: impl Into<String>, contact: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            contact: contact.into(),
        }
    }

    /// Trim both fields and lower-case the contact so `Ann@X.com ` and
    /// `ann@x.com` resume the same session.
    fn normalized(&self) -> ServiceResult<(String, String)> {
        let name = self.name.trim();
        let contact = self.contact.trim().to_lowercase();
        if name.is_empty() {
            return Err(ServiceError::Validation("guest name must not be empty".into()));
        }
        if contact.is_empty() {
            return Err(ServiceError::Validation(
                "guest contact must not be empty".into(),
            ));
        }
        if name.chars().count() > MAX_GUEST_FIELD_LEN || contact.chars().count() > MAX_GUEST_FIELD_LEN {
            return Err(ServiceError::Validation(format!(
                "guest name and contact must be at most {} characters",
                MAX_GUEST_FIELD_LEN
            )));
        }
        Ok((name.to_string(), contact))
    }
}

/// Result of [`SessionService::get_or_create_session`].
#[derive(Debug, Serialize)]
pub struct SessionHandle {
    pub session: GuestSession,
    /// Photos already sent in this session, in upload order.
    pub existing_uploads: Vec<Upload>,
    pub is_resuming: bool,
}

#[derive(Clone)]
pub struct SessionService {
    db: Arc<SqlitePool>,
}

impl SessionService {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Resume the guest's session in `bucket`, or open a new one.
    ///
    /// Returns the session, the uploads it already holds and whether it was
    /// resumed. Fails with `BucketUnavailable` for inactive or expired buckets.
    pub async fn get_or_create_session(
        &self,
        bucket: &Bucket,
        guest: GuestIdentity,
    ) -> ServiceResult<(GuestSession, Vec<Upload>, bool)> {
        if let Some(reason) = bucket.unavailable_reason(Utc::now()) {
            return Err(ServiceError::BucketUnavailable(reason));
        }
        let (guest_name, guest_contact) = guest.normalized()?;

        if let Some(existing) = self.find_by_contact(bucket.id, &guest_contact).await? {
            return self.resume(existing).await;
        }

        let session = GuestSession {
            id: Uuid::new_v4(),
            bucket_id: bucket.id,
            guest_name,
            guest_contact,
            session_token: generate_token(),
            total_images: 0,
            next_upload_order: 1,
            created_at: Utc::now(),
        };

        let inserted = sqlx::query(
            "INSERT INTO guest_sessions (id, bucket_id, guest_name, guest_contact, session_token,
                total_images, next_upload_order, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(session.id)
        .bind(session.bucket_id)
        .bind(&session.guest_name)
        .bind(&session.guest_contact)
        .bind(&session.session_token)
        .bind(session.total_images)
        .bind(session.next_upload_order)
        .bind(session.created_at)
        .execute(&*self.db)
        .await;

        match inserted {
            Ok(_) => {
                info!(
                    bucket_id = %bucket.id,
                    session_id = %session.id,
                    "guest session created"
                );
                Ok((session, Vec::new(), false))
            }
            // Lost the race against an identical request: return the winner.
            Err(err) if is_unique_violation(&err) => {
                debug!(bucket_id = %bucket.id, "concurrent session creation, fetching existing");
                let existing = self
                    .find_by_contact(bucket.id, &session.guest_contact)
                    .await?
                    .ok_or(ServiceError::Database(err))?;
                self.resume(existing).await
            }
            Err(err) => Err(ServiceError::Database(err)),
        }
    }

    /// [`get_or_create_session`](Self::get_or_create_session) packaged for
    /// JSON responses.
    pub async fn open(&self, bucket: &Bucket, guest: GuestIdentity) -> ServiceResult<SessionHandle> {
        let (session, existing_uploads, is_resuming) =
            self.get_or_create_session(bucket, guest).await?;
        Ok(SessionHandle {
            session,
            existing_uploads,
            is_resuming,
        })
    }

    async fn resume(&self, session: GuestSession) -> ServiceResult<(GuestSession, Vec<Upload>, bool)> {
        let uploads = self.uploads_for(session.id).await?;
        info!(
            session_id = %session.id,
            existing = uploads.len(),
            "guest session resumed"
        );
        Ok((session, uploads, true))
    }

    async fn find_by_contact(
        &self,
        bucket_id: Uuid,
        guest_contact: &str,
    ) -> ServiceResult<Option<GuestSession>> {
        let session = sqlx::query_as::<_, GuestSession>(&format!(
            "SELECT {} FROM guest_sessions WHERE bucket_id = ? AND guest_contact = ?",
            SESSION_COLUMNS
        ))
        .bind(bucket_id)
        .bind(guest_contact)
        .fetch_optional(&*self.db)
        .await?;
        Ok(session)
    }

    /// Look a session up by the token the guest client holds.
    pub async fn find_by_token(&self, session_token: &str) -> ServiceResult<GuestSession> {
        sqlx::query_as::<_, GuestSession>(&format!(
            "SELECT {} FROM guest_sessions WHERE session_token = ?",
            SESSION_COLUMNS
        ))
        .bind(session_token)
        .fetch_one(&*self.db)
        .await
        .map_err(not_found("session"))
    }

    pub async fn uploads_for(&self, session_id: Uuid) -> ServiceResult<Vec<Upload>> {
        let uploads = sqlx::query_as::<_, Upload>(&format!(
            "SELECT {} FROM uploads WHERE session_id = ? ORDER BY upload_order ASC",
            UPLOAD_COLUMNS
        ))
        .bind(session_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(uploads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TestContext, jpeg};
    use chrono::Duration;

    #[tokio::test]
    async fn second_visit_with_same_contact_resumes() {
        let ctx = TestContext::new().await;
        let bucket = ctx.bucket(3).await;
        let sessions = &ctx.state.sessions;

        let (first, uploads, resuming) = sessions
            .get_or_create_session(&bucket, GuestIdentity::new("Ann", "ann@example.com"))
            .await
            .unwrap();
        assert!(!resuming);
        assert!(uploads.is_empty());
        assert_eq!(first.total_images, 0);

        ctx.state
            .uploads
            .ingest_uploads(
                &first.session_token,
                vec![jpeg("1.jpg"), jpeg("2.jpg"), jpeg("3.jpg")],
            )
            .await
            .unwrap();

        // misspelled name and different casing, same identity
        let (second, uploads, resuming) = sessions
            .get_or_create_session(&bucket, GuestIdentity::new("Anne", " ANN@example.com "))
            .await
            .unwrap();
        assert!(resuming);
        assert_eq!(second.id, first.id);
        assert_eq!(second.session_token, first.session_token);
        assert_eq!(second.total_images, 3);
        let names: Vec<_> = uploads.iter().map(|u| u.original_filename.as_str()).collect();
        assert_eq!(names, ["1.jpg", "2.jpg", "3.jpg"]);
    }

    #[tokio::test]
    async fn same_contact_in_other_bucket_is_a_new_session() {
        let ctx = TestContext::new().await;
        let a = ctx.bucket(3).await;
        let b = ctx.bucket(3).await;
        let sa = ctx.guest(&a, "Ann", "ann@example.com").await;
        let sb = ctx.guest(&b, "Ann", "ann@example.com").await;
        assert_ne!(sa.id, sb.id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creation_yields_one_session() {
        let ctx = TestContext::new().await;
        let bucket = ctx.bucket(3).await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let sessions = ctx.state.sessions.clone();
            let bucket = bucket.clone();
            handles.push(tokio::spawn(async move {
                sessions
                    .get_or_create_session(&bucket, GuestIdentity::new("Ann", "ann@example.com"))
                    .await
            }));
        }

        let mut ids = Vec::new();
        let mut fresh = 0;
        for handle in handles {
            let (session, _, resuming) = handle.await.unwrap().unwrap();
            if !resuming {
                fresh += 1;
            }
            ids.push((session.id, session.session_token));
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(fresh, 1);

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM guest_sessions WHERE bucket_id = ?")
            .bind(bucket.id)
            .fetch_one(&*ctx.db)
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn expired_or_inactive_bucket_is_unavailable() {
        let ctx = TestContext::new().await;
        let expired = ctx
            .bucket_with(3, 1024, Some(Utc::now() - Duration::minutes(5)))
            .await;

        // the row is still resolvable by token
        let resolved = ctx
            .state
            .buckets
            .resolve_by_token(&expired.access_token)
            .await
            .unwrap();
        let err = ctx
            .state
            .sessions
            .get_or_create_session(&resolved, GuestIdentity::new("Ann", "ann@example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::BucketUnavailable(_)));

        let bucket = ctx.bucket(3).await;
        let inactive = ctx
            .state
            .buckets
            .deactivate(ctx.owner_id, bucket.id)
            .await
            .unwrap();
        assert!(matches!(
            ctx.state
                .sessions
                .get_or_create_session(&inactive, GuestIdentity::new("Ann", "ann@example.com"))
                .await,
            Err(ServiceError::BucketUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn blank_identity_is_rejected() {
        let ctx = TestContext::new().await;
        let bucket = ctx.bucket(3).await;
        for (name, contact) in [("", "a@b.c"), ("Ann", "   ")] {
            assert!(matches!(
                ctx.state
                    .sessions
                    .get_or_create_session(&bucket, GuestIdentity::new(name, contact))
                    .await,
                Err(ServiceError::Validation(_))
            ));
        }
    }

    #[tokio::test]
    async fn unknown_token_is_not_found() {
        let ctx = TestContext::new().await;
        assert!(matches!(
            ctx.state.sessions.find_by_token("missing").await,
            Err(ServiceError::NotFound("session"))
        ));
    }
}
