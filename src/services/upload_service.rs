//! src/services/upload_service.rs
//!
//! Upload Ingestor: validates, stores and records guest photos against a
//! session while enforcing the per-guest quota.
//!
//! Admission works in three phases:
//! 1. per-file validation (image kind, size limit), reported individually;
//! 2. one write transaction that re-checks the bucket, computes
//!    `min(valid, max_images_per_guest - total_images)` and reserves that many
//!    slots plus a contiguous block of `upload_order` values;
//! 3. per-file store + record, each with its own error boundary. A failed
//!    file releases its slot; neighbours are unaffected.

use crate::{
    models::{bucket::Bucket, session::GuestSession, upload::Upload},
    services::{
        ServiceError, ServiceResult, is_foreign_key_violation, naming, not_found,
        object_store::{ObjectStore, StorePolicy},
        session_service::{SessionService, UPLOAD_COLUMNS},
    },
};
use bytes::Bytes;
use chrono::Utc;
use futures::{StreamExt, stream};
use serde::Serialize;
use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};
use tracing::{error, info, warn};
use uuid::Uuid;

const BUCKET_OF_SESSION: &str = "SELECT b.id, b.project_id, b.owner_id, b.name, b.description, \
     b.max_images_per_guest, b.max_file_size_bytes, b.storage_prefix, b.access_token, b.is_active, \
     b.expires_at, b.created_at \
     FROM buckets b JOIN guest_sessions s ON s.bucket_id = b.id WHERE s.id = ?";

/// Files of one batch stored concurrently.
const STORE_CONCURRENCY: usize = 4;
/// Attempts at recording an upload row after its payload was stored.
const RECORD_ATTEMPTS: u32 = 3;

/// One file of an ingestion batch.
#[derive(Debug, Clone)]
pub struct IncomingFile {
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

/// Why a file of the batch was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    /// Not an image.
    UnsupportedType { content_type: Option<String> },
    /// Empty payload.
    Empty,
    /// Larger than the bucket's per-file limit.
    TooLarge { size_bytes: i64, max_bytes: i64 },
    /// The guest's quota was used up by earlier files.
    QuotaExceeded { max_images: i64 },
    /// The object or metadata store failed after retries.
    Storage { message: String },
    /// The bucket was deactivated, expired or deleted mid-batch.
    BucketUnavailable,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileStatus {
    Accepted { upload_id: Uuid, upload_order: i64 },
    Rejected(RejectReason),
}

/// Per-file outcome, in the order the files were submitted.
#[derive(Debug, Clone, Serialize)]
pub struct FileOutcome {
    pub filename: String,
    #[serde(flatten)]
    pub status: FileStatus,
}

#[derive(Debug, Serialize)]
pub struct IngestReport {
    pub accepted_count: usize,
    pub uploads: Vec<Upload>,
    pub outcomes: Vec<FileOutcome>,
    /// Session image count after this batch.
    pub total_images: i64,
    pub max_images_per_guest: i64,
}

/// Slots reserved for one batch.
#[derive(Debug, Clone, Copy)]
struct Reservation {
    admitted: usize,
    first_order: i64,
}

/// A validated file waiting for admission.
struct Candidate {
    index: usize,
    filename: String,
    content_type: String,
    bytes: Bytes,
}

#[derive(Clone)]
pub struct UploadService {
    db: Arc<SqlitePool>,
    objects: Arc<dyn ObjectStore>,
    policy: StorePolicy,
    sessions: SessionService,
}

impl UploadService {
    pub fn new(db: Arc<SqlitePool>, objects: Arc<dyn ObjectStore>, policy: StorePolicy) -> Self {
        Self {
            sessions: SessionService::new(db.clone()),
            db,
            objects,
            policy,
        }
    }

    /// Accept as many of `files` as the session's quota allows.
    ///
    /// Session and bucket resolution failures are hard errors; everything
    /// after that degrades to per-file rejections in the report.
    pub async fn ingest_uploads(
        &self,
        session_token: &str,
        files: Vec<IncomingFile>,
    ) -> ServiceResult<IngestReport> {
        let session = self.sessions.find_by_token(session_token).await?;
        let bucket = self.bucket_of(session.id).await?;
        if let Some(reason) = bucket.unavailable_reason(Utc::now()) {
            return Err(ServiceError::BucketUnavailable(reason));
        }

        let mut outcomes: Vec<Option<FileOutcome>> = vec![None; files.len()];
        let mut candidates = Vec::new();
        for (index, file) in files.into_iter().enumerate() {
            let filename = naming::base_filename(&file.filename).to_string();
            match validate(&bucket, &filename, &file) {
                Ok(content_type) => candidates.push(Candidate {
                    index,
                    filename,
                    content_type,
                    bytes: file.bytes,
                }),
                Err(reason) => outcomes[index] = Some(rejected(filename, reason)),
            }
        }

        // Reservation and stores run detached: a dropped request must not
        // strand reserved slots or half-recorded files.
        let this = self.clone();
        let session_id = session.id;
        let max_images_per_guest = bucket.max_images_per_guest;
        let results = tokio::spawn(async move { this.admit(session, bucket, candidates).await })
            .await??;

        let mut uploads = Vec::new();
        for (index, filename, result) in results {
            outcomes[index] = Some(match result {
                Ok(upload) => {
                    let outcome = FileOutcome {
                        filename,
                        status: FileStatus::Accepted {
                            upload_id: upload.id,
                            upload_order: upload.upload_order,
                        },
                    };
                    uploads.push(upload);
                    outcome
                }
                Err(reason) => rejected(filename, reason),
            });
        }

        let total_images: i64 =
            sqlx::query_scalar("SELECT total_images FROM guest_sessions WHERE id = ?")
                .bind(session_id)
                .fetch_optional(&*self.db)
                .await?
                .unwrap_or(0);

        let outcomes: Vec<FileOutcome> = outcomes.into_iter().flatten().collect();
        info!(
            session_id = %session_id,
            submitted = outcomes.len(),
            accepted = uploads.len(),
            total_images,
            "upload batch ingested"
        );

        Ok(IngestReport {
            accepted_count: uploads.len(),
            uploads,
            outcomes,
            total_images,
            max_images_per_guest,
        })
    }

    /// Reserve quota for `candidates`, then store and record the admitted
    /// ones. Overflow files come back as `QuotaExceeded`.
    async fn admit(
        &self,
        session: GuestSession,
        bucket: Bucket,
        mut candidates: Vec<Candidate>,
    ) -> ServiceResult<Vec<(usize, String, Result<Upload, RejectReason>)>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let reservation = self.reserve(session.id, candidates.len()).await?;
        let overflow = candidates.split_off(reservation.admitted.min(candidates.len()));

        let (session_ref, bucket_ref) = (&session, &bucket);
        let jobs: Vec<_> = candidates
            .into_iter()
            .enumerate()
            .map(|(slot, candidate)| {
                let upload_order = reservation.first_order + slot as i64;
                let index = candidate.index;
                let filename = candidate.filename.clone();
                async move {
                    let result = self
                        .store_one(session_ref, bucket_ref, candidate, upload_order)
                        .await;
                    (index, filename, result)
                }
            })
            .collect();
        let mut results: Vec<(usize, String, Result<Upload, RejectReason>)> = stream::iter(jobs)
            .buffered(STORE_CONCURRENCY)
            .collect()
            .await;

        results.extend(overflow.into_iter().map(|candidate| {
            (
                candidate.index,
                candidate.filename,
                Err(RejectReason::QuotaExceeded {
                    max_images: bucket.max_images_per_guest,
                }),
            )
        }));
        Ok(results)
    }

    async fn bucket_of(&self, session_id: Uuid) -> ServiceResult<Bucket> {
        sqlx::query_as::<_, Bucket>(BUCKET_OF_SESSION)
            .bind(session_id)
            .fetch_one(&*self.db)
            .await
            .map_err(not_found("bucket"))
    }

    /// Atomically reserve up to `wanted` slots on the session counter.
    ///
    /// The transaction opens with a write so it holds SQLite's write lock
    /// before the counter is read; concurrent batches for the same session
    /// therefore see each other's reservations.
    async fn reserve(&self, session_id: Uuid, wanted: usize) -> ServiceResult<Reservation> {
        let mut tx = self.db.begin().await?;

        let touched = sqlx::query("UPDATE guest_sessions SET total_images = total_images WHERE id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        if touched.rows_affected() == 0 {
            return Err(ServiceError::NotFound("session"));
        }

        let (total_images, next_upload_order): (i64, i64) = sqlx::query_as(
            "SELECT total_images, next_upload_order FROM guest_sessions WHERE id = ?",
        )
        .bind(session_id)
        .fetch_one(&mut *tx)
        .await?;

        // Re-check the bucket under the lock: it may have been deactivated or
        // had its quota lowered since the batch started.
        let bucket = sqlx::query_as::<_, Bucket>(BUCKET_OF_SESSION)
            .bind(session_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(not_found("bucket"))?;
        if let Some(reason) = bucket.unavailable_reason(Utc::now()) {
            return Err(ServiceError::BucketUnavailable(reason));
        }

        let remaining = (bucket.max_images_per_guest - total_images).max(0);
        let admitted = wanted.min(remaining as usize);

        if admitted > 0 {
            sqlx::query(
                "UPDATE guest_sessions
                 SET total_images = total_images + ?, next_upload_order = next_upload_order + ?
                 WHERE id = ?",
            )
            .bind(admitted as i64)
            .bind(admitted as i64)
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(Reservation {
            admitted,
            first_order: next_upload_order,
        })
    }

    /// Give back `count` reserved slots after failed stores.
    async fn release(&self, session_id: Uuid, count: i64) {
        let result = sqlx::query(
            "UPDATE guest_sessions SET total_images = MAX(total_images - ?, 0) WHERE id = ?",
        )
        .bind(count)
        .bind(session_id)
        .execute(&*self.db)
        .await;
        if let Err(err) = result {
            error!(session_id = %session_id, error = %err, "failed to release reserved upload slot");
        }
    }

    /// Store one admitted file and record it. Any failure releases the slot.
    async fn store_one(
        &self,
        session: &GuestSession,
        bucket: &Bucket,
        candidate: Candidate,
        upload_order: i64,
    ) -> Result<Upload, RejectReason> {
        let result = self
            .store_and_record(session, bucket, candidate, upload_order)
            .await;
        if result.is_err() {
            self.release(session.id, 1).await;
        }
        result
    }

    async fn store_and_record(
        &self,
        session: &GuestSession,
        bucket: &Bucket,
        candidate: Candidate,
        upload_order: i64,
    ) -> Result<Upload, RejectReason> {
        let object_path = format!(
            "{}/{}/{:06}-{}",
            bucket.storage_prefix,
            session.id.simple(),
            upload_order,
            naming::sanitize_component(&candidate.filename, "photo")
        );

        let objects = &self.objects;
        let bytes = candidate.bytes;
        let content_type = candidate.content_type;
        let url = self
            .policy
            .run("object put", || {
                objects.put(&object_path, bytes.clone(), Some(content_type.as_str()))
            })
            .await
            .map_err(|err| {
                warn!(
                    session_id = %session.id,
                    path = %object_path,
                    error = %err,
                    "storing upload failed"
                );
                RejectReason::Storage {
                    message: err.to_string(),
                }
            })?;

        let upload = Upload {
            id: Uuid::new_v4(),
            session_id: session.id,
            original_filename: candidate.filename,
            object_path,
            url,
            thumbnail_url: None,
            content_type: Some(content_type),
            file_size_bytes: bytes.len() as i64,
            upload_order,
            created_at: Utc::now(),
        };

        let mut attempt = 1;
        loop {
            match self.record(&upload).await {
                Ok(()) => return Ok(upload),
                Err(RecordError::BucketGone) => {
                    self.discard_object(&upload.object_path).await;
                    return Err(RejectReason::BucketUnavailable);
                }
                Err(RecordError::Database(err)) if attempt < RECORD_ATTEMPTS => {
                    warn!(attempt, upload_id = %upload.id, error = %err, "recording upload failed, retrying");
                    tokio::time::sleep(Duration::from_millis(25 * u64::from(attempt))).await;
                    attempt += 1;
                }
                Err(RecordError::Database(err)) => {
                    error!(
                        upload_id = %upload.id,
                        path = %upload.object_path,
                        error = %err,
                        "upload stored but not recorded, discarding object"
                    );
                    self.discard_object(&upload.object_path).await;
                    return Err(RejectReason::Storage {
                        message: "failed to record upload".into(),
                    });
                }
            }
        }
    }

    /// Insert the upload row, re-checking the bucket inside the same write
    /// transaction so a deactivation or delete racing the batch wins.
    async fn record(&self, upload: &Upload) -> Result<(), RecordError> {
        let mut tx = self.db.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO uploads (id, session_id, original_filename, object_path, url,
                thumbnail_url, content_type, file_size_bytes, upload_order, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(upload.id)
        .bind(upload.session_id)
        .bind(&upload.original_filename)
        .bind(&upload.object_path)
        .bind(&upload.url)
        .bind(&upload.thumbnail_url)
        .bind(&upload.content_type)
        .bind(upload.file_size_bytes)
        .bind(upload.upload_order)
        .bind(upload.created_at)
        .execute(&mut *tx)
        .await;
        match inserted {
            Ok(_) => {}
            Err(err) if is_foreign_key_violation(&err) => return Err(RecordError::BucketGone),
            Err(err) => return Err(RecordError::Database(err)),
        }

        let bucket = sqlx::query_as::<_, Bucket>(BUCKET_OF_SESSION)
            .bind(upload.session_id)
            .fetch_optional(&mut *tx)
            .await?;

        match bucket {
            Some(bucket) if bucket.is_available_at(Utc::now()) => {
                tx.commit().await?;
                Ok(())
            }
            _ => {
                tx.rollback().await?;
                Err(RecordError::BucketGone)
            }
        }
    }

    async fn discard_object(&self, path: &str) {
        let objects = &self.objects;
        if let Err(err) = self.policy.run("object delete", || objects.delete(path)).await {
            warn!(path, error = %err, "orphaned object left in store");
        }
    }

    /// Moderation delete by the bucket owner. Removes the row and decrements
    /// the session counter in one transaction, then drops the payload.
    pub async fn delete_upload(&self, owner_id: Uuid, upload_id: Uuid) -> ServiceResult<()> {
        let upload = sqlx::query_as::<_, Upload>(&format!(
            "SELECT {} FROM uploads WHERE id = ?",
            UPLOAD_COLUMNS
        ))
        .bind(upload_id)
        .fetch_one(&*self.db)
        .await
        .map_err(not_found("upload"))?;

        let bucket_owner: Uuid = sqlx::query_scalar(
            "SELECT b.owner_id FROM buckets b JOIN guest_sessions s ON s.bucket_id = b.id
             WHERE s.id = ?",
        )
        .bind(upload.session_id)
        .fetch_one(&*self.db)
        .await
        .map_err(not_found("bucket"))?;
        if bucket_owner != owner_id {
            return Err(ServiceError::NotAuthorized);
        }

        let mut tx = self.db.begin().await?;
        let deleted = sqlx::query("DELETE FROM uploads WHERE id = ?")
            .bind(upload.id)
            .execute(&mut *tx)
            .await?;
        if deleted.rows_affected() == 0 {
            return Err(ServiceError::NotFound("upload"));
        }
        sqlx::query(
            "UPDATE guest_sessions SET total_images = MAX(total_images - 1, 0) WHERE id = ?",
        )
        .bind(upload.session_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(upload_id = %upload.id, session_id = %upload.session_id, "upload deleted");
        self.discard_object(&upload.object_path).await;
        Ok(())
    }
}

enum RecordError {
    BucketGone,
    Database(sqlx::Error),
}

impl From<sqlx::Error> for RecordError {
    fn from(err: sqlx::Error) -> Self {
        RecordError::Database(err)
    }
}

fn rejected(filename: String, reason: RejectReason) -> FileOutcome {
    FileOutcome {
        filename,
        status: FileStatus::Rejected(reason),
    }
}

/// Check kind and size; returns the effective image content type.
fn validate(bucket: &Bucket, filename: &str, file: &IncomingFile) -> Result<String, RejectReason> {
    let content_type = naming::resolve_image_type(filename, file.content_type.as_deref())
        .ok_or_else(|| RejectReason::UnsupportedType {
            content_type: file.content_type.clone(),
        })?;
    let size = file.bytes.len() as i64;
    if size == 0 {
        return Err(RejectReason::Empty);
    }
    if size > bucket.max_file_size_bytes {
        return Err(RejectReason::TooLarge {
            size_bytes: size,
            max_bytes: bucket.max_file_size_bytes,
        });
    }
    Ok(content_type)
}
