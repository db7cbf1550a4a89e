//! src/services/archive_service.rs
//!
//! Archive Exporter: streams a ZIP of a bucket's photos (all of them, one
//! guest's, or an explicit selection).
//!
//! Entries are fetched from the object store and written into the archive
//! one at a time by a background task feeding an in-memory pipe; the caller
//! reads the other end, so bytes flow before the last photo is fetched and
//! memory stays bounded to one entry. A failed fetch skips that entry. When
//! the reader is dropped (client disconnect) the task is cancelled and any
//! in-flight fetch is abandoned.

use crate::{
    models::bucket::Bucket,
    services::{
        ServiceError, ServiceResult,
        bucket_service::BUCKET_COLUMNS,
        naming, not_found,
        object_store::{ObjectStore, StorePolicy},
    },
};
use async_zip::{Compression, ZipEntryBuilder, tokio::write::ZipFileWriter};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::Stream;
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::{
    collections::{HashMap, HashSet},
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tokio::io::DuplexStream;
use tokio_util::{
    io::ReaderStream,
    sync::{CancellationToken, DropGuard},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Pipe capacity between the archive writer task and the response body.
const PIPE_CAPACITY: usize = 64 * 1024;

pub const ARCHIVE_CONTENT_TYPE: &str = "application/zip";

/// Which uploads go into the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportMode {
    /// Every upload of the bucket, one folder per guest.
    All,
    /// One guest's uploads, bare filenames.
    Guest { session_id: Uuid },
    /// An explicit set of uploads, one folder per guest.
    Selected { upload_ids: Vec<Uuid> },
}

impl ExportMode {
    fn partitions_by_guest(&self) -> bool {
        !matches!(self, ExportMode::Guest { .. })
    }
}

/// Upload row joined with the owning guest's name.
#[derive(Debug, Clone, sqlx::FromRow)]
struct Candidate {
    id: Uuid,
    session_id: Uuid,
    guest_name: String,
    original_filename: String,
    object_path: String,
    upload_order: i64,
    created_at: DateTime<Utc>,
}

/// One planned archive entry.
#[derive(Debug, Clone)]
struct PlannedEntry {
    upload_id: Uuid,
    name: String,
    object_path: String,
}

/// Body of an archive download. Dropping it cancels the producer.
pub struct ArchiveStream {
    inner: ReaderStream<DuplexStream>,
    _cancel_on_drop: DropGuard,
}

impl Stream for ArchiveStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// A ready-to-send archive.
pub struct ArchiveExport {
    /// Suggested download filename.
    pub filename: String,
    /// Entries the archive will contain if every fetch succeeds.
    pub planned_entries: usize,
    pub stream: ArchiveStream,
}

#[derive(Clone)]
pub struct ArchiveService {
    db: Arc<SqlitePool>,
    objects: Arc<dyn ObjectStore>,
    policy: StorePolicy,
}

impl ArchiveService {
    pub fn new(db: Arc<SqlitePool>, objects: Arc<dyn ObjectStore>, policy: StorePolicy) -> Self {
        Self {
            db,
            objects,
            policy,
        }
    }

    /// Start streaming an archive of `bucket_id` according to `mode`.
    ///
    /// Fails with `NoContent` before any byte is produced when no upload
    /// matches.
    pub async fn export_archive(
        &self,
        bucket_id: Uuid,
        mode: ExportMode,
    ) -> ServiceResult<ArchiveExport> {
        let bucket = sqlx::query_as::<_, Bucket>(&format!(
            "SELECT {} FROM buckets WHERE id = ?",
            BUCKET_COLUMNS
        ))
        .bind(bucket_id)
        .fetch_one(&*self.db)
        .await
        .map_err(not_found("bucket"))?;

        let (mut candidates, guest_name) = self.candidates(&bucket, &mode).await?;
        if candidates.is_empty() {
            return Err(ServiceError::NoContent);
        }
        candidates.sort_by(|a, b| {
            (a.created_at, a.upload_order).cmp(&(b.created_at, b.upload_order))
        });

        let entries = plan_entries(&candidates, mode.partitions_by_guest());
        let filename = archive_filename(&bucket.name, guest_name.as_deref());
        info!(
            bucket_id = %bucket.id,
            entries = entries.len(),
            filename = %filename,
            "starting archive export"
        );

        let planned_entries = entries.len();
        let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
        let cancel = CancellationToken::new();
        tokio::spawn(write_archive(
            self.objects.clone(),
            self.policy,
            entries,
            writer,
            cancel.clone(),
        ));

        Ok(ArchiveExport {
            filename,
            planned_entries,
            stream: ArchiveStream {
                inner: ReaderStream::new(reader),
                _cancel_on_drop: cancel.drop_guard(),
            },
        })
    }

    /// Resolve the uploads selected by `mode`, plus the guest name for
    /// single-guest exports.
    async fn candidates(
        &self,
        bucket: &Bucket,
        mode: &ExportMode,
    ) -> ServiceResult<(Vec<Candidate>, Option<String>)> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT u.id, u.session_id, s.guest_name, u.original_filename, u.object_path, \
             u.upload_order, u.created_at \
             FROM uploads u JOIN guest_sessions s ON s.id = u.session_id \
             WHERE s.bucket_id = ",
        );
        builder.push_bind(bucket.id);

        let mut guest_name = None;
        match mode {
            ExportMode::All => {}
            ExportMode::Guest { session_id } => {
                let name: String = sqlx::query_scalar(
                    "SELECT guest_name FROM guest_sessions WHERE id = ? AND bucket_id = ?",
                )
                .bind(session_id)
                .bind(bucket.id)
                .fetch_one(&*self.db)
                .await
                .map_err(not_found("session"))?;
                guest_name = Some(name);

                builder.push(" AND u.session_id = ");
                builder.push_bind(*session_id);
            }
            ExportMode::Selected { upload_ids } => {
                if upload_ids.is_empty() {
                    return Ok((Vec::new(), None));
                }
                builder.push(" AND u.id IN (");
                let mut separated = builder.separated(", ");
                for id in upload_ids {
                    separated.push_bind(*id);
                }
                separated.push_unseparated(")");
            }
        }
        builder.push(" ORDER BY u.created_at ASC, u.upload_order ASC");

        let rows: Vec<Candidate> = builder.build_query_as().fetch_all(&*self.db).await?;
        Ok((rows, guest_name))
    }
}

/// Assign entry paths: `guest/filename` when partitioning, bare `filename`
/// otherwise. Colliding names get a ` (n)` suffix; two guests whose names
/// sanitize identically get distinct folders.
fn plan_entries(candidates: &[Candidate], partition: bool) -> Vec<PlannedEntry> {
    let mut folders: HashMap<Uuid, String> = HashMap::new();
    let mut used_folders: HashSet<String> = HashSet::new();
    let mut used_names: HashSet<String> = HashSet::new();
    let mut entries = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        let folder = if partition {
            let folder = folders.entry(candidate.session_id).or_insert_with(|| {
                let base = naming::sanitize_component(&candidate.guest_name, "guest");
                unique_name(&base, &mut used_folders, |n| format!("{} ({})", base, n))
            });
            Some(folder.clone())
        } else {
            None
        };

        let file = naming::sanitize_component(&candidate.original_filename, "photo");
        let qualify = |name: &str| match &folder {
            Some(folder) => format!("{}/{}", folder, name),
            None => name.to_string(),
        };
        let name = unique_name(&qualify(&file), &mut used_names, |n| {
            qualify(&naming::numbered_duplicate(&file, n))
        });

        entries.push(PlannedEntry {
            upload_id: candidate.id,
            name,
            object_path: candidate.object_path.clone(),
        });
    }
    entries
}

fn unique_name(
    first: &str,
    used: &mut HashSet<String>,
    numbered: impl Fn(usize) -> String,
) -> String {
    let mut name = first.to_string();
    let mut n = 2;
    while !used.insert(name.clone()) {
        name = numbered(n);
        n += 1;
    }
    name
}

/// `{bucket}.zip`, or `{bucket}-{guest}.zip` for single-guest exports.
fn archive_filename(bucket_name: &str, guest_name: Option<&str>) -> String {
    let bucket = naming::sanitize_component(bucket_name, "photos").replace(' ', "_");
    match guest_name {
        Some(guest) => format!(
            "{}-{}.zip",
            bucket,
            naming::sanitize_component(guest, "guest").replace(' ', "_")
        ),
        None => format!("{}.zip", bucket),
    }
}

/// Producer task: fetch each entry and append it to the archive.
async fn write_archive(
    objects: Arc<dyn ObjectStore>,
    policy: StorePolicy,
    entries: Vec<PlannedEntry>,
    writer: DuplexStream,
    cancel: CancellationToken,
) {
    let mut zip = ZipFileWriter::with_tokio(writer);
    let mut written = 0usize;
    let mut skipped = 0usize;

    for entry in entries {
        let fetched = tokio::select! {
            _ = cancel.cancelled() => {
                info!(written, "archive export cancelled by client");
                return;
            }
            fetched = policy.run("object get", || objects.get(&entry.object_path)) => fetched,
        };

        let data = match fetched {
            Ok(data) => data,
            Err(err) => {
                skipped += 1;
                warn!(
                    upload_id = %entry.upload_id,
                    path = %entry.object_path,
                    error = %err,
                    "skipping archive entry"
                );
                continue;
            }
        };

        let builder = ZipEntryBuilder::new(entry.name.clone().into(), Compression::Deflate);
        if let Err(err) = zip.write_entry_whole(builder, &data).await {
            // The reader is gone or the pipe broke; nothing left to deliver to.
            debug!(error = %err, entry = %entry.name, "archive stream closed while writing");
            return;
        }
        written += 1;
    }

    match zip.close().await {
        Ok(_) => info!(written, skipped, "archive export finished"),
        Err(err) => warn!(written, skipped, error = %err, "failed to finalize archive"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::session::GuestSession,
        services::object_store::{LocalObjectStore, ObjectStoreResult},
        test_support::{TestContext, jpeg},
    };
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::{
        io::{Cursor, Read},
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        time::Duration,
    };

    /// Sets its flag when dropped.
    struct FlagOnDrop(Arc<AtomicBool>);

    impl Drop for FlagOnDrop {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// Local store where only the first `get` completes; later ones hang
    /// until their future is dropped.
    struct FirstGetOnly {
        inner: LocalObjectStore,
        gets: AtomicUsize,
        abandoned: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ObjectStore for FirstGetOnly {
        async fn put(
            &self,
            path: &str,
            bytes: Bytes,
            content_type: Option<&str>,
        ) -> ObjectStoreResult<String> {
            self.inner.put(path, bytes, content_type).await
        }

        async fn get(&self, path: &str) -> ObjectStoreResult<Bytes> {
            if self.gets.fetch_add(1, Ordering::SeqCst) == 0 {
                return self.inner.get(path).await;
            }
            let _flag = FlagOnDrop(self.abandoned.clone());
            std::future::pending().await
        }

        async fn delete(&self, path: &str) -> ObjectStoreResult<()> {
            self.inner.delete(path).await
        }
    }

    async fn collect(mut export: ArchiveExport) -> Vec<u8> {
        let mut body = Vec::new();
        while let Some(chunk) = export.stream.next().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        body
    }

    fn entry_names(body: Vec<u8>) -> Vec<String> {
        let archive = zip::ZipArchive::new(Cursor::new(body)).unwrap();
        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        names
    }

    async fn two_guests(ctx: &TestContext) -> (Bucket, GuestSession, GuestSession) {
        let bucket = ctx.bucket(3).await;
        let ann = ctx.guest(&bucket, "Ann Lee", "ann@example.com").await;
        let bob = ctx.guest(&bucket, "Bob/Smith", "bob@example.com").await;
        let uploads = &ctx.state.uploads;
        uploads
            .ingest_uploads(&ann.session_token, vec![jpeg("IMG_1.jpg"), jpeg("IMG_2.jpg")])
            .await
            .unwrap();
        uploads
            .ingest_uploads(&ann.session_token, vec![jpeg("IMG_3.jpg")])
            .await
            .unwrap();
        uploads
            .ingest_uploads(&bob.session_token, vec![jpeg("IMG_1.jpg")])
            .await
            .unwrap();
        (bucket, ann, bob)
    }

    #[tokio::test]
    async fn guest_export_uses_bare_filenames() {
        let ctx = TestContext::new().await;
        let (bucket, ann, _) = two_guests(&ctx).await;

        let export = ctx
            .state
            .archives
            .export_archive(bucket.id, ExportMode::Guest { session_id: ann.id })
            .await
            .unwrap();
        assert_eq!(export.filename, "Anna___Tom_s_Wedding-Ann_Lee.zip");
        assert_eq!(export.planned_entries, 3);

        let body = collect(export).await;
        assert_eq!(entry_names(body), ["IMG_1.jpg", "IMG_2.jpg", "IMG_3.jpg"]);
    }

    #[tokio::test]
    async fn all_export_partitions_by_guest_folder() {
        let ctx = TestContext::new().await;
        let (bucket, _, _) = two_guests(&ctx).await;

        let export = ctx
            .state
            .archives
            .export_archive(bucket.id, ExportMode::All)
            .await
            .unwrap();
        assert_eq!(export.filename, "Anna___Tom_s_Wedding.zip");

        let body = collect(export).await;
        let mut archive = zip::ZipArchive::new(Cursor::new(body.clone())).unwrap();
        let mut content = String::new();
        archive
            .by_name("Bob_Smith/IMG_1.jpg")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "jpeg-bytes-of-IMG_1.jpg");

        assert_eq!(
            entry_names(body),
            [
                "Ann Lee/IMG_1.jpg",
                "Ann Lee/IMG_2.jpg",
                "Ann Lee/IMG_3.jpg",
                "Bob_Smith/IMG_1.jpg",
            ]
        );
    }

    #[tokio::test]
    async fn selected_export_only_contains_requested_uploads() {
        let ctx = TestContext::new().await;
        let (bucket, ann, bob) = two_guests(&ctx).await;
        let ann_uploads = ctx.state.sessions.uploads_for(ann.id).await.unwrap();
        let bob_uploads = ctx.state.sessions.uploads_for(bob.id).await.unwrap();

        let export = ctx
            .state
            .archives
            .export_archive(
                bucket.id,
                ExportMode::Selected {
                    upload_ids: vec![ann_uploads[1].id, bob_uploads[0].id, Uuid::new_v4()],
                },
            )
            .await
            .unwrap();
        assert_eq!(
            entry_names(collect(export).await),
            ["Ann Lee/IMG_2.jpg", "Bob_Smith/IMG_1.jpg"]
        );
    }

    #[tokio::test]
    async fn missing_object_is_skipped_not_fatal() {
        let ctx = TestContext::new().await;
        let (bucket, ann, _) = two_guests(&ctx).await;
        let ann_uploads = ctx.state.sessions.uploads_for(ann.id).await.unwrap();
        ctx.state
            .objects
            .delete(&ann_uploads[0].object_path)
            .await
            .unwrap();

        let export = ctx
            .state
            .archives
            .export_archive(bucket.id, ExportMode::All)
            .await
            .unwrap();
        assert_eq!(export.planned_entries, 4);
        assert_eq!(
            entry_names(collect(export).await),
            ["Ann Lee/IMG_2.jpg", "Ann Lee/IMG_3.jpg", "Bob_Smith/IMG_1.jpg"]
        );
    }

    #[tokio::test]
    async fn bytes_flow_early_and_dropping_the_stream_stops_fetching() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FirstGetOnly {
            inner: LocalObjectStore::new(dir.path(), "http://localhost/objects"),
            gets: AtomicUsize::new(0),
            abandoned: Arc::new(AtomicBool::new(false)),
        });
        let ctx = TestContext::with_store(Some(store.clone() as Arc<dyn ObjectStore>)).await;
        let (bucket, _, _) = two_guests(&ctx).await;

        let mut export = ctx
            .state
            .archives
            .export_archive(bucket.id, ExportMode::All)
            .await
            .unwrap();
        assert_eq!(export.planned_entries, 4);

        // the first entry arrives while the second fetch is still blocked
        let first = tokio::time::timeout(Duration::from_secs(2), export.stream.next())
            .await
            .expect("first chunk")
            .unwrap()
            .unwrap();
        assert!(first.starts_with(b"PK\x03\x04"));
        for _ in 0..200 {
            if store.gets.load(Ordering::SeqCst) >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.gets.load(Ordering::SeqCst), 2);
        assert!(!store.abandoned.load(Ordering::SeqCst));

        drop(export);
        for _ in 0..200 {
            if store.abandoned.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(store.abandoned.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.gets.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn empty_candidate_set_fails_fast() {
        let ctx = TestContext::new().await;
        let bucket = ctx.bucket(3).await;
        let session = ctx.guest(&bucket, "Ann", "ann@example.com").await;
        let archives = &ctx.state.archives;

        assert!(matches!(
            archives.export_archive(bucket.id, ExportMode::All).await,
            Err(ServiceError::NoContent)
        ));
        assert!(matches!(
            archives
                .export_archive(bucket.id, ExportMode::Guest { session_id: session.id })
                .await,
            Err(ServiceError::NoContent)
        ));
        assert!(matches!(
            archives
                .export_archive(bucket.id, ExportMode::Selected { upload_ids: vec![] })
                .await,
            Err(ServiceError::NoContent)
        ));
        assert!(matches!(
            archives
                .export_archive(bucket.id, ExportMode::Guest { session_id: Uuid::new_v4() })
                .await,
            Err(ServiceError::NotFound("session"))
        ));
    }

    fn candidate(session_id: Uuid, guest: &str, file: &str) -> Candidate {
        Candidate {
            id: Uuid::new_v4(),
            session_id,
            guest_name: guest.into(),
            original_filename: file.into(),
            object_path: format!("p/{}", file),
            upload_order: 1,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn plan_disambiguates_colliding_names_and_folders() {
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let candidates = vec![
            candidate(a, "Ann", "IMG.jpg"),
            candidate(a, "Ann", "IMG.jpg"),
            candidate(b, "Ann", "IMG.jpg"),
            candidate(b, "Ann", "../x.jpg"),
        ];
        let names: Vec<String> = plan_entries(&candidates, true)
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(
            names,
            ["Ann/IMG.jpg", "Ann/IMG (2).jpg", "Ann (2)/IMG.jpg", "Ann (2)/_x.jpg"]
        );

        let flat: Vec<String> = plan_entries(&candidates[..2], false)
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(flat, ["IMG.jpg", "IMG (2).jpg"]);
    }
}
