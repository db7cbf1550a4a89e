//! src/services/object_store.rs
//!
//! Object Store Adapter: durable binary storage keyed by path. The service
//! layer only talks to the [`ObjectStore`] trait; [`LocalObjectStore`] keeps
//! payloads on local disk sharded beneath `base_path/{shard}/{shard}/{path}`.

use async_trait::async_trait;
use bytes::Bytes;
use std::{
    future::Future,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, warn};
use uuid::Uuid;

const MAX_OBJECT_PATH_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("invalid object path `{0}`")]
    InvalidPath(String),
    #[error("object store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ObjectStoreError {
    /// Whether repeating the same call could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Io(_))
    }
}

pub type ObjectStoreResult<T> = Result<T, ObjectStoreError>;

/// Durable binary storage used for guest photos.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `bytes` at `path`, replacing any previous payload, and return a
    /// retrievable URL.
    async fn put(
        &self,
        path: &str,
        bytes: Bytes,
        content_type: Option<&str>,
    ) -> ObjectStoreResult<String>;

    /// Read the payload stored at `path`.
    async fn get(&self, path: &str) -> ObjectStoreResult<Bytes>;

    /// Remove the payload at `path`. Missing objects are not an error.
    async fn delete(&self, path: &str) -> ObjectStoreResult<()>;
}

/// Timeout and retry budget applied at object store call sites.
#[derive(Clone, Copy, Debug)]
pub struct StorePolicy {
    pub timeout: Duration,
    pub attempts: u32,
}

impl Default for StorePolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            attempts: 3,
        }
    }
}

impl StorePolicy {
    /// Run `op` with a per-attempt timeout, retrying transient failures.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> ObjectStoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ObjectStoreResult<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(self.timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(ObjectStoreError::Timeout(self.timeout)),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < attempts => {
                    warn!(attempt, error = %err, "{} failed, retrying", what);
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Disk-backed object store.
#[derive(Clone, Debug)]
pub struct LocalObjectStore {
    /// Base directory on disk where object payloads are stored.
    base_path: PathBuf,

    /// Public URL prefix under which objects are served (`GET /objects/{*path}`).
    public_base_url: String,
}

impl LocalObjectStore {
    pub fn new(base_path: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Reject paths that could escape the base directory.
    fn ensure_path_safe(path: &str) -> ObjectStoreResult<()> {
        let invalid = path.is_empty()
            || path.len() > MAX_OBJECT_PATH_LEN
            || path.starts_with('/')
            || path.split('/').any(|segment| segment.is_empty() || segment == "..")
            || path
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0');
        if invalid {
            return Err(ObjectStoreError::InvalidPath(path.to_string()));
        }
        Ok(())
    }

    /// Two-level shard identifiers derived from MD5(path) to bound the
    /// number of entries per directory.
    fn shards(path: &str) -> (String, String) {
        let digest = md5::compute(path);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn shard_root(&self, path: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::shards(path);
        self.base_path.join(shard_a).join(shard_b)
    }

    fn file_path(&self, path: &str) -> PathBuf {
        self.shard_root(path).join(path)
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.public_base_url, path)
    }

    /// Remove empty directories between `start` and `stop` (exclusive).
    async fn prune_empty_dirs(start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    /// Write through a temp file, fsync, then rename into place so readers
    /// never observe a partial payload.
    async fn put(
        &self,
        path: &str,
        bytes: Bytes,
        content_type: Option<&str>,
    ) -> ObjectStoreResult<String> {
        Self::ensure_path_safe(path)?;
        let file_path = self.file_path(path);
        let parent = file_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| ObjectStoreError::InvalidPath(path.to_string()))?;
        fs::create_dir_all(&parent).await?;

        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let write = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, &file_path).await
        };
        if let Err(err) = write.await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(ObjectStoreError::Io(err));
        }

        debug!(
            path,
            size = bytes.len(),
            content_type = content_type.unwrap_or("application/octet-stream"),
            "stored object"
        );
        Ok(self.url_for(path))
    }

    async fn get(&self, path: &str) -> ObjectStoreResult<Bytes> {
        Self::ensure_path_safe(path)?;
        match fs::read(self.file_path(path)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(ObjectStoreError::NotFound(path.to_string()))
            }
            Err(err) => Err(ObjectStoreError::Io(err)),
        }
    }

    async fn delete(&self, path: &str) -> ObjectStoreResult<()> {
        Self::ensure_path_safe(path)?;
        let file_path = self.file_path(path);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(ObjectStoreError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            Self::prune_empty_dirs(parent, &self.base_path).await;
        }
        Ok(())
    }
}
