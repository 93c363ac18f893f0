//! Storage backends and the facade in front of them.
//!
//! Every backend implements [`StorageBackend`]. The process builds exactly
//! one at startup (see [`Storage::from_config`]) and reaches it only through
//! [`Storage`], which forwards calls unmodified and never retries.

use crate::config::{BackendKind, Config};
use crate::error::StorageError;
use crate::local_backend::LocalBackend;
use crate::object_store::ObjectStoreBackend;
use crate::s3_client::S3Client;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

/// Owned byte source handed between pipeline stages.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// An open blob and, when the backend knows it, its stored length.
pub struct BlobStream {
    pub reader: BoxReader,
    pub len: Option<u64>,
}

impl BlobStream {
    pub fn new(reader: BoxReader, len: Option<u64>) -> Self {
        Self { reader, len }
    }
}

/// One page of a key listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyPage {
    pub keys: Vec<String>,
    /// Continuation token for the next page, `None` on the last page
    pub next: Option<String>,
}

/// Outcome of [`Storage::sweep_orphans`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub orphans: Vec<String>,
    pub deleted: usize,
}

/// Capability set every storage medium provides.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    async fn read_stream(&self, key: &str) -> Result<BlobStream, StorageError>;

    /// Store the contents of a file on local disk. Returns bytes stored.
    async fn write_from_local_file(&self, key: &str, path: &Path) -> Result<u64, StorageError>;

    async fn write_buffer(&self, key: &str, bytes: Bytes) -> Result<(), StorageError>;

    /// Store a stream. `known_length`, when given, must be exact.
    /// Returns bytes stored.
    async fn write_stream(
        &self,
        key: &str,
        source: BoxReader,
        known_length: Option<u64>,
    ) -> Result<u64, StorageError>;

    /// Remove a blob. Removing a missing blob succeeds.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    async fn copy(&self, from: &str, to: &str) -> Result<(), StorageError>;

    /// Paginated listing. Backends without one return an empty page.
    async fn list_keys(
        &self,
        _prefix: &str,
        _continuation: Option<String>,
    ) -> Result<KeyPage, StorageError> {
        Ok(KeyPage::default())
    }

    /// Absolute on-disk path for `key`, only for disk-backed stores.
    fn local_path(&self, _key: &str) -> Result<Option<PathBuf>, StorageError> {
        Ok(None)
    }
}

/// The single entry point collaborators use to reach storage.
#[derive(Clone)]
pub struct Storage {
    backend: Arc<dyn StorageBackend>,
}

impl Storage {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Build the backend selected by `cfg.backend`.
    pub async fn from_config(cfg: &Config) -> Result<Self, StorageError> {
        let backend: Arc<dyn StorageBackend> = match cfg.backend {
            BackendKind::Local => Arc::new(LocalBackend::new(&cfg.storage_dir).await?),
            BackendKind::S3 => {
                let s3 = cfg
                    .s3
                    .as_ref()
                    .ok_or_else(|| StorageError::backend("s3 backend selected without s3 settings"))?;
                let client = S3Client::new(s3)?;
                Arc::new(ObjectStoreBackend::new(Arc::new(client), cfg.multipart_part_size))
            }
        };
        info!(backend = ?backend.kind(), "storage backend ready");
        Ok(Self { backend })
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        self.backend.exists(key).await
    }

    pub async fn read_stream(&self, key: &str) -> Result<BlobStream, StorageError> {
        debug!(key = %key, "opening blob");
        self.backend.read_stream(key).await
    }

    pub async fn write_from_local_file(&self, key: &str, path: &Path) -> Result<u64, StorageError> {
        self.backend.write_from_local_file(key, path).await
    }

    pub async fn write_buffer(&self, key: &str, bytes: Bytes) -> Result<(), StorageError> {
        self.backend.write_buffer(key, bytes).await
    }

    pub async fn write_stream(
        &self,
        key: &str,
        source: BoxReader,
        known_length: Option<u64>,
    ) -> Result<u64, StorageError> {
        self.backend.write_stream(key, source, known_length).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.backend.delete(key).await
    }

    pub async fn copy(&self, from: &str, to: &str) -> Result<(), StorageError> {
        self.backend.copy(from, to).await
    }

    pub async fn list_keys(
        &self,
        prefix: &str,
        continuation: Option<String>,
    ) -> Result<KeyPage, StorageError> {
        self.backend.list_keys(prefix, continuation).await
    }

    /// Resolve `key` to an absolute path when the local backend is active.
    pub fn local_path(&self, key: &str) -> Result<Option<PathBuf>, StorageError> {
        self.backend.local_path(key)
    }

    /// Delete every listed key under `prefix` that `is_referenced` rejects.
    /// With `dry_run` the orphans are only reported.
    pub async fn sweep_orphans<F>(
        &self,
        prefix: &str,
        is_referenced: F,
        dry_run: bool,
    ) -> Result<SweepReport, StorageError>
    where
        F: Fn(&str) -> bool + Send + Sync,
    {
        let mut report = SweepReport::default();
        let mut continuation = None;

        loop {
            let page = self.list_keys(prefix, continuation.take()).await?;
            report.scanned += page.keys.len();

            for key in page.keys {
                if is_referenced(&key) {
                    continue;
                }
                if !dry_run {
                    match self.delete(&key).await {
                        Ok(()) => report.deleted += 1,
                        Err(e) => warn!(key = %key, error = %e, "failed to delete orphan"),
                    }
                }
                report.orphans.push(key);
            }

            match page.next {
                Some(next) => continuation = Some(next),
                None => break,
            }
        }

        info!(
            scanned = report.scanned,
            orphans = report.orphans.len(),
            deleted = report.deleted,
            dry_run,
            "orphan sweep complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryObjectClient;

    fn memory_storage() -> (Storage, Arc<MemoryObjectClient>) {
        let client = Arc::new(MemoryObjectClient::new());
        let backend = ObjectStoreBackend::new(client.clone(), crate::config::MIN_PART_SIZE)
            .with_list_page_size(2);
        (Storage::new(Arc::new(backend)), client)
    }

    #[tokio::test]
    async fn sweep_walks_every_page() {
        let (storage, client) = memory_storage();
        for key in ["blobs/a", "blobs/b", "blobs/c", "blobs/d", "blobs/e", "other/x"] {
            storage
                .write_buffer(key, Bytes::from_static(b"x"))
                .await
                .expect("write");
        }

        let keep = ["blobs/b", "blobs/d"];
        let dry = storage
            .sweep_orphans("blobs/", |k| keep.contains(&k), true)
            .await
            .expect("dry run");
        assert_eq!(dry.scanned, 5);
        assert_eq!(dry.orphans, vec!["blobs/a", "blobs/c", "blobs/e"]);
        assert_eq!(dry.deleted, 0);
        assert_eq!(client.len(), 6);

        let wet = storage
            .sweep_orphans("blobs/", |k| keep.contains(&k), false)
            .await
            .expect("sweep");
        assert_eq!(wet.deleted, 3);
        assert!(storage.exists("blobs/b").await.expect("exists"));
        assert!(!storage.exists("blobs/a").await.expect("exists"));
        assert!(storage.exists("other/x").await.expect("exists"));
    }

    #[tokio::test]
    async fn local_backend_lists_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Storage::new(Arc::new(
            LocalBackend::new(dir.path()).await.expect("backend"),
        ));
        storage
            .write_buffer("k", Bytes::from_static(b"data"))
            .await
            .expect("write");

        let report = storage
            .sweep_orphans("", |_| false, false)
            .await
            .expect("sweep");
        assert_eq!(report, SweepReport::default());
        assert!(storage.exists("k").await.expect("exists"));
        assert!(storage.local_path("k").expect("resolve").is_some());
    }
}
