//! Object store backend.
//!
//! [`ObjectStoreBackend`] implements the storage contract on top of an
//! S3-style API described by [`ObjectClient`]. The production client is
//! [`crate::s3_client::S3Client`]; [`crate::memory_store::MemoryObjectClient`]
//! stands in for it in tests.
//!
//! Writes with a known length go up in a single `PUT`. Streams of unknown
//! length use a multipart upload, one part buffered at a time.

use crate::config::BackendKind;
use crate::error::StorageError;
use crate::storage::{BlobStream, BoxReader, KeyPage, StorageBackend};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

const DEFAULT_LIST_PAGE: u32 = 1000;

/// Body of a single-shot upload.
pub enum ObjectBody {
    Bytes(Bytes),
    Stream(BoxReader),
}

/// One uploaded part of a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// The subset of the S3 API the vault relies on.
#[async_trait]
pub trait ObjectClient: Send + Sync {
    /// Stored size, or `None` when the object does not exist.
    async fn head_object(&self, key: &str) -> Result<Option<u64>, StorageError>;

    async fn get_object(&self, key: &str) -> Result<BlobStream, StorageError>;

    /// Single-shot upload; `len` is sent as the content length.
    async fn put_object(&self, key: &str, body: ObjectBody, len: u64) -> Result<(), StorageError>;

    /// Returns the upload id.
    async fn create_multipart(&self, key: &str) -> Result<String, StorageError>;

    /// Returns the part's ETag.
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String, StorageError>;

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<(), StorageError>;

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> Result<(), StorageError>;

    async fn delete_object(&self, key: &str) -> Result<(), StorageError>;

    /// Server-side copy.
    async fn copy_object(&self, from: &str, to: &str) -> Result<(), StorageError>;

    async fn list_objects(
        &self,
        prefix: &str,
        continuation: Option<String>,
        max_keys: u32,
    ) -> Result<KeyPage, StorageError>;
}

pub struct ObjectStoreBackend {
    client: Arc<dyn ObjectClient>,
    part_size: usize,
    list_page_size: u32,
}

impl ObjectStoreBackend {
    pub fn new(client: Arc<dyn ObjectClient>, part_size: usize) -> Self {
        Self {
            client,
            part_size,
            list_page_size: DEFAULT_LIST_PAGE,
        }
    }

    pub fn with_list_page_size(mut self, size: u32) -> Self {
        self.list_page_size = size.max(1);
        self
    }

    async fn multipart_upload(&self, key: &str, mut source: BoxReader) -> Result<u64, StorageError> {
        let upload_id = self.client.create_multipart(key).await?;
        debug!(key = %key, upload_id = %upload_id, "multipart upload started");

        let uploaded = async {
            let mut parts = Vec::new();
            let mut total = 0u64;
            loop {
                let mut part = Vec::with_capacity(self.part_size);
                let n = (&mut source)
                    .take(self.part_size as u64)
                    .read_to_end(&mut part)
                    .await?;
                if n == 0 {
                    break;
                }
                total += n as u64;
                let part_number = parts.len() as u32 + 1;
                let etag = self
                    .client
                    .upload_part(key, &upload_id, part_number, Bytes::from(part))
                    .await?;
                debug!(key = %key, part_number, bytes = n, "uploaded part");
                parts.push(CompletedPart { part_number, etag });
                if n < self.part_size {
                    break;
                }
            }
            Ok::<_, StorageError>((parts, total))
        }
        .await;

        let (parts, total) = match uploaded {
            Ok(done) => done,
            Err(e) => {
                self.abort_quietly(key, &upload_id).await;
                return Err(e);
            }
        };

        if parts.is_empty() {
            // Multipart uploads need at least one part; store the empty
            // object directly instead.
            self.abort_quietly(key, &upload_id).await;
            self.client
                .put_object(key, ObjectBody::Bytes(Bytes::new()), 0)
                .await?;
            return Ok(0);
        }

        if let Err(e) = self.client.complete_multipart(key, &upload_id, parts).await {
            self.abort_quietly(key, &upload_id).await;
            return Err(e);
        }
        debug!(key = %key, bytes = total, "multipart upload complete");
        Ok(total)
    }

    async fn abort_quietly(&self, key: &str, upload_id: &str) {
        if let Err(e) = self.client.abort_multipart(key, upload_id).await {
            warn!(key = %key, upload_id = %upload_id, error = %e, "failed to abort multipart upload");
        }
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::S3
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.client.head_object(key).await?.is_some())
    }

    async fn read_stream(&self, key: &str) -> Result<BlobStream, StorageError> {
        self.client.get_object(key).await
    }

    async fn write_from_local_file(&self, key: &str, path: &Path) -> Result<u64, StorageError> {
        let file = fs::File::open(path)
            .await
            .map_err(|e| StorageError::from_io(&path.to_string_lossy(), e))?;
        let len = file.metadata().await?.len();
        self.client
            .put_object(key, ObjectBody::Stream(Box::new(file)), len)
            .await?;
        Ok(len)
    }

    async fn write_buffer(&self, key: &str, bytes: Bytes) -> Result<(), StorageError> {
        let len = bytes.len() as u64;
        self.client
            .put_object(key, ObjectBody::Bytes(bytes), len)
            .await
    }

    async fn write_stream(
        &self,
        key: &str,
        source: BoxReader,
        known_length: Option<u64>,
    ) -> Result<u64, StorageError> {
        match known_length {
            Some(len) => {
                debug!(key = %key, bytes = len, "single-shot upload");
                self.client
                    .put_object(key, ObjectBody::Stream(source), len)
                    .await?;
                Ok(len)
            }
            None => self.multipart_upload(key, source).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.client.delete_object(key).await
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), StorageError> {
        self.client.copy_object(from, to).await
    }

    async fn list_keys(
        &self,
        prefix: &str,
        continuation: Option<String>,
    ) -> Result<KeyPage, StorageError> {
        self.client
            .list_objects(prefix, continuation, self.list_page_size)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIN_PART_SIZE;
    use crate::memory_store::MemoryObjectClient;
    use std::io::Cursor;

    fn backend() -> (ObjectStoreBackend, Arc<MemoryObjectClient>) {
        let client = Arc::new(MemoryObjectClient::new());
        (ObjectStoreBackend::new(client.clone(), MIN_PART_SIZE), client)
    }

    #[tokio::test]
    async fn known_length_uses_single_put() {
        let (backend, client) = backend();
        let data = vec![3u8; 1024];
        let n = backend
            .write_stream("k", Box::new(Cursor::new(data.clone())), Some(1024))
            .await
            .expect("write");
        assert_eq!(n, 1024);
        assert_eq!(client.stats().single_puts, 1);
        assert_eq!(client.stats().multipart_completed, 0);
        assert_eq!(client.object("k").expect("stored"), data);
    }

    #[tokio::test]
    async fn unknown_length_uses_multipart() {
        let (backend, client) = backend();
        let data: Vec<u8> = (0..MIN_PART_SIZE * 2 + 123).map(|i| (i % 241) as u8).collect();
        let n = backend
            .write_stream("big", Box::new(Cursor::new(data.clone())), None)
            .await
            .expect("write");
        assert_eq!(n, data.len() as u64);

        let stats = client.stats();
        assert_eq!(stats.single_puts, 0);
        assert_eq!(stats.multipart_completed, 1);
        assert_eq!(stats.parts_uploaded, 3);
        assert_eq!(client.object("big").expect("stored"), data);
    }

    #[tokio::test]
    async fn empty_unknown_length_stream_stores_empty_object() {
        let (backend, client) = backend();
        let n = backend
            .write_stream("empty", Box::new(Cursor::new(Vec::new())), None)
            .await
            .expect("write");
        assert_eq!(n, 0);
        assert_eq!(client.stats().multipart_aborted, 1);
        assert_eq!(client.object("empty").expect("stored"), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn failed_source_aborts_upload() {
        struct Broken;
        impl tokio::io::AsyncRead for Broken {
            fn poll_read(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                _buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::task::Poll::Ready(Err(std::io::Error::other("source broke")))
            }
        }

        let (backend, client) = backend();
        let result = backend.write_stream("k", Box::new(Broken), None).await;
        assert!(result.is_err());
        assert_eq!(client.stats().multipart_aborted, 1);
        assert!(!backend.exists("k").await.expect("head"));
    }

    #[tokio::test]
    async fn copy_is_server_side() {
        let (backend, client) = backend();
        backend
            .write_buffer("a", Bytes::from_static(b"abc"))
            .await
            .expect("write");
        backend.copy("a", "b").await.expect("copy");
        assert_eq!(client.stats().server_copies, 1);
        assert_eq!(client.object("b").expect("copied"), b"abc");
    }
}
