//! In-memory [`ObjectClient`].
//!
//! Behaves like an S3 bucket for everything the vault uses: exact content
//! lengths on `PUT`, multipart assembly by part number, server-side copy and
//! lexicographic, paginated listing. Used as the test double for the object
//! store backend.

use crate::error::StorageError;
use crate::object_store::{CompletedPart, ObjectBody, ObjectClient};
use crate::storage::{BlobStream, KeyPage};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::ops::Bound;
use tokio::io::AsyncReadExt;

/// Call counters, for asserting which upload path was taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub single_puts: usize,
    pub parts_uploaded: usize,
    pub multipart_completed: usize,
    pub multipart_aborted: usize,
    pub server_copies: usize,
}

struct PendingUpload {
    key: String,
    parts: BTreeMap<u32, Bytes>,
}

#[derive(Default)]
struct Bucket {
    objects: BTreeMap<String, Bytes>,
    uploads: HashMap<String, PendingUpload>,
    next_upload: u64,
    stats: MemoryStats,
}

#[derive(Default)]
pub struct MemoryObjectClient {
    bucket: Mutex<Bucket>,
}

impl MemoryObjectClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> MemoryStats {
        self.bucket.lock().stats
    }

    pub fn len(&self) -> usize {
        self.bucket.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw stored bytes of `key`.
    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.bucket.lock().objects.get(key).map(|b| b.to_vec())
    }

    /// Overwrite stored bytes directly, bypassing the upload paths.
    pub fn insert_raw(&self, key: &str, data: impl Into<Bytes>) {
        self.bucket.lock().objects.insert(key.to_string(), data.into());
    }
}

#[async_trait]
impl ObjectClient for MemoryObjectClient {
    async fn head_object(&self, key: &str) -> Result<Option<u64>, StorageError> {
        Ok(self
            .bucket
            .lock()
            .objects
            .get(key)
            .map(|b| b.len() as u64))
    }

    async fn get_object(&self, key: &str) -> Result<BlobStream, StorageError> {
        let data = self
            .bucket
            .lock()
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        let len = data.len() as u64;
        Ok(BlobStream::new(Box::new(Cursor::new(data)), Some(len)))
    }

    async fn put_object(&self, key: &str, body: ObjectBody, len: u64) -> Result<(), StorageError> {
        let data = match body {
            ObjectBody::Bytes(bytes) => bytes,
            ObjectBody::Stream(mut reader) => {
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf).await?;
                Bytes::from(buf)
            }
        };
        if data.len() as u64 != len {
            return Err(StorageError::backend(format!(
                "content length mismatch for {}: declared {}, sent {}",
                key,
                len,
                data.len()
            )));
        }

        let mut bucket = self.bucket.lock();
        bucket.objects.insert(key.to_string(), data);
        bucket.stats.single_puts += 1;
        Ok(())
    }

    async fn create_multipart(&self, key: &str) -> Result<String, StorageError> {
        let mut bucket = self.bucket.lock();
        bucket.next_upload += 1;
        let upload_id = format!("upload-{}", bucket.next_upload);
        bucket.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String, StorageError> {
        let mut bucket = self.bucket.lock();
        let upload = bucket
            .uploads
            .get_mut(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| StorageError::backend(format!("no such upload: {}", upload_id)))?;
        upload.parts.insert(part_number, data);
        bucket.stats.parts_uploaded += 1;
        Ok(format!("\"etag-{}-{}\"", upload_id, part_number))
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<(), StorageError> {
        let mut bucket = self.bucket.lock();
        let upload = bucket
            .uploads
            .remove(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| StorageError::backend(format!("no such upload: {}", upload_id)))?;

        let mut assembled = Vec::new();
        for part in &parts {
            let data = upload.parts.get(&part.part_number).ok_or_else(|| {
                StorageError::backend(format!("part {} was never uploaded", part.part_number))
            })?;
            assembled.extend_from_slice(data);
        }

        bucket.objects.insert(key.to_string(), Bytes::from(assembled));
        bucket.stats.multipart_completed += 1;
        Ok(())
    }

    async fn abort_multipart(&self, _key: &str, upload_id: &str) -> Result<(), StorageError> {
        let mut bucket = self.bucket.lock();
        bucket.uploads.remove(upload_id);
        bucket.stats.multipart_aborted += 1;
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<(), StorageError> {
        self.bucket.lock().objects.remove(key);
        Ok(())
    }

    async fn copy_object(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let mut bucket = self.bucket.lock();
        let data = bucket
            .objects
            .get(from)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(from.to_string()))?;
        bucket.objects.insert(to.to_string(), data);
        bucket.stats.server_copies += 1;
        Ok(())
    }

    async fn list_objects(
        &self,
        prefix: &str,
        continuation: Option<String>,
        max_keys: u32,
    ) -> Result<KeyPage, StorageError> {
        let bucket = self.bucket.lock();
        let start = match continuation {
            Some(after) => Bound::Excluded(after),
            None => Bound::Included(prefix.to_string()),
        };

        let mut matching = bucket
            .objects
            .range((start, Bound::Unbounded))
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(prefix));

        let keys: Vec<String> = matching
            .by_ref()
            .take(max_keys as usize)
            .cloned()
            .collect();
        let next = match matching.next() {
            Some(_) => keys.last().cloned(),
            None => None,
        };
        Ok(KeyPage { keys, next })
    }
}
