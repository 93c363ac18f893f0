//! Local disk backend.
//!
//! Keys resolve to `root/key`. Resolution is lexical: `.` and `..` segments
//! are folded, and anything that ends up outside the canonicalized root is
//! rejected with [`StorageError::PathEscape`].

use crate::config::BackendKind;
use crate::error::StorageError;
use crate::storage::{BlobStream, BoxReader, StorageBackend};
use async_trait::async_trait;
use bytes::Bytes;
use rand_core::{OsRng, RngCore};
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Create the root if needed and pin it to its canonical form.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref();
        fs::create_dir_all(root).await?;
        let root = fs::canonicalize(root).await?;
        info!(root = %root.display(), "local storage root");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map `key` to a path inside the root.
    pub fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        let mut relative = PathBuf::new();
        for component in Path::new(key).components() {
            match component {
                Component::Normal(part) => relative.push(part),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !relative.pop() {
                        return Err(StorageError::PathEscape(key.to_string()));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(StorageError::PathEscape(key.to_string()));
                }
            }
        }

        if relative.as_os_str().is_empty() {
            return Err(StorageError::PathEscape(key.to_string()));
        }

        let resolved = self.root.join(relative);
        if !resolved.starts_with(&self.root) {
            return Err(StorageError::PathEscape(key.to_string()));
        }
        Ok(resolved)
    }

    async fn prepare_parent(path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Sibling temp path; the final name only appears once the write is done.
    fn partial_path(path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        path.with_file_name(format!(".{}.{:016x}.partial", name, OsRng.next_u64()))
    }

    async fn discard(partial: &Path) {
        match fs::remove_file(partial).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                warn!(path = %partial.display(), error = %e, "failed to remove partial write");
            }
            _ => {}
        }
    }

    /// Move a finished temp file over `path`.
    async fn commit(partial: &Path, path: &Path) -> Result<(), StorageError> {
        if let Err(e) = fs::rename(partial, path).await {
            Self::discard(partial).await;
            return Err(StorageError::Io(e));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.resolve(key)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn read_stream(&self, key: &str) -> Result<BlobStream, StorageError> {
        let path = self.resolve(key)?;
        let file = fs::File::open(&path)
            .await
            .map_err(|e| StorageError::from_io(key, e))?;
        let len = file.metadata().await?.len();
        Ok(BlobStream::new(Box::new(file), Some(len)))
    }

    async fn write_from_local_file(&self, key: &str, source: &Path) -> Result<u64, StorageError> {
        let path = self.resolve(key)?;
        Self::prepare_parent(&path).await?;
        let partial = Self::partial_path(&path);
        let bytes = match fs::copy(source, &partial).await {
            Ok(bytes) => bytes,
            Err(e) => {
                Self::discard(&partial).await;
                return Err(StorageError::from_io(&source.to_string_lossy(), e));
            }
        };
        Self::commit(&partial, &path).await?;
        debug!(key = %key, bytes, "stored local file");
        Ok(bytes)
    }

    async fn write_buffer(&self, key: &str, bytes: Bytes) -> Result<(), StorageError> {
        let path = self.resolve(key)?;
        Self::prepare_parent(&path).await?;
        let partial = Self::partial_path(&path);
        if let Err(e) = fs::write(&partial, &bytes).await {
            Self::discard(&partial).await;
            return Err(StorageError::Io(e));
        }
        Self::commit(&partial, &path).await?;
        debug!(key = %key, bytes = bytes.len(), "stored buffer");
        Ok(())
    }

    async fn write_stream(
        &self,
        key: &str,
        mut source: BoxReader,
        known_length: Option<u64>,
    ) -> Result<u64, StorageError> {
        let path = self.resolve(key)?;
        Self::prepare_parent(&path).await?;
        let partial = Self::partial_path(&path);

        let written = async {
            let mut file = fs::File::create(&partial).await?;
            let written = tokio::io::copy(&mut source, &mut file).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok::<u64, std::io::Error>(written)
        }
        .await;

        let written = match written {
            Ok(n) => n,
            Err(e) => {
                Self::discard(&partial).await;
                return Err(StorageError::Io(e));
            }
        };

        if let Some(expected) = known_length {
            if expected != written {
                Self::discard(&partial).await;
                return Err(StorageError::backend(format!(
                    "length mismatch for {}: expected {} bytes, got {}",
                    key, expected, written
                )));
            }
        }

        Self::commit(&partial, &path).await?;
        debug!(key = %key, bytes = written, "stored stream");
        Ok(written)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(key = %key, "deleted blob");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(key = %key, "blob not found during delete");
                Ok(())
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let source = self.resolve(from)?;
        let dest = self.resolve(to)?;
        Self::prepare_parent(&dest).await?;
        fs::copy(&source, &dest)
            .await
            .map_err(|e| StorageError::from_io(from, e))?;
        Ok(())
    }

    fn local_path(&self, key: &str) -> Result<Option<PathBuf>, StorageError> {
        self.resolve(key).map(Some)
    }
}
