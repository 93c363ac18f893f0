//! High-level encrypted file operations.
//!
//! [`Vault`] ties the codec, the storage facade, the resource locks and the
//! remote agent together. It is the surface request handlers use:
//!
//! - Writes encrypt on the way in and hold the blob's `file:` lock.
//! - Reads pick the cheapest decrypt path the active backend allows.
//! - Copies re-encrypt under a fresh IV so no two blobs share one.
//! - Custom-drive files are read only through the agent.

use crate::agent::AgentClient;
use crate::archive::{ArchiveComposer, ArchiveEntry, ArchiveRoots, ArchiveSummary, EntryLocation};
use crate::config::Config;
use crate::error::{AgentError, ArchiveError, CodecError, StorageError, VaultError};
use crate::key_manager::KeyManager;
use crate::resource_lock::ResourceLocks;
use crate::storage::{BlobStream, BoxReader, Storage, SweepReport};
use crate::streaming::{self, DecryptReader, EncryptReader};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct Vault {
    storage: Storage,
    keys: Arc<KeyManager>,
    agent: Option<AgentClient>,
    locks: ResourceLocks,
}

impl Vault {
    pub fn new(storage: Storage, keys: Arc<KeyManager>) -> Self {
        Self {
            storage,
            keys,
            agent: None,
            locks: ResourceLocks::new(),
        }
    }

    pub fn with_agent(mut self, agent: AgentClient) -> Self {
        self.agent = Some(agent);
        self
    }

    /// Share a lock coordinator with other components.
    pub fn with_locks(mut self, locks: ResourceLocks) -> Self {
        self.locks = locks;
        self
    }

    /// Build storage, key material and the optional agent from `cfg`.
    pub async fn from_config(cfg: &Config) -> Result<Self, VaultError> {
        let storage = Storage::from_config(cfg).await?;
        let keys = Arc::new(KeyManager::from_config(cfg));
        let mut vault = Self::new(storage, keys);
        if let Some(agent_cfg) = &cfg.agent {
            vault = vault.with_agent(AgentClient::new(agent_cfg)?);
        }
        Ok(vault)
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    pub fn locks(&self) -> &ResourceLocks {
        &self.locks
    }

    pub fn agent(&self) -> Option<&AgentClient> {
        self.agent.as_ref()
    }

    /// Encrypt `plaintext` into blob `key`. With `plain_len` the exact blob
    /// length is known up front, which lets the object store skip multipart.
    /// Returns the stored blob size.
    pub async fn put_encrypted<R>(
        &self,
        key: &str,
        plaintext: R,
        plain_len: Option<u64>,
    ) -> Result<u64, VaultError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let _guard = self.locks.acquire(ResourceLocks::file_key(key)).await;
        let reader = EncryptReader::new(plaintext, &self.keys);
        let stored = self
            .storage
            .write_stream(key, Box::new(reader), plain_len.map(streaming::encrypted_len))
            .await?;
        info!(key = %key, bytes = stored, "blob encrypted");
        Ok(stored)
    }

    pub async fn put_encrypted_file(&self, key: &str, path: &Path) -> Result<u64, VaultError> {
        let file = fs::File::open(path)
            .await
            .map_err(|e| StorageError::from_io(&path.to_string_lossy(), e))?;
        let len = file.metadata().await?.len();
        self.put_encrypted(key, file, Some(len)).await
    }

    /// Open blob `key` for decrypted reading.
    ///
    /// On the local backend the IV and tag are read by offset. Elsewhere the
    /// blob is decrypted as it streams, so plaintext is released before the
    /// tag is checked: a read that ends in an integrity error means every
    /// byte already delivered must be discarded. Use
    /// [`read_decrypted_verified`](Self::read_decrypted_verified) when that is
    /// not acceptable.
    pub async fn open_decrypted(&self, key: &str) -> Result<BoxReader, VaultError> {
        if let Some(path) = self.storage.local_path(key)? {
            debug!(key = %key, "decrypting from local path");
            let reader = streaming::decrypt_file(&path, &self.keys)
                .await
                .map_err(|e| StorageError::from_io(key, e))?;
            return Ok(Box::new(reader));
        }

        let blob = self.storage.read_stream(key).await?;
        if let Some(len) = blob.len {
            if len < streaming::FRAME_OVERHEAD as u64 {
                return Err(CodecError::MalformedBlob { len }.into());
            }
        }
        Ok(Box::new(DecryptReader::new(blob.reader, self.keys.clone())))
    }

    /// Decrypt blob `key` fully and return it only once the tag verified.
    pub async fn read_decrypted_verified(&self, key: &str) -> Result<Vec<u8>, VaultError> {
        let mut blob = self.storage.read_stream(key).await?;
        let mut raw = Vec::with_capacity(blob.len.unwrap_or(0) as usize);
        blob.reader.read_to_end(&mut raw).await?;
        Ok(streaming::decrypt_buffer(&raw, &self.keys)?)
    }

    /// Stream blob `key` decrypted into `dest`. Returns plaintext bytes.
    pub async fn read_into<W>(&self, key: &str, dest: &mut W) -> Result<u64, VaultError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut reader = self.open_decrypted(key).await?;
        Ok(tokio::io::copy(&mut reader, dest).await?)
    }

    /// Copy blob `from` to `to`, re-encrypting under a new IV. A failed copy
    /// leaves `to` as it was: backends only replace a blob once the whole
    /// stream has been written.
    pub async fn copy_reencrypt(&self, from: &str, to: &str) -> Result<u64, VaultError> {
        let _guard = self.locks.acquire(ResourceLocks::file_key(to)).await;

        let source = self.storage.read_stream(from).await?;
        // Same plaintext, same frame: the new blob is exactly as long.
        let reader = streaming::reencrypt_reader(source.reader, self.keys.clone());
        let written = self
            .storage
            .write_stream(to, Box::new(reader), source.len)
            .await
            .inspect_err(|e| warn!(from = %from, to = %to, error = %e, "copy failed"))?;
        info!(from = %from, to = %to, bytes = written, "blob re-encrypted");
        Ok(written)
    }

    pub async fn delete(&self, key: &str) -> Result<(), VaultError> {
        let _guard = self.locks.acquire(ResourceLocks::file_key(key)).await;
        self.storage.delete(key).await?;
        info!(key = %key, "blob deleted");
        Ok(())
    }

    /// Open a custom-drive file. There is no local fallback.
    pub async fn open_agent_file(&self, path: &str) -> Result<BlobStream, VaultError> {
        let agent = self
            .agent
            .as_ref()
            .ok_or_else(|| AgentError::unavailable("no agent configured"))?;
        Ok(agent.open_read(path).await?)
    }

    /// Plaintext reader for one archive entry.
    pub(crate) async fn open_entry(&self, entry: &ArchiveEntry) -> Result<BoxReader, VaultError> {
        let key = entry.storage_key.as_deref().ok_or_else(|| {
            StorageError::NotFound(format!("entry {} has no storage key", entry.id))
        })?;

        match (entry.location, entry.encrypted) {
            (EntryLocation::Vault, true) => self.open_decrypted(key).await,
            (EntryLocation::Vault, false) => Ok(self.storage.read_stream(key).await?.reader),
            (EntryLocation::Agent, encrypted) => {
                let blob = self.open_agent_file(key).await?;
                if encrypted {
                    Ok(Box::new(DecryptReader::new(blob.reader, self.keys.clone())))
                } else {
                    Ok(blob.reader)
                }
            }
        }
    }

    /// Write a zip of `roots` into `sink`. See [`ArchiveComposer::compose`].
    pub async fn compose_archive<W, F>(
        &self,
        entries: &[ArchiveEntry],
        roots: &ArchiveRoots,
        sink: W,
        on_complete: F,
    ) -> Result<ArchiveSummary, ArchiveError>
    where
        W: AsyncWrite + Unpin,
        F: FnOnce(&ArchiveSummary),
    {
        ArchiveComposer::new(self.clone())
            .compose(entries, roots, sink, on_complete)
            .await
    }

    /// Remove blobs under `prefix` that are not in `referenced`.
    pub async fn sweep_orphans(
        &self,
        prefix: &str,
        referenced: &HashSet<String>,
        dry_run: bool,
    ) -> Result<SweepReport, VaultError> {
        Ok(self
            .storage
            .sweep_orphans(prefix, |key| referenced.contains(key), dry_run)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_backend::LocalBackend;
    use crate::memory_store::MemoryObjectClient;
    use crate::object_store::ObjectStoreBackend;
    use std::io::Cursor;

    fn memory_vault() -> (Vault, Arc<MemoryObjectClient>) {
        let client = Arc::new(MemoryObjectClient::new());
        let backend = ObjectStoreBackend::new(client.clone(), crate::config::MIN_PART_SIZE);
        let storage = Storage::new(Arc::new(backend));
        let keys = Arc::new(KeyManager::from_key_bytes([7u8; 32]));
        (Vault::new(storage, keys), client)
    }

    async fn local_vault(dir: &Path) -> Vault {
        let storage = Storage::new(Arc::new(LocalBackend::new(dir).await.expect("backend")));
        Vault::new(storage, Arc::new(KeyManager::from_key_bytes([7u8; 32])))
    }

    async fn read_all(mut reader: BoxReader) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await?;
        Ok(out)
    }

    #[tokio::test]
    async fn known_length_put_is_single_shot() {
        let (vault, client) = memory_vault();
        let data = b"hello vault".to_vec();
        let stored = vault
            .put_encrypted("blobs/a", Cursor::new(data.clone()), Some(data.len() as u64))
            .await
            .expect("put");
        assert_eq!(stored, data.len() as u64 + 32);
        assert_eq!(client.stats().single_puts, 1);

        let plain = read_all(vault.open_decrypted("blobs/a").await.expect("open"))
            .await
            .expect("read");
        assert_eq!(plain, data);
    }

    #[tokio::test]
    async fn local_reads_use_the_file_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let vault = local_vault(dir.path()).await;
        vault
            .put_encrypted("u/1/doc", Cursor::new(b"on disk".to_vec()), None)
            .await
            .expect("put");
        assert_eq!(
            vault.read_decrypted_verified("u/1/doc").await.expect("verified"),
            b"on disk"
        );
        let plain = read_all(vault.open_decrypted("u/1/doc").await.expect("open"))
            .await
            .expect("read");
        assert_eq!(plain, b"on disk");
    }

    #[tokio::test]
    async fn copy_uses_fresh_iv() {
        let (vault, client) = memory_vault();
        vault
            .put_encrypted("src", Cursor::new(vec![5u8; 4096]), Some(4096))
            .await
            .expect("put");
        let written = vault.copy_reencrypt("src", "dst").await.expect("copy");
        assert_eq!(written, 4096 + 32);

        let src = client.object("src").expect("src");
        let dst = client.object("dst").expect("dst");
        assert_ne!(src[..16], dst[..16]);
        assert_eq!(
            vault.read_decrypted_verified("dst").await.expect("verify"),
            vec![5u8; 4096]
        );
    }

    #[tokio::test]
    async fn tampered_source_copy_leaves_nothing() {
        let (vault, client) = memory_vault();
        vault
            .put_encrypted("src", Cursor::new(vec![1u8; 100]), Some(100))
            .await
            .expect("put");
        let mut raw = client.object("src").expect("raw");
        raw[40] ^= 0x01;
        client.insert_raw("src", raw);

        let err = vault.copy_reencrypt("src", "dst").await.expect_err("tampered");
        assert!(err.is_integrity_failure(), "{err}");
        assert!(!vault.storage().exists("dst").await.expect("exists"));
    }

    async fn failed_copy_keeps_destination(vault: &Vault, tamper: impl FnOnce()) {
        vault
            .put_encrypted("dst", Cursor::new(b"precious".to_vec()), Some(8))
            .await
            .expect("put dst");
        vault
            .put_encrypted("src", Cursor::new(vec![3u8; 70_000]), None)
            .await
            .expect("put src");
        tamper();

        let err = vault.copy_reencrypt("src", "dst").await.expect_err("tampered");
        assert!(err.is_integrity_failure(), "{err}");
        assert_eq!(
            vault.read_decrypted_verified("dst").await.expect("dst intact"),
            b"precious"
        );
        assert_eq!(vault.locks().held_keys(), 0);
    }

    #[tokio::test]
    async fn failed_copy_over_existing_blob_keeps_it_on_object_store() {
        let (vault, client) = memory_vault();
        failed_copy_keeps_destination(&vault, || {
            let mut raw = client.object("src").expect("raw");
            let last = raw.len() - 1;
            raw[last] ^= 0x10;
            client.insert_raw("src", raw);
        })
        .await;
        assert_eq!(client.stats().multipart_aborted, 0);
    }

    #[tokio::test]
    async fn failed_copy_over_existing_blob_keeps_it_on_local_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let vault = local_vault(dir.path()).await;
        let root = dir.path().to_path_buf();
        failed_copy_keeps_destination(&vault, || {
            let path = root.join("src");
            let mut raw = std::fs::read(&path).expect("raw");
            raw[20_000] ^= 0x01;
            std::fs::write(&path, raw).expect("tamper");
        })
        .await;
    }

    #[tokio::test]
    async fn verified_read_rejects_tamper_and_short_blobs() {
        let (vault, client) = memory_vault();
        client.insert_raw("short", vec![0u8; 31]);
        let err = vault.read_decrypted_verified("short").await.expect_err("short");
        assert!(matches!(err, VaultError::Codec(CodecError::MalformedBlob { len: 31 })));

        assert!(matches!(
            vault.open_decrypted("short").await.err(),
            Some(VaultError::Codec(CodecError::MalformedBlob { .. }))
        ));

        let missing = vault.read_decrypted_verified("missing").await.expect_err("missing");
        assert!(missing.is_not_found());
    }

    #[tokio::test]
    async fn agent_entries_without_agent_are_unavailable() {
        let (vault, _client) = memory_vault();
        let mut entry = ArchiveEntry::file("f1", "root", "a.txt", "/mnt/a.txt");
        entry.location = EntryLocation::Agent;
        let err = vault.open_entry(&entry).await.err().expect("no agent");
        assert!(err.is_agent_unavailable());
    }

    #[tokio::test]
    async fn writes_hold_the_file_lock() {
        let (vault, _client) = memory_vault();
        let guard = vault.locks().acquire(ResourceLocks::file_key("blobs/x")).await;

        let writer = {
            let vault = vault.clone();
            tokio::spawn(async move {
                vault
                    .put_encrypted("blobs/x", Cursor::new(b"late".to_vec()), Some(4))
                    .await
            })
        };
        while vault.locks().waiting("file:blobs/x") == 0 {
            tokio::task::yield_now().await;
        }
        assert!(!vault.storage().exists("blobs/x").await.expect("exists"));

        guard.release();
        writer.await.expect("task").expect("put");
        assert!(vault.storage().exists("blobs/x").await.expect("exists"));
    }
}
