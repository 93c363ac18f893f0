//! Streaming encryption and decryption of vault blobs.
//!
//! Every blob at rest is a single AES-256-GCM frame:
//!
//! ```text
//! [iv:16][ciphertext:N][tag:16]
//! ```
//!
//! The IV is random per blob. A blob shorter than 32 bytes is malformed.
//!
//! ## Readers
//!
//! - [`EncryptReader`] turns a plaintext source into a framed blob
//! - [`DecryptReader`] strips a framed blob arriving over a live stream,
//!   holding back the trailing 16 bytes until end of stream
//! - [`decrypt_file`] opens a blob on local disk, reading IV and tag by offset
//! - [`decrypt_buffer`] decrypts an in-memory blob and verifies before
//!   returning anything
//!
//! ## Provisional plaintext
//!
//! The streaming readers release plaintext as ciphertext arrives; the tag is
//! only checked at end of stream. A consumer that sees a read error carrying
//! [`CodecError::AuthenticationFailure`] must discard everything it received.
//! Use [`decrypt_buffer`] (or `Vault::read_decrypted_verified`) where
//! unauthenticated bytes must never be observed.

use crate::error::CodecError;
use crate::gcm::GcmStream;
use crate::key_manager::KeyManager;
use rand_core::{OsRng, RngCore};
use std::io::{self, SeekFrom};
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt, ReadBuf, Take};

pub use crate::gcm::{FRAME_OVERHEAD, IV_LEN, TAG_LEN};

/// Chunk size for streaming encryption (64KB)
/// Balances memory usage vs. the number of cipher invocations
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Size of the framed blob for `plain_len` bytes of plaintext.
pub fn encrypted_len(plain_len: u64) -> u64 {
    plain_len + FRAME_OVERHEAD as u64
}

fn random_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// Read one chunk from `inner` into `buf` (resized to `CHUNK_SIZE`).
/// On `Ready(Ok(n))`, `buf` holds exactly `n` bytes; otherwise it is empty.
fn poll_chunk<R: AsyncRead + Unpin>(
    inner: &mut R,
    cx: &mut Context<'_>,
    buf: &mut Vec<u8>,
) -> Poll<io::Result<usize>> {
    buf.resize(CHUNK_SIZE, 0);
    let polled = {
        let mut read_buf = ReadBuf::new(buf.as_mut_slice());
        match Pin::new(inner).poll_read(cx, &mut read_buf) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(read_buf.filled().len())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    };
    match polled {
        Poll::Ready(Ok(n)) => buf.truncate(n),
        _ => buf.clear(),
    }
    polled
}

/// Copy staged bytes into the caller's buffer. Returns false when nothing
/// was staged.
fn drain_staged(staged: &[u8], pos: &mut usize, out: &mut ReadBuf<'_>) -> bool {
    if *pos >= staged.len() {
        return false;
    }
    let n = out.remaining().min(staged.len() - *pos);
    out.put_slice(&staged[*pos..*pos + n]);
    *pos += n;
    true
}

/// Plaintext source -> framed blob (`IV || ciphertext || tag`).
pub struct EncryptReader<R> {
    inner: R,
    gcm: Option<GcmStream>,
    staged: Vec<u8>,
    pos: usize,
}

impl<R: AsyncRead + Unpin> EncryptReader<R> {
    /// Wrap `inner` with a freshly generated random IV.
    pub fn new(inner: R, keys: &KeyManager) -> Self {
        let iv = random_iv();
        Self {
            inner,
            gcm: Some(GcmStream::new(keys.key(), &iv)),
            staged: iv.to_vec(),
            pos: 0,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for EncryptReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if drain_staged(&this.staged, &mut this.pos, out) {
                return Poll::Ready(Ok(()));
            }
            if this.gcm.is_none() {
                return Poll::Ready(Ok(()));
            }

            this.pos = 0;
            let n = match poll_chunk(&mut this.inner, cx, &mut this.staged) {
                Poll::Ready(Ok(n)) => n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };

            if n == 0 {
                if let Some(gcm) = this.gcm.take() {
                    this.staged.extend_from_slice(&gcm.finalize());
                }
            } else if let Some(gcm) = this.gcm.as_mut() {
                gcm.encrypt_in_place(&mut this.staged);
            }
        }
    }
}

enum DecryptState {
    Header,
    Body(GcmStream),
    Done,
    /// Verification failed; every further read repeats the error
    Failed(CodecError),
}

/// Framed blob arriving over a live stream -> plaintext.
///
/// The length is not known up front, so the last 16 bytes seen are held
/// back as the tag candidate. Plaintext before that point is released
/// immediately and verified only at end of stream.
pub struct DecryptReader<R> {
    inner: R,
    keys: Arc<KeyManager>,
    state: DecryptState,
    held: Vec<u8>,
    chunk: Vec<u8>,
    staged: Vec<u8>,
    pos: usize,
    total: u64,
}

impl<R: AsyncRead + Unpin> DecryptReader<R> {
    pub fn new(inner: R, keys: Arc<KeyManager>) -> Self {
        Self {
            inner,
            keys,
            state: DecryptState::Header,
            held: Vec::with_capacity(TAG_LEN * 2),
            chunk: Vec::new(),
            staged: Vec::new(),
            pos: 0,
            total: 0,
        }
    }

    fn finish(&mut self) -> io::Result<()> {
        let outcome = match std::mem::replace(&mut self.state, DecryptState::Done) {
            DecryptState::Body(gcm) if self.total >= FRAME_OVERHEAD as u64 => gcm.verify(&self.held),
            DecryptState::Done => Ok(()),
            DecryptState::Failed(e) => Err(e),
            _ => Err(CodecError::MalformedBlob { len: self.total }),
        };
        if let Err(e) = &outcome {
            self.state = DecryptState::Failed(e.clone());
        }
        outcome.map_err(CodecError::into_io)
    }

    fn absorb_chunk(&mut self) {
        self.total += self.chunk.len() as u64;
        self.held.extend_from_slice(&self.chunk);

        if matches!(self.state, DecryptState::Header) && self.held.len() >= IV_LEN {
            let mut iv = [0u8; IV_LEN];
            iv.copy_from_slice(&self.held[..IV_LEN]);
            self.held.drain(..IV_LEN);
            self.state = DecryptState::Body(GcmStream::new(self.keys.key(), &iv));
        }

        if let DecryptState::Body(gcm) = &mut self.state {
            if self.held.len() > TAG_LEN {
                let release = self.held.len() - TAG_LEN;
                self.staged.clear();
                self.staged.extend(self.held.drain(..release));
                self.pos = 0;
                gcm.decrypt_in_place(&mut self.staged);
            }
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for DecryptReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if let DecryptState::Failed(e) = &this.state {
                return Poll::Ready(Err(e.clone().into_io()));
            }
            if drain_staged(&this.staged, &mut this.pos, out) {
                return Poll::Ready(Ok(()));
            }
            if matches!(this.state, DecryptState::Done) {
                return Poll::Ready(Ok(()));
            }

            let n = match poll_chunk(&mut this.inner, cx, &mut this.chunk) {
                Poll::Ready(Ok(n)) => n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };

            if n == 0 {
                return Poll::Ready(this.finish());
            }
            this.absorb_chunk();
        }
    }
}

/// Blob body with the tag already known (read by offset) -> plaintext.
pub struct FramedDecryptReader<R> {
    inner: R,
    gcm: Option<GcmStream>,
    tag: [u8; TAG_LEN],
    staged: Vec<u8>,
    pos: usize,
    failed: Option<CodecError>,
}

impl<R: AsyncRead + Unpin> FramedDecryptReader<R> {
    /// `inner` must yield exactly the ciphertext between IV and tag.
    pub fn new(inner: R, keys: &KeyManager, iv: [u8; IV_LEN], tag: [u8; TAG_LEN]) -> Self {
        Self {
            inner,
            gcm: Some(GcmStream::new(keys.key(), &iv)),
            tag,
            staged: Vec::new(),
            pos: 0,
            failed: None,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for FramedDecryptReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if let Some(e) = &this.failed {
                return Poll::Ready(Err(e.clone().into_io()));
            }
            if drain_staged(&this.staged, &mut this.pos, out) {
                return Poll::Ready(Ok(()));
            }
            if this.gcm.is_none() {
                return Poll::Ready(Ok(()));
            }

            this.pos = 0;
            let n = match poll_chunk(&mut this.inner, cx, &mut this.staged) {
                Poll::Ready(Ok(n)) => n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };

            if n == 0 {
                let verified = match this.gcm.take() {
                    Some(gcm) => gcm.verify(&this.tag),
                    None => Ok(()),
                };
                if let Err(e) = &verified {
                    this.failed = Some(e.clone());
                }
                return Poll::Ready(verified.map_err(CodecError::into_io));
            }
            if let Some(gcm) = this.gcm.as_mut() {
                gcm.decrypt_in_place(&mut this.staged);
            }
        }
    }
}

/// Open a blob stored at `path`. The total length is known, so the IV and
/// tag are read by offset and only the ciphertext range is streamed.
pub async fn decrypt_file(
    path: impl AsRef<Path>,
    keys: &KeyManager,
) -> io::Result<FramedDecryptReader<Take<File>>> {
    let mut file = File::open(path.as_ref()).await?;
    let len = file.metadata().await?.len();
    if len < FRAME_OVERHEAD as u64 {
        return Err(CodecError::MalformedBlob { len }.into_io());
    }

    let mut iv = [0u8; IV_LEN];
    file.read_exact(&mut iv).await?;

    let mut tag = [0u8; TAG_LEN];
    file.seek(SeekFrom::Start(len - TAG_LEN as u64)).await?;
    file.read_exact(&mut tag).await?;

    file.seek(SeekFrom::Start(IV_LEN as u64)).await?;
    let body = file.take(len - FRAME_OVERHEAD as u64);
    Ok(FramedDecryptReader::new(body, keys, iv, tag))
}

/// Encrypt an in-memory buffer into a framed blob.
pub fn encrypt_buffer(plaintext: &[u8], keys: &KeyManager) -> Vec<u8> {
    let iv = random_iv();
    let mut gcm = GcmStream::new(keys.key(), &iv);

    let mut blob = Vec::with_capacity(plaintext.len() + FRAME_OVERHEAD);
    blob.extend_from_slice(&iv);
    blob.extend_from_slice(plaintext);
    gcm.encrypt_in_place(&mut blob[IV_LEN..]);
    blob.extend_from_slice(&gcm.finalize());
    blob
}

/// Decrypt an in-memory blob. Nothing is returned unless the tag verifies.
pub fn decrypt_buffer(blob: &[u8], keys: &KeyManager) -> Result<Vec<u8>, CodecError> {
    if blob.len() < FRAME_OVERHEAD {
        return Err(CodecError::MalformedBlob {
            len: blob.len() as u64,
        });
    }

    let mut iv = [0u8; IV_LEN];
    iv.copy_from_slice(&blob[..IV_LEN]);
    let (body, tag) = blob[IV_LEN..].split_at(blob.len() - FRAME_OVERHEAD);

    let mut plaintext = body.to_vec();
    let mut gcm = GcmStream::new(keys.key(), &iv);
    gcm.decrypt_in_place(&mut plaintext);
    gcm.verify(tag)?;
    Ok(plaintext)
}

/// Decrypt `source` and re-encrypt it under a new random IV into `dest`,
/// without materializing the plaintext. Returns the bytes written to `dest`.
///
/// If the source fails authentication the error arrives after `dest` has
/// received most of the new blob; the caller must discard `dest`.
pub async fn copy_reencrypt<R, W>(source: R, dest: &mut W, keys: Arc<KeyManager>) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = reencrypt_reader(source, keys);
    let written = tokio::io::copy(&mut reader, dest).await?;
    dest.flush().await?;
    Ok(written)
}

/// The reader behind [`copy_reencrypt`], for sinks that pull.
pub fn reencrypt_reader<R: AsyncRead + Unpin>(
    source: R,
    keys: Arc<KeyManager>,
) -> EncryptReader<DecryptReader<R>> {
    EncryptReader::new(DecryptReader::new(source, keys.clone()), &keys)
}

/// Shared handle onto a [`CountingReader`]'s byte count.
#[derive(Debug, Clone, Default)]
pub struct ByteCounter(Arc<AtomicU64>);

impl ByteCounter {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

/// Pass-through stage that counts the bytes flowing through it.
pub struct CountingReader<R> {
    inner: R,
    counter: ByteCounter,
}

impl<R: AsyncRead + Unpin> CountingReader<R> {
    pub fn new(inner: R) -> (Self, ByteCounter) {
        let counter = ByteCounter::default();
        (
            Self {
                inner,
                counter: counter.clone(),
            },
            counter,
        )
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = out.filled().len();
        let polled = Pin::new(&mut this.inner).poll_read(cx, out);
        if let Poll::Ready(Ok(())) = polled {
            let n = (out.filled().len() - before) as u64;
            this.counter.0.fetch_add(n, Ordering::AcqRel);
        }
        polled
    }
}
