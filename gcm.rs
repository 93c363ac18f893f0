//! Incremental AES-256-GCM.
//!
//! `aes-gcm` only works on whole buffers; blobs here are streamed, so the
//! mode is assembled from its parts: AES-256 in 32-bit big-endian counter
//! mode for confidentiality and GHASH over the ciphertext for the tag.
//! Output is byte-identical to one-shot AES-256-GCM with a 16-byte nonce and
//! no associated data.

use crate::error::CodecError;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, InnerIvInit, KeyInit, StreamCipher};
use aes::Aes256;
use ghash::universal_hash::UniversalHash;
use ghash::{Block, GHash};
use subtle::ConstantTimeEq;

/// IV length in bytes
pub const IV_LEN: usize = 16;
/// Authentication tag length in bytes
pub const TAG_LEN: usize = 16;
/// Smallest valid frame: `IV || TAG` around empty ciphertext
pub const FRAME_OVERHEAD: usize = IV_LEN + TAG_LEN;

const BLOCK_LEN: usize = 16;

type Aes256Ctr = ctr::Ctr32BE<Aes256>;

/// Running GCM state for one blob.
pub struct GcmStream {
    ctr: Aes256Ctr,
    ghash: GHash,
    tag_mask: Block,
    partial: [u8; BLOCK_LEN],
    partial_len: usize,
    ciphertext_len: u64,
}

impl GcmStream {
    pub fn new(key: &[u8; 32], iv: &[u8; IV_LEN]) -> Self {
        let cipher = Aes256::new(GenericArray::from_slice(key));

        let mut hash_key = Block::default();
        cipher.encrypt_block(&mut hash_key);

        // Pre-counter block for a non-96-bit IV: GHASH(IV || 0^64 || [len(IV)]_64)
        let mut j0_hash = GHash::new(&hash_key);
        j0_hash.update_padded(iv);
        j0_hash.update(&[length_block(0, IV_LEN as u64 * 8)]);
        let j0 = j0_hash.finalize();

        let mut tag_mask = j0;
        cipher.encrypt_block(&mut tag_mask);

        let mut counter = j0;
        inc32(&mut counter);

        Self {
            ctr: Aes256Ctr::from_core(ctr::CtrCore::inner_iv_init(cipher, &counter)),
            ghash: GHash::new(&hash_key),
            tag_mask,
            partial: [0u8; BLOCK_LEN],
            partial_len: 0,
            ciphertext_len: 0,
        }
    }

    /// Encrypt `buf` in place and absorb the resulting ciphertext.
    pub fn encrypt_in_place(&mut self, buf: &mut [u8]) {
        self.ctr.apply_keystream(buf);
        self.absorb(buf);
    }

    /// Absorb ciphertext `buf` and decrypt it in place.
    pub fn decrypt_in_place(&mut self, buf: &mut [u8]) {
        self.absorb(buf);
        self.ctr.apply_keystream(buf);
    }

    /// Bytes of ciphertext processed so far.
    pub fn ciphertext_len(&self) -> u64 {
        self.ciphertext_len
    }

    /// Close the stream and produce the tag.
    pub fn finalize(mut self) -> [u8; TAG_LEN] {
        if self.partial_len > 0 {
            self.ghash.update_padded(&self.partial[..self.partial_len]);
        }
        self.ghash
            .update(&[length_block(0, self.ciphertext_len * 8)]);

        let mut tag = [0u8; TAG_LEN];
        for (out, (h, m)) in tag
            .iter_mut()
            .zip(self.ghash.finalize().iter().zip(self.tag_mask.iter()))
        {
            *out = h ^ m;
        }
        tag
    }

    /// Close the stream and compare against `expected` in constant time.
    pub fn verify(self, expected: &[u8]) -> Result<(), CodecError> {
        let computed = self.finalize();
        if bool::from(computed[..].ct_eq(expected)) {
            Ok(())
        } else {
            Err(CodecError::AuthenticationFailure)
        }
    }

    fn absorb(&mut self, mut data: &[u8]) {
        self.ciphertext_len += data.len() as u64;

        if self.partial_len > 0 {
            let take = (BLOCK_LEN - self.partial_len).min(data.len());
            self.partial[self.partial_len..self.partial_len + take].copy_from_slice(&data[..take]);
            self.partial_len += take;
            data = &data[take..];
            if self.partial_len < BLOCK_LEN {
                return;
            }
            self.ghash.update(&[Block::clone_from_slice(&self.partial)]);
            self.partial_len = 0;
        }

        let mut blocks = data.chunks_exact(BLOCK_LEN);
        for block in &mut blocks {
            self.ghash.update(&[Block::clone_from_slice(block)]);
        }

        let rest = blocks.remainder();
        self.partial[..rest.len()].copy_from_slice(rest);
        self.partial_len = rest.len();
    }
}

fn length_block(aad_bits: u64, data_bits: u64) -> Block {
    let mut block = Block::default();
    block[..8].copy_from_slice(&aad_bits.to_be_bytes());
    block[8..].copy_from_slice(&data_bits.to_be_bytes());
    block
}

fn inc32(block: &mut Block) {
    let mut word = [0u8; 4];
    word.copy_from_slice(&block[12..]);
    let next = u32::from_be_bytes(word).wrapping_add(1);
    block[12..].copy_from_slice(&next.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes_gcm::aead::consts::U16;
    use aes_gcm::aead::{Aead, KeyInit as _};
    use aes_gcm::{AesGcm, Nonce};

    type Aes256Gcm16 = AesGcm<Aes256, U16>;

    const KEY: [u8; 32] = [0x42; 32];
    const IV: [u8; IV_LEN] = [0x24; IV_LEN];

    fn one_shot(plaintext: &[u8]) -> Vec<u8> {
        let cipher = Aes256Gcm16::new(aes_gcm::Key::<Aes256Gcm16>::from_slice(&KEY));
        cipher
            .encrypt(Nonce::<U16>::from_slice(&IV), plaintext)
            .expect("one-shot encryption")
    }

    fn streamed(plaintext: &[u8], split: usize) -> Vec<u8> {
        let mut gcm = GcmStream::new(&KEY, &IV);
        let mut out = plaintext.to_vec();
        for chunk in out.chunks_mut(split.max(1)) {
            gcm.encrypt_in_place(chunk);
        }
        out.extend_from_slice(&gcm.finalize());
        out
    }

    #[test]
    fn matches_one_shot_gcm_for_every_split() {
        let plaintext: Vec<u8> = (0..1000u32).map(|i| (i * 31 % 251) as u8).collect();
        let expected = one_shot(&plaintext);
        for split in [1, 7, 15, 16, 17, 64, 333, 1000] {
            assert_eq!(streamed(&plaintext, split), expected, "split {split}");
        }
    }

    #[test]
    fn empty_plaintext_yields_bare_tag() {
        let expected = one_shot(b"");
        let gcm = GcmStream::new(&KEY, &IV);
        assert_eq!(gcm.finalize().to_vec(), expected);
    }

    #[test]
    fn decrypt_verifies_and_restores() {
        let sealed = streamed(b"attack at dawn", 5);
        let (body, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        let mut buf = body.to_vec();
        let mut gcm = GcmStream::new(&KEY, &IV);
        gcm.decrypt_in_place(&mut buf);
        gcm.verify(tag).expect("tag verifies");
        assert_eq!(buf, b"attack at dawn");
    }

    #[test]
    fn wrong_tag_is_rejected() {
        let sealed = streamed(b"attack at dawn", 5);
        let (body, tag) = sealed.split_at(sealed.len() - TAG_LEN);
        let mut bad_tag = tag.to_vec();
        bad_tag[0] ^= 0x80;

        let mut buf = body.to_vec();
        let mut gcm = GcmStream::new(&KEY, &IV);
        gcm.decrypt_in_place(&mut buf);
        assert!(matches!(
            gcm.verify(&bad_tag),
            Err(CodecError::AuthenticationFailure)
        ));
    }

    #[test]
    fn counter_wraps_within_low_word() {
        let mut block = Block::clone_from_slice(&[0xff; 16]);
        inc32(&mut block);
        assert_eq!(&block[..12], &[0xff; 12]);
        assert_eq!(&block[12..], &[0, 0, 0, 0]);
    }
}
