//! # VaultFS - Encrypted Streaming Storage Engine
//!
//! VaultFS stores every blob as an AES-256-GCM frame and never holds a whole
//! file in memory: encryption, decryption, re-encryption and archive
//! composition all run as streaming pipelines over a pluggable backend.
//!
//! ## Features
//!
//! - **Framed AES-256-GCM**: `IV(16) || ciphertext || tag(16)` at rest
//! - **Backends**: local disk or any S3-compatible object store, one contract
//! - **Archives**: zip many encrypted or plain sources into one stream
//! - **Resource locks**: FIFO per-key critical sections for mutating calls
//! - **Custom drives**: fail-closed client for the remote agent
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::io::Cursor;
//! use vaultfs::{config::Config, vault::Vault};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cfg = Config::local("./storage", Some("correct horse battery staple".into()));
//!     let vault = Vault::from_config(&cfg).await?;
//!
//!     // Encrypt data
//!     let data = b"sensitive data".to_vec();
//!     let len = data.len() as u64;
//!     vault.put_encrypted("users/1/secret.txt", Cursor::new(data), Some(len)).await?;
//!
//!     // Decrypt data
//!     let plain = vault.read_decrypted_verified("users/1/secret.txt").await?;
//!     assert_eq!(plain, b"sensitive data");
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod archive;
pub mod config;
pub mod error;
pub mod gcm;
pub mod key_manager;
pub mod local_backend;
pub mod memory_store;
pub mod object_store;
pub mod resource_lock;
pub mod s3_client;
pub mod storage;
pub mod streaming;
pub mod vault;

// Re-export common types for convenience
pub use error::VaultError;
pub use storage::Storage;
pub use vault::Vault;
