//! Configuration management with environment variable support.
//!
//! This module provides [`Config`] for loading and validating vault settings
//! from JSON files and environment variables. The config is read once at
//! startup and handed by reference to the components that need it.
//!
//! ## Environment Variables
//!
//! - `VAULTFS_CONFIG`: Override config file path
//! - `VAULTFS_BACKEND`: `local` or `s3`
//! - `VAULTFS_STORAGE_DIR`: Local storage root
//! - `VAULTFS_ENCRYPTION_SECRET`: Encryption secret (base64, hex or passphrase)
//! - `VAULTFS_S3_ENDPOINT`, `VAULTFS_S3_REGION`, `VAULTFS_S3_BUCKET`,
//!   `VAULTFS_S3_ACCESS_KEY_ID`, `VAULTFS_S3_SECRET_ACCESS_KEY`: Object store
//! - `VAULTFS_AGENT_URL`, `VAULTFS_AGENT_TOKEN`: Remote agent

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Environment variable names for configuration overrides
pub const ENV_CONFIG_PATH: &str = "VAULTFS_CONFIG";
pub const ENV_BACKEND: &str = "VAULTFS_BACKEND";
pub const ENV_STORAGE_DIR: &str = "VAULTFS_STORAGE_DIR";
pub const ENV_ENCRYPTION_SECRET: &str = "VAULTFS_ENCRYPTION_SECRET";
pub const ENV_S3_ENDPOINT: &str = "VAULTFS_S3_ENDPOINT";
pub const ENV_S3_REGION: &str = "VAULTFS_S3_REGION";
pub const ENV_S3_BUCKET: &str = "VAULTFS_S3_BUCKET";
pub const ENV_S3_ACCESS_KEY_ID: &str = "VAULTFS_S3_ACCESS_KEY_ID";
pub const ENV_S3_SECRET_ACCESS_KEY: &str = "VAULTFS_S3_SECRET_ACCESS_KEY";
pub const ENV_AGENT_URL: &str = "VAULTFS_AGENT_URL";
pub const ENV_AGENT_TOKEN: &str = "VAULTFS_AGENT_TOKEN";

/// Smallest part S3 accepts for all but the last part of a multipart upload
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;
const DEFAULT_PART_SIZE: usize = 8 * 1024 * 1024;

/// Which storage backend is active for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
    S3,
}

impl std::str::FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "s3" => Ok(Self::S3),
            other => anyhow::bail!("unknown storage backend '{}' (expected local or s3)", other),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct S3Config {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub base_url: String,
    pub token: Option<String>,
    /// Health and metadata calls
    pub metadata_timeout_ms: u64,
    /// Whole-file transfers
    pub transfer_timeout_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token: None,
            metadata_timeout_ms: 5_000,
            transfer_timeout_ms: 600_000,
        }
    }
}

impl AgentConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_millis(self.metadata_timeout_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendKind,
    pub storage_dir: String,
    pub s3: Option<S3Config>,
    pub encryption_secret: Option<String>,
    pub agent: Option<AgentConfig>,
    pub multipart_part_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendKind::Local,
            storage_dir: "./storage".to_string(),
            s3: None,
            encryption_secret: None,
            agent: None,
            multipart_part_size: DEFAULT_PART_SIZE,
        }
    }
}

impl Config {
    /// Load config with environment variable overrides
    /// Priority: ENV vars > config file > defaults
    pub fn load_with_env(path: Option<&str>) -> Result<Self> {
        // Check for config path from environment
        let config_path = path
            .map(String::from)
            .or_else(|| env::var(ENV_CONFIG_PATH).ok());

        let mut config = match config_path {
            Some(ref p) if Path::new(p).exists() => {
                info!(path = p, "loading config from file");
                let s = fs::read_to_string(p)
                    .with_context(|| format!("reading config file {}", p))?;
                serde_json::from_str(&s).with_context(|| format!("parsing config file {}", p))?
            }
            _ => {
                debug!("using default configuration");
                Config::default()
            }
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to config
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(backend) = env::var(ENV_BACKEND) {
            debug!(backend = %backend, "overriding backend from environment");
            self.backend = backend.parse()?;
        }

        if let Ok(storage_dir) = env::var(ENV_STORAGE_DIR) {
            debug!(storage_dir = %storage_dir, "overriding storage_dir from environment");
            self.storage_dir = storage_dir;
        }

        if let Ok(secret) = env::var(ENV_ENCRYPTION_SECRET) {
            debug!("overriding encryption secret from environment");
            self.encryption_secret = Some(secret);
        }

        let s3_overrides = [
            ENV_S3_ENDPOINT,
            ENV_S3_REGION,
            ENV_S3_BUCKET,
            ENV_S3_ACCESS_KEY_ID,
            ENV_S3_SECRET_ACCESS_KEY,
        ];
        if s3_overrides.iter().any(|name| env::var(name).is_ok()) {
            let s3 = self.s3.get_or_insert_with(S3Config::default);
            let fields = [
                (ENV_S3_ENDPOINT, &mut s3.endpoint),
                (ENV_S3_REGION, &mut s3.region),
                (ENV_S3_BUCKET, &mut s3.bucket),
                (ENV_S3_ACCESS_KEY_ID, &mut s3.access_key_id),
                (ENV_S3_SECRET_ACCESS_KEY, &mut s3.secret_access_key),
            ];
            for (name, field) in fields {
                if let Ok(value) = env::var(name) {
                    debug!(var = name, "overriding object store setting from environment");
                    *field = value;
                }
            }
        }

        if let Ok(url) = env::var(ENV_AGENT_URL) {
            debug!(url = %url, "overriding agent url from environment");
            self.agent.get_or_insert_with(AgentConfig::default).base_url = url;
        }

        if let Ok(token) = env::var(ENV_AGENT_TOKEN) {
            self.agent.get_or_insert_with(AgentConfig::default).token = Some(token);
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        match self.backend {
            BackendKind::Local => {
                if self.storage_dir.trim().is_empty() {
                    anyhow::bail!("storage_dir cannot be empty for the local backend");
                }
            }
            BackendKind::S3 => {
                let s3 = self
                    .s3
                    .as_ref()
                    .context("the s3 backend requires an `s3` section")?;
                let required = [
                    ("endpoint", &s3.endpoint),
                    ("region", &s3.region),
                    ("bucket", &s3.bucket),
                    ("access_key_id", &s3.access_key_id),
                    ("secret_access_key", &s3.secret_access_key),
                ];
                for (name, value) in required {
                    if value.trim().is_empty() {
                        anyhow::bail!("s3.{} cannot be empty", name);
                    }
                }
            }
        }

        if self.multipart_part_size < MIN_PART_SIZE {
            anyhow::bail!(
                "multipart_part_size must be at least {} bytes, got {}",
                MIN_PART_SIZE,
                self.multipart_part_size
            );
        }

        if let Some(agent) = &self.agent {
            if agent.base_url.trim().is_empty() {
                anyhow::bail!("agent.base_url cannot be empty when an agent is configured");
            }
        }

        if self
            .encryption_secret
            .as_deref()
            .map_or(true, |s| s.trim().is_empty())
        {
            warn!("no encryption secret configured - blobs will use the development key");
        }

        Ok(())
    }

    /// Create a local-disk config with explicit values
    pub fn local(storage_dir: impl Into<String>, encryption_secret: Option<String>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            encryption_secret,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_select_local_backend() {
        let cfg = Config::default();
        assert_eq!(cfg.backend, BackendKind::Local);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn s3_backend_requires_every_field() {
        let mut cfg = Config {
            backend: BackendKind::S3,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());

        cfg.s3 = Some(S3Config {
            endpoint: "http://localhost:9000".into(),
            region: "us-east-1".into(),
            bucket: "vault".into(),
            access_key_id: "minio".into(),
            secret_access_key: String::new(),
        });
        assert!(cfg.validate().is_err());

        if let Some(s3) = cfg.s3.as_mut() {
            s3.secret_access_key = "minio123".into();
        }
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn parses_json_with_partial_fields() {
        let cfg: Config = serde_json::from_str(
            r#"{"backend":"local","storage_dir":"/var/vault","agent":{"base_url":"http://127.0.0.1:7777"}}"#,
        )
        .expect("valid config");
        assert_eq!(cfg.storage_dir, "/var/vault");
        let agent = cfg.agent.expect("agent section");
        assert_eq!(agent.metadata_timeout(), Duration::from_secs(5));
        assert_eq!(agent.transfer_timeout(), Duration::from_secs(600));
        assert_eq!(cfg.multipart_part_size, DEFAULT_PART_SIZE);
    }

    #[test]
    fn backend_kind_parses_case_insensitively() {
        assert_eq!("S3".parse::<BackendKind>().ok(), Some(BackendKind::S3));
        assert_eq!(" local ".parse::<BackendKind>().ok(), Some(BackendKind::Local));
        assert!("ftp".parse::<BackendKind>().is_err());
    }

    #[test]
    fn load_with_env_reads_file_or_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("vaultfs.json");
        fs::write(&path, r#"{"storage_dir":"/srv/vault","multipart_part_size":10485760}"#)
            .expect("write config");

        let cfg = Config::load_with_env(path.to_str()).expect("load");
        assert_eq!(cfg.multipart_part_size, 10 * 1024 * 1024);

        let missing = dir.path().join("absent.json");
        let cfg = Config::load_with_env(missing.to_str()).expect("defaults");
        assert_eq!(cfg.multipart_part_size, DEFAULT_PART_SIZE);

        fs::write(&path, "{not json").expect("write config");
        assert!(Config::load_with_env(path.to_str()).is_err());
    }

    #[test]
    fn undersized_parts_are_rejected() {
        let cfg = Config {
            multipart_part_size: 1024,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }
}
