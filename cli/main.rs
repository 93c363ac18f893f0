use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use std::collections::HashSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};
use vaultfs::archive::{content_disposition, ArchiveEntry, ArchiveRoots, CONTENT_TYPE};
use vaultfs::config::{self, BackendKind};
use vaultfs::key_manager;
use vaultfs::streaming::CountingReader;
use vaultfs::vault::Vault;
use vaultfs::VaultError;

/// VaultFS - Encrypted streaming storage over local disk or S3
#[derive(Parser)]
#[command(name = "vaultfs")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.json")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a local-backend config with a freshly generated secret
    Init {
        /// Storage directory path
        #[arg(short, long, default_value = "./storage")]
        storage_dir: String,
    },

    /// Encrypt a local file into the vault
    Put {
        /// Input file to encrypt
        input: PathBuf,

        /// Storage key (defaults to the input filename)
        #[arg(short, long)]
        key: Option<String>,
    },

    /// Decrypt a blob
    Get {
        /// Storage key
        key: String,

        /// Output file path (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Verify the whole blob before writing any plaintext
        #[arg(long)]
        verified: bool,
    },

    /// Copy a blob, re-encrypting it under a new IV
    Cp { from: String, to: String },

    /// Remove a blob
    Rm {
        key: String,

        /// Skip confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// List blob keys (object store only)
    Ls {
        #[arg(short, long, default_value = "")]
        prefix: String,
    },

    /// Build a zip from a JSON manifest of entries and roots
    Archive {
        /// Manifest file: {"entries": [...], "roots": "id" | ["id", ...]}
        manifest: PathBuf,

        /// Output file path (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Delete blobs under a prefix that are not referenced
    Sweep {
        /// JSON array of referenced storage keys
        referenced: PathBuf,

        #[arg(short, long, default_value = "")]
        prefix: String,

        /// Actually delete; without it the sweep only reports
        #[arg(long)]
        apply: bool,
    },

    /// Check that the remote agent answers its health check
    AgentHealth,
}

#[derive(Deserialize)]
struct ArchiveManifest {
    entries: Vec<ArchiveEntry>,
    roots: ArchiveRoots,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Use RUST_LOG to control log level (e.g., RUST_LOG=info,vaultfs=debug)
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_thread_ids(false)
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    info!(command = ?cli.command, "VaultFS starting");

    match cli.command {
        Commands::Init { storage_dir } => cmd_init(&cli.config, &storage_dir).await,
        Commands::Put { input, key } => cmd_put(&cli.config, &input, key.as_deref()).await,
        Commands::Get {
            key,
            output,
            verified,
        } => cmd_get(&cli.config, &key, output.as_deref(), verified).await,
        Commands::Cp { from, to } => cmd_cp(&cli.config, &from, &to).await,
        Commands::Rm { key, yes } => cmd_rm(&cli.config, &key, yes).await,
        Commands::Ls { prefix } => cmd_ls(&cli.config, &prefix).await,
        Commands::Archive { manifest, output } => {
            cmd_archive(&cli.config, &manifest, output.as_deref()).await
        }
        Commands::Sweep {
            referenced,
            prefix,
            apply,
        } => cmd_sweep(&cli.config, &referenced, &prefix, apply).await,
        Commands::AgentHealth => cmd_agent_health(&cli.config).await,
    }
}

async fn open_vault(config_path: &str) -> Result<Vault> {
    let cfg = config::Config::load_with_env(Some(config_path))?;
    Vault::from_config(&cfg)
        .await
        .context("initializing storage backend")
}

/// Create a styled progress bar for file operations
fn create_progress_bar(total: u64, message: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({percent}%) {msg}")?
            .progress_chars("#>-"),
    );
    pb.set_message(message.to_string());
    Ok(pb)
}

/// Create a spinner for indeterminate operations
fn create_spinner(message: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    Ok(pb)
}

async fn cmd_init(config_path: &str, storage_dir: &str) -> Result<()> {
    println!("Initializing VaultFS...");

    if fs::try_exists(config_path).await.unwrap_or(false) {
        anyhow::bail!(
            "Configuration file '{}' already exists. Remove it first or use a different path.",
            config_path
        );
    }

    fs::create_dir_all(storage_dir)
        .await
        .with_context(|| format!("creating storage directory '{}'", storage_dir))?;

    let cfg = config::Config::local(storage_dir, Some(key_manager::generate_secret()));
    let config_json = serde_json::to_string_pretty(&cfg)?;
    fs::write(config_path, config_json)
        .await
        .with_context(|| format!("writing config to '{}'", config_path))?;

    println!("Initialization complete!");
    println!("Config:  {}", config_path);
    println!("Storage: {}", storage_dir);
    println!();
    println!("IMPORTANT: The config file holds the encryption secret. Keep it secure and backed up!");
    println!("Without it, your encrypted blobs cannot be recovered.");

    Ok(())
}

async fn cmd_put(config_path: &str, input: &Path, key: Option<&str>) -> Result<()> {
    let vault = open_vault(config_path).await?;

    let key = match key {
        Some(key) => key.to_string(),
        None => input
            .file_name()
            .context("input file has no filename")?
            .to_string_lossy()
            .to_string(),
    };

    let file = fs::File::open(input)
        .await
        .with_context(|| format!("opening {:?}", input))?;
    let input_size = file
        .metadata()
        .await
        .with_context(|| format!("reading metadata for {:?}", input))?
        .len();

    let pb = create_progress_bar(input_size, "Encrypting")?;
    let (reader, counter) = CountingReader::new(file);

    let ticker = {
        let pb = pb.clone();
        let counter = counter.clone();
        tokio::spawn(async move {
            loop {
                pb.set_position(counter.get());
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
    };
    let stored = vault.put_encrypted(&key, reader, Some(input_size)).await;
    ticker.abort();

    let stored = stored.with_context(|| format!("encrypting {:?} into '{}'", input, key))?;
    pb.set_position(counter.get());
    pb.finish_with_message(format!("Encrypted {} bytes ({} stored)", input_size, stored));

    println!("  {} -> {}", input.display(), key);
    Ok(())
}

async fn cmd_get(config_path: &str, key: &str, output: Option<&Path>, verified: bool) -> Result<()> {
    let vault = open_vault(config_path).await?;
    let spinner = create_spinner(&format!("Decrypting {}...", key))?;

    if verified {
        let data = vault
            .read_decrypted_verified(key)
            .await
            .with_context(|| format!("decrypting '{}'", key))?;
        match output {
            Some(path) => {
                fs::write(path, &data)
                    .await
                    .with_context(|| format!("writing to {:?}", path))?;
                spinner.finish_with_message(format!("Decrypted {} bytes -> {:?}", data.len(), path));
            }
            None => {
                spinner.finish_and_clear();
                io::stdout().write_all(&data)?;
                eprintln!("Decrypted {} bytes to stdout", data.len());
            }
        }
        return Ok(());
    }

    match output {
        Some(path) => {
            let mut file = fs::File::create(path)
                .await
                .with_context(|| format!("creating {:?}", path))?;
            let result = vault.read_into(key, &mut file).await;
            let bytes = match result {
                Ok(bytes) => bytes,
                Err(e) => {
                    // Plaintext written before the tag check must not survive.
                    drop(file);
                    let _ = fs::remove_file(path).await;
                    return Err(e).with_context(|| format!("decrypting '{}'", key));
                }
            };
            file.flush().await?;
            spinner.finish_with_message(format!("Decrypted {} bytes -> {:?}", bytes, path));
        }
        None => {
            spinner.finish_and_clear();
            let mut stdout = tokio::io::stdout();
            let bytes = vault
                .read_into(key, &mut stdout)
                .await
                .with_context(|| format!("decrypting '{}' (output already written is invalid)", key))?;
            stdout.flush().await?;
            eprintln!("Decrypted {} bytes to stdout", bytes);
        }
    }

    Ok(())
}

async fn cmd_cp(config_path: &str, from: &str, to: &str) -> Result<()> {
    let vault = open_vault(config_path).await?;
    let spinner = create_spinner(&format!("Copying {} -> {}...", from, to))?;
    let bytes = vault
        .copy_reencrypt(from, to)
        .await
        .with_context(|| format!("copying '{}' to '{}'", from, to))?;
    spinner.finish_with_message(format!("Copied {} -> {} ({} bytes, new IV)", from, to, bytes));
    Ok(())
}

async fn cmd_rm(config_path: &str, key: &str, yes: bool) -> Result<()> {
    let vault = open_vault(config_path).await?;

    if !vault.storage().exists(key).await? {
        anyhow::bail!("Blob '{}' not found in storage", key);
    }

    if !yes {
        print!("Delete '{}'? This cannot be undone. [y/N]: ", key);
        io::stdout().flush()?;

        let mut response = String::new();
        io::stdin().read_line(&mut response)?;

        if !response.trim().eq_ignore_ascii_case("y") {
            println!("Cancelled.");
            return Ok(());
        }
    }

    vault.delete(key).await?;
    println!("Deleted '{}'", key);
    Ok(())
}

async fn cmd_ls(config_path: &str, prefix: &str) -> Result<()> {
    let vault = open_vault(config_path).await?;
    if vault.storage().kind() == BackendKind::Local {
        println!("Listing is only available on the object store backend");
        return Ok(());
    }

    let mut continuation = None;
    let mut total = 0usize;
    loop {
        let page = vault.storage().list_keys(prefix, continuation.take()).await?;
        total += page.keys.len();
        for key in &page.keys {
            println!("  {}", key);
        }
        match page.next {
            Some(next) => continuation = Some(next),
            None => break,
        }
    }
    println!();
    println!("{} key(s) under '{}'", total, prefix);
    Ok(())
}

async fn cmd_archive(config_path: &str, manifest: &Path, output: Option<&Path>) -> Result<()> {
    let vault = open_vault(config_path).await?;
    let raw = fs::read(manifest)
        .await
        .with_context(|| format!("reading manifest {:?}", manifest))?;
    let manifest: ArchiveManifest =
        serde_json::from_slice(&raw).context("parsing archive manifest")?;

    let name = output
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive.zip".to_string());
    info!(content_type = CONTENT_TYPE, disposition = %content_disposition(&name), "archive headers");

    let log_done = |summary: &vaultfs::archive::ArchiveSummary| {
        info!(files = summary.files, bytes = summary.bytes, "archive delivered");
    };

    let summary = match output {
        Some(path) => {
            let file = fs::File::create(path)
                .await
                .with_context(|| format!("creating {:?}", path))?;
            vault
                .compose_archive(&manifest.entries, &manifest.roots, file, log_done)
                .await
        }
        None => {
            vault
                .compose_archive(&manifest.entries, &manifest.roots, tokio::io::stdout(), log_done)
                .await
        }
    };

    let summary = match summary {
        Ok(summary) => summary,
        Err(e) => {
            let err = VaultError::from(e);
            if err.is_agent_unavailable() {
                return Err(anyhow::Error::new(err)
                    .context("a custom drive is offline, reconnect the agent and try again"));
            }
            return Err(anyhow::Error::new(err).context("archive failed; any output written is incomplete"));
        }
    };

    eprintln!(
        "Archived {} file(s), {} empty folder(s), {} bytes",
        summary.files, summary.folders, summary.bytes
    );
    Ok(())
}

async fn cmd_sweep(config_path: &str, referenced: &Path, prefix: &str, apply: bool) -> Result<()> {
    let vault = open_vault(config_path).await?;
    let raw = fs::read(referenced)
        .await
        .with_context(|| format!("reading {:?}", referenced))?;
    let keys: HashSet<String> =
        serde_json::from_slice(&raw).context("parsing referenced key list")?;

    let spinner = create_spinner("Scanning for orphaned blobs...")?;
    let report = vault.sweep_orphans(prefix, &keys, !apply).await?;
    spinner.finish_and_clear();

    println!("Scanned:  {}", report.scanned);
    println!("Orphans:  {}", report.orphans.len());
    for key in &report.orphans {
        println!("  {}", key);
    }
    if apply {
        println!("Deleted:  {}", report.deleted);
    } else if !report.orphans.is_empty() {
        println!();
        println!("Dry run. Re-run with --apply to delete.");
    }
    Ok(())
}

async fn cmd_agent_health(config_path: &str) -> Result<()> {
    let vault = open_vault(config_path).await?;
    let agent = vault
        .agent()
        .context("no agent configured (set agent.base_url or VAULTFS_AGENT_URL)")?;

    match agent.health().await {
        Ok(()) => {
            println!("Agent at {} is reachable", agent.base_url());
            Ok(())
        }
        Err(e) => anyhow::bail!("Agent at {} is unavailable: {}", agent.base_url(), e),
    }
}
