use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use packsync_core::config::{self, ClientConfig, ServerConfig};
use packsync_core::download::{Downloader, SyncStatus};
use packsync_core::generate::generate;
use packsync_core::progress::LogProgress;
use packsync_core::security::{self, signed::Authority, Role};
use packsync_core::server;

#[derive(Parser)]
#[command(name = "packsync", version, about = "packsync: authenticated content synchronization")]
struct Cli {
    /// Log at debug level (RUST_LOG still wins when set)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Generate the manifest, watch for changes and serve until interrupted
    Serve {
        #[arg(short, long, default_value = "server.toml")]
        config: PathBuf,
        /// Listen address override
        #[arg(short, long)]
        listen: Option<String>,
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Run one synchronization and print the resulting content roots
    Sync {
        #[arg(short, long, default_value = "client.toml")]
        config: PathBuf,
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Generate the manifest once and print a summary
    Manifest {
        #[arg(short, long, default_value = "server.toml")]
        config: PathBuf,
        #[arg(long)]
        root: Option<PathBuf>,
    },
    /// Create an authority keypair for signed identity mode
    Keygen {
        #[arg(long, default_value = "authority.json")]
        out: PathBuf,
    },
    /// Mint client identity material signed by an authority
    IssueIdentity {
        #[arg(long, default_value = "authority.json")]
        authority: PathBuf,
        /// Identity UUID; a random one when omitted
        #[arg(long)]
        id: Option<Uuid>,
        #[arg(long, default_value_t = 30)]
        valid_days: u32,
        #[arg(long, default_value = "identity.json")]
        out: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match cli.cmd {
        Cmd::Serve { config, listen, root } => serve(&config, listen, root),
        Cmd::Sync { config, root } => sync(&config, root),
        Cmd::Manifest { config, root } => manifest(&config, root),
        Cmd::Keygen { out } => keygen(&out),
        Cmd::IssueIdentity { authority, id, valid_days, out } => {
            issue_identity(&authority, id, valid_days, &out)
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

/// Load `path`, or write the defaults there and use them if it does not exist yet.
fn load_or_default<T>(path: &Path, load: fn(&Path) -> packsync_core::Result<T>) -> Result<T>
where
    T: Default + serde::Serialize,
{
    if path.exists() {
        return load(path).with_context(|| format!("load {}", path.display()));
    }
    tracing::info!("no config file at {}, writing defaults", path.display());
    let cfg = T::default();
    match config::to_toml(&cfg) {
        Ok(text) => {
            if let Err(e) = std::fs::write(path, text) {
                tracing::warn!("could not write default config {}: {}", path.display(), e);
            }
        }
        Err(e) => tracing::warn!("could not render default config: {}", e),
    }
    Ok(cfg)
}

fn server_config(path: &Path, root: Option<PathBuf>) -> Result<ServerConfig> {
    let mut cfg = load_or_default(path, ServerConfig::load)?;
    if let Some(root) = root {
        cfg.root = root;
    }
    cfg.validate()?;
    Ok(cfg)
}

fn serve(path: &Path, listen: Option<String>, root: Option<PathBuf>) -> Result<()> {
    let mut cfg = server_config(path, root)?;
    if let Some(listen) = listen {
        cfg.listen_addr = listen;
    }
    let provider = security::from_config(&cfg.security, Role::Server)
        .context("security configuration")?;
    tracing::info!("starting server on {} with {} security", cfg.listen_addr, provider.name());
    server::serve(cfg, provider)?;
    Ok(())
}

fn sync(path: &Path, root: Option<PathBuf>) -> Result<()> {
    let mut cfg = load_or_default(path, ClientConfig::load)?;
    if let Some(root) = root {
        cfg.root = root;
    }
    let provider = security::from_config(&cfg.security, Role::Client)
        .context("security configuration")?;
    let progress = LogProgress::new(Duration::from_secs(5));
    progress.start();
    let downloader = Downloader::new(cfg, provider, Arc::new(progress.clone()))?;
    let status = downloader.run();
    progress.stop();
    match status {
        SyncStatus::Synced(outcome) => {
            for root in &outcome.content_roots {
                println!("{}", root.display());
            }
            Ok(())
        }
        SyncStatus::Degraded(reason) => Err(anyhow!("no synchronized content available: {reason}")),
    }
}

fn manifest(path: &Path, root: Option<PathBuf>) -> Result<()> {
    let cfg = server_config(path, root)?;
    let copy = cfg.manifest_copy_path();
    let mf = generate(&cfg.root, &cfg.directories, Some(&copy))?;
    for dir in &mf.directories {
        let bytes: u64 = dir.file_data.iter().map(|f| f.size).sum();
        println!(
            "{}: {} files, {} bytes, {:?} -> {}",
            dir.name,
            dir.file_data.len(),
            bytes,
            dir.sync_type,
            dir.target_path
        );
    }
    eprintln!("Wrote manifest copy to {}", copy.display());
    Ok(())
}

fn keygen(out: &Path) -> Result<()> {
    if out.exists() {
        bail!("{} already exists, refusing to overwrite", out.display());
    }
    let authority = Authority::generate();
    authority.save(out)?;
    println!("{}", authority.public_key_b64());
    eprintln!("Wrote authority keypair to {}", out.display());
    Ok(())
}

fn issue_identity(authority: &Path, id: Option<Uuid>, valid_days: u32, out: &Path) -> Result<()> {
    if valid_days == 0 {
        bail!("--valid-days must be at least 1");
    }
    let authority = Authority::load(authority)?;
    let id = id.unwrap_or_else(Uuid::new_v4);
    let expires_at = chrono::Utc::now()
        .checked_add_signed(chrono::Duration::days(i64::from(valid_days)))
        .ok_or_else(|| anyhow!("--valid-days {valid_days} is too far in the future"))?;
    let identity = authority.issue(id, expires_at);
    identity.save(out)?;
    println!("{}", id);
    eprintln!("Wrote identity valid until {} to {}", identity.expires_at, out.display());
    Ok(())
}
