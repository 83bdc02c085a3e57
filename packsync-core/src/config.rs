//! Configuration types shared by the server and the client.
//!
//! Both sides read a TOML file. Only the shape and validation live here; where the file comes
//! from is up to the host.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::manifest::SyncType;

pub const DEFAULT_PASSWORD: &str = "!!CHANGEME_WHEN_USING_PASSWORD_MODE!!";

/// Authentication scheme, resolved once at startup by [`crate::security::from_config`].
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SecurityConfig {
    Password {
        password: String,
    },
    SignedIdentity {
        /// Client role: identity material issued by the authority.
        #[serde(default)]
        identity_file: Option<PathBuf>,
        /// Server role: base64 ed25519 verifying key of the authority.
        #[serde(default)]
        authority_public_key: Option<String>,
        #[serde(default)]
        allow_list: Vec<Uuid>,
        #[serde(default)]
        allow_any: bool,
    },
}

impl Default for SecurityConfig {
    fn default() -> Self {
        SecurityConfig::Password { password: DEFAULT_PASSWORD.to_string() }
    }
}

/// A directory the server exposes.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ExposedDirectory {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub target_path: Option<String>,
    pub sync_type: SyncType,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub remove_dangling_files: bool,
    /// Globs matched against the `/`-separated relative path.
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl ExposedDirectory {
    pub fn target_path(&self) -> &str {
        self.target_path.as_deref().unwrap_or(&self.path)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ServerConfig {
    pub root: PathBuf,
    pub listen_addr: String,
    pub log_client_ips: bool,
    /// Diagnostic manifest copy, relative to `root`.
    pub manifest_copy: PathBuf,
    pub io_threads: usize,
    pub directories: Vec<ExposedDirectory>,
    pub security: SecurityConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            listen_addr: "0.0.0.0:8080".to_string(),
            log_client_ips: true,
            manifest_copy: PathBuf::from("spl/manifest.json"),
            io_threads: 2,
            directories: vec![ExposedDirectory {
                name: "servermods".to_string(),
                path: "servermods".to_string(),
                target_path: None,
                sync_type: SyncType::ServerOnly,
                recursive: false,
                remove_dangling_files: false,
                exclude: Vec::new(),
            }],
            security: SecurityConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let cfg: Self = load_toml(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for d in &self.directories {
            if !seen.insert(d.name.as_str()) {
                return Err(SyncError::Configuration(format!(
                    "directory name {:?} is configured twice",
                    d.name
                )));
            }
            if d.path.trim().is_empty() {
                return Err(SyncError::Configuration(format!(
                    "directory {:?} has an empty path",
                    d.name
                )));
            }
        }
        if self.io_threads == 0 {
            return Err(SyncError::Configuration("io_threads must be at least 1".into()));
        }
        Ok(())
    }

    pub fn manifest_copy_path(&self) -> PathBuf {
        self.root.join(&self.manifest_copy)
    }
}

/// Client-side options for one directory of the server manifest, matched by name.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ConsumedDirectory {
    pub name: String,
    /// Regular expressions that must match the whole relative path.
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ClientConfig {
    pub root: PathBuf,
    pub remote_server: String,
    /// Copy of the last received manifest, relative to `root`.
    pub manifest_copy: PathBuf,
    pub max_workers: usize,
    pub stall_timeout_secs: u64,
    pub overall_timeout_secs: Option<u64>,
    pub directories: Vec<ConsumedDirectory>,
    pub security: SecurityConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            remote_server: "http://localhost:8080/".to_string(),
            manifest_copy: PathBuf::from("spl/servermanifest-copy.json"),
            max_workers: 4,
            stall_timeout_secs: 30,
            overall_timeout_secs: None,
            directories: Vec::new(),
            security: SecurityConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let cfg: Self = load_toml(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let remote = self.remote_server.trim();
        if remote.is_empty() {
            return Err(SyncError::Configuration("no remote server set".into()));
        }
        let url = reqwest::Url::parse(remote).map_err(|e| {
            SyncError::Configuration(format!("remote server is not a valid URL: {e}"))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SyncError::Configuration(format!(
                "remote server must be http or https, got {}",
                url.scheme()
            )));
        }
        if self.stall_timeout_secs == 0 {
            return Err(SyncError::Configuration("stall_timeout_secs must be positive".into()));
        }
        for d in &self.directories {
            for pattern in &d.exclude {
                regex::Regex::new(pattern).map_err(|e| {
                    SyncError::Configuration(format!("bad exclusion pattern {pattern:?}: {e}"))
                })?;
            }
        }
        Ok(())
    }

    pub fn manifest_copy_path(&self) -> PathBuf {
        self.root.join(&self.manifest_copy)
    }
}

fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| SyncError::fs(path, e))?;
    toml::from_str(&content)
        .map_err(|e| SyncError::Configuration(format!("{}: {e}", path.display())))
}

/// Render a config as TOML, used to write defaults next to a missing file.
pub fn to_toml<T: Serialize>(cfg: &T) -> Result<String> {
    toml::to_string_pretty(cfg).map_err(|e| SyncError::Configuration(e.to_string()))
}
