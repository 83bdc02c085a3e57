use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::checksum::Checksum;
use crate::error::{Result, SyncError};

/// Where the content of a directory is used.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SyncType {
    #[serde(rename = "LOADED_SERVER", alias = "server_only")]
    ServerOnly,
    #[serde(rename = "LOADED_CLIENT", alias = "client_only")]
    ClientOnly,
    #[serde(rename = "INITIAL_SYNC", alias = "initial_only")]
    InitialOnly,
    #[serde(rename = "FORCED_SYNC", alias = "force_always")]
    ForceAlways,
}

impl SyncType {
    pub fn loads_on_server(self) -> bool {
        self == SyncType::ServerOnly
    }

    pub fn loads_on_client(self) -> bool {
        matches!(self, SyncType::ClientOnly | SyncType::ServerOnly)
    }

    /// Whether a locally modified file gets overwritten.
    pub fn force_sync(self) -> bool {
        self != SyncType::InitialOnly
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    /// `/`-separated, relative to the directory.
    pub relative_path: String,
    pub size: u64,
    /// Absent when the server could not read the file; such entries never match and are never served.
    pub checksum: Option<Checksum>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    pub name: String,
    /// Server-relative source directory.
    pub path: String,
    /// Client-relative destination.
    pub target_path: String,
    pub file_data: Vec<FileEntry>,
    pub sync_type: SyncType,
    #[serde(default)]
    pub should_remove_dangling_files: bool,
}

impl DirectoryEntry {
    pub fn file(&self, relative_path: &str) -> Option<&FileEntry> {
        self.file_data.iter().find(|f| f.relative_path == relative_path)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Manifest {
    pub directories: Vec<DirectoryEntry>,
}

impl Manifest {
    pub fn directory(&self, name: &str) -> Option<&DirectoryEntry> {
        self.directories.iter().find(|d| d.name == name)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| SyncError::Manifest(e.to_string()))
    }

    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s)
            .map_err(|e| SyncError::Manifest(format!("failed to parse manifest: {e}")))
    }

    /// Write a human-readable copy, creating parent directories.
    pub fn write_copy(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SyncError::fs(parent, e))?;
        }
        let json = self.to_json()?;
        let mut f = File::create(path).map_err(|e| SyncError::fs(path, e))?;
        f.write_all(json.as_bytes()).map_err(|e| SyncError::fs(path, e))?;
        Ok(())
    }
}
