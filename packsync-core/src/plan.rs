use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::checksum::{compute_checksum, Checksum};
use crate::config::ConsumedDirectory;
use crate::error::{Result, SyncError};
use crate::manifest::Manifest;
use crate::path_safety::{check_manifest, validate_path};

/// What the downloader does with one manifest entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileAction {
    /// Local content already matches.
    UpToDate,
    /// A differing local copy exists and the directory does not force resync.
    PreserveLocal,
    Download,
    /// Matched a client exclusion, or the server has no checksum for it.
    Excluded,
}

#[derive(Clone, Debug)]
pub struct PlannedFile {
    /// Manifest directory name.
    pub directory: String,
    /// Public name on the server: `<directory path>/<relative path>`.
    pub source: String,
    pub relative_path: String,
    pub target: PathBuf,
    pub size: u64,
    pub checksum: Option<Checksum>,
    pub action: FileAction,
}

#[derive(Clone, Debug, Default)]
pub struct SyncPlan {
    pub files: Vec<PlannedFile>,
}

impl SyncPlan {
    /// Compare `manifest` against what is under `root`.
    ///
    /// Fails without touching anything if the manifest contains unsafe paths.
    pub fn build(manifest: &Manifest, root: &Path, consumed: &[ConsumedDirectory]) -> Result<Self> {
        check_manifest(manifest)?;
        let excludes = compile_excludes(consumed)?;
        let mut files = Vec::new();
        for dir in &manifest.directories {
            let patterns = excludes.get(dir.name.as_str()).map(Vec::as_slice).unwrap_or(&[]);
            let target_root = validate_path(root, &dir.target_path)?;
            for f in &dir.file_data {
                let target = validate_path(&target_root, &f.relative_path)?;
                let action = if patterns.iter().any(|p| p.is_match(&f.relative_path)) {
                    tracing::info!("skipping excluded file {}", f.relative_path);
                    FileAction::Excluded
                } else {
                    decide(&f.checksum, &target, dir.sync_type.force_sync(), &f.relative_path)
                };
                files.push(PlannedFile {
                    directory: dir.name.clone(),
                    source: format!("{}/{}", dir.path, f.relative_path),
                    relative_path: f.relative_path.clone(),
                    target,
                    size: f.size,
                    checksum: f.checksum.clone(),
                    action,
                });
            }
        }
        Ok(SyncPlan { files })
    }

    pub fn downloads(&self) -> impl Iterator<Item = &PlannedFile> {
        self.files.iter().filter(|f| f.action == FileAction::Download)
    }

    pub fn count(&self, action: FileAction) -> usize {
        self.files.iter().filter(|f| f.action == action).count()
    }
}

fn decide(expected: &Option<Checksum>, target: &Path, force: bool, rel: &str) -> FileAction {
    let Some(expected) = expected else {
        tracing::warn!("server has no checksum for {}, not downloadable", rel);
        return FileAction::Excluded;
    };
    match compute_checksum(target) {
        Some(local) if &local == expected => {
            tracing::debug!("found existing file {}, skipping", rel);
            FileAction::UpToDate
        }
        Some(_) if !force => {
            tracing::warn!(
                "existing file {} differs and its directory is not force-synced, keeping it",
                rel
            );
            FileAction::PreserveLocal
        }
        _ => FileAction::Download,
    }
}

/// Client exclusions must match the whole relative path.
fn compile_excludes(consumed: &[ConsumedDirectory]) -> Result<HashMap<&str, Vec<Regex>>> {
    let mut out = HashMap::new();
    for d in consumed {
        let mut v = Vec::with_capacity(d.exclude.len());
        for p in &d.exclude {
            let re = Regex::new(&format!("^(?:{p})$")).map_err(|e| {
                SyncError::Configuration(format!("bad exclusion pattern {p:?}: {e}"))
            })?;
            v.push(re);
        }
        out.insert(d.name.as_str(), v);
    }
    Ok(out)
}
