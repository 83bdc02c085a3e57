use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use crate::error::{Result, SyncError};
use crate::manifest::Manifest;

/// Ensure `rel` is safe relative to `root`: not absolute, no `..`, no prefix, and no symlink
/// between `root` and the final component. Returns the joined path.
pub fn validate_path(root: &Path, rel: &str) -> Result<PathBuf> {
    check_relative(rel)?;
    let rel_path = Path::new(rel);
    let mut cur = root.to_path_buf();
    for comp in rel_path.components() {
        cur.push(comp);
        if let Ok(m) = std::fs::symlink_metadata(&cur) {
            if m.file_type().is_symlink() {
                return Err(SyncError::Manifest(format!("symlink in path (not following): {cur:?}")));
            }
        }
    }
    Ok(root.join(rel_path))
}

/// Lexical checks only: not absolute, no `..`, no root or prefix components.
pub fn check_relative(rel: &str) -> Result<()> {
    if rel.is_empty() {
        return Err(SyncError::Manifest("empty path".into()));
    }
    let rel_path = Path::new(rel);
    if rel_path.is_absolute() || rel.starts_with('/') || rel.starts_with('\\') {
        return Err(SyncError::Manifest(format!("absolute paths are not allowed: {rel:?}")));
    }
    for comp in rel_path.components() {
        match comp {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => {
                return Err(SyncError::Manifest(format!("parent traversal not allowed: {rel:?}")))
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(SyncError::Manifest(format!("rooted path not allowed: {rel:?}")))
            }
        }
    }
    // Windows-style separators would survive the component check on unix.
    if rel.split('\\').any(|seg| seg == "..") {
        return Err(SyncError::Manifest(format!("parent traversal not allowed: {rel:?}")));
    }
    Ok(())
}

/// Reject manifests a client must not apply: unsafe paths or duplicate entries.
pub fn check_manifest(manifest: &Manifest) -> Result<()> {
    let mut names = HashSet::new();
    for dir in &manifest.directories {
        if !names.insert(dir.name.as_str()) {
            return Err(SyncError::Manifest(format!("duplicate directory {:?}", dir.name)));
        }
        check_relative(&dir.path)?;
        check_relative(&dir.target_path)?;
        let mut seen = HashSet::new();
        for f in &dir.file_data {
            check_relative(&f.relative_path)?;
            if !seen.insert(f.relative_path.as_str()) {
                return Err(SyncError::Manifest(format!(
                    "duplicate file {:?} in directory {:?}",
                    f.relative_path, dir.name
                )));
            }
        }
    }
    Ok(())
}

/// `/`-separated form of a relative path, regardless of platform.
pub fn to_slash(rel: &Path) -> String {
    rel.to_string_lossy().replace('\\', "/")
}
