use globset::{Glob, GlobSet, GlobSetBuilder};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::checksum::compute_checksum;
use crate::config::ExposedDirectory;
use crate::error::{Result, SyncError};
use crate::manifest::{DirectoryEntry, FileEntry, Manifest};
use crate::path_safety::to_slash;

/// Build a manifest from the configured directories under `root`.
///
/// Missing directories are created. Directories that end up with no files are left out.
/// When `copy_path` is given, a pretty-printed copy is written there.
pub fn generate(
    root: &Path,
    dirs: &[ExposedDirectory],
    copy_path: Option<&Path>,
) -> Result<Manifest> {
    tracing::debug!("generating manifest for {} directories", dirs.len());
    let mut directories = Vec::with_capacity(dirs.len());
    for dir in dirs {
        let content_path = root.join(&dir.path);
        std::fs::create_dir_all(&content_path).map_err(|e| SyncError::fs(&content_path, e))?;

        let excludes = build_excludes(&dir.exclude)?;
        let mut rels = Vec::new();
        for rel in list_files(&content_path, dir.recursive)? {
            // A lossy name could never be served back.
            if rel.to_str().is_none() {
                tracing::warn!(
                    "skipping {}: file name is not valid UTF-8",
                    content_path.join(&rel).display()
                );
                continue;
            }
            let slash = to_slash(&rel);
            if excludes.is_match(&slash) {
                tracing::debug!("skipping excluded file {}", slash);
                continue;
            }
            rels.push((slash, content_path.join(&rel)));
        }

        if rels.is_empty() {
            tracing::warn!("no files found in {} for directory {:?}", content_path.display(), dir.name);
            continue;
        }

        let file_data: Vec<FileEntry> = rels
            .par_iter()
            .map(|(slash, full)| {
                let size = std::fs::metadata(full).map(|m| m.len()).unwrap_or(0);
                let checksum = compute_checksum(full);
                if checksum.is_none() {
                    tracing::warn!("{} could not be hashed and will not be served", full.display());
                }
                FileEntry { relative_path: slash.clone(), size, checksum }
            })
            .collect();

        directories.push(DirectoryEntry {
            name: dir.name.clone(),
            path: dir.path.clone(),
            target_path: dir.target_path().to_string(),
            file_data,
            sync_type: dir.sync_type,
            should_remove_dangling_files: dir.remove_dangling_files,
        });
    }

    let manifest = Manifest { directories };
    if let Some(copy) = copy_path {
        manifest.write_copy(copy)?;
    }
    Ok(manifest)
}

/// Regular files below `dir`, relative to it, in sorted order.
fn list_files(dir: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
    let mut walk = WalkDir::new(dir).min_depth(1).sort_by_file_name();
    if !recursive {
        walk = walk.max_depth(1);
    }
    let mut out = Vec::new();
    for ent in walk {
        let ent = ent.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| dir.to_path_buf());
            SyncError::fs(path, e.into())
        })?;
        if !ent.file_type().is_file() {
            continue;
        }
        if let Some(rel) = pathdiff::diff_paths(ent.path(), dir) {
            out.push(rel);
        }
    }
    Ok(out)
}

fn build_excludes(patterns: &[String]) -> Result<GlobSet> {
    let mut b = GlobSetBuilder::new();
    for p in patterns {
        let glob = Glob::new(p)
            .map_err(|e| SyncError::Configuration(format!("bad exclusion glob {p:?}: {e}")))?;
        b.add(glob);
    }
    b.build().map_err(|e| SyncError::Configuration(e.to_string()))
}
