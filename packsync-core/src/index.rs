use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use crate::config::ServerConfig;
use crate::error::Result;
use crate::generate::generate;
use crate::manifest::Manifest;

/// A file clients may fetch, addressed by `<directory path>/<relative path>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExposedFile {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

/// Lookup table from public file names to backing files. Requests never touch the
/// filesystem by any other route.
#[derive(Default, Debug)]
pub struct ExposedIndex {
    files: HashMap<String, ExposedFile>,
}

impl ExposedIndex {
    pub fn build(manifest: &Manifest, root: &Path) -> Self {
        let mut files = HashMap::new();
        for dir in &manifest.directories {
            for f in &dir.file_data {
                if f.checksum.is_none() {
                    continue;
                }
                let name = format!("{}/{}", dir.path, f.relative_path);
                let path = root.join(&dir.path).join(&f.relative_path);
                files.insert(name.clone(), ExposedFile { name, path, size: f.size });
            }
        }
        ExposedIndex { files }
    }

    pub fn get(&self, name: &str) -> Option<&ExposedFile> {
        self.files.get(name)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// One immutable generation of server state.
#[derive(Debug)]
pub struct Published {
    pub manifest: Manifest,
    /// Serialized once per generation; every manifest request returns these bytes.
    pub json: String,
    pub index: ExposedIndex,
}

impl Published {
    fn new(manifest: Manifest, root: &Path) -> Result<Self> {
        let json = manifest.to_json()?;
        let index = ExposedIndex::build(&manifest, root);
        Ok(Published { manifest, json, index })
    }
}

/// Holds the current [`Published`] snapshot. Readers clone the `Arc`; a rebuild swaps it whole.
pub struct ManifestStore {
    config: ServerConfig,
    current: RwLock<Arc<Published>>,
    rebuild_guard: Mutex<()>,
}

impl ManifestStore {
    /// Generate the first snapshot. Fails if the configured directories cannot be read.
    pub fn open(config: ServerConfig) -> Result<Self> {
        let published = Self::build(&config)?;
        tracing::info!(
            "manifest ready: {} directories, {} exposed files",
            published.manifest.directories.len(),
            published.index.len()
        );
        Ok(ManifestStore {
            config,
            current: RwLock::new(Arc::new(published)),
            rebuild_guard: Mutex::new(()),
        })
    }

    pub fn current(&self) -> Arc<Published> {
        match self.current.read() {
            Ok(g) => Arc::clone(&g),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Regenerate and publish. Only one rebuild runs at a time; on error the previous
    /// snapshot stays in place.
    pub fn rebuild(&self) -> Result<()> {
        let _guard = self.rebuild_guard.lock().unwrap_or_else(|e| e.into_inner());
        let published = Arc::new(Self::build(&self.config)?);
        let files = published.index.len();
        match self.current.write() {
            Ok(mut g) => *g = published,
            Err(poisoned) => *poisoned.into_inner() = published,
        }
        tracing::info!("manifest rebuilt, {} exposed files", files);
        Ok(())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Absolute paths of every configured directory, watched for changes.
    pub fn watch_roots(&self) -> Vec<PathBuf> {
        self.config.directories.iter().map(|d| self.config.root.join(&d.path)).collect()
    }

    /// Directories the server itself loads content from.
    pub fn server_content_roots(&self) -> Vec<PathBuf> {
        self.config
            .directories
            .iter()
            .filter(|d| d.sync_type.loads_on_server())
            .map(|d| self.config.root.join(&d.path))
            .collect()
    }

    fn build(config: &ServerConfig) -> Result<Published> {
        let copy = config.manifest_copy_path();
        let manifest = generate(&config.root, &config.directories, Some(&copy))?;
        Published::new(manifest, &config.root)
    }
}
