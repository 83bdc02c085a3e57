use anyhow::Context;
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use walkdir::WalkDir;

use crate::error::{Result, SyncError};
use crate::index::ManifestStore;

enum Msg {
    Fs(notify::Result<Event>),
    Stop,
}

/// What a batch of events requires. Ordered by cost.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Change {
    /// File contents changed: regenerate the manifest.
    Content,
    /// Entries appeared or vanished: regenerate and recompute the watched directories.
    Structure,
}

/// Classify one filesystem event. `None` for events that cannot affect the manifest.
pub fn classify(kind: &EventKind) -> Option<Change> {
    match kind {
        EventKind::Create(_) | EventKind::Remove(_) => Some(Change::Structure),
        EventKind::Modify(ModifyKind::Name(_)) => Some(Change::Structure),
        EventKind::Modify(_) => Some(Change::Content),
        EventKind::Any | EventKind::Access(_) | EventKind::Other => None,
    }
}

/// Keeps a [`ManifestStore`] in step with the filesystem from one background thread.
///
/// Dropping the handle stops the thread.
pub struct ManifestWatcher {
    tx: Sender<Msg>,
    handle: Option<JoinHandle<()>>,
}

impl ManifestWatcher {
    pub fn start(store: Arc<ManifestStore>) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let fs_tx = tx.clone();
        let watcher = notify::recommended_watcher(move |res| {
            let _ = fs_tx.send(Msg::Fs(res));
        })
        .map_err(|e| SyncError::Configuration(format!("cannot create file watcher: {e}")))?;

        let (ready_tx, ready_rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("packsync-watcher".into())
            .spawn(move || run(store, watcher, rx, ready_tx))
            .map_err(|e| SyncError::Configuration(format!("cannot start watcher thread: {e}")))?;
        // Changes made after start() returns are guaranteed to be seen.
        let _ = ready_rx.recv();
        tracing::info!("started file watch service");
        Ok(ManifestWatcher { tx, handle: Some(handle) })
    }
}

impl Drop for ManifestWatcher {
    fn drop(&mut self) {
        let _ = self.tx.send(Msg::Stop);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

fn run(
    store: Arc<ManifestStore>,
    mut watcher: RecommendedWatcher,
    rx: Receiver<Msg>,
    ready: Sender<()>,
) {
    let ignored = store.config().manifest_copy_path();
    let mut watched = HashSet::new();
    if let Err(e) = rewatch(&mut watcher, &mut watched, &store.watch_roots()) {
        tracing::error!("failed to register watches: {:#}", e);
    }
    let _ = ready.send(());

    let mut stopping = false;
    while !stopping {
        let mut pending = match rx.recv() {
            Ok(Msg::Fs(ev)) => relevant(ev, &ignored),
            Ok(Msg::Stop) | Err(_) => break,
        };
        // Everything queued while the last rebuild ran folds into this one.
        loop {
            match rx.try_recv() {
                Ok(Msg::Fs(ev)) => pending = pending.max(relevant(ev, &ignored)),
                Ok(Msg::Stop) => {
                    stopping = true;
                    break;
                }
                Err(_) => break,
            }
        }
        let Some(change) = pending else { continue };
        if stopping {
            break;
        }
        tracing::debug!("filesystem change detected: {:?}", change);
        // Register new directories before walking them: anything created afterwards is either
        // seen by the walk or queued as an event.
        if change == Change::Structure {
            if let Err(e) = rewatch(&mut watcher, &mut watched, &store.watch_roots()) {
                tracing::error!("failed to update watches: {:#}", e);
            }
        }
        if let Err(e) = store.rebuild() {
            tracing::error!("manifest rebuild failed, keeping previous manifest: {}", e);
        }
    }
    tracing::debug!("file watch service stopped");
}

fn relevant(ev: notify::Result<Event>, ignored: &Path) -> Option<Change> {
    match ev {
        Ok(ev) => {
            if !ev.paths.is_empty() && ev.paths.iter().all(|p| p == ignored) {
                return None;
            }
            classify(&ev.kind)
        }
        Err(e) => {
            tracing::warn!("file watcher error: {}", e);
            None
        }
    }
}

/// Every directory at or below the given roots.
pub fn directories_under(roots: &[PathBuf]) -> HashSet<PathBuf> {
    let mut out = HashSet::new();
    for root in roots {
        for ent in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
            if ent.file_type().is_dir() {
                out.insert(ent.into_path());
            }
        }
    }
    out
}

fn rewatch(
    watcher: &mut RecommendedWatcher,
    watched: &mut HashSet<PathBuf>,
    roots: &[PathBuf],
) -> anyhow::Result<()> {
    let wanted = directories_under(roots);
    watched.retain(|dir| {
        if wanted.contains(dir) {
            return true;
        }
        // The directory may already be gone along with its watch.
        let _ = watcher.unwatch(dir);
        false
    });
    let mut first_err = None;
    for dir in wanted {
        if watched.contains(&dir) {
            continue;
        }
        match watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("watch {}", dir.display()))
        {
            Ok(()) => {
                watched.insert(dir);
            }
            Err(e) => {
                first_err.get_or_insert(e);
            }
        }
    }
    tracing::debug!("watching {} directories", watched.len());
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
