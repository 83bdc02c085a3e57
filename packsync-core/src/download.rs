use rayon::prelude::*;
use reqwest::blocking::{Client, Response};
use reqwest::header::HeaderMap;
use reqwest::{StatusCode, Url};
use std::collections::HashSet;
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use walkdir::WalkDir;

use crate::checksum::compute_checksum;
use crate::config::ClientConfig;
use crate::error::{Result, SyncError};
use crate::manifest::Manifest;
use crate::path_safety::{to_slash, validate_path};
use crate::plan::{PlannedFile, SyncPlan};
use crate::progress::{ProgressSink, TransferProgress};
use crate::security::{ClientSession, ConnectionSecurity, RequestPhase, CHALLENGE};

const WRITE_BLOCK: usize = 64 * 1024;

/// Result of a completed synchronization run.
#[derive(Debug)]
pub struct SyncOutcome {
    pub manifest: Manifest,
    /// Local directories the host should load content from.
    pub content_roots: Vec<PathBuf>,
    pub downloaded: usize,
    pub skipped: usize,
    pub deleted: usize,
}

/// What the host gets back: either synced content or a reason to carry on without it.
#[derive(Debug)]
pub enum SyncStatus {
    Synced(SyncOutcome),
    Degraded(String),
}

impl SyncStatus {
    pub fn content_roots(&self) -> &[PathBuf] {
        match self {
            SyncStatus::Synced(o) => &o.content_roots,
            SyncStatus::Degraded(_) => &[],
        }
    }
}

pub struct Downloader {
    config: ClientConfig,
    security: Arc<dyn ConnectionSecurity>,
    http: Client,
    base: Url,
    progress: TransferProgress,
    /// Set once the host has given up on this run.
    cancelled: Arc<AtomicBool>,
}

impl Downloader {
    pub fn new(
        config: ClientConfig,
        security: Arc<dyn ConnectionSecurity>,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<Self> {
        config.validate()?;
        let mut base = Url::parse(config.remote_server.trim())
            .map_err(|e| SyncError::Configuration(format!("remote server: {e}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let stall = Duration::from_secs(config.stall_timeout_secs);
        let http = Client::builder()
            .connect_timeout(stall)
            .timeout(stall)
            .build()
            .map_err(|e| SyncError::Configuration(format!("http client: {e}")))?;
        Ok(Downloader {
            config,
            security,
            http,
            base,
            progress: TransferProgress::new(sink),
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Run one full synchronization. Any error means nothing synced should be trusted.
    pub fn sync(&self) -> Result<SyncOutcome> {
        let mut session = ClientSession::new();
        if self.security.needs_handshake() {
            session = self.authenticate(session)?;
        }
        let (manifest, session) = self.fetch_manifest(session)?;

        let root = &self.config.root;
        let plan = SyncPlan::build(&manifest, root, &self.config.directories)?;
        let downloaded = self.download_all(&plan, session)?;
        let skipped = plan.files.len() - downloaded;
        self.check_cancelled()?;
        let deleted = remove_dangling(&manifest, root);
        let content_roots = content_roots(&manifest, root);

        tracing::info!(
            "sync complete: {} downloaded, {} skipped, {} dangling removed",
            downloaded,
            skipped,
            deleted
        );
        Ok(SyncOutcome { manifest, content_roots, downloaded, skipped, deleted })
    }

    /// [`Downloader::sync`] under a wall-clock budget. On timeout the run is abandoned in the
    /// background and the host continues without synced content.
    pub fn sync_with_deadline(self, budget: Duration) -> SyncStatus {
        let cancelled = Arc::clone(&self.cancelled);
        let (tx, rx) = mpsc::channel();
        let spawned = thread::Builder::new().name("packsync-sync".into()).spawn(move || {
            let _ = tx.send(self.sync());
        });
        if let Err(e) = spawned {
            return SyncStatus::Degraded(format!("cannot start sync thread: {e}"));
        }
        match rx.recv_timeout(budget) {
            Ok(Ok(outcome)) => SyncStatus::Synced(outcome),
            Ok(Err(e)) => {
                tracing::error!("synchronization failed: {}", e);
                SyncStatus::Degraded(e.to_string())
            }
            Err(_) => {
                // The abandoned run stops at its next checkpoint and leaves the rest alone.
                cancelled.store(true, Ordering::Relaxed);
                tracing::error!("synchronization did not finish within {:?}", budget);
                SyncStatus::Degraded(format!("timed out after {budget:?}"))
            }
        }
    }

    /// Like [`Downloader::sync`] but never fails; errors become [`SyncStatus::Degraded`].
    pub fn run(self) -> SyncStatus {
        match self.config.overall_timeout_secs {
            Some(secs) => self.sync_with_deadline(Duration::from_secs(secs)),
            None => match self.sync() {
                Ok(outcome) => SyncStatus::Synced(outcome),
                Err(e) => {
                    tracing::error!("synchronization failed: {}", e);
                    SyncStatus::Degraded(e.to_string())
                }
            },
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancelled.load(Ordering::Relaxed) {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::Configuration("remote server cannot be a base URL".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Send one GET, fold the response challenge into the session and check the status.
    fn request(
        &self,
        session: ClientSession,
        segments: &[&str],
        phase: RequestPhase,
    ) -> Result<(Response, ClientSession)> {
        let url = self.url(segments)?;
        let mut headers = HeaderMap::new();
        self.security.decorate_request(&session, &mut headers, phase)?;
        tracing::debug!("requesting {}", url);
        let resp = self.http.get(url.clone()).headers(headers).send()?;

        let session = match resp.headers().get(CHALLENGE).and_then(|v| v.to_str().ok()) {
            Some(token) => self.security.absorb_challenge(session, token)?,
            None => session,
        };
        match resp.status() {
            StatusCode::OK => Ok((resp, session)),
            StatusCode::UNAUTHORIZED => Err(SyncError::Authentication(format!(
                "server rejected credentials for {url}"
            ))),
            s => Err(SyncError::Transport(format!("got HTTP status {s} for {url}"))),
        }
    }

    fn authenticate(&self, session: ClientSession) -> Result<ClientSession> {
        tracing::info!("authenticating with {}", self.base);
        let (_, session) = self.request(session, &["authenticate"], RequestPhase::Handshake)?;
        Ok(session)
    }

    fn fetch_manifest(&self, session: ClientSession) -> Result<(Manifest, ClientSession)> {
        let (resp, session) =
            self.request(session, &["servermanifest.json"], RequestPhase::Authenticated)?;
        let body = resp.text()?;
        let manifest = Manifest::from_json(&body)?;
        tracing::debug!("received manifest with {} directories", manifest.directories.len());

        let copy = self.config.manifest_copy_path();
        if let Err(e) = manifest.write_copy(&copy) {
            tracing::warn!("failed to write manifest copy: {}", e);
        }
        Ok((manifest, session))
    }

    fn workers(&self) -> usize {
        if !self.security.supports_concurrent_requests() {
            return 1;
        }
        let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        cpus.min(self.config.max_workers).max(1)
    }

    fn download_all(&self, plan: &SyncPlan, session: ClientSession) -> Result<usize> {
        let jobs: Vec<&PlannedFile> = plan.downloads().collect();
        if jobs.is_empty() {
            tracing::info!("all files are up to date");
            return Ok(0);
        }
        let bytes: u64 = jobs.iter().map(|f| f.size).sum();
        self.progress.reset(jobs.len() as u64, bytes);
        tracing::info!("downloading {} files ({} bytes)", jobs.len(), bytes);

        let workers = self.workers();
        if workers == 1 {
            // Each response carries the challenge the next request must answer.
            let mut session = session;
            for job in &jobs {
                session = self.download_one(session, job)?;
            }
        } else {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .thread_name(|i| format!("packsync-download-{i}"))
                .build()
                .map_err(|e| SyncError::Configuration(format!("download pool: {e}")))?;
            pool.install(|| {
                jobs.par_iter()
                    .try_for_each(|job| self.download_one(session.clone(), job).map(|_| ()))
            })?;
        }
        Ok(jobs.len())
    }

    fn download_one(&self, session: ClientSession, job: &PlannedFile) -> Result<ClientSession> {
        self.check_cancelled()?;
        tracing::info!("requesting file {}", job.source);
        let segments: Vec<&str> =
            std::iter::once("files").chain(job.source.split('/')).collect();
        let (mut resp, session) = self.request(session, &segments, RequestPhase::Authenticated)?;
        self.check_cancelled()?;

        if let Some(parent) = job.target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SyncError::fs(parent, e))?;
        }
        let mut out = File::create(&job.target).map_err(|e| SyncError::fs(&job.target, e))?;
        let mut buf = vec![0u8; WRITE_BLOCK];
        loop {
            let n = match resp.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(SyncError::Transport(format!(
                        "download of {} failed: {e}",
                        job.source
                    )))
                }
            };
            out.write_all(&buf[..n]).map_err(|e| SyncError::fs(&job.target, e))?;
            self.progress.add_bytes(&job.relative_path, n as u64);
            self.check_cancelled()?;
        }
        out.flush().map_err(|e| SyncError::fs(&job.target, e))?;
        drop(out);

        let expected = job.checksum.as_ref().map(|c| c.as_str()).unwrap_or_default();
        let actual = compute_checksum(&job.target);
        if job.checksum.is_none() || actual != job.checksum {
            return Err(SyncError::Integrity {
                path: job.target.clone(),
                expected: expected.to_string(),
                actual: actual.map(|c| c.to_string()).unwrap_or_else(|| "<unreadable>".into()),
            });
        }
        self.progress.finish_file();
        Ok(session)
    }
}

/// Local directories of `manifest` that the client loads content from.
pub fn content_roots(manifest: &Manifest, root: &Path) -> Vec<PathBuf> {
    manifest
        .directories
        .iter()
        .filter(|d| d.sync_type.loads_on_client())
        .filter_map(|d| validate_path(root, &d.target_path).ok())
        .collect()
}

/// Delete local files the manifest no longer names, in directories that ask for it.
/// Returns how many were removed. Failures are logged and skipped.
pub fn remove_dangling(manifest: &Manifest, root: &Path) -> usize {
    let mut deleted = 0;
    for dir in manifest.directories.iter().filter(|d| d.should_remove_dangling_files) {
        let Ok(target) = validate_path(root, &dir.target_path) else { continue };
        if !target.is_dir() {
            continue;
        }
        let wanted: HashSet<&str> = dir.file_data.iter().map(|f| f.relative_path.as_str()).collect();
        for ent in WalkDir::new(&target).min_depth(1) {
            let ent = match ent {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!("failed to read {}: {}", target.display(), e);
                    continue;
                }
            };
            if !ent.file_type().is_file() {
                continue;
            }
            let Some(rel) = pathdiff::diff_paths(ent.path(), &target) else { continue };
            if wanted.contains(to_slash(&rel).as_str()) {
                continue;
            }
            match std::fs::remove_file(ent.path()) {
                Ok(()) => {
                    tracing::info!("deleted dangling file {}", ent.path().display());
                    deleted += 1;
                }
                Err(e) => {
                    tracing::warn!("failed to delete dangling file {}: {}", ent.path().display(), e)
                }
            }
        }
    }
    deleted
}

