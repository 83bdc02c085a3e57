use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};
use std::thread;
use std::time::{Duration, Instant};

/// Receives transfer progress. Called from download workers concurrently, so it must not block.
pub trait ProgressSink: Send + Sync {
    /// `done`/`total` are bytes across the whole run; `file` is the one that just advanced.
    fn on_progress(&self, file: &str, done: u64, total: u64);
}

/// Discards everything.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_progress(&self, _file: &str, _done: u64, _total: u64) {}
}

/// Run-wide byte and file counters shared by all download workers.
#[derive(Clone)]
pub struct TransferProgress {
    pub files_done: Arc<AtomicU64>,
    pub files_total: Arc<AtomicU64>,
    pub bytes_done: Arc<AtomicU64>,
    pub bytes_total: Arc<AtomicU64>,
    sink: Arc<dyn ProgressSink>,
}

impl TransferProgress {
    pub fn new(sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            files_done: Arc::new(AtomicU64::new(0)),
            files_total: Arc::new(AtomicU64::new(0)),
            bytes_done: Arc::new(AtomicU64::new(0)),
            bytes_total: Arc::new(AtomicU64::new(0)),
            sink,
        }
    }

    pub fn reset(&self, files: u64, bytes: u64) {
        self.files_total.store(files, Ordering::Relaxed);
        self.bytes_total.store(bytes, Ordering::Relaxed);
        self.files_done.store(0, Ordering::Relaxed);
        self.bytes_done.store(0, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, file: &str, n: u64) {
        let done = self.bytes_done.fetch_add(n, Ordering::Relaxed) + n;
        let total = self.bytes_total.load(Ordering::Relaxed);
        self.sink.on_progress(file, done, total);
    }

    pub fn finish_file(&self) {
        self.files_done.fetch_add(1, Ordering::Relaxed);
    }
}

/// Logs the latest progress at a fixed interval from a reporter thread.
#[derive(Clone)]
pub struct LogProgress {
    interval: Duration,
    file: Arc<Mutex<String>>,
    done: Arc<AtomicU64>,
    total: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
}

impl LogProgress {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            file: Arc::new(Mutex::new(String::new())),
            done: Arc::new(AtomicU64::new(0)),
            total: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::Relaxed) {
            return;
        }
        let this = self.clone();
        thread::spawn(move || {
            let t0 = Instant::now();
            while this.running.load(Ordering::Relaxed) {
                thread::sleep(this.interval);
                if !this.running.load(Ordering::Relaxed) {
                    break;
                }
                let done = this.done.load(Ordering::Relaxed);
                let total = this.total.load(Ordering::Relaxed);
                if total == 0 {
                    continue;
                }
                let file = this.file.lock().map(|f| f.clone()).unwrap_or_default();
                let pct = (done as f64 / total as f64) * 100.0;
                tracing::info!(
                    "[{:>4}s] downloading {} | {}/{} bytes ({}%)",
                    t0.elapsed().as_secs(),
                    file,
                    done,
                    total,
                    pct as i32
                );
            }
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

impl ProgressSink for LogProgress {
    fn on_progress(&self, file: &str, done: u64, total: u64) {
        self.done.store(done, Ordering::Relaxed);
        self.total.store(total, Ordering::Relaxed);
        // Skip the name update rather than wait on the reporter.
        if let Ok(mut f) = self.file.try_lock() {
            if f.as_str() != file {
                *f = file.to_string();
            }
        }
    }
}
