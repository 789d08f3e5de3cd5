//! Local directory observer.
//!
//! Reports files already present, then live arrivals. A new file is held
//! for a settle period (extended while it keeps changing) and reported only
//! if it still exists afterwards. A file the startup scan already reported
//! is not reported again when its creation event arrives late.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

use crate::error::WatcherError;
use crate::pipeline::types::{SourceTag, SupportedFormats};
use crate::scheduler::DetectionCallback;

/// Upper bound on how long the observer blocks before checking for stop.
const TICK: Duration = Duration::from_millis(250);

/// Supported media files directly inside `dir`, sorted by path.
pub fn scan_existing(dir: &Path, formats: &SupportedFormats) -> io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file() && formats.is_supported(p))
        .collect();
    files.sort();
    Ok(files)
}

/// A running observer on one directory. Stops when dropped.
pub struct LocalWatcher {
    dir: PathBuf,
    watcher: Option<RecommendedWatcher>,
    thread: Option<thread::JoinHandle<()>>,
    stopped: Arc<AtomicBool>,
}

impl LocalWatcher {
    pub fn start(
        dir: &Path,
        formats: SupportedFormats,
        settle: Duration,
        callback: DetectionCallback,
    ) -> Result<Self, WatcherError> {
        if !dir.is_dir() {
            return Err(WatcherError::MissingInput(dir.display().to_string()));
        }
        // Event paths are reported under the watched path; keep scan paths
        // in the same form.
        let root = fs::canonicalize(dir)?;
        let dir = root.as_path();

        // Watch before scanning so nothing lands in between unseen.
        let (tx, rx) = mpsc::channel();
        let mut watcher = notify::recommended_watcher(tx)?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;

        let existing = scan_existing(dir, &formats)?;
        info!(dir = %dir.display(), existing = existing.len(), "Reporting files already present");
        for path in &existing {
            callback(path, SourceTag::Local);
        }
        let arrivals = Arrivals::after_scan(existing);

        let stopped = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stopped);
        let thread = thread::Builder::new()
            .name("stockpile-observer".into())
            .spawn(move || observe(rx, &flag, arrivals, formats, settle, callback))?;

        info!(dir = %dir.display(), settle_ms = settle.as_millis() as u64, "Watching local folder");
        Ok(Self {
            dir: dir.to_path_buf(),
            watcher: Some(watcher),
            thread: Some(thread),
            stopped,
        })
    }

    /// Stop observing and wait for the observer thread to exit. Files still
    /// settling are not reported.
    pub fn stop(&mut self) {
        if self.watcher.take().is_none() {
            return;
        }
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(dir = %self.dir.display(), "Observer thread panicked");
            }
        }
        info!(dir = %self.dir.display(), "Stopped watching local folder");
    }
}

impl Drop for LocalWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Files waiting to settle, plus the startup scan's results.
#[derive(Debug, Default)]
struct Arrivals {
    settling: HashMap<PathBuf, Instant>,
    /// Reported by the scan; a creation event for one of these was queued
    /// before the scan ran and is ignored once.
    scanned: HashSet<PathBuf>,
}

impl Arrivals {
    fn after_scan(scanned: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            settling: HashMap::new(),
            scanned: scanned.into_iter().collect(),
        }
    }

    /// How long the observer may block before something is due.
    fn wait(&self) -> Duration {
        self.settling
            .values()
            .min()
            .map(|due| due.saturating_duration_since(Instant::now()))
            .map_or(TICK, |wait| wait.min(TICK))
    }

    fn note(&mut self, event: Event, formats: &SupportedFormats, settle: Duration) {
        let deadline = Instant::now() + settle;
        let arrived: Vec<PathBuf> = match event.kind {
            EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event.paths,
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                event.paths.into_iter().last().into_iter().collect()
            }
            EventKind::Modify(_) => {
                // Still being written: push the deadline out.
                for path in &event.paths {
                    if let Some(due) = self.settling.get_mut(path) {
                        *due = deadline;
                    }
                }
                return;
            }
            EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                // A later arrival at the same path is new.
                for path in &event.paths {
                    self.scanned.remove(path);
                    self.settling.remove(path);
                }
                return;
            }
            _ => return,
        };

        for path in arrived {
            if !formats.is_supported(&path) {
                continue;
            }
            if self.scanned.remove(&path) {
                debug!(path = %path.display(), "Already reported by the startup scan");
                continue;
            }
            debug!(path = %path.display(), "Arrival noticed; settling");
            self.settling.insert(path, deadline);
        }
    }

    /// Remove and return every path whose settle period has passed.
    fn take_due(&mut self, now: Instant) -> Vec<PathBuf> {
        let due: Vec<PathBuf> = self
            .settling
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();
        for path in &due {
            self.settling.remove(path);
        }
        due
    }
}

fn observe(
    rx: Receiver<notify::Result<Event>>,
    stopped: &AtomicBool,
    mut arrivals: Arrivals,
    formats: SupportedFormats,
    settle: Duration,
    callback: DetectionCallback,
) {
    while !stopped.load(Ordering::SeqCst) {
        match rx.recv_timeout(arrivals.wait()) {
            Ok(Ok(event)) => arrivals.note(event, &formats, settle),
            Ok(Err(e)) => warn!(error = %e, "Filesystem observer error"),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        for path in arrivals.take_due(Instant::now()) {
            if path.is_file() {
                info!(path = %path.display(), "New file detected");
                callback(&path, SourceTag::Local);
            } else {
                debug!(path = %path.display(), "File vanished before settling");
            }
        }
    }

    debug!(pending = arrivals.settling.len(), "Observer thread exiting");
}
