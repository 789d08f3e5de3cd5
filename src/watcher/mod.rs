//! File watcher: detects new media inputs and hands them to the scheduler.
//!
//! Two kinds of source:
//! - `local` — a directory observed from a dedicated thread
//! - `remote` — a remote folder polled on an interval from its own task
//!
//! Neither touches pipeline state; detections go out only through the
//! [`DetectionCallback`].

pub mod local;
pub mod remote;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::collaborators::RemoteStorage;
use crate::error::WatcherError;
use crate::pipeline::types::SupportedFormats;
use crate::scheduler::DetectionCallback;

pub use local::LocalWatcher;
pub use remote::RemotePoller;

/// Detection sources and their timing.
#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub local_dir: Option<PathBuf>,
    pub remote_folder: Option<String>,
    pub formats: SupportedFormats,
    /// Wait after a local arrival before re-checking it.
    pub settle: Duration,
    pub poll_interval: Duration,
    pub error_interval: Duration,
    /// Where remote inputs are copied before being reported.
    pub temp_dir: PathBuf,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            local_dir: None,
            remote_folder: None,
            formats: SupportedFormats::default(),
            settle: Duration::from_secs(2),
            poll_interval: Duration::from_secs(30),
            error_interval: Duration::from_secs(60),
            temp_dir: std::env::temp_dir().join("stockpile"),
        }
    }
}

pub struct FileWatcher {
    settings: WatchSettings,
    storage: Arc<dyn RemoteStorage>,
}

impl FileWatcher {
    pub fn new(settings: WatchSettings, storage: Arc<dyn RemoteStorage>) -> Self {
        Self { settings, storage }
    }

    /// Start every configured source. Must be called within a Tokio
    /// runtime when a remote folder is configured.
    pub fn start(self, callback: DetectionCallback) -> Result<WatcherHandle, WatcherError> {
        let local = match &self.settings.local_dir {
            Some(dir) => Some(LocalWatcher::start(
                dir,
                self.settings.formats.clone(),
                self.settings.settle,
                Arc::clone(&callback),
            )?),
            None => None,
        };

        let remote = match &self.settings.remote_folder {
            Some(folder) if self.storage.is_configured() => {
                std::fs::create_dir_all(&self.settings.temp_dir)?;
                let poller = Arc::new(RemotePoller::new(
                    Arc::clone(&self.storage),
                    folder.clone(),
                    self.settings.temp_dir.clone(),
                    self.settings.formats.clone(),
                    callback,
                ));
                let (stop_tx, stop_rx) = watch::channel(false);
                let task = tokio::spawn(remote::poll_loop(
                    poller,
                    self.settings.poll_interval,
                    self.settings.error_interval,
                    stop_rx,
                ));
                Some(RemoteTask { task, stop_tx })
            }
            Some(folder) => {
                warn!(folder = %folder, "Remote input folder set but no remote storage configured");
                None
            }
            None => None,
        };

        Ok(WatcherHandle { local, remote })
    }
}

struct RemoteTask {
    task: JoinHandle<()>,
    stop_tx: watch::Sender<bool>,
}

/// Running watchers; stop them to end intake.
pub struct WatcherHandle {
    local: Option<LocalWatcher>,
    remote: Option<RemoteTask>,
}

impl WatcherHandle {
    pub fn is_idle(&self) -> bool {
        self.local.is_none() && self.remote.is_none()
    }

    pub async fn stop(mut self) {
        if let Some(mut local) = self.local.take() {
            // Joins the observer thread.
            let _ = tokio::task::spawn_blocking(move || local.stop()).await;
        }
        if let Some(remote) = self.remote.take() {
            let _ = remote.stop_tx.send(true);
            if let Err(e) = remote.task.await {
                warn!(error = %e, "Remote poller ended abnormally");
            }
        }
        info!("File watchers stopped");
    }
}
