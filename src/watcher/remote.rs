//! Poll-based detection on a remote folder.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::collaborators::{RemoteFile, RemoteStorage};
use crate::error::CollaboratorError;
use crate::pipeline::types::{SourceTag, SupportedFormats};
use crate::scheduler::DetectionCallback;

/// Compares each listing of a remote folder against the ids seen before
/// and materializes new media files locally before reporting them.
pub struct RemotePoller {
    storage: Arc<dyn RemoteStorage>,
    folder_id: String,
    temp_dir: PathBuf,
    formats: SupportedFormats,
    callback: DetectionCallback,
    /// `None` until the first successful listing.
    known: Mutex<Option<HashSet<String>>>,
}

impl RemotePoller {
    pub fn new(
        storage: Arc<dyn RemoteStorage>,
        folder_id: impl Into<String>,
        temp_dir: PathBuf,
        formats: SupportedFormats,
        callback: DetectionCallback,
    ) -> Self {
        Self {
            storage,
            folder_id: folder_id.into(),
            temp_dir,
            formats,
            callback,
            known: Mutex::new(None),
        }
    }

    /// One poll. The first successful listing only records what is already
    /// there. Returns how many files were reported.
    ///
    /// Blocking; run it on the worker pool.
    pub fn poll_once(&self) -> Result<usize, CollaboratorError> {
        let listing: Vec<RemoteFile> = self
            .storage
            .list_files(&self.folder_id)?
            .into_iter()
            .filter(|f| self.formats.is_supported_remote(&f.name, f.mime_type.as_deref()))
            .collect();

        let mut known = self.known.lock().unwrap_or_else(PoisonError::into_inner);
        if known.is_none() {
            info!(
                folder = %self.folder_id,
                existing = listing.len(),
                "Recorded existing remote files"
            );
            *known = Some(listing.into_iter().map(|f| f.id).collect());
            return Ok(0);
        }
        let seen = known.get_or_insert_with(HashSet::new);

        let fresh: Vec<RemoteFile> = listing
            .into_iter()
            .filter(|f| !seen.contains(&f.id))
            .collect();

        let mut reported = 0;
        for file in fresh {
            let hash = blake3::hash(file.id.as_bytes()).to_hex();
            let dest = self.temp_dir.join(&hash.as_str()[..12]);
            match self.storage.fetch_file(&file, &dest) {
                Ok(path) => {
                    info!(file = %file.name, path = %path.display(), "New remote file detected");
                    seen.insert(file.id.clone());
                    (self.callback)(&path, SourceTag::Remote);
                    reported += 1;
                }
                // Left unknown so the next poll tries again.
                Err(e) => warn!(file = %file.name, error = %e, "Could not fetch remote file"),
            }
        }
        Ok(reported)
    }

    pub fn known_count(&self) -> usize {
        self.known
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, HashSet::len)
    }
}

/// Poll until `stop` flips or its sender is dropped.
pub async fn poll_loop(
    poller: Arc<RemotePoller>,
    interval: Duration,
    error_interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    info!(
        folder = %poller.folder_id,
        interval_secs = interval.as_secs(),
        "Polling remote folder"
    );

    loop {
        let p = Arc::clone(&poller);
        let wait = match tokio::task::spawn_blocking(move || p.poll_once()).await {
            Ok(Ok(reported)) => {
                debug!(reported, known = poller.known_count(), "Remote poll finished");
                interval
            }
            Ok(Err(e)) => {
                warn!(
                    error = %e,
                    retry_in_secs = error_interval.as_secs(),
                    "Remote poll failed"
                );
                error_interval
            }
            Err(e) => {
                error!(error = %e, "Remote poll task crashed");
                error_interval
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = stop.changed() => break,
        }
    }

    info!(folder = %poller.folder_id, "Stopped polling remote folder");
}
