//! External collaborator contracts.
//!
//! Each role is a narrow synchronous trait. The orchestrator never calls
//! these on the scheduler thread; calls go through
//! [`RetryPolicy::run_blocking`](crate::retry::RetryPolicy::run_blocking).
//! [`Unconfigured`] stands in for any role that has no implementation.
//!
//! Adapters:
//! - `whisper` — transcription via the whisper CLI
//! - `ytdlp` — search and download via yt-dlp
//! - `gemini` — phrase extraction and candidate evaluation
//! - `smtp` — email notifications via lettre
//! - `mounted` — remote storage backed by a mounted folder

pub mod gemini;
pub mod mounted;
pub mod smtp;
pub mod whisper;
pub mod ytdlp;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::CollaboratorError;
use crate::pipeline::layout::sanitize_name;
use crate::pipeline::types::RunSummary;
use crate::store::JobStore;

/// Maximum number of phrases kept from one transcript.
pub const MAX_PHRASES: usize = 10;

/// Lowest evaluation score that counts as a match.
pub const MIN_SCORE: u8 = 6;

/// Highest evaluation score.
pub const MAX_SCORE: u8 = 10;

// ── Data ────────────────────────────────────────────────────────────

/// A search result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoCandidate {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Duration in seconds; 0 when unknown.
    #[serde(default)]
    pub duration_secs: u64,
    pub url: String,
}

impl VideoCandidate {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }
}

/// Evaluation verdict for one candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: String,
    pub score: u8,
}

/// A candidate joined with its score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoredCandidate {
    pub candidate: VideoCandidate,
    pub score: u8,
}

/// Everything a downloader needs to place one candidate.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub candidate: ScoredCandidate,
    pub target_dir: PathBuf,
    /// File name without extension; the downloader picks the extension.
    pub file_stem: String,
    pub max_bytes: u64,
}

/// A file in a remote folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
    pub mime_type: Option<String>,
}

// ── Roles ───────────────────────────────────────────────────────────

pub trait Transcriber: Send + Sync {
    fn transcribe(&self, path: &Path) -> Result<String, CollaboratorError>;
}

pub trait PhraseExtractor: Send + Sync {
    fn extract_phrases(&self, transcript: &str) -> Result<Vec<String>, CollaboratorError>;
}

pub trait VideoSearcher: Send + Sync {
    fn search(&self, phrase: &str) -> Result<Vec<VideoCandidate>, CollaboratorError>;
}

pub trait CandidateEvaluator: Send + Sync {
    /// Ranked subset of `candidates`, best first.
    fn evaluate(
        &self,
        phrase: &str,
        candidates: &[VideoCandidate],
    ) -> Result<Vec<Evaluation>, CollaboratorError>;
}

pub trait Downloader: Send + Sync {
    /// Download one candidate, returning the local file path.
    fn download(&self, request: &DownloadRequest) -> Result<PathBuf, CollaboratorError>;
}

pub trait RemoteStorage: Send + Sync {
    /// Whether this storage is backed by a real remote.
    fn is_configured(&self) -> bool {
        true
    }

    fn create_folder(&self, name: &str, parent: &str) -> Result<String, CollaboratorError>;

    fn upload_file(&self, path: &Path, folder_id: &str) -> Result<(), CollaboratorError>;

    fn list_files(&self, folder_id: &str) -> Result<Vec<RemoteFile>, CollaboratorError>;

    /// Copy a remote file into `dest_dir`, returning the local path.
    fn fetch_file(&self, file: &RemoteFile, dest_dir: &Path) -> Result<PathBuf, CollaboratorError>;

    /// Human-facing location of a folder, if the remote has one.
    fn folder_url(&self, _folder_id: &str) -> Option<String> {
        None
    }
}

pub trait Notifier: Send + Sync {
    fn is_configured(&self) -> bool {
        true
    }

    fn notify(&self, summary: &RunSummary) -> Result<(), CollaboratorError>;
}

// ── Null implementation ─────────────────────────────────────────────

/// Stand-in for any collaborator that is not configured.
///
/// Lookups come back empty, so a run through it completes with nothing
/// downloaded. Writes to remote storage and downloads are rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unconfigured;

impl Transcriber for Unconfigured {
    fn transcribe(&self, path: &Path) -> Result<String, CollaboratorError> {
        warn!(path = %path.display(), "No transcriber configured; using empty transcript");
        Ok(String::new())
    }
}

impl PhraseExtractor for Unconfigured {
    fn extract_phrases(&self, _transcript: &str) -> Result<Vec<String>, CollaboratorError> {
        warn!("No phrase extractor configured; no phrases extracted");
        Ok(Vec::new())
    }
}

impl VideoSearcher for Unconfigured {
    fn search(&self, phrase: &str) -> Result<Vec<VideoCandidate>, CollaboratorError> {
        debug!(phrase, "No searcher configured");
        Ok(Vec::new())
    }
}

impl CandidateEvaluator for Unconfigured {
    fn evaluate(
        &self,
        phrase: &str,
        _candidates: &[VideoCandidate],
    ) -> Result<Vec<Evaluation>, CollaboratorError> {
        debug!(phrase, "No evaluator configured");
        Ok(Vec::new())
    }
}

impl Downloader for Unconfigured {
    fn download(&self, request: &DownloadRequest) -> Result<PathBuf, CollaboratorError> {
        Err(CollaboratorError::Validation(format!(
            "no downloader configured for {}",
            request.candidate.candidate.url
        )))
    }
}

impl RemoteStorage for Unconfigured {
    fn is_configured(&self) -> bool {
        false
    }

    fn create_folder(&self, name: &str, _parent: &str) -> Result<String, CollaboratorError> {
        Err(CollaboratorError::Validation(format!(
            "no remote storage configured for folder '{name}'"
        )))
    }

    fn upload_file(&self, path: &Path, _folder_id: &str) -> Result<(), CollaboratorError> {
        Err(CollaboratorError::Validation(format!(
            "no remote storage configured for {}",
            path.display()
        )))
    }

    fn list_files(&self, _folder_id: &str) -> Result<Vec<RemoteFile>, CollaboratorError> {
        Ok(Vec::new())
    }

    fn fetch_file(&self, file: &RemoteFile, _dest_dir: &Path) -> Result<PathBuf, CollaboratorError> {
        Err(CollaboratorError::NotFound(format!(
            "no remote storage configured for {}",
            file.name
        )))
    }
}

impl Notifier for Unconfigured {
    fn is_configured(&self) -> bool {
        false
    }

    fn notify(&self, summary: &RunSummary) -> Result<(), CollaboratorError> {
        debug!(run_id = %summary.run_id, outcome = %summary.outcome, "Notifications disabled");
        Ok(())
    }
}

// ── Bundle ──────────────────────────────────────────────────────────

/// The full set of collaborators used by the orchestrator.
#[derive(Clone)]
pub struct Collaborators {
    pub transcriber: Arc<dyn Transcriber>,
    pub extractor: Arc<dyn PhraseExtractor>,
    pub searcher: Arc<dyn VideoSearcher>,
    pub evaluator: Arc<dyn CandidateEvaluator>,
    pub downloader: Arc<dyn Downloader>,
    pub storage: Arc<dyn RemoteStorage>,
    pub notifier: Arc<dyn Notifier>,
    pub store: Arc<dyn JobStore>,
}

impl Collaborators {
    /// Every role filled by [`Unconfigured`].
    pub fn unconfigured() -> Self {
        let null = Arc::new(Unconfigured);
        Self {
            transcriber: null.clone(),
            extractor: null.clone(),
            searcher: null.clone(),
            evaluator: null.clone(),
            downloader: null.clone(),
            storage: null.clone(),
            notifier: null.clone(),
            store: null,
        }
    }

    pub fn with_transcriber(mut self, transcriber: Arc<dyn Transcriber>) -> Self {
        self.transcriber = transcriber;
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn PhraseExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_searcher(mut self, searcher: Arc<dyn VideoSearcher>) -> Self {
        self.searcher = searcher;
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn CandidateEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_downloader(mut self, downloader: Arc<dyn Downloader>) -> Self {
        self.downloader = downloader;
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn RemoteStorage>) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = store;
        self
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("storage_configured", &self.storage.is_configured())
            .field("notifier_configured", &self.notifier.is_configured())
            .field("store_configured", &self.store.is_configured())
            .finish_non_exhaustive()
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Trim, lower-case and de-duplicate phrases, preserving order, dropping
/// empties, capped at [`MAX_PHRASES`].
///
/// Two phrases are duplicates when they map to the same folder name, so
/// every kept phrase owns its own folder.
pub fn normalize_phrases<I, S>(phrases: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    let mut folders: HashSet<String> = HashSet::new();
    for phrase in phrases {
        let clean = phrase.as_ref().trim().to_lowercase();
        if clean.is_empty() {
            continue;
        }
        if !folders.insert(sanitize_name(&clean)) {
            debug!(phrase = %clean, "Phrase shares a folder with an earlier one; dropped");
            continue;
        }
        out.push(clean);
        if out.len() == MAX_PHRASES {
            break;
        }
    }
    out
}

/// Join evaluations with their candidates: unknown ids and out-of-range
/// scores are dropped, the rest sorted by score descending (stable) and
/// truncated to `max`.
pub fn rank_candidates(
    candidates: &[VideoCandidate],
    evaluations: &[Evaluation],
    max: usize,
) -> Vec<ScoredCandidate> {
    let mut ranked: Vec<ScoredCandidate> = Vec::new();
    for evaluation in evaluations {
        if !(MIN_SCORE..=MAX_SCORE).contains(&evaluation.score) {
            continue;
        }
        if ranked.iter().any(|r| r.candidate.id == evaluation.id) {
            continue;
        }
        if let Some(candidate) = candidates.iter().find(|c| c.id == evaluation.id) {
            ranked.push(ScoredCandidate {
                candidate: candidate.clone(),
                score: evaluation.score,
            });
        }
    }
    ranked.sort_by(|a, b| b.score.cmp(&a.score));
    ranked.truncate(max);
    ranked
}
