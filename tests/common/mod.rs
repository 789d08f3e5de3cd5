//! Scripted collaborators for integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stockpile::collaborators::mounted::MountedStorage;
use stockpile::collaborators::{
    CandidateEvaluator, Collaborators, DownloadRequest, Downloader, Evaluation, Notifier,
    PhraseExtractor, RemoteFile, RemoteStorage, Transcriber, VideoCandidate, VideoSearcher,
};
use stockpile::error::CollaboratorError;
use stockpile::pipeline::{OrchestratorSettings, RunSummary};
use stockpile::retry::RetrySettings;

pub fn candidate(id: &str) -> VideoCandidate {
    VideoCandidate {
        id: id.to_string(),
        title: format!("Clip {id}"),
        description: format!("Stock footage {id}"),
        duration_secs: 45,
        url: format!("https://www.youtube.com/watch?v={id}"),
    }
}

pub fn evaluation(id: &str, score: u8) -> Evaluation {
    Evaluation {
        id: id.to_string(),
        score,
    }
}

/// Orchestrator settings with near-zero retry delays.
pub fn fast_settings() -> OrchestratorSettings {
    OrchestratorSettings {
        retry: RetrySettings::immediate(),
        ..Default::default()
    }
}

/// Write a media file into `dir` and return its path.
pub fn media_file(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, b"fake media").unwrap();
    path
}

/// Immediate subdirectories of `dir`, sorted.
pub fn subfolders(dir: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(dir)
        .unwrap()
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    dirs
}

// ── Transcriber ─────────────────────────────────────────────────────

pub struct FakeTranscriber {
    transcript: String,
    failures: Mutex<VecDeque<CollaboratorError>>,
    delay: Duration,
    pub calls: AtomicUsize,
}

impl FakeTranscriber {
    pub fn new(transcript: &str) -> Self {
        Self {
            transcript: transcript.to_string(),
            failures: Mutex::new(VecDeque::new()),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Fail the next calls with these errors, in order.
    pub fn failing_first(self, failures: impl IntoIterator<Item = CollaboratorError>) -> Self {
        self.failures.lock().unwrap().extend(failures);
        self
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Transcriber for FakeTranscriber {
    fn transcribe(&self, _path: &Path) -> Result<String, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(self.transcript.clone())
    }
}

// ── Phrases, search, evaluation ─────────────────────────────────────

pub struct FakeExtractor {
    phrases: Vec<String>,
    fail_with: Option<CollaboratorError>,
    pub calls: AtomicUsize,
}

impl FakeExtractor {
    pub fn new(phrases: &[&str]) -> Self {
        Self {
            phrases: phrases.iter().map(|p| p.to_string()).collect(),
            fail_with: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Fail every call with `error`.
    pub fn failing(error: CollaboratorError) -> Self {
        Self {
            fail_with: Some(error),
            ..Self::new(&[])
        }
    }
}

impl PhraseExtractor for FakeExtractor {
    fn extract_phrases(&self, _transcript: &str) -> Result<Vec<String>, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.fail_with {
            return Err(err.clone());
        }
        Ok(self.phrases.clone())
    }
}

/// Returns the scripted candidates for a phrase, nothing for other phrases.
#[derive(Default)]
pub struct FakeSearcher {
    results: HashMap<String, Vec<VideoCandidate>>,
    failures: HashMap<String, CollaboratorError>,
}

impl FakeSearcher {
    pub fn with(mut self, phrase: &str, candidates: Vec<VideoCandidate>) -> Self {
        self.results.insert(phrase.to_string(), candidates);
        self
    }

    pub fn failing_for(mut self, phrase: &str, error: CollaboratorError) -> Self {
        self.failures.insert(phrase.to_string(), error);
        self
    }
}

impl VideoSearcher for FakeSearcher {
    fn search(&self, phrase: &str) -> Result<Vec<VideoCandidate>, CollaboratorError> {
        if let Some(err) = self.failures.get(phrase) {
            return Err(err.clone());
        }
        Ok(self.results.get(phrase).cloned().unwrap_or_default())
    }
}

/// Scores listed candidate ids; unlisted ids are left out.
pub struct FakeEvaluator {
    scores: Vec<Evaluation>,
    failures: HashMap<String, CollaboratorError>,
}

impl FakeEvaluator {
    pub fn new(scores: Vec<Evaluation>) -> Self {
        Self {
            scores,
            failures: HashMap::new(),
        }
    }

    pub fn failing_for(mut self, phrase: &str, error: CollaboratorError) -> Self {
        self.failures.insert(phrase.to_string(), error);
        self
    }
}

impl CandidateEvaluator for FakeEvaluator {
    fn evaluate(
        &self,
        phrase: &str,
        candidates: &[VideoCandidate],
    ) -> Result<Vec<Evaluation>, CollaboratorError> {
        if let Some(err) = self.failures.get(phrase) {
            return Err(err.clone());
        }
        Ok(self
            .scores
            .iter()
            .filter(|e| candidates.iter().any(|c| c.id == e.id))
            .cloned()
            .collect())
    }
}

// ── Downloader ──────────────────────────────────────────────────────

/// Writes `size` bytes to `<target>/<stem>.mp4`, unless the candidate id
/// is scripted to fail.
pub struct FakeDownloader {
    size: usize,
    failures: HashMap<String, CollaboratorError>,
    pub attempts: Mutex<Vec<String>>,
}

impl FakeDownloader {
    pub fn new() -> Self {
        Self {
            size: 64,
            failures: HashMap::new(),
            attempts: Mutex::new(Vec::new()),
        }
    }

    pub fn of_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn failing(mut self, id: &str, error: CollaboratorError) -> Self {
        self.failures.insert(id.to_string(), error);
        self
    }

    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }
}

impl Downloader for FakeDownloader {
    fn download(&self, request: &DownloadRequest) -> Result<PathBuf, CollaboratorError> {
        let id = &request.candidate.candidate.id;
        self.attempts.lock().unwrap().push(id.clone());
        if let Some(err) = self.failures.get(id) {
            return Err(err.clone());
        }
        let path = request.target_dir.join(format!("{}.mp4", request.file_stem));
        fs::write(&path, vec![0u8; self.size])?;
        Ok(path)
    }
}

// ── Notifier ────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<RunSummary>>,
    fail_with: Option<CollaboratorError>,
}

impl RecordingNotifier {
    pub fn failing(error: CollaboratorError) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail_with: Some(error),
        }
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<RunSummary> {
        self.sent.lock().unwrap().last().cloned()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, summary: &RunSummary) -> Result<(), CollaboratorError> {
        self.sent.lock().unwrap().push(summary.clone());
        match &self.fail_with {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

// ── Remote storage ──────────────────────────────────────────────────

type FolderFault = Box<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Mounted storage with scripted faults and delays.
pub struct ScriptedStorage {
    pub inner: MountedStorage,
    hide_first_listing: bool,
    listings: AtomicUsize,
    fetch_delay: Duration,
    fail_create: Option<FolderFault>,
    pub fetches: AtomicUsize,
    pub created: Mutex<Vec<String>>,
}

impl ScriptedStorage {
    pub fn new(root: &Path) -> Self {
        Self {
            inner: MountedStorage::new(root).unwrap(),
            hide_first_listing: false,
            listings: AtomicUsize::new(0),
            fetch_delay: Duration::ZERO,
            fail_create: None,
            fetches: AtomicUsize::new(0),
            created: Mutex::new(Vec::new()),
        }
    }

    /// The first listing comes back empty, so everything already in the
    /// folder looks new on the second poll.
    pub fn hiding_first_listing(mut self) -> Self {
        self.hide_first_listing = true;
        self
    }

    pub fn slow_fetch(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }

    /// Refuse `create_folder(name, parent)` whenever `when` says so.
    pub fn failing_create(mut self, when: impl Fn(&str, &str) -> bool + Send + Sync + 'static) -> Self {
        self.fail_create = Some(Box::new(when));
        self
    }

    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }
}

impl RemoteStorage for ScriptedStorage {
    fn create_folder(&self, name: &str, parent: &str) -> Result<String, CollaboratorError> {
        if self.fail_create.as_ref().is_some_and(|fail| fail(name, parent)) {
            return Err(CollaboratorError::Permission(format!("cannot create {parent}/{name}")));
        }
        let id = self.inner.create_folder(name, parent)?;
        self.created.lock().unwrap().push(id.clone());
        Ok(id)
    }

    fn upload_file(&self, path: &Path, folder_id: &str) -> Result<(), CollaboratorError> {
        self.inner.upload_file(path, folder_id)
    }

    fn list_files(&self, folder_id: &str) -> Result<Vec<RemoteFile>, CollaboratorError> {
        let first = self.listings.fetch_add(1, Ordering::SeqCst) == 0;
        if first && self.hide_first_listing {
            return Ok(Vec::new());
        }
        self.inner.list_files(folder_id)
    }

    fn fetch_file(&self, file: &RemoteFile, dest_dir: &Path) -> Result<PathBuf, CollaboratorError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.fetch_delay.is_zero() {
            std::thread::sleep(self.fetch_delay);
        }
        self.inner.fetch_file(file, dest_dir)
    }

    fn folder_url(&self, folder_id: &str) -> Option<String> {
        self.inner.folder_url(folder_id)
    }
}

// ── Bundle ──────────────────────────────────────────────────────────

/// Every fake, kept so tests can inspect them after a run.
pub struct Fakes {
    pub transcriber: Arc<FakeTranscriber>,
    pub extractor: Arc<FakeExtractor>,
    pub downloader: Arc<FakeDownloader>,
    pub notifier: Arc<RecordingNotifier>,
    pub collaborators: Collaborators,
}

impl Fakes {
    pub fn new(
        transcriber: FakeTranscriber,
        extractor: FakeExtractor,
        searcher: FakeSearcher,
        evaluator: FakeEvaluator,
        downloader: FakeDownloader,
        notifier: RecordingNotifier,
    ) -> Self {
        let transcriber = Arc::new(transcriber);
        let extractor = Arc::new(extractor);
        let downloader = Arc::new(downloader);
        let notifier = Arc::new(notifier);
        let collaborators = Collaborators::unconfigured()
            .with_transcriber(transcriber.clone())
            .with_extractor(extractor.clone())
            .with_searcher(Arc::new(searcher))
            .with_evaluator(Arc::new(evaluator))
            .with_downloader(downloader.clone())
            .with_notifier(notifier.clone());
        Self {
            transcriber,
            extractor,
            downloader,
            notifier,
            collaborators,
        }
    }

    /// Transcript and phrases only; nothing is ever found.
    pub fn phrases_only(transcript: &str, phrases: &[&str]) -> Self {
        Self::new(
            FakeTranscriber::new(transcript),
            FakeExtractor::new(phrases),
            FakeSearcher::default(),
            FakeEvaluator::new(Vec::new()),
            FakeDownloader::new(),
            RecordingNotifier::default(),
        )
    }
}
