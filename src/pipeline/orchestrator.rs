//! Pipeline orchestrator: drives one input through every stage.
//!
//! A run never returns an error. Failures in transcription, phrase
//! extraction, layout or phrase folder creation fail the run; failures
//! inside the per-phrase loop are logged and scoped to that phrase or
//! candidate. Every collaborator call goes through the retry policy of its
//! call class and runs on the blocking worker pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::collaborators::{
    normalize_phrases, rank_candidates, Collaborators, DownloadRequest, ScoredCandidate,
};
use crate::error::{CollaboratorError, PipelineError};
use crate::pipeline::layout::{sanitize_name, scored_file_stem, ProjectDir, ProjectLayout};
use crate::pipeline::state::{PhraseDownloads, PipelineRun, RunStage};
use crate::store::JobRecord;
use crate::pipeline::types::{InputUnit, SupportedFormats};
use crate::retry::{CallClass, RetryPolicy, RetrySettings};

/// Tunables for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Evaluated candidates kept per phrase.
    pub max_candidates_per_phrase: usize,
    /// Candidates longer than this are skipped; zero disables the check.
    pub max_duration: Duration,
    /// Downloads larger than this are discarded.
    pub max_download_bytes: u64,
    /// Remote parent folder for mirrored projects. Mirroring is on when this
    /// is set and remote storage is configured.
    pub remote_parent: Option<String>,
    /// Create phrase folders (local and remote together) only when the
    /// first candidate for a phrase is about to download.
    pub remote_folders_on_demand: bool,
    pub formats: SupportedFormats,
    pub retry: RetrySettings,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_candidates_per_phrase: 3,
            max_duration: Duration::from_secs(600),
            max_download_bytes: 100 * 1024 * 1024,
            remote_parent: None,
            remote_folders_on_demand: true,
            formats: SupportedFormats::default(),
            retry: RetrySettings::default(),
        }
    }
}

pub struct PipelineOrchestrator {
    collaborators: Collaborators,
    layout: ProjectLayout,
    settings: OrchestratorSettings,
}

impl PipelineOrchestrator {
    pub fn new(
        collaborators: Collaborators,
        output_base: impl Into<PathBuf>,
        settings: OrchestratorSettings,
    ) -> Self {
        let mirroring = settings.remote_parent.is_some() && collaborators.storage.is_configured();
        let layout = ProjectLayout::new(output_base)
            .with_lazy_phrase_folders(mirroring && settings.remote_folders_on_demand);
        Self {
            collaborators,
            layout,
            settings,
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn layout(&self) -> &ProjectLayout {
        &self.layout
    }

    fn policy(&self, class: CallClass) -> &RetryPolicy {
        self.settings.retry.for_class(class)
    }

    fn mirror_parent(&self) -> Option<&str> {
        if self.collaborators.storage.is_configured() {
            self.settings.remote_parent.as_deref()
        } else {
            None
        }
    }

    /// Execute every stage for `input` and return the terminal run.
    pub async fn run(&self, input: InputUnit) -> PipelineRun {
        let mut run = PipelineRun::new(input);
        info!(
            run_id = %run.run_id,
            input = %run.input.path.display(),
            source = %run.input.source,
            "Starting pipeline run"
        );
        self.persist(&run).await;

        match self.execute(&mut run).await {
            Ok(()) => {
                self.notify(&run).await;
                if let Err(e) = run.transition_to(RunStage::Completed, None) {
                    error!(run_id = %run.run_id, error = %e, "Could not complete run");
                    run.fail(e.to_string());
                }
                info!(
                    run_id = %run.run_id,
                    phrases = run.phrases_processed,
                    files = run.files_downloaded(),
                    elapsed = %run.summary().elapsed_display(),
                    "Pipeline run completed"
                );
            }
            Err(e) => {
                error!(
                    run_id = %run.run_id,
                    stage = %run.stage,
                    error = %e,
                    "Pipeline run failed"
                );
                run.fail(e.to_string());
                self.notify(&run).await;
            }
        }

        self.persist(&run).await;
        run
    }

    async fn execute(&self, run: &mut PipelineRun) -> Result<(), PipelineError> {
        self.advance(run, RunStage::Transcribing).await?;
        let transcript = self.transcribe(&run.input).await?;
        run.transcript = Some(transcript.clone());

        self.advance(run, RunStage::ExtractingPhrases).await?;
        run.phrases = self.extract_phrases(run.run_id, transcript).await?;

        self.advance(run, RunStage::Layout).await?;
        let project = self.lay_out(run).await?;

        for phrase in run.phrases.clone() {
            self.advance(run, RunStage::Searching).await?;
            self.process_phrase(run, &project, &phrase).await?;
            run.phrases_processed += 1;
        }

        self.clean_up(run, &project).await;
        self.advance(run, RunStage::Notifying).await?;
        Ok(())
    }

    async fn advance(&self, run: &mut PipelineRun, next: RunStage) -> Result<(), PipelineError> {
        let from = run.stage;
        run.transition_to(next, None)?;
        debug!(run_id = %run.run_id, from = %from, to = %next, "Stage transition");
        self.persist(run).await;
        Ok(())
    }

    /// Write the run's current snapshot and its latest transition to the
    /// job store. Failures are logged only.
    async fn persist(&self, run: &PipelineRun) {
        let store = &self.collaborators.store;
        if !store.is_configured() {
            return;
        }
        if let Err(e) = store.save_job(&JobRecord::from_run(run)).await {
            warn!(run_id = %run.run_id, stage = %run.stage, error = %e, "Failed to save job history");
            return;
        }
        if let Some(transition) = run.transitions.last() {
            if let Err(e) = store.record_transition(run.run_id, transition).await {
                warn!(run_id = %run.run_id, error = %e, "Failed to record stage transition");
            }
        }
    }

    // ── Prerequisite stages ─────────────────────────────────────────

    async fn transcribe(&self, input: &InputUnit) -> Result<String, PipelineError> {
        if !self.settings.formats.is_supported(&input.path) {
            return Err(PipelineError::Transcribe(CollaboratorError::Validation(
                format!("unsupported file format: {}", input.file_name()),
            )));
        }

        let transcriber = Arc::clone(&self.collaborators.transcriber);
        let path = input.path.clone();
        let transcript = self
            .policy(CallClass::Api)
            .run_blocking("transcribe", move || transcriber.transcribe(&path))
            .await
            .map_err(PipelineError::Transcribe)?;

        info!(input = %input.file_name(), chars = transcript.len(), "Transcription finished");
        Ok(transcript)
    }

    async fn extract_phrases(
        &self,
        run_id: Uuid,
        transcript: String,
    ) -> Result<Vec<String>, PipelineError> {
        if transcript.trim().is_empty() {
            warn!(run_id = %run_id, "Empty transcript; no phrases to search");
            return Ok(Vec::new());
        }

        let extractor = Arc::clone(&self.collaborators.extractor);
        let phrases = self
            .policy(CallClass::Api)
            .run_blocking("extract_phrases", move || extractor.extract_phrases(&transcript))
            .await
            .map_err(PipelineError::ExtractPhrases)?;

        let phrases = normalize_phrases(phrases);
        info!(run_id = %run_id, count = phrases.len(), ?phrases, "Extracted search phrases");
        Ok(phrases)
    }

    async fn lay_out(&self, run: &mut PipelineRun) -> Result<ProjectDir, PipelineError> {
        let layout = self.layout.clone();
        let input = run.input.clone();
        let phrases = run.phrases.clone();
        let project = self
            .policy(CallClass::File)
            .run_blocking("create_project", move || {
                layout
                    .create_project(&input, &phrases)
                    .map_err(CollaboratorError::from)
            })
            .await
            .map_err(PipelineError::Layout)?;
        run.project_dir = Some(project.root.clone());

        let Some(parent) = self.mirror_parent() else {
            return Ok(project);
        };

        let storage = Arc::clone(&self.collaborators.storage);
        let name = project.name.clone();
        let parent = parent.to_string();
        let (remote_id, link) = self
            .policy(CallClass::Api)
            .run_blocking("create_remote_project", move || {
                let id = storage.create_folder(&name, &parent)?;
                let link = storage.folder_url(&id);
                Ok((id, link))
            })
            .await
            .map_err(PipelineError::Layout)?;
        info!(run_id = %run.run_id, remote = %remote_id, "Created remote project folder");
        run.remote_project = Some(remote_id);
        run.remote_project_link = link;

        if !self.layout.lazy_phrase_folders() {
            for phrase in run.phrases.clone() {
                self.remote_phrase_folder(run, &phrase)
                    .await
                    .map_err(PipelineError::Layout)?;
            }
        }

        Ok(project)
    }

    /// Remote folder for `phrase`, created on first use.
    async fn remote_phrase_folder(
        &self,
        run: &mut PipelineRun,
        phrase: &str,
    ) -> Result<Option<String>, CollaboratorError> {
        let Some(project_id) = run.remote_project.clone() else {
            return Ok(None);
        };
        let name = sanitize_name(phrase);
        if let Some(id) = run.remote_phrase_folders.get(&name) {
            return Ok(Some(id.clone()));
        }

        let storage = Arc::clone(&self.collaborators.storage);
        let folder_name = name.clone();
        let id = self
            .policy(CallClass::Api)
            .run_blocking("create_remote_folder", move || {
                storage.create_folder(&folder_name, &project_id)
            })
            .await?;
        run.remote_phrase_folders.insert(name, id.clone());
        Ok(Some(id))
    }

    // ── Per-phrase loop ─────────────────────────────────────────────

    async fn process_phrase(
        &self,
        run: &mut PipelineRun,
        project: &ProjectDir,
        phrase: &str,
    ) -> Result<(), PipelineError> {
        let mut entry = PhraseDownloads {
            phrase: phrase.to_string(),
            ..Default::default()
        };

        let ranked = self.find_candidates(run.run_id, phrase).await;
        if ranked.is_empty() {
            info!(run_id = %run.run_id, phrase, "No usable candidates; skipping downloads");
            run.downloads.push(entry);
            return Ok(());
        }

        let folder = self.phrase_folder(run, project, phrase).await?;
        entry.folder = Some(folder.clone());
        entry.remote_folder = run.remote_phrase_folders.get(&sanitize_name(phrase)).cloned();

        self.advance(run, RunStage::Downloading).await?;
        for candidate in ranked {
            let id = candidate.candidate.id.clone();
            let request = DownloadRequest {
                file_stem: scored_file_stem(candidate.score, &candidate.candidate.title),
                candidate,
                target_dir: folder.clone(),
                max_bytes: self.settings.max_download_bytes,
            };
            match self.download(request).await {
                Ok(path) => {
                    info!(run_id = %run.run_id, phrase, file = %path.display(), "Downloaded candidate");
                    if let Some(remote) = &entry.remote_folder {
                        self.mirror(&path, remote).await;
                    }
                    entry.files.push(path);
                }
                Err(e) => warn!(
                    run_id = %run.run_id,
                    phrase,
                    candidate = %id,
                    kind = e.kind(),
                    error = %e,
                    "Candidate download failed; skipping"
                ),
            }
        }

        run.downloads.push(entry);
        Ok(())
    }

    /// Search, evaluate and rank. Failures here are scoped to the phrase.
    async fn find_candidates(&self, run_id: Uuid, phrase: &str) -> Vec<ScoredCandidate> {
        if phrase.trim().is_empty() {
            return Vec::new();
        }

        let searcher = Arc::clone(&self.collaborators.searcher);
        let query = phrase.to_string();
        let candidates = match self
            .policy(CallClass::Api)
            .run_blocking("search", move || searcher.search(&query))
            .await
        {
            Ok(c) => c,
            Err(e) => {
                warn!(run_id = %run_id, phrase, error = %e, "Search failed; skipping phrase");
                return Vec::new();
            }
        };
        if candidates.is_empty() {
            return Vec::new();
        }

        let evaluator = Arc::clone(&self.collaborators.evaluator);
        let query = phrase.to_string();
        let pool = candidates.clone();
        let evaluations = match self
            .policy(CallClass::Api)
            .run_blocking("evaluate", move || evaluator.evaluate(&query, &pool))
            .await
        {
            Ok(e) => e,
            Err(e) => {
                warn!(run_id = %run_id, phrase, error = %e, "Evaluation failed; skipping phrase");
                return Vec::new();
            }
        };

        let ranked = rank_candidates(
            &candidates,
            &evaluations,
            self.settings.max_candidates_per_phrase,
        );
        debug!(
            run_id = %run_id,
            phrase,
            searched = candidates.len(),
            kept = ranked.len(),
            "Ranked candidates"
        );
        ranked
    }

    /// Local folder for `phrase`, paired with its remote folder when
    /// mirroring. Errors here escape the phrase boundary and fail the run.
    async fn phrase_folder(
        &self,
        run: &mut PipelineRun,
        project: &ProjectDir,
        phrase: &str,
    ) -> Result<PathBuf, PipelineError> {
        let folder_error = |source: CollaboratorError| PipelineError::PhraseFolder {
            phrase: phrase.to_string(),
            source,
        };

        let dir = project.clone();
        let name = phrase.to_string();
        let folder = self
            .policy(CallClass::File)
            .run_blocking("create_phrase_folder", move || {
                dir.ensure_phrase_dir(&name).map_err(CollaboratorError::from)
            })
            .await
            .map_err(folder_error)?;

        self.remote_phrase_folder(run, phrase)
            .await
            .map_err(folder_error)?;
        Ok(folder)
    }

    async fn download(&self, request: DownloadRequest) -> Result<PathBuf, CollaboratorError> {
        let candidate = &request.candidate.candidate;
        let max_duration = self.settings.max_duration;
        if !max_duration.is_zero() && candidate.duration() > max_duration {
            return Err(CollaboratorError::Validation(format!(
                "{} runs {}s, over the {}s limit",
                candidate.id,
                candidate.duration_secs,
                max_duration.as_secs()
            )));
        }

        let downloader = Arc::clone(&self.collaborators.downloader);
        let max_bytes = request.max_bytes;
        let path = self
            .policy(CallClass::Download)
            .run_blocking("download", move || downloader.download(&request))
            .await?;

        let size = tokio::fs::metadata(&path).await?.len();
        if size > max_bytes {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(file = %path.display(), error = %e, "Could not remove oversized download");
            }
            return Err(CollaboratorError::Validation(format!(
                "{} is {size} bytes, over the {max_bytes} byte limit",
                path.display()
            )));
        }
        Ok(path)
    }

    /// Best-effort upload of one downloaded file.
    async fn mirror(&self, path: &Path, remote_folder: &str) {
        let storage = Arc::clone(&self.collaborators.storage);
        let file = path.to_path_buf();
        let folder = remote_folder.to_string();
        match self
            .policy(CallClass::Api)
            .run_blocking("upload", move || storage.upload_file(&file, &folder))
            .await
        {
            Ok(()) => debug!(file = %path.display(), folder = %remote_folder, "Mirrored file"),
            Err(e) => warn!(
                file = %path.display(),
                folder = %remote_folder,
                error = %e,
                "Upload failed; file kept locally"
            ),
        }
    }

    // ── Wrap-up ─────────────────────────────────────────────────────

    async fn clean_up(&self, run: &PipelineRun, project: &ProjectDir) {
        let dir = project.clone();
        let run_id = run.run_id;
        let input = run.input.clone();
        let downloads = run.downloads.clone();

        let result = tokio::task::spawn_blocking(move || {
            let partials = dir.remove_partial_downloads();
            let removed = dir.remove_empty_subfolders();
            let summary = dir.write_summary(run_id, &input, &downloads);
            (partials, removed, summary)
        })
        .await;

        match result {
            Ok((partials, removed, summary)) => {
                debug!(
                    run_id = %run_id,
                    partials,
                    empty_folders = removed.len(),
                    "Cleaned up project directory"
                );
                if let Err(e) = summary {
                    warn!(run_id = %run_id, error = %e, "Could not write project summary");
                }
            }
            Err(e) => warn!(run_id = %run_id, error = %e, "Project cleanup task failed"),
        }
    }

    /// Hand the run summary to the notifier. Never changes the outcome.
    async fn notify(&self, run: &PipelineRun) {
        let notifier = Arc::clone(&self.collaborators.notifier);
        if !notifier.is_configured() {
            debug!(run_id = %run.run_id, "No notifier configured");
            return;
        }

        let summary = run.summary();
        match self
            .policy(CallClass::Api)
            .run_blocking("notify", move || notifier.notify(&summary))
            .await
        {
            Ok(()) => info!(run_id = %run.run_id, outcome = %run.summary().outcome, "Notification sent"),
            Err(e) => error!(run_id = %run.run_id, error = %e, "Notification failed"),
        }
    }
}
