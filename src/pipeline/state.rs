//! Pipeline run state machine.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::pipeline::types::{InputUnit, RunOutcome, RunSummary};

/// Stage of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    /// Admitted and waiting for a worker permit.
    Queued,
    /// The input is being turned into text.
    Transcribing,
    /// Search phrases are being pulled out of the transcript.
    ExtractingPhrases,
    /// Creating the project folder, plus its remote mirror.
    Layout,
    /// Searching and ranking candidates for the current phrase.
    Searching,
    /// Fetching the ranked candidates for the current phrase.
    Downloading,
    /// Cleanup is done; the summary is going out.
    Notifying,
    /// Finished; every phrase was handled.
    Completed,
    /// A prerequisite stage failed and the run stopped.
    Failed,
}

impl RunStage {
    /// Check if this stage allows transitioning to another stage.
    pub fn can_transition_to(&self, target: RunStage) -> bool {
        use RunStage::*;

        if target == Failed {
            return !self.is_terminal();
        }

        matches!(
            (self, target),
            (Queued, Transcribing)
                | (Transcribing, ExtractingPhrases)
                | (ExtractingPhrases, Layout)
                | (Layout, Searching)
                | (Layout, Notifying)
                // Next phrase, with or without downloads for the previous one
                | (Searching, Searching)
                | (Searching, Downloading)
                | (Downloading, Searching)
                | (Searching, Notifying)
                | (Downloading, Notifying)
                | (Notifying, Completed)
        )
    }

    /// Check if this is a terminal stage.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Transcribing => "transcribing",
            Self::ExtractingPhrases => "extracting_phrases",
            Self::Layout => "layout",
            Self::Searching => "searching",
            Self::Downloading => "downloading",
            Self::Notifying => "notifying",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A stage transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTransition {
    pub from: RunStage,
    pub to: RunStage,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Files downloaded for one phrase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhraseDownloads {
    pub phrase: String,
    pub folder: Option<PathBuf>,
    pub remote_folder: Option<String>,
    pub files: Vec<PathBuf>,
}

/// One pipeline run: ephemeral, owned by the task that executes it.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub input: InputUnit,
    pub stage: RunStage,
    pub started_at: DateTime<Utc>,
    started: Instant,
    finished: Option<Instant>,
    pub transcript: Option<String>,
    pub phrases: Vec<String>,
    /// Per-phrase results, in phrase order.
    pub downloads: Vec<PhraseDownloads>,
    pub phrases_processed: usize,
    pub project_dir: Option<PathBuf>,
    pub remote_project: Option<String>,
    pub remote_project_link: Option<String>,
    /// Remote phrase folders keyed by sanitized folder name.
    pub remote_phrase_folders: BTreeMap<String, String>,
    pub outcome: Option<RunOutcome>,
    pub failure_reason: Option<String>,
    pub transitions: Vec<StageTransition>,
}

impl PipelineRun {
    pub fn new(input: InputUnit) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            input,
            stage: RunStage::Queued,
            started_at: Utc::now(),
            started: Instant::now(),
            finished: None,
            transcript: None,
            phrases: Vec::new(),
            downloads: Vec::new(),
            phrases_processed: 0,
            project_dir: None,
            remote_project: None,
            remote_project_link: None,
            remote_phrase_folders: BTreeMap::new(),
            outcome: None,
            failure_reason: None,
            transitions: Vec::new(),
        }
    }

    /// Transition to a new stage.
    pub fn transition_to(
        &mut self,
        next: RunStage,
        reason: Option<String>,
    ) -> Result<(), PipelineError> {
        if !self.stage.can_transition_to(next) {
            return Err(PipelineError::InvalidTransition {
                from: self.stage,
                to: next,
            });
        }

        self.transitions.push(StageTransition {
            from: self.stage,
            to: next,
            timestamp: Utc::now(),
            reason,
        });
        self.stage = next;

        match next {
            RunStage::Completed => {
                self.outcome = Some(RunOutcome::Succeeded);
                self.finished = Some(Instant::now());
            }
            RunStage::Failed => {
                self.outcome = Some(RunOutcome::Failed);
                self.finished = Some(Instant::now());
            }
            _ => {}
        }

        Ok(())
    }

    /// Fail the run from whatever non-terminal stage it is in.
    pub fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.stage.is_terminal() {
            return;
        }
        self.failure_reason = Some(reason.clone());
        // Failed is reachable from every non-terminal stage.
        let _ = self.transition_to(RunStage::Failed, Some(reason));
    }

    /// Wall time since start, frozen once the run is terminal.
    pub fn elapsed(&self) -> Duration {
        self.finished
            .unwrap_or_else(Instant::now)
            .duration_since(self.started)
    }

    pub fn files_downloaded(&self) -> usize {
        self.downloads.iter().map(|d| d.files.len()).sum()
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    /// Build the summary handed to the notifier.
    ///
    /// A run that is not yet terminal reports as succeeded, which is what
    /// the notifying stage sends.
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id,
            input: self.input.clone(),
            outcome: self.outcome.unwrap_or(RunOutcome::Succeeded),
            elapsed: self.elapsed(),
            phrases_processed: self.phrases_processed,
            files_downloaded: self.files_downloaded(),
            project_path: self.project_dir.clone(),
            remote_project: self
                .remote_project_link
                .clone()
                .or_else(|| self.remote_project.clone()),
            failure_reason: self.failure_reason.clone(),
            finished_at: Utc::now(),
        }
    }
}
