//! Job history: a record of every run and the stages it went through.
//!
//! The orchestrator writes through [`JobStore`] after each stage
//! transition and once more when the run ends; `stockpile status` reads it
//! back. History is informational only: a failed write is logged and never
//! changes a run's outcome, and nothing is resumed from it on startup.

pub mod libsql_backend;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::collaborators::Unconfigured;
use crate::error::StoreError;
use crate::pipeline::state::{PipelineRun, RunStage, StageTransition};
use crate::pipeline::types::SourceTag;

pub use libsql_backend::LibSqlJobStore;

/// Persisted view of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub run_id: Uuid,
    pub input_path: PathBuf,
    pub source: SourceTag,
    pub stage: RunStage,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub transcript: Option<String>,
    pub phrases: Vec<String>,
    /// Downloaded files keyed by phrase; phrases without files are left out.
    pub downloads: BTreeMap<String, Vec<PathBuf>>,
    pub project_path: Option<PathBuf>,
    pub failure_reason: Option<String>,
    /// Link (or id) of the mirrored remote project.
    pub remote_url: Option<String>,
}

impl JobRecord {
    /// Snapshot `run` as it stands now.
    pub fn from_run(run: &PipelineRun) -> Self {
        let downloads = run
            .downloads
            .iter()
            .filter(|d| !d.files.is_empty())
            .map(|d| (d.phrase.clone(), d.files.clone()))
            .collect();
        Self {
            run_id: run.run_id,
            input_path: run.input.path.clone(),
            source: run.input.source,
            stage: run.stage,
            created_at: run.started_at,
            updated_at: Utc::now(),
            transcript: run.transcript.clone(),
            phrases: run.phrases.clone(),
            downloads,
            project_path: run.project_dir.clone(),
            failure_reason: run.failure_reason.clone(),
            remote_url: run
                .remote_project_link
                .clone()
                .or_else(|| run.remote_project.clone()),
        }
    }

    pub fn file_name(&self) -> String {
        self.input_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.input_path.display().to_string())
    }

    pub fn files_downloaded(&self) -> usize {
        self.downloads.values().map(Vec::len).sum()
    }
}

/// Number of jobs per stage, plus the total.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub by_stage: BTreeMap<String, u64>,
    pub total: u64,
}

impl JobCounts {
    pub fn get(&self, stage: RunStage) -> u64 {
        self.by_stage.get(&stage.to_string()).copied().unwrap_or(0)
    }
}

/// Where run history is kept.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Whether history is actually being kept.
    fn is_configured(&self) -> bool {
        true
    }

    /// Insert or replace the record for a run.
    async fn save_job(&self, job: &JobRecord) -> Result<(), StoreError>;

    /// Append one stage transition to a run's history.
    async fn record_transition(
        &self,
        run_id: Uuid,
        transition: &StageTransition,
    ) -> Result<(), StoreError>;

    async fn get_job(&self, run_id: Uuid) -> Result<Option<JobRecord>, StoreError>;

    /// Transitions of one run, oldest first.
    async fn transitions(&self, run_id: Uuid) -> Result<Vec<StageTransition>, StoreError>;

    /// Runs that have not reached a terminal stage, oldest first.
    async fn active_jobs(&self) -> Result<Vec<JobRecord>, StoreError>;

    /// Most recently updated runs first.
    async fn recent_jobs(&self, limit: usize) -> Result<Vec<JobRecord>, StoreError>;

    async fn job_counts(&self) -> Result<JobCounts, StoreError>;
}

/// No history: writes are dropped and reads come back empty.
#[async_trait]
impl JobStore for Unconfigured {
    fn is_configured(&self) -> bool {
        false
    }

    async fn save_job(&self, _job: &JobRecord) -> Result<(), StoreError> {
        Ok(())
    }

    async fn record_transition(
        &self,
        _run_id: Uuid,
        _transition: &StageTransition,
    ) -> Result<(), StoreError> {
        Ok(())
    }

    async fn get_job(&self, _run_id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        Ok(None)
    }

    async fn transitions(&self, _run_id: Uuid) -> Result<Vec<StageTransition>, StoreError> {
        Ok(Vec::new())
    }

    async fn active_jobs(&self) -> Result<Vec<JobRecord>, StoreError> {
        Ok(Vec::new())
    }

    async fn recent_jobs(&self, _limit: usize) -> Result<Vec<JobRecord>, StoreError> {
        Ok(Vec::new())
    }

    async fn job_counts(&self) -> Result<JobCounts, StoreError> {
        Ok(JobCounts::default())
    }
}
