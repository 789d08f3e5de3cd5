//! Wiring: turns a [`StockpileConfig`] into collaborators, an orchestrator
//! and (for the service) watchers plus a run dispatcher.

use std::fmt::Write as _;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use secrecy::ExposeSecret;
use tracing::{error, info, warn};

use crate::admission::AdmissionGuard;
use crate::collaborators::gemini::GeminiClient;
use crate::collaborators::mounted::MountedStorage;
use crate::collaborators::smtp::SmtpNotifier;
use crate::collaborators::whisper::WhisperCli;
use crate::collaborators::ytdlp::YtDlp;
use crate::collaborators::{Collaborators, Unconfigured};
use crate::config::StockpileConfig;
use crate::error::{ConfigError, Result, SchedulerError};
use crate::pipeline::{InputUnit, PipelineOrchestrator, PipelineRun, SourceTag};
use crate::scheduler::{self, DispatchStats, RunDispatcher};
use crate::store::{JobRecord, JobStore, LibSqlJobStore};
use crate::watcher::FileWatcher;

/// Build every collaborator the configuration enables. Roles left
/// unconfigured fall back to the null implementation.
///
/// Call this outside the async runtime: the HTTP client is blocking.
pub fn build_collaborators(config: &StockpileConfig) -> Result<Collaborators> {
    let ytdlp = Arc::new(YtDlp::new(&config.ytdlp_program, config.max_search_results));
    let mut collaborators = Collaborators::unconfigured()
        .with_transcriber(Arc::new(WhisperCli::new(
            &config.whisper_program,
            &config.whisper_model,
            config.temp_dir.clone(),
        )))
        .with_searcher(ytdlp.clone())
        .with_downloader(ytdlp);

    match &config.gemini_api_key {
        Some(key) if !key.expose_secret().is_empty() => {
            let gemini = Arc::new(GeminiClient::new(key.clone(), &config.gemini_model)?);
            collaborators = collaborators
                .with_extractor(gemini.clone())
                .with_evaluator(gemini);
        }
        _ => warn!("GEMINI_API_KEY not set; no phrases will be extracted"),
    }

    if let Some(root) = &config.remote_storage_root {
        collaborators = collaborators.with_storage(Arc::new(MountedStorage::new(root)?));
    }

    match config.smtp_settings() {
        Some(settings) => {
            collaborators = collaborators.with_notifier(Arc::new(SmtpNotifier::new(settings)));
        }
        None if config.notifications_enabled => {
            warn!("Notifications enabled but SMTP is not fully configured; skipping them");
        }
        None => {}
    }

    Ok(collaborators)
}

/// Human-readable view of the effective configuration, for `check`.
pub fn describe(config: &StockpileConfig, collaborators: &Collaborators) -> String {
    let mut out = String::new();
    let or_none = |v: Option<String>| v.unwrap_or_else(|| "(none)".to_string());

    let _ = writeln!(out, "Inputs");
    let _ = writeln!(
        out,
        "  local folder:   {}",
        or_none(config.local_input_folder.as_ref().map(|p| p.display().to_string()))
    );
    let _ = writeln!(out, "  remote folder:  {}", or_none(config.remote_input_folder.clone()));
    let _ = writeln!(out, "Outputs");
    let _ = writeln!(out, "  local base:     {}", config.output_folder.display());
    let _ = writeln!(out, "  remote parent:  {}", or_none(config.remote_output_folder.clone()));
    let _ = writeln!(out, "Collaborators");
    let _ = writeln!(
        out,
        "  transcriber:    {} (model {})",
        config.whisper_program, config.whisper_model
    );
    let _ = writeln!(out, "  search/download: {}", config.ytdlp_program);
    let _ = writeln!(
        out,
        "  phrases/ranking: {}",
        if config.gemini_api_key.is_some() {
            config.gemini_model.as_str()
        } else {
            "unconfigured"
        }
    );
    let _ = writeln!(
        out,
        "  remote storage: {}",
        if collaborators.storage.is_configured() {
            or_none(config.remote_storage_root.as_ref().map(|p| p.display().to_string()))
        } else {
            "unconfigured".to_string()
        }
    );
    let _ = writeln!(
        out,
        "  notifications:  {}",
        if collaborators.notifier.is_configured() {
            or_none(config.notification_email.clone())
        } else {
            "off".to_string()
        }
    );
    let _ = writeln!(
        out,
        "  job history:    {}",
        if config.job_history_enabled {
            config.database_path.display().to_string()
        } else {
            "off".to_string()
        }
    );
    let _ = writeln!(out, "Limits");
    let _ = writeln!(out, "  concurrent runs: {}", config.max_concurrent_jobs);
    let _ = writeln!(out, "  worker threads:  {}", config.worker_threads);
    let _ = writeln!(out, "  videos/phrase:   {}", config.max_videos_per_phrase);
    let _ = writeln!(
        out,
        "  max duration:    {}s, max size {} MB",
        config.video_duration_limit.as_secs(),
        config.max_download_mb
    );
    out
}

/// Open the job history database, or the null store when history is off.
pub async fn open_job_store(config: &StockpileConfig) -> Result<Arc<dyn JobStore>> {
    if !config.job_history_enabled {
        info!("Job history disabled");
        return Ok(Arc::new(Unconfigured));
    }
    let store = LibSqlJobStore::new_local(&config.database_path).await?;
    Ok(Arc::new(store))
}

// ── Status ──────────────────────────────────────────────────────────

/// Text for `stockpile status`: unfinished runs, the latest `limit` runs
/// and the number of runs per stage.
pub async fn status_report(store: &dyn JobStore, limit: usize) -> Result<String> {
    let active = store.active_jobs().await?;
    let recent = store.recent_jobs(limit).await?;
    let counts = store.job_counts().await?;

    let mut out = String::new();
    let _ = writeln!(out, "Queue");
    if active.is_empty() {
        let _ = writeln!(out, "  no unfinished runs");
    }
    for job in &active {
        let _ = writeln!(
            out,
            "  {:<19} {:<20} {}",
            job.stage.to_string(),
            job.file_name(),
            job.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    let _ = writeln!(out, "Recent jobs");
    if recent.is_empty() {
        let _ = writeln!(out, "  none");
    }
    for job in &recent {
        let _ = writeln!(out, "  {}", recent_line(job));
    }

    let _ = writeln!(out, "Job counts");
    let _ = writeln!(out, "  total: {}", counts.total);
    for (stage, n) in &counts.by_stage {
        let _ = writeln!(out, "  {stage}: {n}");
    }
    Ok(out)
}

fn recent_line(job: &JobRecord) -> String {
    let mut line = format!(
        "{} {:<10} {} phrase(s), {} file(s)",
        job.updated_at.format("%Y-%m-%d %H:%M:%S"),
        job.stage.to_string(),
        job.phrases.len(),
        job.files_downloaded()
    );
    let _ = write!(line, "  {}", job.file_name());
    if let Some(reason) = &job.failure_reason {
        let _ = write!(line, "  ({reason})");
    }
    line
}

fn orchestrator(config: &StockpileConfig, collaborators: Collaborators) -> PipelineOrchestrator {
    PipelineOrchestrator::new(
        collaborators,
        config.output_folder.clone(),
        config.orchestrator_settings(),
    )
}

/// Run one file through admission and the pipeline.
pub async fn process_single(
    config: &StockpileConfig,
    collaborators: Collaborators,
    path: &Path,
    source: SourceTag,
) -> Result<PipelineRun> {
    let orchestrator = orchestrator(config, collaborators);
    let guard = AdmissionGuard::new();
    let input = InputUnit::canonical(path, source);
    let id = input.id();
    let Some(_ticket) = guard.admit(&id) else {
        return Err(SchedulerError::Duplicate(id).into());
    };
    Ok(orchestrator.run(input).await)
}

/// Watch the configured sources and process arrivals until `shutdown`
/// resolves. Intake stops the moment it does; watchers are stopped next and
/// anything they still report is dropped. Runs already started finish.
pub async fn serve<S>(
    config: &StockpileConfig,
    collaborators: Collaborators,
    shutdown: S,
) -> Result<DispatchStats>
where
    S: Future<Output = ()>,
{
    tokio::fs::create_dir_all(&config.output_folder)
        .await
        .map_err(ConfigError::Io)?;

    let storage = Arc::clone(&collaborators.storage);
    let orchestrator = Arc::new(orchestrator(config, collaborators));
    let (scheduler, queue) = scheduler::channel();

    let watchers = FileWatcher::new(config.watch_settings(), storage)
        .start(scheduler.detection_callback())?;
    drop(scheduler);
    if watchers.is_idle() {
        warn!("No input source is being watched");
    }

    let dispatcher = RunDispatcher::new(orchestrator, AdmissionGuard::new(), config.max_concurrent_jobs);
    let draining = dispatcher.accept(queue, shutdown).await;
    info!(started = draining.started(), "Intake stopped; stopping watchers");
    watchers.stop().await;
    Ok(draining.finish().await)
}

/// [`serve`] until Ctrl-C.
pub async fn run_daemon(
    config: &StockpileConfig,
    collaborators: Collaborators,
) -> Result<DispatchStats> {
    config.validate()?;
    info!(
        output = %config.output_folder.display(),
        max_concurrent = config.max_concurrent_jobs,
        "Starting stockpile service"
    );
    serve(config, collaborators, ctrl_c()).await
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => {
            error!(error = %e, "Could not listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
}
