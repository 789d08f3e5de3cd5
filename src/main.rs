use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use stockpile::app;
use stockpile::config::StockpileConfig;
use stockpile::pipeline::{RunOutcome, SourceTag};
use stockpile::store::LibSqlJobStore;

#[derive(Parser)]
#[command(name = "stockpile", version, about = "Turns talking-head media into B-roll projects")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Watch the configured input folders (default).
    Start,
    /// Process one file and exit.
    Process {
        file: PathBuf,
        #[arg(long, value_enum, default_value_t = Source::Local)]
        source: Source,
    },
    /// Validate the configuration and show what would run.
    Check,
    /// Show unfinished runs, recent runs and per-stage counts from the job history.
    Status {
        /// How many recent runs to list.
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Source {
    Local,
    Remote,
}

impl From<Source> for SourceTag {
    fn from(source: Source) -> Self {
        match source {
            Source::Local => SourceTag::Local,
            Source::Remote => SourceTag::Remote,
        }
    }
}

fn main() -> ExitCode {
    // Install rustls crypto provider before any TLS usage
    let _ = rustls::crypto::ring::default_provider().install_default();

    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = match StockpileConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let _log_guard = init_tracing(config.log_file.as_deref());

    match run(cli, config) {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Stockpile stopped with an error");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Console logging, plus a file log when one is configured. The returned
/// guard flushes the file writer and must outlive every log call.
fn init_tracing(log_file: Option<&Path>) -> Option<WorkerGuard> {
    let mut guard = None;
    let file_layer = log_file.and_then(|path| {
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        let name = path.file_name()?;
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("Warning: failed to create log directory {}: {}", dir.display(), e);
            return None;
        }
        let (writer, g) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
        guard = Some(g);
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(env_filter()),
        )
    });

    tracing_subscriber::registry()
        .with(file_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_filter(env_filter()),
        )
        .init();
    guard
}

fn runtime(config: &StockpileConfig) -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .max_blocking_threads(config.worker_threads.max(1))
        .build()
        .context("failed to start the async runtime")
}

fn run(cli: Cli, config: StockpileConfig) -> anyhow::Result<ExitCode> {
    let command = cli.command.unwrap_or(Command::Start);

    if let Command::Check = command {
        let collaborators = app::build_collaborators(&config)?;
        print!("{}", app::describe(&config, &collaborators));
        return Ok(match config.validate() {
            Ok(()) => {
                println!("\nConfiguration OK");
                ExitCode::SUCCESS
            }
            Err(e) => {
                println!("\n{e}");
                ExitCode::FAILURE
            }
        });
    }

    if let Command::Status { limit } = command {
        if !config.database_path.exists() {
            println!("No job history at {}", config.database_path.display());
            return Ok(ExitCode::SUCCESS);
        }
        let report = runtime(&config)?.block_on(async {
            let store = LibSqlJobStore::new_local(&config.database_path).await?;
            app::status_report(&store, limit).await
        })?;
        print!("{report}");
        return Ok(ExitCode::SUCCESS);
    }

    // Built and dropped outside the runtime.
    let collaborators = app::build_collaborators(&config)?;
    let runtime = runtime(&config)?;

    match command {
        Command::Process { file, source } => {
            config.validate_single()?;
            let run = runtime.block_on(async {
                let store = app::open_job_store(&config).await?;
                app::process_single(
                    &config,
                    collaborators.clone().with_store(store),
                    &file,
                    source.into(),
                )
                .await
            })?;
            drop(runtime);

            let summary = run.summary();
            println!("Run {} {}", summary.run_id, summary.outcome);
            println!("  input:      {}", summary.input.file_name());
            println!("  took:       {}", summary.elapsed_display());
            println!("  phrases:    {}", summary.phrases_processed);
            println!("  downloads:  {}", summary.files_downloaded);
            if let Some(project) = &summary.project_path {
                println!("  project:    {}", project.display());
            }
            if let Some(remote) = &summary.remote_project {
                println!("  remote:     {remote}");
            }
            if let Some(reason) = &summary.failure_reason {
                println!("  error:      {reason}");
            }

            Ok(if summary.outcome == RunOutcome::Succeeded {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        _ => {
            let stats = runtime.block_on(async {
                let store = app::open_job_store(&config).await?;
                app::run_daemon(&config, collaborators.clone().with_store(store)).await
            })?;
            drop(runtime);
            println!(
                "Processed {} file(s): {} succeeded, {} failed",
                stats.started, stats.succeeded, stats.failed
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}
