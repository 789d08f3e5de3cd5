//! Cross-thread handoff from detection sources to the task scheduler.
//!
//! Watchers run outside the runtime (the filesystem observer has its own
//! thread). They only ever push [`InputUnit`]s into an unbounded channel
//! through [`CrossThreadScheduler`]; the [`RunDispatcher`], running on the
//! scheduler, admits each one and spawns the pipeline task.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::admission::AdmissionGuard;
use crate::error::SchedulerError;
use crate::pipeline::{InputUnit, PipelineOrchestrator, PipelineRun, RunOutcome, SourceTag};

/// Callback handed to watchers: `(path, source)`.
pub type DetectionCallback = Arc<dyn Fn(&Path, SourceTag) + Send + Sync>;

/// Create a connected scheduler handle and detection queue.
pub fn channel() -> (CrossThreadScheduler, DetectionQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CrossThreadScheduler { tx }, DetectionQueue { rx })
}

/// Thread-safe handle for enqueueing detections. Cheap to clone.
#[derive(Debug, Clone)]
pub struct CrossThreadScheduler {
    tx: mpsc::UnboundedSender<InputUnit>,
}

impl CrossThreadScheduler {
    /// Enqueue `input` for the dispatcher. Never runs work inline.
    pub fn schedule(&self, input: InputUnit) -> Result<(), SchedulerError> {
        self.tx.send(input).map_err(|e| {
            let id = e.0.id();
            error!(input = %id, "Task scheduler not running; dropping detected file");
            SchedulerError::Closed(id)
        })
    }

    /// Detection callback that canonicalizes the path and schedules it.
    /// Failures are logged by [`schedule`](Self::schedule).
    pub fn detection_callback(&self) -> DetectionCallback {
        let scheduler = self.clone();
        Arc::new(move |path: &Path, source: SourceTag| {
            let input = InputUnit::canonical(path, source);
            debug!(input = %input.id(), source = %source, "Detected input");
            let _ = scheduler.schedule(input);
        })
    }
}

/// Receiving end, consumed by the dispatcher.
#[derive(Debug)]
pub struct DetectionQueue {
    rx: mpsc::UnboundedReceiver<InputUnit>,
}

/// Counters reported when the dispatcher stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub started: usize,
    pub duplicates: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub crashed: usize,
    pub dropped_on_shutdown: usize,
}

/// Admits detections and runs one pipeline task per admitted input.
pub struct RunDispatcher {
    orchestrator: Arc<PipelineOrchestrator>,
    guard: AdmissionGuard,
    limit: Arc<Semaphore>,
    remove_remote_copies: bool,
}

impl RunDispatcher {
    pub fn new(
        orchestrator: Arc<PipelineOrchestrator>,
        guard: AdmissionGuard,
        max_concurrent: usize,
    ) -> Self {
        Self {
            orchestrator,
            guard,
            limit: Arc::new(Semaphore::new(max_concurrent.max(1))),
            remove_remote_copies: true,
        }
    }

    /// Whether local copies of remote inputs are deleted after their run.
    pub fn with_remote_copy_cleanup(mut self, enabled: bool) -> Self {
        self.remove_remote_copies = enabled;
        self
    }

    /// Consume detections until `shutdown` resolves or every sender is
    /// gone, then let in-flight runs finish.
    pub async fn run<S>(self, queue: DetectionQueue, shutdown: S) -> DispatchStats
    where
        S: Future<Output = ()>,
    {
        self.accept(queue, shutdown).await.finish().await
    }

    /// Intake phase only: admit detections until `shutdown` resolves or
    /// every sender is gone. Nothing is admitted once this returns; the
    /// queue stays open so late detections can be counted by
    /// [`Draining::finish`].
    pub async fn accept<S>(self, mut queue: DetectionQueue, shutdown: S) -> Draining
    where
        S: Future<Output = ()>,
    {
        let mut stats = DispatchStats::default();
        let mut tasks: JoinSet<PipelineRun> = JoinSet::new();
        tokio::pin!(shutdown);

        info!("Run dispatcher ready");
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Shutdown requested; no longer accepting detections");
                    break;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    record(&mut stats, joined);
                }
                next = queue.rx.recv() => match next {
                    Some(input) => self.dispatch(&mut tasks, &mut stats, input),
                    None => {
                        info!("All detection sources closed");
                        break;
                    }
                },
            }
        }

        Draining {
            queue,
            tasks,
            stats,
            remove_remote_copies: self.remove_remote_copies,
        }
    }

    fn dispatch(&self, tasks: &mut JoinSet<PipelineRun>, stats: &mut DispatchStats, input: InputUnit) {
        let id = input.id();
        let Some(ticket) = self.guard.admit(&id) else {
            info!(input = %id, "Already processing; dropping duplicate detection");
            stats.duplicates += 1;
            return;
        };
        stats.started += 1;

        let orchestrator = Arc::clone(&self.orchestrator);
        let limit = Arc::clone(&self.limit);
        let remove_copy = self.remove_remote_copies && input.source == SourceTag::Remote;
        tasks.spawn(async move {
            // Released on every exit path, including a panic in the run.
            let _ticket = ticket;
            let _permit = limit.acquire_owned().await.ok();
            let path = input.path.clone();
            let run = orchestrator.run(input).await;
            if remove_copy {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!(path = %path.display(), error = %e, "Could not remove local copy of remote input");
                }
            }
            run
        });
    }
}

/// A dispatcher that has stopped admitting runs.
pub struct Draining {
    queue: DetectionQueue,
    tasks: JoinSet<PipelineRun>,
    stats: DispatchStats,
    remove_remote_copies: bool,
}

impl Draining {
    /// Runs started so far.
    pub fn started(&self) -> usize {
        self.stats.started
    }

    /// Drop whatever is still queued, then wait for in-flight runs.
    pub async fn finish(mut self) -> DispatchStats {
        self.queue.rx.close();
        while let Ok(input) = self.queue.rx.try_recv() {
            warn!(input = %input.id(), "Dropping detection received during shutdown");
            self.stats.dropped_on_shutdown += 1;
            if self.remove_remote_copies && input.source == SourceTag::Remote {
                if let Err(e) = tokio::fs::remove_file(&input.path).await {
                    warn!(path = %input.path.display(), error = %e, "Could not remove local copy of remote input");
                }
            }
        }

        if !self.tasks.is_empty() {
            info!(in_flight = self.tasks.len(), "Waiting for in-flight runs to finish");
        }
        while let Some(joined) = self.tasks.join_next().await {
            record(&mut self.stats, joined);
        }

        let stats = self.stats;
        info!(
            started = stats.started,
            succeeded = stats.succeeded,
            failed = stats.failed,
            duplicates = stats.duplicates,
            dropped = stats.dropped_on_shutdown,
            "Run dispatcher stopped"
        );
        stats
    }
}

fn record(stats: &mut DispatchStats, joined: Result<PipelineRun, JoinError>) {
    match joined {
        Ok(run) => match run.outcome {
            Some(RunOutcome::Succeeded) => stats.succeeded += 1,
            _ => stats.failed += 1,
        },
        Err(e) => {
            error!(error = %e, "Pipeline task crashed");
            stats.crashed += 1;
        }
    }
}
