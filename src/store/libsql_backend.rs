//! libSQL-backed job history.
//!
//! One row per run in `jobs` (replaced on every save) and an append-only
//! `job_transitions` log. Phrases and downloads are stored as JSON text.
//! The schema is version-tracked in `_migrations`; only new versions are
//! applied on open.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use super::{JobCounts, JobRecord, JobStore};
use crate::error::StoreError;
use crate::pipeline::state::{RunStage, StageTransition};
use crate::pipeline::types::SourceTag;

pub struct LibSqlJobStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlJobStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Open(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("{}: {e}", path.display())))?;
        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Job history opened");
        Ok(store)
    }

    /// In-memory database, gone when dropped.
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Open(format!("in-memory database: {e}")))?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, StoreError> {
        let conn = db
            .connect()
            .map_err(|e| StoreError::Open(format!("connection: {e}")))?;
        run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }
}

// ── Migrations ──────────────────────────────────────────────────────

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Add new versions to the end.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "job_history",
    sql: r#"
        CREATE TABLE IF NOT EXISTS jobs (
            run_id TEXT PRIMARY KEY,
            input_path TEXT NOT NULL,
            source TEXT NOT NULL,
            stage TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            transcript TEXT,
            phrases TEXT NOT NULL DEFAULT '[]',
            downloads TEXT NOT NULL DEFAULT '{}',
            project_path TEXT,
            failure_reason TEXT,
            remote_url TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_jobs_stage ON jobs(stage);
        CREATE INDEX IF NOT EXISTS idx_jobs_updated_at ON jobs(updated_at);

        CREATE TABLE IF NOT EXISTS job_transitions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            from_stage TEXT NOT NULL,
            to_stage TEXT NOT NULL,
            at TEXT NOT NULL,
            reason TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_job_transitions_run ON job_transitions(run_id);
    "#,
}];

async fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| StoreError::Migration(format!("_migrations table: {e}")))?;

    let current = current_version(conn).await?;
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        conn.execute_batch(migration.sql).await.map_err(|e| {
            StoreError::Migration(format!("V{} {}: {e}", migration.version, migration.name))
        })?;
        seed_version(conn, migration.version, migration.name).await?;
        debug!(version = migration.version, name = migration.name, "Applied migration");
    }
    Ok(())
}

async fn current_version(conn: &Connection) -> Result<i64, StoreError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| StoreError::Migration(format!("read version: {e}")))?;
    match rows
        .next()
        .await
        .map_err(|e| StoreError::Migration(format!("read version: {e}")))?
    {
        Some(row) => row
            .get::<i64>(0)
            .map_err(|e| StoreError::Migration(format!("read version: {e}"))),
        None => Ok(0),
    }
}

async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        params![version, name],
    )
    .await
    .map_err(|e| StoreError::Migration(format!("record V{version}: {e}")))?;
    Ok(())
}

// ── Row helpers ─────────────────────────────────────────────────────

fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    Utc::now()
}

/// Fixed-width RFC 3339, so text order is time order.
fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn stage_from_str(s: &str) -> RunStage {
    match s {
        "queued" => RunStage::Queued,
        "transcribing" => RunStage::Transcribing,
        "extracting_phrases" => RunStage::ExtractingPhrases,
        "layout" => RunStage::Layout,
        "searching" => RunStage::Searching,
        "downloading" => RunStage::Downloading,
        "notifying" => RunStage::Notifying,
        "completed" => RunStage::Completed,
        _ => RunStage::Failed,
    }
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn query_err(op: &str) -> impl FnOnce(libsql::Error) -> StoreError + '_ {
    move |e| StoreError::Query(format!("{op}: {e}"))
}

const JOB_COLUMNS: &str = "run_id, input_path, source, stage, created_at, updated_at, \
     transcript, phrases, downloads, project_path, failure_reason, remote_url";

const TERMINAL_STAGES: &str = "('completed', 'failed')";

fn row_to_job(row: &libsql::Row) -> Result<JobRecord, StoreError> {
    let text = |i: i32| {
        row.get::<String>(i)
            .map_err(|e| StoreError::Query(format!("read column {i}: {e}")))
    };
    let run_id = text(0)?;
    let run_id = Uuid::parse_str(&run_id)
        .map_err(|e| StoreError::Query(format!("bad run id {run_id}: {e}")))?;
    let source = text(2)?
        .parse::<SourceTag>()
        .map_err(|e| StoreError::Query(format!("bad source: {e}")))?;
    let phrases: Vec<String> = serde_json::from_str(&text(7)?).unwrap_or_default();
    let downloads: BTreeMap<String, Vec<PathBuf>> =
        serde_json::from_str(&text(8)?).unwrap_or_default();

    Ok(JobRecord {
        run_id,
        input_path: PathBuf::from(text(1)?),
        source,
        stage: stage_from_str(&text(3)?),
        created_at: parse_datetime(&text(4)?),
        updated_at: parse_datetime(&text(5)?),
        transcript: row.get::<String>(6).ok(),
        phrases,
        downloads,
        project_path: row.get::<String>(9).ok().map(PathBuf::from),
        failure_reason: row.get::<String>(10).ok(),
        remote_url: row.get::<String>(11).ok(),
    })
}

// ── Trait implementation ────────────────────────────────────────────

impl LibSqlJobStore {
    async fn query_jobs(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        op: &str,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let mut rows = self.conn.query(sql, params).await.map_err(query_err(op))?;
        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err(op))? {
            jobs.push(row_to_job(&row)?);
        }
        Ok(jobs)
    }
}

#[async_trait]
impl JobStore for LibSqlJobStore {
    async fn save_job(&self, job: &JobRecord) -> Result<(), StoreError> {
        let phrases = serde_json::to_string(&job.phrases)
            .map_err(|e| StoreError::Query(format!("encode phrases: {e}")))?;
        let downloads = serde_json::to_string(&job.downloads)
            .map_err(|e| StoreError::Query(format!("encode downloads: {e}")))?;
        let project_path = job.project_path.as_ref().map(|p| p.display().to_string());

        self.conn
            .execute(
                &format!(
                    "INSERT OR REPLACE INTO jobs ({JOB_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    job.run_id.to_string(),
                    job.input_path.display().to_string(),
                    job.source.to_string(),
                    job.stage.to_string(),
                    timestamp(&job.created_at),
                    timestamp(&job.updated_at),
                    opt_text(job.transcript.as_deref()),
                    phrases,
                    downloads,
                    opt_text(project_path.as_deref()),
                    opt_text(job.failure_reason.as_deref()),
                    opt_text(job.remote_url.as_deref()),
                ],
            )
            .await
            .map_err(query_err("save_job"))?;
        Ok(())
    }

    async fn record_transition(
        &self,
        run_id: Uuid,
        transition: &StageTransition,
    ) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO job_transitions (run_id, from_stage, to_stage, at, reason) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    run_id.to_string(),
                    transition.from.to_string(),
                    transition.to.to_string(),
                    timestamp(&transition.timestamp),
                    opt_text(transition.reason.as_deref()),
                ],
            )
            .await
            .map_err(query_err("record_transition"))?;
        Ok(())
    }

    async fn get_job(&self, run_id: Uuid) -> Result<Option<JobRecord>, StoreError> {
        let jobs = self
            .query_jobs(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE run_id = ?1"),
                params![run_id.to_string()],
                "get_job",
            )
            .await?;
        Ok(jobs.into_iter().next())
    }

    async fn transitions(&self, run_id: Uuid) -> Result<Vec<StageTransition>, StoreError> {
        let op = "transitions";
        let mut rows = self
            .conn
            .query(
                "SELECT from_stage, to_stage, at, reason FROM job_transitions \
                 WHERE run_id = ?1 ORDER BY id",
                params![run_id.to_string()],
            )
            .await
            .map_err(query_err(op))?;

        let mut out = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err(op))? {
            let from = row.get::<String>(0).map_err(query_err(op))?;
            let to = row.get::<String>(1).map_err(query_err(op))?;
            let at = row.get::<String>(2).map_err(query_err(op))?;
            out.push(StageTransition {
                from: stage_from_str(&from),
                to: stage_from_str(&to),
                timestamp: parse_datetime(&at),
                reason: row.get::<String>(3).ok(),
            });
        }
        Ok(out)
    }

    async fn active_jobs(&self) -> Result<Vec<JobRecord>, StoreError> {
        self.query_jobs(
            &format!(
                "SELECT {JOB_COLUMNS} FROM jobs WHERE stage NOT IN {TERMINAL_STAGES} \
                 ORDER BY created_at"
            ),
            (),
            "active_jobs",
        )
        .await
    }

    async fn recent_jobs(&self, limit: usize) -> Result<Vec<JobRecord>, StoreError> {
        self.query_jobs(
            &format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY updated_at DESC LIMIT ?1"),
            params![limit as i64],
            "recent_jobs",
        )
        .await
    }

    async fn job_counts(&self) -> Result<JobCounts, StoreError> {
        let op = "job_counts";
        let mut rows = self
            .conn
            .query("SELECT stage, COUNT(*) FROM jobs GROUP BY stage", ())
            .await
            .map_err(query_err(op))?;

        let mut counts = JobCounts::default();
        while let Some(row) = rows.next().await.map_err(query_err(op))? {
            let stage = row.get::<String>(0).map_err(query_err(op))?;
            let n = row.get::<i64>(1).map_err(query_err(op))?.max(0) as u64;
            counts.total += n;
            counts.by_stage.insert(stage, n);
        }
        Ok(counts)
    }
}
