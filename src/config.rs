//! Configuration types.
//!
//! Everything is read from environment variables (after `.env` is loaded by
//! the binary). Unset variables take the defaults below; a variable that is
//! set but malformed is an error, never a silent default.

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::collaborators::gemini::DEFAULT_MODEL;
use crate::collaborators::smtp::SmtpSettings;
use crate::error::ConfigError;
use crate::pipeline::{OrchestratorSettings, SupportedFormats};
use crate::retry::{RetryPolicy, RetrySettings};
use crate::watcher::WatchSettings;

const MB: u64 = 1024 * 1024;

/// Service configuration.
#[derive(Debug, Clone)]
pub struct StockpileConfig {
    /// Local directory watched for new media.
    pub local_input_folder: Option<PathBuf>,
    /// Remote folder id polled for new media.
    pub remote_input_folder: Option<String>,
    /// Base directory for project folders.
    pub output_folder: PathBuf,
    /// Mount point of the remote storage. Remote features need it.
    pub remote_storage_root: Option<PathBuf>,
    /// Remote parent folder that projects are mirrored into.
    pub remote_output_folder: Option<String>,
    /// Create phrase folders only when something is about to land in them.
    pub remote_folders_on_demand: bool,
    pub max_videos_per_phrase: usize,
    /// Candidates requested from each search.
    pub max_search_results: usize,
    pub video_duration_limit: Duration,
    pub max_download_mb: u64,
    /// Pipeline runs allowed at once.
    pub max_concurrent_jobs: usize,
    /// Size of the blocking pool collaborator calls run on.
    pub worker_threads: usize,
    pub notifications_enabled: bool,
    pub smtp_host: Option<String>,
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<SecretString>,
    pub notification_email: Option<String>,
    pub gemini_api_key: Option<SecretString>,
    pub gemini_model: String,
    pub whisper_program: String,
    pub whisper_model: String,
    pub ytdlp_program: String,
    pub retry: RetrySettings,
    /// How long a new local file must sit before it is reported.
    pub watch_settle: Duration,
    pub remote_poll_interval: Duration,
    /// Poll interval after a failed listing.
    pub remote_error_interval: Duration,
    /// Local copies of remote inputs.
    pub temp_dir: PathBuf,
    pub log_file: Option<PathBuf>,
    /// Record every run in the job history database.
    pub job_history_enabled: bool,
    pub database_path: PathBuf,
}

impl Default for StockpileConfig {
    fn default() -> Self {
        Self {
            local_input_folder: None,
            remote_input_folder: None,
            output_folder: PathBuf::from("./output"),
            remote_storage_root: None,
            remote_output_folder: None,
            remote_folders_on_demand: true,
            max_videos_per_phrase: 3,
            max_search_results: 20,
            video_duration_limit: Duration::from_secs(600), // 10 minutes
            max_download_mb: 100,
            max_concurrent_jobs: 3,
            worker_threads: 8,
            notifications_enabled: true,
            smtp_host: None,
            smtp_port: 587,
            smtp_username: None,
            smtp_password: None,
            notification_email: None,
            gemini_api_key: None,
            gemini_model: DEFAULT_MODEL.to_string(),
            whisper_program: "whisper".to_string(),
            whisper_model: "base".to_string(),
            ytdlp_program: "yt-dlp".to_string(),
            retry: RetrySettings::default(),
            watch_settle: Duration::from_secs(2),
            remote_poll_interval: Duration::from_secs(30),
            remote_error_interval: Duration::from_secs(60),
            temp_dir: std::env::temp_dir().join("stockpile"),
            log_file: None,
            job_history_enabled: true,
            database_path: PathBuf::from("./data/stockpile.db"),
        }
    }
}

impl StockpileConfig {
    /// Read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let retry = RetrySettings {
            api: read_policy(&get, "API", defaults.retry.api)?,
            download: read_policy(&get, "DOWNLOAD", defaults.retry.download)?,
            file: read_policy(&get, "FILE", defaults.retry.file)?,
        };

        Ok(Self {
            local_input_folder: get("LOCAL_INPUT_FOLDER").map(PathBuf::from),
            remote_input_folder: get("REMOTE_INPUT_FOLDER"),
            output_folder: get("LOCAL_OUTPUT_FOLDER")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_folder),
            remote_storage_root: get("REMOTE_STORAGE_ROOT").map(PathBuf::from),
            remote_output_folder: get("REMOTE_OUTPUT_FOLDER"),
            remote_folders_on_demand: parse_bool(&get, "REMOTE_FOLDERS_ON_DEMAND")?
                .unwrap_or(defaults.remote_folders_on_demand),
            max_videos_per_phrase: parse(&get, "MAX_VIDEOS_PER_PHRASE")?
                .unwrap_or(defaults.max_videos_per_phrase),
            max_search_results: parse(&get, "MAX_SEARCH_RESULTS")?
                .unwrap_or(defaults.max_search_results),
            video_duration_limit: parse(&get, "VIDEO_DURATION_LIMIT")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.video_duration_limit),
            max_download_mb: parse(&get, "MAX_DOWNLOAD_MB")?.unwrap_or(defaults.max_download_mb),
            max_concurrent_jobs: parse(&get, "MAX_CONCURRENT_JOBS")?
                .unwrap_or(defaults.max_concurrent_jobs),
            worker_threads: parse(&get, "WORKER_THREADS")?.unwrap_or(defaults.worker_threads),
            notifications_enabled: parse_bool(&get, "NOTIFICATIONS_ENABLED")?
                .unwrap_or(defaults.notifications_enabled),
            smtp_host: get("SMTP_HOST"),
            smtp_port: parse(&get, "SMTP_PORT")?.unwrap_or(defaults.smtp_port),
            smtp_username: get("SMTP_USERNAME"),
            smtp_password: get("SMTP_PASSWORD").map(SecretString::from),
            notification_email: get("NOTIFICATION_EMAIL"),
            gemini_api_key: get("GEMINI_API_KEY").map(SecretString::from),
            gemini_model: get("GEMINI_MODEL").unwrap_or(defaults.gemini_model),
            whisper_program: get("WHISPER_PROGRAM").unwrap_or(defaults.whisper_program),
            whisper_model: get("WHISPER_MODEL").unwrap_or(defaults.whisper_model),
            ytdlp_program: get("YTDLP_PROGRAM").unwrap_or(defaults.ytdlp_program),
            retry,
            watch_settle: parse(&get, "WATCH_SETTLE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.watch_settle),
            remote_poll_interval: parse(&get, "REMOTE_POLL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.remote_poll_interval),
            remote_error_interval: parse(&get, "REMOTE_ERROR_POLL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.remote_error_interval),
            temp_dir: get("STOCKPILE_TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.temp_dir),
            log_file: get("STOCKPILE_LOG_FILE").map(PathBuf::from),
            job_history_enabled: parse_bool(&get, "JOB_HISTORY_ENABLED")?
                .unwrap_or(defaults.job_history_enabled),
            database_path: get("STOCKPILE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
        })
    }

    /// Check the whole configuration for the watching service, reporting
    /// every problem at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.check(true)
    }

    /// Like [`validate`](Self::validate) but without requiring an input
    /// source, for processing a single file.
    pub fn validate_single(&self) -> Result<(), ConfigError> {
        self.check(false)
    }

    fn check(&self, require_input: bool) -> Result<(), ConfigError> {
        let mut problems: Vec<String> = Vec::new();

        if require_input && self.local_input_folder.is_none() && self.remote_input_folder.is_none() {
            problems.push("no input source: set LOCAL_INPUT_FOLDER or REMOTE_INPUT_FOLDER".into());
        }
        if self.output_folder.as_os_str().is_empty() {
            problems.push("LOCAL_OUTPUT_FOLDER must not be empty".into());
        }

        let limits = [
            ("MAX_VIDEOS_PER_PHRASE", self.max_videos_per_phrase as u64),
            ("MAX_SEARCH_RESULTS", self.max_search_results as u64),
            ("MAX_DOWNLOAD_MB", self.max_download_mb),
            ("MAX_CONCURRENT_JOBS", self.max_concurrent_jobs as u64),
            ("WORKER_THREADS", self.worker_threads as u64),
            ("REMOTE_POLL_SECS", self.remote_poll_interval.as_secs()),
            ("REMOTE_ERROR_POLL_SECS", self.remote_error_interval.as_secs()),
        ];
        for (key, value) in limits {
            if value == 0 {
                problems.push(format!("{key} must be positive"));
            }
        }

        if self.smtp_username.is_some() && self.smtp_password.is_none() {
            problems.push("SMTP_PASSWORD is required when SMTP_USERNAME is set".into());
        }
        if self.remote_storage_root.is_none() {
            if self.remote_input_folder.is_some() {
                problems.push("REMOTE_INPUT_FOLDER requires REMOTE_STORAGE_ROOT".into());
            }
            if self.remote_output_folder.is_some() {
                problems.push("REMOTE_OUTPUT_FOLDER requires REMOTE_STORAGE_ROOT".into());
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid { problems })
        }
    }

    pub fn retry_settings(&self) -> RetrySettings {
        self.retry
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            max_candidates_per_phrase: self.max_videos_per_phrase,
            max_duration: self.video_duration_limit,
            max_download_bytes: self.max_download_mb.saturating_mul(MB),
            remote_parent: self.remote_output_folder.clone(),
            remote_folders_on_demand: self.remote_folders_on_demand,
            formats: SupportedFormats::default(),
            retry: self.retry_settings(),
        }
    }

    pub fn watch_settings(&self) -> WatchSettings {
        WatchSettings {
            local_dir: self.local_input_folder.clone(),
            remote_folder: self.remote_input_folder.clone(),
            formats: SupportedFormats::default(),
            settle: self.watch_settle,
            poll_interval: self.remote_poll_interval,
            error_interval: self.remote_error_interval,
            temp_dir: self.temp_dir.clone(),
        }
    }

    /// SMTP delivery settings, if notifications are on and every piece is set.
    pub fn smtp_settings(&self) -> Option<SmtpSettings> {
        if !self.notifications_enabled {
            return None;
        }
        Some(SmtpSettings {
            host: self.smtp_host.clone()?,
            port: self.smtp_port,
            username: self.smtp_username.clone()?,
            password: self.smtp_password.clone()?,
            recipient: self.notification_email.clone()?,
        })
    }
}

// ── Parsing helpers ─────────────────────────────────────────────────────

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    get(key)
        .map(|raw| {
            raw.parse::<T>().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            })
        })
        .transpose()
}

fn parse_bool(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<bool>, ConfigError> {
    get(key)
        .map(|raw| match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?} is not a boolean"),
            }),
        })
        .transpose()
}

/// `<CLASS>_MAX_RETRIES` and `<CLASS>_BASE_DELAY_MS`; the cap stays fixed.
fn read_policy(
    get: &impl Fn(&str) -> Option<String>,
    class: &str,
    default: RetryPolicy,
) -> Result<RetryPolicy, ConfigError> {
    let max_retries = parse(get, &format!("{class}_MAX_RETRIES"))?.unwrap_or(default.max_retries);
    let base_delay = parse(get, &format!("{class}_BASE_DELAY_MS"))?
        .map(Duration::from_millis)
        .unwrap_or(default.base_delay);
    Ok(RetryPolicy::new(max_retries, base_delay, default.max_delay))
}
