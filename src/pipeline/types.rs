//! Shared types for the processing pipeline.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Input unit ──────────────────────────────────────────────────────

/// Where an input file was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTag {
    Local,
    Remote,
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

impl std::str::FromStr for SourceTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "remote" | "google_drive" | "drive" => Ok(Self::Remote),
            other => Err(format!("unknown source '{other}' (expected local or remote)")),
        }
    }
}

/// A detected media file. Always a local path; remote inputs are
/// materialized before they are reported.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputUnit {
    pub path: PathBuf,
    pub source: SourceTag,
}

impl InputUnit {
    pub fn new(path: impl Into<PathBuf>, source: SourceTag) -> Self {
        Self {
            path: path.into(),
            source,
        }
    }

    /// Build an input with its path resolved to canonical form, falling
    /// back to the path as given when it cannot be resolved.
    pub fn canonical(path: impl AsRef<Path>, source: SourceTag) -> Self {
        let path = path.as_ref();
        let resolved = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        Self::new(resolved, source)
    }

    /// Admission identifier.
    pub fn id(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    /// File name without directories, for display.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.id())
    }

    /// File name without extension.
    pub fn file_stem(&self) -> Option<String> {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
    }
}

// ── Media formats ───────────────────────────────────────────────────

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv", "wmv", "flv", "webm", "m4v"];
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "flac", "aac", "ogg", "m4a", "wma"];

/// Allow-list of media file extensions accepted as pipeline input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportedFormats {
    extensions: Vec<String>,
}

impl SupportedFormats {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            extensions: extensions
                .into_iter()
                .map(|e| e.as_ref().trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    /// Case-insensitive extension match.
    pub fn is_supported(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .is_some_and(|e| self.extensions.iter().any(|x| *x == e))
    }

    /// Match on a remote file's name, or failing that its MIME type.
    pub fn is_supported_remote(&self, name: &str, mime_type: Option<&str>) -> bool {
        self.is_supported(Path::new(name))
            || mime_type.is_some_and(|m| m.starts_with("video/") || m.starts_with("audio/"))
    }
}

impl Default for SupportedFormats {
    fn default() -> Self {
        Self::new(VIDEO_EXTENSIONS.iter().chain(AUDIO_EXTENSIONS))
    }
}

// ── Outcome & summary ───────────────────────────────────────────────

/// Terminal outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Result summary handed to the notifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub input: InputUnit,
    pub outcome: RunOutcome,
    pub elapsed: Duration,
    pub phrases_processed: usize,
    pub files_downloaded: usize,
    pub project_path: Option<PathBuf>,
    /// Link or identifier of the mirrored project folder.
    pub remote_project: Option<String>,
    pub failure_reason: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl RunSummary {
    pub fn elapsed_display(&self) -> String {
        format_elapsed(self.elapsed)
    }
}

/// Format a duration as seconds, minutes or hours depending on magnitude.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs < 60.0 {
        format!("{secs:.1} seconds")
    } else if secs < 3600.0 {
        format!("{:.1} minutes", secs / 60.0)
    } else {
        format!("{:.1} hours", secs / 3600.0)
    }
}
