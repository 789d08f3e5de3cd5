//! On-disk project layout: naming, phrase folders, cleanup and summary.

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Local};
use regex::Regex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::pipeline::state::PhraseDownloads;
use crate::pipeline::types::InputUnit;

/// Name used when sanitization leaves nothing.
pub const PLACEHOLDER_NAME: &str = "unnamed";

/// Maximum length of a sanitized name, in characters.
pub const MAX_NAME_LEN: usize = 50;

pub const SUMMARY_FILE: &str = "PROJECT_SUMMARY.txt";

/// Extensions left behind by interrupted downloads.
const PARTIAL_EXTENSIONS: &[&str] = &["part", "ytdl", "tmp"];

static ILLEGAL_CHARS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"[<>:"/\\|?*\x00-\x1f]"#).expect("illegal character pattern is valid")
});

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern is valid"));

/// Make a string safe to use as a single path component.
///
/// Idempotent: `sanitize_name(&sanitize_name(s)) == sanitize_name(s)`.
pub fn sanitize_name(raw: &str) -> String {
    let replaced = ILLEGAL_CHARS.replace_all(raw, "_");
    let collapsed = WHITESPACE.replace_all(&replaced, "_");
    let trimmed = trim_separators(&collapsed);
    let capped: String = trimmed.chars().take(MAX_NAME_LEN).collect();
    let name = trim_separators(&capped);
    if name.is_empty() {
        PLACEHOLDER_NAME.to_string()
    } else {
        name.to_string()
    }
}

fn trim_separators(s: &str) -> &str {
    s.trim_matches(|c| c == '_' || c == '.')
}

/// File stem for a downloaded candidate; the score prefix keeps ranking
/// visible in a directory listing.
pub fn scored_file_stem(score: u8, title: &str) -> String {
    format!("score{score:02}_{}", sanitize_name(title))
}

/// Creates project roots under one output base directory.
#[derive(Debug, Clone)]
pub struct ProjectLayout {
    output_base: PathBuf,
    lazy_phrase_folders: bool,
}

impl ProjectLayout {
    pub fn new(output_base: impl Into<PathBuf>) -> Self {
        Self {
            output_base: output_base.into(),
            lazy_phrase_folders: false,
        }
    }

    /// Defer phrase folder creation until the first download for a phrase.
    pub fn with_lazy_phrase_folders(mut self, lazy: bool) -> Self {
        self.lazy_phrase_folders = lazy;
        self
    }

    pub fn lazy_phrase_folders(&self) -> bool {
        self.lazy_phrase_folders
    }

    /// `{sanitized source name}_{hash of identifier}_{timestamp}`.
    pub fn project_name(input: &InputUnit, now: DateTime<Local>) -> String {
        let stem = input.file_stem().unwrap_or_default();
        let hash = blake3::hash(input.id().as_bytes()).to_hex();
        format!(
            "{}_{}_{}",
            sanitize_name(&stem),
            &hash.as_str()[..8],
            now.format("%Y%m%d_%H%M%S")
        )
    }

    /// Create the project root and, unless folders are lazy, one folder per
    /// phrase.
    pub fn create_project(&self, input: &InputUnit, phrases: &[String]) -> io::Result<ProjectDir> {
        let name = Self::project_name(input, Local::now());
        let project = ProjectDir {
            root: self.output_base.join(&name),
            name,
        };
        fs::create_dir_all(&project.root)?;

        if !self.lazy_phrase_folders {
            for phrase in phrases {
                project.ensure_phrase_dir(phrase)?;
            }
        }

        info!(
            project = %project.root.display(),
            phrases = phrases.len(),
            lazy = self.lazy_phrase_folders,
            "Created project directory"
        );
        Ok(project)
    }
}

/// A created project root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectDir {
    pub root: PathBuf,
    pub name: String,
}

impl ProjectDir {
    pub fn phrase_dir(&self, phrase: &str) -> PathBuf {
        self.root.join(sanitize_name(phrase))
    }

    /// Create (or reuse) the folder for `phrase`.
    pub fn ensure_phrase_dir(&self, phrase: &str) -> io::Result<PathBuf> {
        let dir = self.phrase_dir(phrase);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Delete leftover partial download artifacts in phrase folders.
    /// Returns how many files were removed.
    pub fn remove_partial_downloads(&self) -> usize {
        let mut removed = 0;
        for dir in self.subfolders() {
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let partial = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| PARTIAL_EXTENSIONS.contains(&e));
                if !partial || !path.is_file() {
                    continue;
                }
                match fs::remove_file(&path) {
                    Ok(()) => {
                        debug!(path = %path.display(), "Removed partial download");
                        removed += 1;
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "Could not remove partial download"),
                }
            }
        }
        removed
    }

    /// Remove phrase folders that hold nothing. Returns the removed paths.
    pub fn remove_empty_subfolders(&self) -> Vec<PathBuf> {
        let mut removed = Vec::new();
        for dir in self.subfolders() {
            let empty = fs::read_dir(&dir)
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(false);
            if !empty {
                continue;
            }
            match fs::remove_dir(&dir) {
                Ok(()) => {
                    debug!(path = %dir.display(), "Removed empty phrase folder");
                    removed.push(dir);
                }
                Err(e) => warn!(path = %dir.display(), error = %e, "Could not remove empty folder"),
            }
        }
        removed
    }

    fn subfolders(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut dirs: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();
        dirs
    }

    /// Write `PROJECT_SUMMARY.txt` describing the run's downloads.
    pub fn write_summary(
        &self,
        run_id: Uuid,
        input: &InputUnit,
        downloads: &[PhraseDownloads],
    ) -> io::Result<PathBuf> {
        let text = render_summary(&self.name, run_id, input, downloads, Local::now());
        let path = self.root.join(SUMMARY_FILE);
        fs::write(&path, text)?;
        info!(path = %path.display(), "Wrote project summary");
        Ok(path)
    }
}

fn size_mb(path: &Path) -> Option<f64> {
    fs::metadata(path)
        .ok()
        .map(|m| m.len() as f64 / (1024.0 * 1024.0))
}

fn render_summary(
    project_name: &str,
    run_id: Uuid,
    input: &InputUnit,
    downloads: &[PhraseDownloads],
    now: DateTime<Local>,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "B-ROLL PROJECT SUMMARY");
    let _ = writeln!(out, "{}\n", "=".repeat(50));
    let _ = writeln!(out, "Run ID: {run_id}");
    let _ = writeln!(out, "Source: {} ({})", input.file_name(), input.source);
    let _ = writeln!(out, "Created: {}", now.format("%Y-%m-%d %H:%M:%S"));
    let _ = writeln!(out, "Project Directory: {project_name}\n");
    let _ = writeln!(out, "FILES BY SEARCH PHRASE:");
    let _ = writeln!(out, "{}\n", "-".repeat(40));

    let mut total_files = 0;
    let mut total_mb = 0.0;
    for entry in downloads.iter().filter(|d| !d.files.is_empty()) {
        let _ = writeln!(out, "Search Phrase: '{}'", entry.phrase);
        let _ = writeln!(out, "Files ({}):", entry.files.len());
        for file in &entry.files {
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| file.display().to_string());
            match size_mb(file) {
                Some(mb) => {
                    total_mb += mb;
                    let _ = writeln!(out, "  - {name} ({mb:.1} MB)");
                }
                None => {
                    let _ = writeln!(out, "  - {name} (unknown size)");
                }
            }
        }
        let _ = writeln!(out);
        total_files += entry.files.len();
    }

    let _ = writeln!(out, "TOTAL FILES: {total_files}");
    let _ = writeln!(out, "TOTAL SIZE: {total_mb:.1} MB");
    out
}
