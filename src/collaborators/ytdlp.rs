//! Video search and download through `yt-dlp`.

use std::path::PathBuf;
use std::process::Command;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::collaborators::{DownloadRequest, Downloader, VideoCandidate, VideoSearcher};
use crate::error::CollaboratorError;

const FORMAT: &str = "best[height<=1080][ext=mp4]/best[ext=mp4]/best";

pub struct YtDlp {
    program: String,
    max_results: usize,
}

impl YtDlp {
    pub fn new(program: impl Into<String>, max_results: usize) -> Self {
        Self {
            program: program.into(),
            max_results,
        }
    }

    fn search_command(&self, phrase: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg(format!("ytsearch{}:{phrase}", self.max_results))
            .args(["--dump-json", "--skip-download", "--no-warnings", "--ignore-errors"]);
        cmd
    }

    fn download_command(&self, request: &DownloadRequest) -> Command {
        let template = request
            .target_dir
            .join(format!("{}.%(ext)s", request.file_stem));
        let mut cmd = Command::new(&self.program);
        cmd.args(["-f", FORMAT])
            .arg("--max-filesize")
            .arg(request.max_bytes.to_string())
            .arg("-o")
            .arg(template)
            .args([
                "--no-playlist",
                "--merge-output-format",
                "mp4",
                "--print",
                "after_move:filepath",
                "--no-simulate",
                "--quiet",
                "--no-warnings",
            ])
            .arg(&request.candidate.candidate.url);
        cmd
    }
}

/// One line of `--dump-json` output.
#[derive(Debug, Deserialize)]
struct SearchEntry {
    id: Option<String>,
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    webpage_url: Option<String>,
}

impl SearchEntry {
    fn into_candidate(self) -> Option<VideoCandidate> {
        let id = self.id.filter(|id| !id.is_empty())?;
        let url = self
            .webpage_url
            .unwrap_or_else(|| format!("https://www.youtube.com/watch?v={id}"));
        Some(VideoCandidate {
            title: self.title.unwrap_or_else(|| "Unknown Title".to_string()),
            description: self.description.unwrap_or_default(),
            duration_secs: self.duration.map(|d| d.max(0.0).round() as u64).unwrap_or(0),
            url,
            id,
        })
    }
}

fn parse_search_output(stdout: &str) -> Vec<VideoCandidate> {
    stdout
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<SearchEntry>(line) {
            Ok(entry) => entry.into_candidate(),
            Err(e) => {
                warn!(error = %e, "Skipping unparseable search entry");
                None
            }
        })
        .collect()
}

impl VideoSearcher for YtDlp {
    fn search(&self, phrase: &str) -> Result<Vec<VideoCandidate>, CollaboratorError> {
        if phrase.trim().is_empty() {
            return Ok(Vec::new());
        }
        info!(phrase, "Searching for candidates");

        let output = self.search_command(phrase).output()?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let candidates = parse_search_output(&stdout);

        // --ignore-errors exits non-zero when single entries fail; only a
        // failure with nothing usable is an error.
        if !output.status.success() && candidates.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CollaboratorError::classify(format!(
                "yt-dlp search failed: {}",
                stderr.trim()
            )));
        }

        debug!(phrase, found = candidates.len(), "Search finished");
        Ok(candidates)
    }
}

impl Downloader for YtDlp {
    fn download(&self, request: &DownloadRequest) -> Result<PathBuf, CollaboratorError> {
        let candidate = &request.candidate.candidate;
        info!(id = %candidate.id, score = request.candidate.score, "Downloading candidate");

        let output = self.download_command(request).output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CollaboratorError::classify(format!(
                "yt-dlp download of {} failed: {}",
                candidate.id,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let path = stdout
            .lines()
            .map(str::trim)
            .rfind(|l| !l.is_empty())
            .map(PathBuf::from)
            .filter(|p| p.is_file())
            .ok_or_else(|| {
                CollaboratorError::Validation(format!(
                    "no file produced for {} (larger than {} bytes or filtered)",
                    candidate.id, request.max_bytes
                ))
            })?;

        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::ScoredCandidate;

    #[test]
    fn parses_dump_json_lines() {
        let stdout = concat!(
            r#"{"id":"abc","title":"Ocean","description":"waves","duration":61.6,"webpage_url":"https://youtu.be/abc"}"#,
            "\n",
            "not json\n",
            r#"{"id":"def","title":null,"duration":null}"#,
            "\n",
            r#"{"title":"no id"}"#,
            "\n",
        );
        let candidates = parse_search_output(stdout);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].duration_secs, 62);
        assert_eq!(candidates[0].url, "https://youtu.be/abc");
        assert_eq!(candidates[1].title, "Unknown Title");
        assert_eq!(candidates[1].url, "https://www.youtube.com/watch?v=def");
    }

    #[test]
    fn blank_phrase_skips_search() {
        let ytdlp = YtDlp::new("stockpile-test-no-such-binary", 5);
        assert!(ytdlp.search("   ").unwrap().is_empty());
    }

    #[test]
    fn download_command_uses_score_prefixed_template() {
        let ytdlp = YtDlp::new("yt-dlp", 5);
        let request = DownloadRequest {
            candidate: ScoredCandidate {
                candidate: VideoCandidate {
                    id: "abc".into(),
                    title: "Ocean".into(),
                    description: String::new(),
                    duration_secs: 30,
                    url: "https://youtu.be/abc".into(),
                },
                score: 9,
            },
            target_dir: PathBuf::from("/out/ocean"),
            file_stem: "score09_Ocean".into(),
            max_bytes: 1024,
        };
        let args: Vec<String> = ytdlp
            .download_command(&request)
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.contains(&"/out/ocean/score09_Ocean.%(ext)s".to_string()));
        assert!(args.windows(2).any(|w| w == ["--max-filesize", "1024"]));
        assert_eq!(args.last().map(String::as_str), Some("https://youtu.be/abc"));
    }
}
