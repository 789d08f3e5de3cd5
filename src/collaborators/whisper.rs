//! Transcription through the `whisper` command-line tool.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::collaborators::Transcriber;
use crate::error::CollaboratorError;

pub struct WhisperCli {
    program: String,
    model: String,
    scratch_root: PathBuf,
}

impl WhisperCli {
    pub fn new(program: impl Into<String>, model: impl Into<String>, scratch_root: PathBuf) -> Self {
        Self {
            program: program.into(),
            model: model.into(),
            scratch_root,
        }
    }

    fn command(&self, input: &Path, out_dir: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg(input)
            .args(["--model", &self.model])
            .args(["--output_format", "txt"])
            .arg("--output_dir")
            .arg(out_dir)
            .args(["--verbose", "False"]);
        cmd
    }
}

impl Transcriber for WhisperCli {
    fn transcribe(&self, path: &Path) -> Result<String, CollaboratorError> {
        if !path.is_file() {
            return Err(CollaboratorError::NotFound(format!(
                "media file {} does not exist",
                path.display()
            )));
        }

        let out_dir = self.scratch_root.join(format!("whisper-{}", Uuid::new_v4()));
        fs::create_dir_all(&out_dir)?;

        info!(path = %path.display(), model = %self.model, "Transcribing");
        let result = run_whisper(self.command(path, &out_dir), path, &out_dir);

        if let Err(e) = fs::remove_dir_all(&out_dir) {
            warn!(dir = %out_dir.display(), error = %e, "Could not remove transcription scratch dir");
        }
        result
    }
}

fn run_whisper(mut cmd: Command, input: &Path, out_dir: &Path) -> Result<String, CollaboratorError> {
    let output = cmd.output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CollaboratorError::classify(format!(
            "whisper exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let transcript_path = out_dir.join(format!("{stem}.txt"));
    let text = fs::read_to_string(&transcript_path).map_err(|e| {
        CollaboratorError::Validation(format!(
            "whisper produced no transcript at {}: {e}",
            transcript_path.display()
        ))
    })?;

    let text = text.trim().to_string();
    debug!(chars = text.len(), "Transcription finished");
    Ok(text)
}
