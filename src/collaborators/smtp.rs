//! Run notifications by email, sent over SMTP with lettre.

use std::fmt::Write as _;

use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use crate::collaborators::Notifier;
use crate::error::CollaboratorError;
use crate::pipeline::types::{RunOutcome, RunSummary};

pub const SUCCESS_SUBJECT: &str = "Your B-roll videos are ready";
pub const FAILURE_SUBJECT: &str = "Issue with your B-roll processing";

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    /// Recipient; also used as the sender address.
    pub recipient: String,
}

pub struct SmtpNotifier {
    settings: SmtpSettings,
}

impl SmtpNotifier {
    pub fn new(settings: SmtpSettings) -> Self {
        Self { settings }
    }

    fn send_email(&self, subject: &str, body: String) -> Result<(), CollaboratorError> {
        let creds = Credentials::new(
            self.settings.username.clone(),
            self.settings.password.expose_secret().to_string(),
        );

        let transport = SmtpTransport::relay(&self.settings.host)
            .map_err(|e| CollaboratorError::Validation(format!("SMTP relay error: {e}")))?
            .port(self.settings.port)
            .credentials(creds)
            .build();

        let address = self
            .settings
            .recipient
            .parse::<lettre::message::Mailbox>()
            .map_err(|e| CollaboratorError::Validation(format!("Invalid notification address: {e}")))?;

        let email = Message::builder()
            .from(address.clone())
            .to(address)
            .subject(subject)
            .body(body)
            .map_err(|e| CollaboratorError::Validation(format!("Failed to build email: {e}")))?;

        transport
            .send(&email)
            .map_err(|e| classify_smtp_error(&e))?;

        info!(to = %self.settings.recipient, subject, "Notification email sent");
        Ok(())
    }
}

fn classify_smtp_error(e: &lettre::transport::smtp::Error) -> CollaboratorError {
    let message = format!("SMTP send failed: {e}");
    if e.is_transient() || e.is_timeout() {
        CollaboratorError::Unavailable(message)
    } else if e.is_permanent() {
        CollaboratorError::classify(message)
    } else {
        CollaboratorError::Network(message)
    }
}

impl Notifier for SmtpNotifier {
    fn notify(&self, summary: &RunSummary) -> Result<(), CollaboratorError> {
        let (subject, body) = render_notification(summary);
        self.send_email(subject, body)
    }
}

/// Subject and plain-text body for a run summary.
pub fn render_notification(summary: &RunSummary) -> (&'static str, String) {
    let location = match (&summary.remote_project, &summary.project_path) {
        (Some(remote), _) => format!("Remote folder: {remote}"),
        (None, Some(local)) => format!("Local folder: {}", local.display()),
        (None, None) => String::new(),
    };

    let mut body = String::new();
    match summary.outcome {
        RunOutcome::Succeeded => {
            let _ = writeln!(body, "Your B-roll videos have been processed and are ready.\n");
            let _ = writeln!(body, "- Input file: {}", summary.input.file_name());
            let _ = writeln!(body, "- Took {}", summary.elapsed_display());
            let _ = writeln!(body, "- Searched {} phrases", summary.phrases_processed);
            let _ = writeln!(body, "- Found {} videos", summary.files_downloaded);
            if !location.is_empty() {
                let _ = writeln!(body, "\n{location}");
            }
            (SUCCESS_SUBJECT, body)
        }
        RunOutcome::Failed => {
            let _ = writeln!(body, "stockpile ran into an issue while processing your B-roll videos.\n");
            let _ = writeln!(body, "- Input file: {}", summary.input.file_name());
            let _ = writeln!(body, "- Took {}", summary.elapsed_display());
            if let Some(reason) = &summary.failure_reason {
                let _ = writeln!(body, "- Error: {reason}");
            }
            if !location.is_empty() {
                let _ = writeln!(body, "\n{location}");
            }
            let _ = writeln!(
                body,
                "\nYou can try processing the file again or check the logs for more details."
            );
            (FAILURE_SUBJECT, body)
        }
    }
}
