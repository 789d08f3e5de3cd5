//! Gemini phrase extraction and candidate evaluation over HTTP.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::collaborators::{
    normalize_phrases, CandidateEvaluator, Evaluation, PhraseExtractor, VideoCandidate, MAX_SCORE,
    MIN_SCORE,
};
use crate::error::CollaboratorError;

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

pub const DEFAULT_MODEL: &str = "gemini-2.0-flash-001";

const EXTRACT_TEMPERATURE: f32 = 0.85;
const EVALUATE_TEMPERATURE: f32 = 0.1;

/// Characters of a candidate description included in the evaluation prompt.
const DESCRIPTION_PREVIEW: usize = 200;

static QUOTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""([^"]+)""#).expect("quoted string pattern is valid"));

static ID_SCORE_PAIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""video_id":\s*"([^"]+)".*?"score":\s*(\d+)"#).expect("pair pattern is valid")
});

/// Gemini client used for both AI roles.
pub struct GeminiClient {
    api_key: SecretString,
    model: String,
    client: reqwest::blocking::Client,
}

impl GeminiClient {
    pub fn new(api_key: SecretString, model: impl Into<String>) -> Result<Self, CollaboratorError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| CollaboratorError::Internal(format!("HTTP client setup failed: {e}")))?;
        let model = model.into();
        info!(model = %model, "Initialized Gemini client");
        Ok(Self {
            api_key,
            model,
            client,
        })
    }

    fn api_url(&self) -> String {
        format!("{API_BASE}/{}:generateContent", self.model)
    }

    /// Send one prompt and return the model's text.
    fn generate(&self, prompt: &str, temperature: f32) -> Result<String, CollaboratorError> {
        let body = serde_json::json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": { "temperature": temperature },
        });

        let resp = self
            .client
            .post(self.api_url())
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(&body)
            .send()
            .map_err(map_transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().unwrap_or_default();
            return Err(CollaboratorError::from_status(status.as_u16(), text));
        }

        let parsed: GenerateResponse = resp
            .json()
            .map_err(|e| CollaboratorError::Validation(format!("Malformed Gemini response: {e}")))?;
        Ok(parsed.text())
    }
}

fn map_transport_error(e: reqwest::Error) -> CollaboratorError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        CollaboratorError::Network(e.to_string())
    } else {
        CollaboratorError::classify(e.to_string())
    }
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<ResponseCandidate>,
}

#[derive(Debug, Deserialize)]
struct ResponseCandidate {
    content: Option<ResponseContent>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

impl GenerateResponse {
    fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| {
                c.parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<String>()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct RawEvaluation {
    video_id: String,
    score: f64,
}

// ── Roles ───────────────────────────────────────────────────────────

impl PhraseExtractor for GeminiClient {
    fn extract_phrases(&self, transcript: &str) -> Result<Vec<String>, CollaboratorError> {
        if transcript.trim().is_empty() {
            warn!("Empty transcript provided for phrase extraction");
            return Ok(Vec::new());
        }
        let text = self.generate(&extraction_prompt(transcript), EXTRACT_TEMPERATURE)?;
        let phrases = parse_phrases(&text);
        info!(count = phrases.len(), "Extracted search phrases");
        Ok(phrases)
    }
}

impl CandidateEvaluator for GeminiClient {
    fn evaluate(
        &self,
        phrase: &str,
        candidates: &[VideoCandidate],
    ) -> Result<Vec<Evaluation>, CollaboratorError> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let text = self.generate(&evaluation_prompt(phrase, candidates), EVALUATE_TEMPERATURE)?;
        let evaluations = parse_evaluations(&text);
        debug!(phrase, kept = evaluations.len(), of = candidates.len(), "Evaluated candidates");
        Ok(evaluations)
    }
}

// ── Prompts & parsing ───────────────────────────────────────────────

fn extraction_prompt(transcript: &str) -> String {
    format!(
        r#"You turn transcripts into stock-footage search phrases an editor can paste into a video search.

OUTPUT
Return one JSON string array and nothing else.
Example: ["Berlin Wall falling", "vintage CRT monitor close-up", "Mao era parade"]

RULES
- At least 10 phrases.
- 2 to 6 words each.
- Each names a tangible scene, person, object or event, never a pure idea.
- Use simple connectors ("with", "in", "during") to relate entities.
- No duplicates, no markdown, no extra keys, no surrounding text.

TRANSCRIPT
<<<
{transcript}
>>>"#
    )
}

fn evaluation_prompt(phrase: &str, candidates: &[VideoCandidate]) -> String {
    let listing: String = candidates
        .iter()
        .map(|c| {
            let description = if c.description.is_empty() {
                "N/A".to_string()
            } else {
                c.description.chars().take(DESCRIPTION_PREVIEW).collect()
            };
            format!(
                "ID: {}\nTitle: {}\nDescription: {}\nDuration: {}s\nURL: {}\n---\n",
                c.id, c.title, description, c.duration_secs, c.url
            )
        })
        .collect();

    format!(
        r#"You select the most visually relevant videos for a B-roll search phrase.

SEARCH PHRASE:
"{phrase}"

RESULTS:
---
{listing}
TASK:
1. Compare each title and description against the search phrase.
2. Prefer cinematic shots, stock footage and documentary clips. Avoid vlogs, talk shows, tutorials and heavy branding.
3. Rate each video from 1 to 10 for B-roll potential.

OUTPUT:
A JSON array of objects with video_id and score for videos scoring {MIN_SCORE} or higher, highest first.
Format: [{{"video_id": "abc123", "score": 9}}, {{"video_id": "def456", "score": 7}}]
Return only the JSON array."#
    )
}

/// Locate the JSON array in a model reply.
///
/// Shapes tried, in order:
/// - the reply is the array itself
/// - the array is the body of a fenced block; the fence may carry a
///   language tag, and blocks that hold something else are skipped
/// - the array sits inside prose: the span from the first `[` to the last `]`
///
/// `None` means the reply has no bracketed span at all.
fn json_array_span(text: &str) -> Option<&str> {
    let text = text.trim();
    if text.starts_with('[') {
        return Some(text);
    }

    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after_open = &rest[open + 3..];
        let Some(close) = after_open.find("```") else {
            break;
        };
        let block = &after_open[..close];
        let body = match block.split_once('\n') {
            Some((tag, body)) if tag.trim().chars().all(|c| c.is_ascii_alphanumeric()) => body,
            _ => block,
        }
        .trim();
        if body.starts_with('[') {
            return Some(body);
        }
        rest = &after_open[close + 3..];
    }

    let start = text.find('[')?;
    let end = text.rfind(']')?;
    (end > start).then(|| &text[start..=end])
}

fn parse_phrases(text: &str) -> Vec<String> {
    let json = json_array_span(text).unwrap_or(text);
    match serde_json::from_str::<Vec<String>>(json) {
        Ok(phrases) => normalize_phrases(phrases),
        Err(e) => {
            warn!(error = %e, "Phrase response is not a JSON array; falling back to quoted strings");
            let quoted: Vec<&str> = QUOTED
                .captures_iter(text)
                .filter_map(|c| c.get(1).map(|m| m.as_str()))
                .collect();
            if !quoted.is_empty() {
                return normalize_phrases(quoted);
            }
            normalize_phrases(
                text.lines()
                    .map(|l| l.trim_matches(|c: char| c.is_whitespace() || "-*•".contains(c)))
                    .filter(|l| l.chars().count() < 50),
            )
        }
    }
}

fn parse_evaluations(text: &str) -> Vec<Evaluation> {
    let json = json_array_span(text).unwrap_or(text);
    let raw: Vec<RawEvaluation> = match serde_json::from_str(json) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(error = %e, "Evaluation response is not a JSON array; scanning for id/score pairs");
            ID_SCORE_PAIR
                .captures_iter(text)
                .filter_map(|c| {
                    Some(RawEvaluation {
                        video_id: c.get(1)?.as_str().to_string(),
                        score: c.get(2)?.as_str().parse().ok()?,
                    })
                })
                .collect()
        }
    };

    let mut evaluations: Vec<Evaluation> = raw
        .into_iter()
        .filter_map(|r| {
            let in_range = r.score >= f64::from(MIN_SCORE) && r.score <= f64::from(MAX_SCORE);
            if !in_range {
                debug!(video_id = %r.video_id, score = r.score, "Dropping out-of-range score");
                return None;
            }
            Some(Evaluation {
                id: r.video_id,
                score: r.score.round() as u8,
            })
        })
        .collect();
    evaluations.sort_by(|a, b| b.score.cmp(&a.score));
    evaluations
}
