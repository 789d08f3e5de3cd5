//! Media processing pipeline.
//!
//! Every admitted input flows through:
//! 1. Transcribe the media file
//! 2. Extract search phrases from the transcript
//! 3. Lay out the project directory
//! 4. Per phrase: search, evaluate, download (and mirror)
//! 5. Clean up empty folders and notify
//!
//! Stages run strictly in order; a run ends `completed` or `failed`.

pub mod layout;
pub mod orchestrator;
pub mod state;
pub mod types;

pub use orchestrator::{OrchestratorSettings, PipelineOrchestrator};
pub use state::{PipelineRun, RunStage};
pub use types::{InputUnit, RunOutcome, RunSummary, SourceTag, SupportedFormats};
