use std::path::PathBuf;
use thiserror::Error;

use crate::mux::MuxError;
use crate::providers::ProviderError;

/// Planning failures abort the job; there is no retry at this level.
#[derive(Debug, Error)]
pub enum PlanningError {
    #[error("planning provider failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("no provider available for planning")]
    NoProvider,

    #[error("plan response is not valid JSON: {reason}")]
    Malformed { reason: String, raw: String },
}

/// Content generation failure for a single section. Never fatal to the job.
#[derive(Debug, Error)]
pub enum SectionError {
    #[error("section {index}: no content provider supports this request")]
    NoProvider { index: u32 },

    #[error("section {index}: content generation failed: {source}")]
    Generation {
        index: u32,
        #[source]
        source: ProviderError,
    },

    #[error("section {index}: generated content was empty")]
    EmptyContent { index: u32 },
}

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("no sections were successfully rendered ({succeeded} of {attempted} succeeded)")]
    NoSuccessfulSections {
        attempted: usize,
        succeeded: usize,
        failures: Vec<(u32, String)>,
    },

    #[error("concatenation failed: {0}")]
    Mux(#[from] MuxError),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Job-level failures. Each one ends the event stream with a `failed` event.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error(transparent)]
    Planning(#[from] PlanningError),

    #[error(transparent)]
    Join(#[from] JoinError),

    #[error("could not prepare job workspace {path}: {source}")]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("job cancelled")]
    Cancelled,

    #[error("job exceeded its {0} second time limit")]
    TimedOut(u64),
}

impl PipelineError {
    /// Full diagnostic text for the terminal event. Mux output and per-section
    /// failures are reported verbatim.
    pub fn detail(&self) -> String {
        match self {
            PipelineError::Planning(PlanningError::Malformed { reason, raw }) => {
                format!("{reason}\n\nraw response:\n{raw}")
            }
            PipelineError::Join(JoinError::NoSuccessfulSections { failures, .. }) => failures
                .iter()
                .map(|(index, error)| format!("section {index}: {error}"))
                .collect::<Vec<_>>()
                .join("\n"),
            PipelineError::Join(JoinError::Mux(err)) => err.diagnostic(),
            other => other.to_string(),
        }
    }
}
