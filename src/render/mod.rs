//! Section rendering.
//!
//! A [`RenderTask`] goes through the [`RenderPool`] to a [`RenderWorker`],
//! which drives the external [`RenderEngine`] and, when an attempt fails, asks
//! the [`Repairer`] for a revised artifact before trying again.

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::providers::ProviderError;
use crate::JobId;

mod manim;
mod pool;
mod repair;
mod worker;

pub use manim::ManimEngine;
pub use pool::{RenderHandle, RenderPool};
pub use repair::LlmRepairer;
pub use worker::{RenderLimits, RenderWorker};

/// Generated content for one section, ready to render.
#[derive(Debug, Clone)]
pub struct SectionArtifact {
    pub index: u32,
    pub code: String,
    pub narration: String,
}

#[derive(Debug, Clone)]
pub struct RenderTask {
    pub job_id: JobId,
    pub artifact: SectionArtifact,
    /// Job workspace. The task only writes inside `section_<n>/` and to
    /// `section_<n>.mp4`.
    pub job_dir: PathBuf,
}

impl RenderTask {
    pub fn index(&self) -> u32 {
        self.artifact.index
    }

    pub fn work_dir(&self) -> PathBuf {
        self.job_dir.join(format!("section_{}", self.index()))
    }

    pub fn output_path(&self) -> PathBuf {
        self.job_dir.join(format!("section_{}.mp4", self.index()))
    }

    /// Source file for a given attempt; repaired attempts get their own file.
    pub fn source_path(&self, attempt: u32) -> PathBuf {
        let name = if attempt <= 1 {
            format!("section_{}.py", self.index())
        } else {
            format!("section_{}_repaired_{}.py", self.index(), attempt - 1)
        };
        self.work_dir().join(name)
    }
}

/// Terminal outcome of one section.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RenderResult {
    Success {
        index: u32,
        output: PathBuf,
        attempts: u32,
    },
    Failure {
        index: u32,
        error: String,
    },
}

impl RenderResult {
    pub fn failure(index: u32, error: impl Into<String>) -> Self {
        RenderResult::Failure {
            index,
            error: error.into(),
        }
    }

    pub fn index(&self) -> u32 {
        match self {
            RenderResult::Success { index, .. } | RenderResult::Failure { index, .. } => *index,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RenderResult::Success { .. })
    }

    pub fn output(&self) -> Option<&Path> {
        match self {
            RenderResult::Success { output, .. } => Some(output),
            RenderResult::Failure { .. } => None,
        }
    }
}

#[derive(Debug)]
pub struct RenderInput<'a> {
    pub index: u32,
    pub code: &'a str,
    pub source: &'a Path,
    pub work_dir: &'a Path,
}

/// What the engine reports for one attempt.
#[derive(Debug, Clone, Default)]
pub struct RenderOutcome {
    /// Rendered file, if the engine produced one.
    pub output: Option<PathBuf>,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl RenderOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0) && self.output.is_some()
    }
}

#[async_trait]
pub trait RenderEngine: Send + Sync {
    /// Renders `input.source`, writing only under `input.work_dir`. A non-zero
    /// exit is reported through the outcome, not as an error.
    async fn render(&self, input: &RenderInput<'_>) -> std::io::Result<RenderOutcome>;
}

#[async_trait]
pub trait Repairer: Send + Sync {
    /// Returns a revised artifact for `code` given why it failed.
    async fn repair(&self, code: &str, failure: &RenderError) -> Result<String, ProviderError>;
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("render failed with exit code {exit_code:?}")]
    Failed {
        exit_code: Option<i32>,
        output_missing: bool,
        stdout: String,
        stderr: String,
    },

    #[error("render timed out after {0:?}")]
    TimedOut(Duration),

    #[error("could not launch render engine: {0}")]
    Launch(#[source] std::io::Error),

    #[error("could not stage render files: {0}")]
    Io(#[source] std::io::Error),

    #[error("render cancelled")]
    Cancelled,
}

impl RenderError {
    /// Launch and staging failures skip the repair loop.
    pub fn is_repairable(&self) -> bool {
        matches!(self, RenderError::Failed { .. } | RenderError::TimedOut(_))
    }

    /// Untruncated diagnostic text.
    pub fn detail(&self) -> String {
        match self {
            RenderError::Failed {
                output_missing,
                stdout,
                stderr,
                ..
            } => {
                let missing = if *output_missing { " (no output file)" } else { "" };
                format!("{self}{missing}\n\nstdout:\n{stdout}\n\nstderr:\n{stderr}")
            }
            other => other.to_string(),
        }
    }

    /// Output streams cut to `limit` characters each, for the repair prompt.
    pub fn excerpt(&self, limit: usize) -> (String, String) {
        match self {
            RenderError::Failed { stdout, stderr, .. } => (
                truncate_chars(stdout, limit).to_string(),
                truncate_chars(stderr, limit).to_string(),
            ),
            other => (String::new(), truncate_chars(&other.to_string(), limit).to_string()),
        }
    }
}

/// Cuts `text` to at most `limit` characters on a char boundary.
pub fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((byte_index, _)) => &text[..byte_index],
        None => text,
    }
}
