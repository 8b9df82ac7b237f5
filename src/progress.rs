//! Per-job progress events.
//!
//! Each job gets its own unbounded channel. Events are append-only,
//! percentages never go backwards, and the stream ends with exactly one
//! `completed` or `failed` event.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::*;

use crate::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Planning,
    Planned,
    Generating,
    Rendered,
    Joining,
    Completed,
    Failed,
}

impl Stage {
    /// Checkpoint percentage. `Failed` keeps whatever was reached.
    pub fn percentage(self) -> Option<u8> {
        match self {
            Stage::Planning => Some(5),
            Stage::Planned | Stage::Generating => Some(15),
            Stage::Rendered => Some(75),
            Stage::Joining => Some(80),
            Stage::Completed => Some(100),
            Stage::Failed => None,
        }
    }

    fn status(self) -> Status {
        match self {
            Stage::Completed => Status::Completed,
            Stage::Failed => Status::Failed,
            _ => Status::Processing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub status: Status,
    pub stage: Stage,
    pub percentage: u8,
    pub message: String,
    pub job_id: JobId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cached: bool,
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        self.status != Status::Processing
    }

    /// Server-sent-events framing.
    pub fn to_sse(&self) -> Result<String, serde_json::Error> {
        Ok(format!("data: {}\n\n", serde_json::to_string(self)?))
    }
}

pub struct ProgressReporter {
    job_id: JobId,
    sender: mpsc::UnboundedSender<ProgressEvent>,
    percentage: u8,
    finished: bool,
    receiver_gone: bool,
}

impl ProgressReporter {
    pub fn new(job_id: JobId, sender: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        ProgressReporter {
            job_id,
            sender,
            percentage: 0,
            finished: false,
            receiver_gone: false,
        }
    }

    pub fn channel(job_id: JobId) -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(job_id, sender), receiver)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn stage(&mut self, stage: Stage, message: impl Into<String>, payload: Option<Value>) {
        self.emit(stage, message.into(), payload, false);
    }

    pub fn completed(&mut self, message: impl Into<String>, payload: Value, cached: bool) {
        self.emit(Stage::Completed, message.into(), Some(payload), cached);
    }

    pub fn failed(&mut self, message: impl Into<String>, detail: Option<String>) {
        let payload = detail.map(|detail| serde_json::json!({ "error": detail }));
        self.emit(Stage::Failed, message.into(), payload, false);
    }

    fn emit(&mut self, stage: Stage, message: String, payload: Option<Value>, cached: bool) {
        if self.finished {
            debug!(message = "Dropping event after terminal event", job_id = %self.job_id, stage = ?stage);
            return;
        }

        if let Some(percentage) = stage.percentage() {
            self.percentage = self.percentage.max(percentage);
        }
        let event = ProgressEvent {
            status: stage.status(),
            stage,
            percentage: self.percentage,
            message,
            job_id: self.job_id.clone(),
            payload,
            cached,
        };
        self.finished = event.is_terminal();
        debug!(message = "Progress", job_id = %self.job_id, stage = ?stage, percentage = self.percentage);

        if self.sender.send(event).is_err() && !self.receiver_gone {
            self.receiver_gone = true;
            warn!(message = "Progress receiver closed, events are no longer delivered", job_id = %self.job_id);
        }
    }
}
