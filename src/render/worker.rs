use async_channel::Receiver;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::*;

use super::{RenderEngine, RenderError, RenderInput, RenderResult, RenderTask, Repairer};
use crate::cleanup::clean_scene_code;
use crate::config::PipelineSettings;

#[derive(Debug, Clone, Copy)]
pub struct RenderLimits {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    /// Budget for the whole task, repairs included. Starts when a worker
    /// picks the task off the queue.
    pub task_timeout: Duration,
}

impl From<&PipelineSettings> for RenderLimits {
    fn from(settings: &PipelineSettings) -> Self {
        RenderLimits {
            max_attempts: settings.max_render_attempts,
            attempt_timeout: settings.render_attempt_timeout(),
            task_timeout: settings.render_task_timeout(),
        }
    }
}

/// Renders one section, repairing the artifact between failed attempts.
pub struct RenderWorker {
    engine: Arc<dyn RenderEngine>,
    repairer: Arc<dyn Repairer>,
    limits: RenderLimits,
}

/// A task on the render queue together with its reply slot.
pub(super) struct Envelope {
    pub task: RenderTask,
    pub token: CancellationToken,
    pub reply: oneshot::Sender<RenderResult>,
}

impl RenderWorker {
    pub fn new(engine: Arc<dyn RenderEngine>, repairer: Arc<dyn Repairer>, limits: RenderLimits) -> Self {
        RenderWorker {
            engine,
            repairer,
            limits,
        }
    }

    /// Runs up to `max_attempts` render attempts. Never panics on a failed
    /// section; every path ends in a [`RenderResult`].
    #[instrument(skip_all, fields(job_id = %task.job_id, section = task.index()))]
    pub async fn render(&self, task: RenderTask) -> RenderResult {
        let index = task.index();
        let work_dir = task.work_dir();
        if let Err(err) = fs::create_dir_all(&work_dir).await {
            return RenderResult::failure(index, RenderError::Io(err).detail());
        }

        let mut code = task.artifact.code.clone();
        let mut attempt = 1;
        loop {
            let source = task.source_path(attempt);
            if let Err(err) = fs::write(&source, &code).await {
                return RenderResult::failure(index, RenderError::Io(err).detail());
            }

            debug!(message = "Render attempt", attempt, max_attempts = self.limits.max_attempts);
            let failure = match self.attempt(index, &code, &source, &work_dir).await {
                Ok(output) => {
                    let target = task.output_path();
                    return match fs::rename(&output, &target).await {
                        Ok(()) => {
                            info!(message = "Section rendered", attempts = attempt, output = ?target);
                            RenderResult::Success {
                                index,
                                output: target,
                                attempts: attempt,
                            }
                        }
                        Err(err) => RenderResult::failure(index, RenderError::Io(err).detail()),
                    };
                }
                Err(failure) => failure,
            };

            if !failure.is_repairable() || attempt >= self.limits.max_attempts {
                warn!(message = "Section failed", attempts = attempt, error = %failure);
                return RenderResult::failure(index, failure.detail());
            }

            warn!(message = "Render failed, requesting repair", attempt, error = %failure);
            match self.repairer.repair(&code, &failure).await {
                Ok(revised) => code = clean_scene_code(&revised),
                Err(err) => {
                    warn!(message = "Repair failed", error = %err);
                    return RenderResult::failure(
                        index,
                        format!("{}\n\nrepair failed: {err}", failure.detail()),
                    );
                }
            }
            attempt += 1;
        }
    }

    async fn attempt(
        &self,
        index: u32,
        code: &str,
        source: &Path,
        work_dir: &Path,
    ) -> Result<PathBuf, RenderError> {
        let input = RenderInput {
            index,
            code,
            source,
            work_dir,
        };
        let outcome = tokio::time::timeout(self.limits.attempt_timeout, self.engine.render(&input))
            .await
            .map_err(|_| RenderError::TimedOut(self.limits.attempt_timeout))?
            .map_err(RenderError::Launch)?;

        let succeeded = outcome.succeeded();
        match outcome.output {
            Some(output) if succeeded && fs::try_exists(&output).await.unwrap_or(false) => Ok(output),
            output => Err(RenderError::Failed {
                exit_code: outcome.exit_code,
                output_missing: output.is_none(),
                stdout: outcome.stdout,
                stderr: outcome.stderr,
            }),
        }
    }
}

/// Pulls tasks off the render queue until the queue closes or `cancel_token`
/// fires.
pub(super) async fn start(
    cancel_token: CancellationToken,
    recv_from_queue: Receiver<Envelope>,
    worker: Arc<RenderWorker>,
) {
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Render worker cancelled");
                break;
            },
            envelope = recv_from_queue.recv() => {
                match envelope {
                    Err(_) => {
                        debug!("Render queue closed");
                        break;
                    },
                    Ok(envelope) => process(envelope, &worker, &cancel_token).await,
                }
            }
        }
    }
    info!("Render worker stopped.");
}

async fn process(envelope: Envelope, worker: &RenderWorker, shutdown: &CancellationToken) {
    let Envelope { task, token, reply } = envelope;
    let index = task.index();
    if token.is_cancelled() || reply.is_closed() {
        debug!(message = "Skipping abandoned render task", section = index);
        return;
    }

    let limit = worker.limits.task_timeout;
    let result = tokio::select! {
        _ = token.cancelled() => RenderResult::failure(index, RenderError::Cancelled.to_string()),
        _ = shutdown.cancelled() => RenderResult::failure(index, RenderError::Cancelled.to_string()),
        result = tokio::time::timeout(limit, worker.render(task)) => match result {
            Ok(result) => result,
            Err(_) => {
                warn!(message = "Render task timed out", section = index, timeout = ?limit);
                RenderResult::failure(index, format!("render task timed out after {limit:?}"))
            }
        },
    };

    // Nobody is waiting any more when the handle was dropped.
    if reply.send(result).is_err() {
        debug!(message = "Render result discarded", section = index);
    }
}
