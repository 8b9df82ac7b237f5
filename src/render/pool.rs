use async_channel::Sender;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::*;

use super::worker::{self, Envelope};
use super::{RenderResult, RenderTask, RenderWorker};

/// Fixed set of render workers shared by every job in the process.
///
/// Submitting never blocks: tasks queue up until a worker is free.
pub struct RenderPool {
    send_to_queue: Sender<Envelope>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cancel_token: CancellationToken,
}

impl RenderPool {
    pub fn start(workers_count: u16, cancel_token: CancellationToken, worker: Arc<RenderWorker>) -> Self {
        let (send_to_queue, recv_from_queue) = async_channel::unbounded::<Envelope>();

        let mut workers = vec![];
        for id in 0..workers_count {
            let cancel_token = cancel_token.clone();
            let recv_from_queue = recv_from_queue.clone();
            let worker = worker.clone();
            let join_handle = tokio::spawn(
                async move {
                    worker::start(cancel_token, recv_from_queue, worker).await;
                }
                .instrument(info_span!("render_worker", id)),
            );
            workers.push(join_handle);
        }
        debug!(message = "Render pool started", workers = workers_count);

        RenderPool {
            send_to_queue,
            workers: Mutex::new(workers),
            cancel_token,
        }
    }

    /// Queues `task`. The task is cancelled when `parent` is cancelled or the
    /// returned handle is dropped.
    pub fn submit(&self, task: RenderTask, parent: &CancellationToken) -> RenderHandle {
        let index = task.index();
        let token = parent.child_token();
        let (reply, recv_reply) = oneshot::channel();

        let envelope = Envelope {
            task,
            token: token.clone(),
            reply,
        };
        // Only fails after shutdown; the dropped reply then resolves the handle.
        if self.send_to_queue.try_send(envelope).is_err() {
            warn!(message = "Render pool is closed, task dropped", section = index);
        }

        RenderHandle {
            index,
            recv_reply,
            _guard: token.drop_guard(),
        }
    }

    /// Stops accepting tasks and waits for the workers to drain the queue.
    pub async fn shutdown(&self) {
        self.send_to_queue.close();
        let workers = std::mem::take(&mut *self.workers.lock().await);
        for result in futures::future::join_all(workers).await {
            if let Err(err) = result {
                error!(message = "Render worker panicked", error = ?err);
            }
        }
        info!("Render pool stopped.");
    }

    /// Cancels every in-flight task and stops the workers.
    pub async fn abort(&self) {
        self.cancel_token.cancel();
        self.shutdown().await;
    }
}

/// Claim on one section's eventual [`RenderResult`].
pub struct RenderHandle {
    index: u32,
    recv_reply: oneshot::Receiver<RenderResult>,
    _guard: DropGuard,
}

impl RenderHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Waits for the worker's result. The task's own time budget is enforced
    /// by the worker from the moment it is dequeued, so queue time behind
    /// other tasks is not charged against it.
    pub async fn wait(self) -> RenderResult {
        let RenderHandle {
            index,
            recv_reply,
            _guard,
        } = self;

        match recv_reply.await {
            Ok(result) => result,
            Err(_) => RenderResult::failure(index, "render task was dropped before completing"),
        }
    }
}
