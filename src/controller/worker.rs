//! Reconcile worker pool
//!
//! A fixed number of tasks pull keys from the work queue and reconcile them.
//! The queue never hands the same key to two workers, so reconciles of one
//! proxy are serialized while different proxies run in parallel.

use std::sync::Arc;

use futures::future::join_all;
use kube::runtime::events::EventType;
use kube::Resource;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{reconcile, Context, ObjectKey, ReconcileOutcome};
use crate::events::{actions, reasons};
use crate::queue::WorkQueue;
use crate::Error;

/// Runs reconciles for queued keys
pub struct WorkerPool {
    queue: Arc<WorkQueue<ObjectKey>>,
    ctx: Arc<Context>,
    workers: usize,
    max_retries: u32,
}

impl WorkerPool {
    /// Create a pool of `workers` tasks (at least one). A failing key is
    /// retried at most `max_retries` times before it is dropped.
    pub fn new(
        queue: Arc<WorkQueue<ObjectKey>>,
        ctx: Arc<Context>,
        workers: usize,
        max_retries: u32,
    ) -> Self {
        Self {
            queue,
            ctx,
            workers: workers.max(1),
            max_retries,
        }
    }

    /// Run until `shutdown` is cancelled and every in-flight reconcile ends
    pub async fn run(&self, shutdown: CancellationToken) {
        let stopper = {
            let queue = Arc::clone(&self.queue);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                shutdown.cancelled().await;
                queue.shutdown();
            })
        };

        info!(workers = self.workers, "starting reconcile workers");
        let handles: Vec<_> = (0..self.workers)
            .map(|id| {
                let queue = Arc::clone(&self.queue);
                let ctx = Arc::clone(&self.ctx);
                let max_retries = self.max_retries;
                tokio::spawn(async move { worker_loop(id, queue, ctx, max_retries).await })
            })
            .collect();

        for result in join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "reconcile worker panicked");
            }
        }
        stopper.abort();
        info!("reconcile workers stopped");
    }
}

async fn worker_loop(
    id: usize,
    queue: Arc<WorkQueue<ObjectKey>>,
    ctx: Arc<Context>,
    max_retries: u32,
) {
    debug!(worker = id, "worker started");
    while let Some(key) = queue.get().await {
        let result = reconcile(&key, &ctx).await;
        handle_result(&queue, &ctx, &key, result, max_retries).await;
        queue.done(&key);
    }
    debug!(worker = id, "worker stopped");
}

/// Decide what happens to a key after a reconcile
async fn handle_result(
    queue: &Arc<WorkQueue<ObjectKey>>,
    ctx: &Context,
    key: &ObjectKey,
    result: Result<ReconcileOutcome, Error>,
    max_retries: u32,
) {
    let error = match result {
        Ok(outcome) => {
            debug!(proxy = %key, ?outcome, "reconcile succeeded");
            queue.forget(key);
            return;
        }
        Err(e) => e,
    };

    if !error.is_retryable() {
        error!(
            proxy = %key,
            error = %error,
            retryable = false,
            "reconcile failed, waiting for a change"
        );
        queue.forget(key);
        return;
    }

    let requeues = queue.num_requeues(key);
    if requeues < max_retries {
        let delay = queue.add_rate_limited(key.clone());
        warn!(
            proxy = %key,
            error = %error,
            attempt = requeues + 1,
            delay_ms = delay.map(|d| d.as_millis() as u64),
            "reconcile failed, requeueing"
        );
        return;
    }

    error!(proxy = %key, error = %error, retries = requeues, "retry budget exhausted, dropping");
    queue.forget(key);

    match ctx.kube.get_proxy(key).await {
        Ok(Some(proxy)) => {
            ctx.events
                .publish(
                    &proxy.object_ref(&()),
                    EventType::Warning,
                    reasons::RETRIES_EXHAUSTED,
                    actions::RECONCILE,
                    Some(format!("gave up after {} retries: {}", requeues, error)),
                )
                .await;
        }
        Ok(None) => {}
        Err(e) => debug!(proxy = %key, error = %e, "cannot load proxy for event"),
    }
}
