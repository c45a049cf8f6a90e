//! WorkerGroup - キューを消化するワーカー群
//!
//! 各ワーカーは claim → execute → ack/fail を繰り返します。
//! retry/dead-letter の判断はキュー側（Decider）の責務で、ワーカーは結果を報告するだけです。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::runtime::Runtime;
use crate::domain::{Decision, GuildcastError, TaskFailure};
use crate::queue::{TaskLease, TaskQueue};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// How long one `claim` waits for work before re-checking for shutdown.
    pub claim_wait: Duration,
    /// Pause after a queue error so a broken store is not hammered.
    pub error_backoff: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            claim_wait: Duration::from_secs(1),
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// Worker group handle.
/// - `request_shutdown` で新しい claim を止める（実行中の handler は最後まで走る）
/// - `shutdown_and_join()` で全ワーカーの終了を待てる
pub struct WorkerGroup {
    queue: Arc<dyn TaskQueue>,
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    pub fn spawn(
        n: usize,
        queue: Arc<dyn TaskQueue>,
        runtime: Arc<Runtime>,
        settings: WorkerSettings,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let q = Arc::clone(&queue);
            let rt = Arc::clone(&runtime);
            let settings = settings.clone();
            let mut rx = shutdown_rx.clone();

            let join = tokio::spawn(async move {
                worker_loop(worker_id, q, rt, settings, &mut rx).await;
            });
            joins.push(join);
        }
        info!(workers = n, "worker group started");

        Self {
            queue,
            shutdown_tx,
            joins,
        }
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop claiming, let in-flight tasks finish, wait for every worker.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            if let Err(e) = join.await {
                warn!(error = %e, "worker task ended abnormally");
            }
        }
        info!("worker group stopped");
    }

    /// Resolves once nothing is pending or in progress. Dead letters do not
    /// count; retries waiting out their backoff do.
    pub async fn wait_until_idle(&self, poll_interval: Duration) -> Result<(), GuildcastError> {
        loop {
            if self.queue.counts().await?.is_idle() {
                return Ok(());
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: Arc<dyn TaskQueue>,
    runtime: Arc<Runtime>,
    settings: WorkerSettings,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // claim は待つ可能性があるので select で shutdown と競合させる
        let claimed = tokio::select! {
            changed = shutdown_rx.changed() => {
                // group handle dropped
                if changed.is_err() {
                    break;
                }
                continue;
            }
            claimed = queue.claim(settings.claim_wait) => claimed,
        };

        let lease = match claimed {
            Ok(Some(lease)) => lease,
            Ok(None) => continue,
            Err(e) => {
                warn!(worker_id, error = %e, "claim failed");
                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    _ = tokio::time::sleep(settings.error_backoff) => {}
                }
                continue;
            }
        };

        let task_id = lease.task_id();
        let kind = lease.task().kind();
        debug!(worker_id, %task_id, %kind, "executing task");

        // ここから先は shutdown を見ない（実行中の task は最後まで走らせる）
        let result = runtime.execute(lease.task()).await;
        match result {
            Ok(()) => {
                if let Err(e) = lease.ack().await {
                    warn!(worker_id, %task_id, error = %e, "ack failed");
                }
            }
            Err(err) => match lease.fail(TaskFailure::from(&err)).await {
                Ok(Decision::Retry { delay, .. }) => {
                    debug!(worker_id, %task_id, ?delay, error = %err, "task will be retried");
                }
                Ok(Decision::DeadLetter { .. }) => {
                    debug!(worker_id, %task_id, error = %err, "task dead-lettered");
                }
                Err(e) => {
                    warn!(worker_id, %task_id, error = %e, "failure report failed");
                }
            },
        }
    }
    debug!(worker_id, "worker stopped");
}
