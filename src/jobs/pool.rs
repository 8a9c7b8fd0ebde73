use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{run_with_retry, DerivationJob, JobSubmitter, RetryPolicy};
use crate::app::derivation::DerivationEngine;
use crate::error::{MediaError, MediaResult};

const QUEUE_CAPACITY: usize = 1024;

/// Submitter side of the in-process worker pool.
#[derive(Clone)]
pub struct InProcessQueue {
    sender: mpsc::Sender<DerivationJob>,
}

impl InProcessQueue {
    pub fn channel() -> (Self, mpsc::Receiver<DerivationJob>) {
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl JobSubmitter for InProcessQueue {
    async fn submit(&self, job: DerivationJob) -> MediaResult<()> {
        self.sender
            .send(job)
            .await
            .map_err(|_| MediaError::Dispatch(anyhow::anyhow!("derivation worker pool has shut down")))
    }
}

/// Tokio workers draining an [`InProcessQueue`], at most `concurrency` jobs at a time.
pub struct WorkerPool {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl WorkerPool {
    pub fn spawn(
        engine: Arc<DerivationEngine>,
        mut receiver: mpsc::Receiver<DerivationJob>,
        concurrency: usize,
        retry: RetryPolicy,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let concurrency = concurrency.max(1);

        let handle = tokio::spawn(async move {
            let permits = Arc::new(Semaphore::new(concurrency));
            info!(concurrency, "derivation workers started");

            loop {
                let job = tokio::select! {
                    _ = token.cancelled() => break,
                    job = receiver.recv() => job,
                };
                match job {
                    Some(job) => dispatch(&engine, &permits, job, retry).await,
                    None => break,
                }
            }

            // Finish what was already queued before stopping.
            receiver.close();
            while let Some(job) = receiver.recv().await {
                dispatch(&engine, &permits, job, retry).await;
            }
            if permits.acquire_many(concurrency as u32).await.is_err() {
                warn!("worker semaphore closed during shutdown");
            }
            info!("derivation workers stopped");
        });

        Self { shutdown, handle }
    }

    /// Stop accepting jobs and wait for queued and running ones to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(err) = self.handle.await {
            warn!(error = %err, "derivation worker task panicked");
        }
    }
}

async fn dispatch(engine: &Arc<DerivationEngine>, permits: &Arc<Semaphore>, job: DerivationJob, retry: RetryPolicy) {
    let permit = match permits.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };
    let engine = engine.clone();
    tokio::spawn(async move {
        run_with_retry(&engine, job, &retry).await;
        drop(permit);
    });
}
