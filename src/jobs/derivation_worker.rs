use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use super::{run_with_retry, JobOutcome, RetryPolicy};
use crate::app::derivation::DerivationEngine;
use crate::infra::queue::QueueClient;

const POLL_WAIT_SECONDS: i32 = 10;
const IDLE_SLEEP_MS: u64 = 200;
const ERROR_BACKOFF_MS: u64 = 1000;

/// Consume derivation jobs from the durable queue until cancelled.
///
/// A message is deleted once its job has completed, been discarded, or used
/// up its attempts; anything else leaves it to reappear after the queue's
/// visibility timeout.
pub async fn run(engine: Arc<DerivationEngine>, queue: QueueClient, retry: RetryPolicy) -> Result<()> {
    info!(queue = queue.queue_name(), "derivation worker started");
    loop {
        match queue.receive_job(POLL_WAIT_SECONDS).await {
            Ok(Some(message)) => {
                let outcome = run_with_retry(&engine, message.job.clone(), &retry).await;
                if outcome == JobOutcome::GaveUp {
                    warn!(media_id = %message.job.media_id, "dropping derivation job after final attempt");
                }
                if let Err(err) = queue.delete_message(&message.receipt_handle).await {
                    warn!(error = ?err, "failed to delete queue message");
                }
            }
            Ok(None) => {
                tokio::time::sleep(Duration::from_millis(IDLE_SLEEP_MS)).await;
            }
            Err(err) => {
                warn!(error = ?err, "queue receive failed, backing off");
                tokio::time::sleep(Duration::from_millis(ERROR_BACKOFF_MS)).await;
            }
        }
    }
}
