pub mod derivation_worker;
pub mod pool;

use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::app::derivation::DerivationEngine;
pub use crate::app::derivation::DerivationJob;
use crate::error::MediaResult;

/// Hands derivation jobs to whatever runs them.
#[async_trait]
pub trait JobSubmitter: Send + Sync {
    async fn submit(&self, job: DerivationJob) -> MediaResult<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Discarded,
    GaveUp,
}

/// Run `job`, re-running only the failed derivations with exponential
/// backoff until everything succeeds or the attempts are used up.
pub async fn run_with_retry(engine: &DerivationEngine, job: DerivationJob, retry: &RetryPolicy) -> JobOutcome {
    let mut job = job;
    let mut attempt = 1;
    loop {
        let next = match engine.execute(&job).await {
            Ok(report) if report.discarded => return JobOutcome::Discarded,
            Ok(report) if report.is_success() => {
                if attempt > 1 {
                    info!(media_id = %job.media_id, attempt, "derivations recovered on retry");
                }
                return JobOutcome::Completed;
            }
            Ok(report) => job.retry_for(&report),
            Err(err) => {
                warn!(media_id = %job.media_id, attempt, error = %err, "derivation job failed");
                job.clone()
            }
        };

        if attempt >= retry.max_attempts {
            error!(
                media_id = %job.media_id,
                attempts = attempt,
                pending = ?next.names,
                "giving up on derivations"
            );
            return JobOutcome::GaveUp;
        }

        tokio::time::sleep(retry.delay_for(attempt)).await;
        attempt += 1;
        job = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(retry.delay_for(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for(3), Duration::from_millis(350));
        assert_eq!(retry.delay_for(40), Duration::from_millis(350));
    }
}
