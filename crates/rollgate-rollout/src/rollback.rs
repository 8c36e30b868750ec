//! Rollback executor.
//!
//! Runs the plan's single revert action with bounded retries. Each
//! attempt is capped by `rollback.timeout`; failed attempts back off
//! exponentially from `policy.retry_backoff`. Exhausting the attempts is
//! final: nothing here retries past `1 + max_retries`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use rollgate_core::{RollbackPolicy, RollbackSpec};
use rollgate_health::{CancelToken, Interrupt};
use rollgate_state::ActionOutcome;

use crate::executor::{CommandExecutor, run_action};

const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevertOutcome {
    Reverted { attempts: u32 },
    Exhausted { attempts: u32, last_error: String },
}

#[derive(Clone)]
pub struct RollbackExecutor {
    executor: Arc<dyn CommandExecutor>,
    spec: RollbackSpec,
    max_retries: u32,
    retry_backoff: Duration,
}

impl RollbackExecutor {
    pub fn new(executor: Arc<dyn CommandExecutor>, spec: &RollbackSpec, policy: &RollbackPolicy) -> Self {
        Self {
            executor,
            spec: spec.clone(),
            max_retries: policy.max_retries,
            retry_backoff: policy.retry_backoff,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before attempt `attempt + 1`, given `attempt` failures so far.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.retry_backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }

    /// Revert `target`. `on_attempt` sees every attempt's outcome as it
    /// happens so the caller can record it.
    pub async fn revert(
        &self,
        target: &str,
        cancel: &mut CancelToken,
        on_attempt: &mut (dyn FnMut(u32, &ActionOutcome) + Send),
    ) -> Result<RevertOutcome, Interrupt> {
        let max_attempts = self.max_attempts();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            info!(%target, action = %self.spec.action.name, attempt, max_attempts, "rollback attempt");
            let outcome = run_action(
                self.executor.as_ref(),
                target,
                &self.spec.action,
                self.spec.timeout,
                cancel,
            )
            .await?;
            on_attempt(attempt, &outcome);

            match outcome {
                ActionOutcome::Success { .. } => {
                    return Ok(RevertOutcome::Reverted { attempts: attempt });
                }
                ActionOutcome::Failure { reason } => last_error = reason,
                ActionOutcome::TimedOut => {
                    last_error = format!("timed out after {:?}", self.spec.timeout);
                }
            }
            warn!(%target, attempt, error = %last_error, "rollback attempt failed");

            if attempt < max_attempts {
                cancel.sleep(self.backoff(attempt)).await?;
            }
        }

        Ok(RevertOutcome::Exhausted {
            attempts: max_attempts,
            last_error,
        })
    }
}
