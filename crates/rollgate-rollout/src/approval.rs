//! Approval gate for phases that need manual sign-off.
//!
//! The gate is polled at the phase boundary until it answers, the
//! approval timeout passes, or the rollout is interrupted.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use rollgate_core::ApprovalConfig;
use rollgate_health::{CancelToken, Interrupt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Granted,
    Denied,
    Pending,
}

pub type ApprovalFuture<'a> =
    Pin<Box<dyn Future<Output = Result<ApprovalStatus, String>> + Send + 'a>>;

pub trait ApprovalGate: Send + Sync {
    /// Current answer for phase `phase` of rollout `rollout_id`.
    fn request<'a>(&'a self, rollout_id: &'a str, phase: usize) -> ApprovalFuture<'a>;
}

/// Grants every request.
pub struct AutoApprove;

impl ApprovalGate for AutoApprove {
    fn request<'a>(&'a self, _rollout_id: &'a str, _phase: usize) -> ApprovalFuture<'a> {
        Box::pin(async { Ok(ApprovalStatus::Granted) })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Granted,
    Denied(String),
    TimedOut,
}

/// Poll `gate` until it grants or denies. A missing gate denies.
pub async fn await_approval(
    gate: Option<&dyn ApprovalGate>,
    rollout_id: &str,
    phase: usize,
    config: &ApprovalConfig,
    cancel: &mut CancelToken,
) -> Result<ApprovalOutcome, Interrupt> {
    let Some(gate) = gate else {
        return Ok(ApprovalOutcome::Denied(
            "no approval gate configured".to_string(),
        ));
    };
    let deadline = Instant::now() + config.timeout;

    loop {
        let answer = cancel
            .run(tokio::time::timeout_at(deadline, gate.request(rollout_id, phase)))
            .await?;
        match answer {
            Ok(Ok(ApprovalStatus::Granted)) => return Ok(ApprovalOutcome::Granted),
            Ok(Ok(ApprovalStatus::Denied)) => {
                return Ok(ApprovalOutcome::Denied("denied by approver".to_string()));
            }
            Ok(Ok(ApprovalStatus::Pending)) => {
                debug!(rollout = %rollout_id, phase, "approval pending");
            }
            Ok(Err(e)) => warn!(rollout = %rollout_id, phase, error = %e, "approval gate error"),
            Err(_) => return Ok(ApprovalOutcome::TimedOut),
        }

        let now = Instant::now();
        if now >= deadline {
            return Ok(ApprovalOutcome::TimedOut);
        }
        cancel
            .sleep_until((now + config.poll_interval).min(deadline))
            .await?;
    }
}
