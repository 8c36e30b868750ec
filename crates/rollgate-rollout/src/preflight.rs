//! Preflight validator: read-only go/no-go gate.
//!
//! Runs the plan's named checks before anything is mutated. Each check is
//! bounded by its own deadline; a probe that errors or overruns counts as
//! a failed check.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use rollgate_core::{PreflightCheck, PreflightMode};

pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = Result<bool, String>> + Send + 'a>>;

/// Executes one preflight check against a target. Must not mutate it.
pub trait PreflightProbe: Send + Sync {
    fn check<'a>(&'a self, target: &'a str, check: &'a PreflightCheck) -> ProbeFuture<'a>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum PreflightVerdict {
    Go,
    NoGo {
        reason: String,
        failed_checks: Vec<String>,
    },
}

impl PreflightVerdict {
    pub fn is_go(&self) -> bool {
        matches!(self, Self::Go)
    }
}

/// Fails every check. Used when no probe is configured, so a plan that
/// declares checks can never pass without one.
pub struct NoProbe;

impl PreflightProbe for NoProbe {
    fn check<'a>(&'a self, _target: &'a str, _check: &'a PreflightCheck) -> ProbeFuture<'a> {
        Box::pin(async { Err("no preflight probe configured".to_string()) })
    }
}

#[derive(Clone)]
pub struct PreflightValidator {
    probe: Arc<dyn PreflightProbe>,
}

impl PreflightValidator {
    pub fn new(probe: Arc<dyn PreflightProbe>) -> Self {
        Self { probe }
    }

    pub async fn run(
        &self,
        target: &str,
        checks: &[PreflightCheck],
        mode: PreflightMode,
    ) -> PreflightVerdict {
        let mut failures: Vec<(String, String)> = Vec::new();

        for check in checks {
            let result =
                tokio::time::timeout(check.deadline, self.probe.check(target, check)).await;
            let failure = match result {
                Ok(Ok(true)) => None,
                Ok(Ok(false)) => Some("check returned false".to_string()),
                Ok(Err(reason)) => Some(reason),
                Err(_) => Some(format!("deadline of {:?} exceeded", check.deadline)),
            };

            match failure {
                None => debug!(%target, check = %check.name, "preflight check passed"),
                Some(reason) => {
                    warn!(%target, check = %check.name, %reason, "preflight check failed");
                    failures.push((check.name.clone(), reason));
                    if mode == PreflightMode::FailFast {
                        break;
                    }
                }
            }
        }

        if failures.is_empty() {
            info!(%target, checks = checks.len(), "preflight GO");
            return PreflightVerdict::Go;
        }

        let reason = failures
            .iter()
            .map(|(name, reason)| format!("{name}: {reason}"))
            .collect::<Vec<_>>()
            .join("; ");
        let failed_checks = failures.into_iter().map(|(name, _)| name).collect();
        PreflightVerdict::NoGo {
            reason,
            failed_checks,
        }
    }
}
