//! Health monitor: drives sampling for one observation window.
//!
//! The `HealthMonitor` samples at the window start and then every
//! `interval` until `duration` has elapsed. After each tick it asks the
//! evaluator for a verdict over the samples gathered so far in this
//! window attempt; a Hold or Rollback ends the window immediately.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use rollgate_core::{ObservationWindow, RolloutClock};
use rollgate_state::{Decision, Signal, Verdict, WindowScope};

use crate::cancel::{CancelToken, Interrupt};
use crate::sampler::sample_tick;
use crate::source::SignalSource;

/// Produces a verdict from the samples of one window attempt.
pub trait WindowEvaluator: Send + Sync {
    /// Signals that must be sampled for this window.
    fn signals(&self) -> Vec<String>;

    /// Evaluate `samples` (all from `scope`, in time order) at time `now`.
    fn evaluate(&self, samples: &[Signal], now: u64, scope: &WindowScope) -> Decision;
}

#[derive(Debug, Clone, PartialEq)]
pub enum WindowOutcome {
    /// The window ran to completion (Continue) or was cut short by a
    /// Hold or Rollback verdict.
    Decided(Decision),
    Interrupted(Interrupt),
}

/// Samples one target's signals on the rollout clock.
#[derive(Clone)]
pub struct HealthMonitor {
    source: Arc<dyn SignalSource>,
    target: String,
    clock: RolloutClock,
    query_timeout: Option<Duration>,
}

impl HealthMonitor {
    pub fn new(source: Arc<dyn SignalSource>, target: &str, clock: RolloutClock) -> Self {
        Self {
            source,
            target: target.to_string(),
            clock,
            query_timeout: None,
        }
    }

    /// Bound each signal query. Defaults to the window's sampling interval.
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = Some(timeout);
        self
    }

    pub fn clock(&self) -> RolloutClock {
        self.clock
    }

    /// Run one window attempt. Every sample is passed to `sink` as soon
    /// as it is taken so the caller can persist it; only samples the sink
    /// accepts are evaluated.
    pub async fn observe(
        &self,
        window: &ObservationWindow,
        evaluator: &dyn WindowEvaluator,
        scope: &WindowScope,
        cancel: &mut CancelToken,
        sink: &mut (dyn FnMut(&Signal) -> bool + Send),
    ) -> WindowOutcome {
        let signals = evaluator.signals();
        let ticks = window.tick_count();
        let query_timeout = self.query_timeout.unwrap_or(window.interval);
        let started = Instant::now();
        let mut buffer: Vec<Signal> = Vec::new();

        info!(
            target = %self.target,
            %scope,
            duration = ?window.duration,
            interval = ?window.interval,
            ticks,
            "observation window started"
        );

        let mut last = None;
        for tick in 0..ticks {
            if tick > 0 {
                let at = started + window.interval * tick as u32;
                if let Err(interrupt) = cancel.sleep_until(at).await {
                    return WindowOutcome::Interrupted(interrupt);
                }
            } else if let Some(interrupt) = cancel.check() {
                return WindowOutcome::Interrupted(interrupt);
            }

            let now = self.clock.now_ms();
            let samples = match cancel
                .run(sample_tick(
                    self.source.as_ref(),
                    &self.target,
                    &signals,
                    scope,
                    now,
                    window.interval,
                    query_timeout,
                ))
                .await
            {
                Ok(samples) => samples,
                Err(interrupt) => return WindowOutcome::Interrupted(interrupt),
            };
            buffer.extend(samples.into_iter().filter(|sample| sink(sample)));

            let decision = evaluator.evaluate(&buffer, now, scope);
            debug!(target = %self.target, %scope, tick, verdict = %decision.verdict, "window tick evaluated");
            if decision.verdict != Verdict::Continue {
                info!(
                    target = %self.target,
                    %scope,
                    verdict = %decision.verdict,
                    reason = %decision.reason,
                    "window ended early"
                );
                return WindowOutcome::Decided(decision);
            }
            last = Some(decision);
        }

        match last {
            Some(decision) => WindowOutcome::Decided(decision),
            // tick_count is at least one, so a decision always exists.
            None => WindowOutcome::Interrupted(Interrupt::DeadlineExceeded),
        }
    }
}
