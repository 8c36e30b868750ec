//! Phase executor: drives one rollout through its state machine.
//!
//! ```text
//! PreflightRunning → [AwaitingApproval(i)] → Deploying(i) → Verifying(i) → … → Succeeded
//!          └──────────────── any trigger ────────────────→ RollingBack → RolledBack | Failed
//! ```
//!
//! Every failure on the forward path (threshold breach, executor
//! failure, phase or global timeout, abort, approval denial, hold
//! escalation) is recorded as a Rollback decision and takes the single
//! path into `RollingBack`. Losing the lease is the exception: the
//! rollout stops where it is and is marked `Failed` without touching the
//! target, since another owner may now hold it.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::watch;
use tracing::{error, info, warn};

use rollgate_core::{Action, ObservationWindow, RolloutClock, RolloutPlan, format_duration};
use rollgate_health::{CancelToken, HealthMonitor, Interrupt, WindowOutcome};
use rollgate_state::{
    ActionOutcome, Decision, DecisionSource, HistoryEntry, RolloutState, RolloutStatus, Signal,
    Stage, StateStore, Verdict, WindowScope,
};

use crate::approval::{ApprovalGate, ApprovalOutcome, await_approval};
use crate::decision::DecisionEngine;
use crate::events::{EventBus, EventKind};
use crate::executor::{CommandExecutor, run_action};
use crate::rollback::{RevertOutcome, RollbackExecutor};

/// Why forward progress stopped.
enum Halt {
    /// A recorded Rollback decision.
    Trigger(Decision),
    LeaseLost,
    /// The record refused a transition; nothing sensible remains but to stop.
    Fatal(String),
}

// ── Record keeping ────────────────────────────────────────────────

/// Sole writer of a rollout's record. Persists every transition and
/// decision, and publishes every change to status readers.
pub(crate) struct RecordKeeper {
    state: RolloutState,
    store: StateStore,
    snapshot: watch::Sender<RolloutState>,
    events: EventBus,
    clock: RolloutClock,
}

impl RecordKeeper {
    pub(crate) fn new(
        state: RolloutState,
        store: StateStore,
        snapshot: watch::Sender<RolloutState>,
        events: EventBus,
        clock: RolloutClock,
    ) -> Self {
        Self {
            state,
            store,
            snapshot,
            events,
            clock,
        }
    }

    fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    fn persist(&self) {
        if let Err(e) = self.store.put_rollout(&self.state) {
            error!(rollout = %self.state.id, error = %e, "failed to persist rollout record");
        }
        self.publish();
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.state.clone());
    }

    fn emit(&self, kind: EventKind, payload: serde_json::Value) {
        self.events.emit(kind, payload, self.now());
    }

    fn transition(&mut self, to: Stage, reason: &str) -> Result<(), Halt> {
        let from = self.state.stage();
        self.state
            .transition(to, self.now(), reason)
            .map_err(|e| Halt::Fatal(e.to_string()))?;
        info!(rollout = %self.state.id, target = %self.state.target, %from, %to, reason, "rollout transition");
        self.persist();
        Ok(())
    }

    fn finish(&mut self, to: Stage, reason: &str, manual_intervention: bool) -> Result<(), Halt> {
        let from = self.state.stage();
        self.state
            .finish(to, self.now(), reason, manual_intervention)
            .map_err(|e| Halt::Fatal(e.to_string()))?;
        info!(rollout = %self.state.id, target = %self.state.target, %from, %to, reason, "rollout finished");
        self.persist();
        Ok(())
    }

    fn record_decision(&mut self, decision: &Decision) {
        self.state.record_decision(decision.clone());
        self.persist();
        self.emit(
            EventKind::DecisionRecorded,
            serde_json::to_value(decision).unwrap_or_default(),
        );
    }

    fn record_action(&mut self, phase: Option<usize>, action: &Action, outcome: &ActionOutcome) {
        self.state.record_action(HistoryEntry {
            at: self.now(),
            phase,
            action: action.name.clone(),
            kind: action.kind,
            outcome: outcome.clone(),
        });
        self.persist();
        let kind = if outcome.is_success() {
            EventKind::ActionSucceeded
        } else {
            EventKind::ActionFailed
        };
        self.emit(kind, json!({ "phase": phase, "action": action.name, "outcome": outcome }));
    }

    /// Whether the sample made it into the record. Refused samples are
    /// kept out of evaluation so replay sees exactly what was decided on.
    fn record_signal(&mut self, signal: &Signal) -> bool {
        match self.state.record_signal(signal.clone()) {
            Ok(()) => {
                self.publish();
                true
            }
            Err(e) => {
                warn!(rollout = %self.state.id, error = %e, "sample dropped");
                false
            }
        }
    }

    fn into_state(self) -> RolloutState {
        self.state
    }
}

// ── State machine ─────────────────────────────────────────────────

pub(crate) struct PhaseExecutor {
    keeper: RecordKeeper,
    plan: RolloutPlan,
    executor: Arc<dyn CommandExecutor>,
    monitor: HealthMonitor,
    approval: Option<Arc<dyn ApprovalGate>>,
    cancel: CancelToken,
}

impl PhaseExecutor {
    pub(crate) fn new(
        keeper: RecordKeeper,
        executor: Arc<dyn CommandExecutor>,
        monitor: HealthMonitor,
        approval: Option<Arc<dyn ApprovalGate>>,
        cancel: CancelToken,
    ) -> Self {
        let plan = keeper.state.plan.clone();
        Self {
            keeper,
            plan,
            executor,
            monitor,
            approval,
            cancel,
        }
    }

    /// Run to a terminal status and return the final record.
    pub(crate) async fn run(mut self) -> RolloutState {
        let halt = match self.forward().await {
            Ok(()) => match self.keeper.finish(Stage::Succeeded, "all phases verified", false) {
                Ok(()) => {
                    self.keeper.emit(EventKind::RolloutSucceeded, json!({}));
                    return self.keeper.into_state();
                }
                Err(halt) => halt,
            },
            Err(halt) => halt,
        };

        match halt {
            Halt::Trigger(decision) => self.roll_back(decision).await,
            Halt::LeaseLost => self.lease_lost(),
            Halt::Fatal(reason) => self.fatal(&reason),
        }
        self.keeper.into_state()
    }

    async fn forward(&mut self) -> Result<(), Halt> {
        let id = self.keeper.state.id.clone();
        let target = self.plan.target.clone();
        let phases = self.plan.phases.clone();

        for (i, phase) in phases.iter().enumerate() {
            if phase.requires_approval {
                self.checkpoint()?;
                self.keeper.transition(
                    Stage::AwaitingApproval { phase: i },
                    &format!("phase `{}` requires approval", phase.name),
                )?;
                self.keeper
                    .emit(EventKind::ApprovalRequested, json!({ "phase": i, "name": phase.name }));
                let outcome = match await_approval(
                    self.approval.as_deref(),
                    &id,
                    i,
                    &self.plan.approval,
                    &mut self.cancel,
                )
                .await
                {
                    Ok(outcome) => outcome,
                    Err(interrupt) => return Err(self.interrupted(interrupt)),
                };
                match outcome {
                    ApprovalOutcome::Granted => {
                        info!(rollout = %id, phase = i, "approval granted");
                    }
                    ApprovalOutcome::Denied(reason) => {
                        return Err(self.trigger(
                            DecisionSource::ApprovalDenied,
                            format!("approval for phase `{}` denied: {reason}", phase.name),
                        ));
                    }
                    ApprovalOutcome::TimedOut => {
                        return Err(self.trigger(
                            DecisionSource::ApprovalTimeout,
                            format!(
                                "approval for phase `{}` not granted within {}",
                                phase.name,
                                format_duration(self.plan.approval.timeout)
                            ),
                        ));
                    }
                }
            }

            self.checkpoint()?;
            self.keeper.transition(
                Stage::Deploying { phase: i },
                &format!("running action `{}`", phase.action.name),
            )?;
            self.keeper.emit(
                EventKind::PhaseStarted,
                json!({ "phase": i, "name": phase.name, "action": phase.action.name }),
            );

            let outcome = match run_action(
                self.executor.as_ref(),
                &target,
                &phase.action,
                phase.timeout,
                &mut self.cancel,
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(interrupt) => return Err(self.interrupted(interrupt)),
            };
            self.keeper.record_action(Some(i), &phase.action, &outcome);
            match outcome {
                ActionOutcome::Success { .. } => {}
                ActionOutcome::Failure { reason } => {
                    return Err(self.trigger(
                        DecisionSource::ExecutorFailure,
                        format!("action `{}` of phase `{}` failed: {reason}", phase.action.name, phase.name),
                    ));
                }
                ActionOutcome::TimedOut => {
                    return Err(self.trigger(
                        DecisionSource::PhaseTimeout,
                        format!(
                            "action `{}` of phase `{}` exceeded its {} timeout",
                            phase.action.name,
                            phase.name,
                            format_duration(phase.timeout)
                        ),
                    ));
                }
            }

            self.checkpoint()?;
            self.keeper.transition(
                Stage::Verifying { phase: i },
                &format!("action `{}` succeeded", phase.action.name),
            )?;
            for window in phase.windows_in_order() {
                self.verify_window(i, window).await?;
            }
        }
        Ok(())
    }

    /// Observe one window, rerunning it after Holds until it continues,
    /// breaches, or exhausts the hold budget.
    async fn verify_window(&mut self, phase: usize, window: &ObservationWindow) -> Result<(), Halt> {
        let engine = DecisionEngine::for_window(&self.plan.policy, window);
        let mut attempt = 0u32;
        loop {
            let decision = self.observe(Some(phase), window, &engine, attempt).await?;
            match decision.verdict {
                Verdict::Continue => return Ok(()),
                Verdict::Rollback => return Err(Halt::Trigger(decision)),
                Verdict::Hold => {
                    if attempt >= self.plan.policy.hold_retries {
                        return Err(self.trigger(
                            DecisionSource::HoldEscalation,
                            format!(
                                "window `{}` held {} times: {}",
                                window.name,
                                attempt + 1,
                                decision.reason
                            ),
                        ));
                    }
                    warn!(
                        rollout = %self.keeper.state.id,
                        phase,
                        window = %window.name,
                        cooldown = %format_duration(self.plan.policy.hold_cooldown),
                        "window held, rerunning after cooldown"
                    );
                    if let Err(interrupt) = self.cancel.sleep(self.plan.policy.hold_cooldown).await {
                        return Err(self.interrupted(interrupt));
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Run one window attempt and record its decision.
    async fn observe(
        &mut self,
        phase: Option<usize>,
        window: &ObservationWindow,
        engine: &DecisionEngine,
        attempt: u32,
    ) -> Result<Decision, Halt> {
        let scope = WindowScope::new(phase, &window.name, attempt);
        self.keeper.emit(
            EventKind::WindowStarted,
            json!({ "phase": phase, "window": window.name, "attempt": attempt }),
        );

        let keeper = &mut self.keeper;
        let outcome = self
            .monitor
            .observe(window, engine, &scope, &mut self.cancel, &mut |s| keeper.record_signal(s))
            .await;

        match outcome {
            WindowOutcome::Decided(decision) => {
                self.keeper.record_decision(&decision);
                Ok(decision)
            }
            WindowOutcome::Interrupted(interrupt) => Err(self.interrupted(interrupt)),
        }
    }

    fn checkpoint(&mut self) -> Result<(), Halt> {
        match self.cancel.check() {
            Some(interrupt) => Err(self.interrupted(interrupt)),
            None => Ok(()),
        }
    }

    fn trigger(&mut self, source: DecisionSource, reason: String) -> Halt {
        let decision = Decision::rollback(source, reason, self.keeper.now());
        self.keeper.record_decision(&decision);
        Halt::Trigger(decision)
    }

    fn interrupted(&mut self, interrupt: Interrupt) -> Halt {
        match interrupt {
            Interrupt::Aborted => self.trigger(DecisionSource::Abort, "aborted by operator".into()),
            Interrupt::DeadlineExceeded => self.trigger(
                DecisionSource::GlobalTimeout,
                format!(
                    "global timeout of {} exceeded",
                    format_duration(self.plan.global_timeout)
                ),
            ),
            Interrupt::LeaseLost => Halt::LeaseLost,
        }
    }

    // ── Rollback ───────────────────────────────────────────────────

    async fn roll_back(&mut self, trigger: Decision) {
        let reason = trigger.reason.clone();
        if let Err(halt) = self.keeper.transition(Stage::RollingBack, &reason) {
            return self.settle(halt);
        }
        self.keeper.emit(
            EventKind::RollbackStarted,
            json!({ "trigger": serde_json::to_value(&trigger).unwrap_or_default() }),
        );

        // Aborts and the global deadline no longer apply; lease loss still does.
        self.cancel = self.cancel.rollback_scope();
        let rollback =
            RollbackExecutor::new(self.executor.clone(), &self.plan.rollback, &self.plan.policy);
        let target = self.plan.target.clone();
        let action = self.plan.rollback.action.clone();

        let keeper = &mut self.keeper;
        let outcome = rollback
            .revert(&target, &mut self.cancel, &mut |attempt, outcome| {
                keeper.state.note_rollback_attempt();
                keeper.record_action(None, &action, outcome);
                if !outcome.is_success() {
                    keeper.emit(
                        EventKind::RollbackAttemptFailed,
                        json!({ "attempt": attempt, "outcome": outcome }),
                    );
                }
            })
            .await;

        match outcome {
            Ok(RevertOutcome::Reverted { attempts }) => self.verify_revert(&reason, attempts).await,
            Ok(RevertOutcome::Exhausted { attempts, last_error }) => self.fail_manual(&format!(
                "rollback failed after {attempts} attempt(s): {last_error}; manual intervention required (trigger: {reason})"
            )),
            Err(Interrupt::LeaseLost) => self.lease_lost(),
            Err(other) => self.fail_manual(&format!(
                "rollback interrupted ({other:?}); manual intervention required"
            )),
        }
    }

    async fn verify_revert(&mut self, reason: &str, attempts: u32) {
        let Some(window) = self.plan.rollback_verify_window().cloned() else {
            return self.finish_rolled_back(&format!(
                "rolled back after {attempts} attempt(s), no verification window declared: {reason}"
            ));
        };

        let engine = DecisionEngine::for_window(&self.plan.policy, &window);
        match self.observe(None, &window, &engine, 0).await {
            Ok(decision) if decision.verdict == Verdict::Continue => {
                self.finish_rolled_back(&format!("rolled back: {reason}"));
            }
            Ok(decision) => self.fail_manual(&format!(
                "post-rollback verification returned {}: {}; manual intervention required",
                decision.verdict, decision.reason
            )),
            Err(Halt::LeaseLost) => self.lease_lost(),
            Err(_) => self.fail_manual("post-rollback verification interrupted; manual intervention required"),
        }
    }

    fn finish_rolled_back(&mut self, reason: &str) {
        match self.keeper.finish(Stage::RolledBack, reason, false) {
            Ok(()) => self
                .keeper
                .emit(EventKind::RolloutRolledBack, json!({ "reason": reason })),
            Err(halt) => self.settle(halt),
        }
    }

    fn fail_manual(&mut self, reason: &str) {
        match self.keeper.finish(Stage::Failed, reason, true) {
            Ok(()) => {
                error!(rollout = %self.keeper.state.id, target = %self.plan.target, reason, "rollout failed, manual intervention required");
                self.keeper.emit(
                    EventKind::RolloutFailed,
                    json!({ "reason": reason, "manual_intervention": true }),
                );
            }
            Err(halt) => self.settle(halt),
        }
    }

    fn lease_lost(&mut self) {
        let now = self.keeper.now();
        self.keeper.record_decision(&Decision::rollback(
            DecisionSource::LeaseExpired,
            "target lease lost; stopping without revert",
            now,
        ));
        match self.keeper.state.mark_lease_expired(now) {
            Ok(()) => {
                self.keeper.persist();
                error!(rollout = %self.keeper.state.id, target = %self.plan.target, "lease lost, rollout failed");
                self.keeper.emit(
                    EventKind::RolloutFailed,
                    json!({ "reason": "LeaseExpired", "manual_intervention": true }),
                );
            }
            Err(e) => self.fatal(&e.to_string()),
        }
    }

    fn settle(&mut self, halt: Halt) {
        match halt {
            Halt::LeaseLost => self.lease_lost(),
            Halt::Trigger(decision) => self.fatal(&decision.reason),
            Halt::Fatal(reason) => self.fatal(&reason),
        }
    }

    /// Last resort: drive the record to `Failed` along legal edges.
    fn fatal(&mut self, reason: &str) {
        error!(rollout = %self.keeper.state.id, reason, "rollout stopped on internal error");
        if self.keeper.state.is_terminal() {
            return;
        }
        let reason = format!("internal error: {reason}; manual intervention required");
        if self.keeper.state.status() == RolloutStatus::Running
            && self.keeper.transition(Stage::RollingBack, &reason).is_err()
        {
            return;
        }
        if self.keeper.finish(Stage::Failed, &reason, true).is_ok() {
            self.keeper.emit(
                EventKind::RolloutFailed,
                json!({ "reason": reason, "manual_intervention": true }),
            );
        }
    }
}
