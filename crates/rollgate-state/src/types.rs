//! Persisted rollout records.
//!
//! A [`RolloutState`] is created once its target lease is held and
//! preflight has passed, mutated only by the task owning that lease, and
//! kept in the store after it reaches a terminal status. Its history
//! lists are append-only: the record exposes them as slices and only
//! offers methods that push.

use std::fmt;

use serde::{Deserialize, Serialize};

use rollgate_core::{ActionKind, RolloutPlan, ThresholdRule};

use crate::error::{StateError, StateResult};

/// Unique identifier for a rollout.
pub type RolloutId = String;

// ── Status and stage ──────────────────────────────────────────────

/// Coarse lifecycle status.
///
/// Edges: `Pending → Running → (Succeeded | RollingBack → (RolledBack | Failed))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStatus {
    Pending,
    Running,
    RollingBack,
    Succeeded,
    RolledBack,
    Failed,
}

impl RolloutStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::RolledBack | Self::Failed)
    }

    pub fn can_transition_to(self, next: RolloutStatus) -> bool {
        use RolloutStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Running)
                | (Running, Succeeded)
                | (Running, RollingBack)
                | (RollingBack, RolledBack)
                | (RollingBack, Failed)
        )
    }
}

impl fmt::Display for RolloutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::RollingBack => "rolling_back",
            Self::Succeeded => "succeeded",
            Self::RolledBack => "rolled_back",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Position in the phase state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum Stage {
    Pending,
    PreflightRunning,
    AwaitingApproval { phase: usize },
    Deploying { phase: usize },
    Verifying { phase: usize },
    RollingBack,
    Succeeded,
    RolledBack,
    Failed,
}

impl Stage {
    pub fn status(self) -> RolloutStatus {
        match self {
            Self::Pending => RolloutStatus::Pending,
            Self::PreflightRunning
            | Self::AwaitingApproval { .. }
            | Self::Deploying { .. }
            | Self::Verifying { .. } => RolloutStatus::Running,
            Self::RollingBack => RolloutStatus::RollingBack,
            Self::Succeeded => RolloutStatus::Succeeded,
            Self::RolledBack => RolloutStatus::RolledBack,
            Self::Failed => RolloutStatus::Failed,
        }
    }

    pub fn phase(self) -> Option<usize> {
        match self {
            Self::AwaitingApproval { phase }
            | Self::Deploying { phase }
            | Self::Verifying { phase } => Some(phase),
            _ => None,
        }
    }

    /// Whether `self` may directly follow `prev`. Phases advance strictly
    /// in order; nothing re-enters a forward stage once rolling back.
    pub fn can_follow(self, prev: Stage) -> bool {
        use Stage::*;
        match (prev, self) {
            (Pending, PreflightRunning) => true,
            (PreflightRunning, AwaitingApproval { phase: 0 } | Deploying { phase: 0 }) => true,
            (AwaitingApproval { phase: a }, Deploying { phase: b }) => a == b,
            (Deploying { phase: a }, Verifying { phase: b }) => a == b,
            (Verifying { phase: a }, AwaitingApproval { phase: b } | Deploying { phase: b }) => {
                b == a + 1
            }
            // Only after the last phase; the record checks against its plan.
            (Verifying { .. }, Succeeded) => true,
            (
                PreflightRunning | AwaitingApproval { .. } | Deploying { .. } | Verifying { .. },
                RollingBack,
            ) => true,
            (RollingBack, RolledBack | Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::PreflightRunning => f.write_str("preflight_running"),
            Self::AwaitingApproval { phase } => write!(f, "awaiting_approval({phase})"),
            Self::Deploying { phase } => write!(f, "deploying({phase})"),
            Self::Verifying { phase } => write!(f, "verifying({phase})"),
            Self::RollingBack => f.write_str("rolling_back"),
            Self::Succeeded => f.write_str("succeeded"),
            Self::RolledBack => f.write_str("rolled_back"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

// ── Signals and decisions ─────────────────────────────────────────

/// Which window attempt a sample or decision belongs to. A phase of
/// `None` denotes the post-rollback verification window.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowScope {
    pub phase: Option<usize>,
    pub window: String,
    /// Zero for the first run; incremented each time a Hold reruns the window.
    pub attempt: u32,
}

impl WindowScope {
    pub fn new(phase: Option<usize>, window: &str, attempt: u32) -> Self {
        Self {
            phase,
            window: window.to_string(),
            attempt,
        }
    }
}

impl fmt::Display for WindowScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.phase {
            Some(i) => write!(f, "phase {i} window {}#{}", self.window, self.attempt),
            None => write!(f, "rollback window {}#{}", self.window, self.attempt),
        }
    }
}

/// One timestamped observation. `value` is `None` when the signal source
/// could not answer (an Unknown sample).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub name: String,
    pub value: Option<f64>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    #[serde(flatten)]
    pub scope: WindowScope,
}

impl Signal {
    pub fn is_unknown(&self) -> bool {
        self.value.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Continue,
    Hold,
    Rollback,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Continue => "continue",
            Self::Hold => "hold",
            Self::Rollback => "rollback",
        })
    }
}

/// What produced a decision. Only `Engine` decisions are re-derivable
/// from stored signals; the rest record external or timing events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Engine,
    Abort,
    GlobalTimeout,
    PhaseTimeout,
    ExecutorFailure,
    HoldEscalation,
    ApprovalDenied,
    ApprovalTimeout,
    LeaseExpired,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub verdict: Verdict,
    pub source: DecisionSource,
    /// The rule that triggered a Rollback verdict, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<ThresholdRule>,
    /// Timestamp of the first sample in the violating run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub violation_start: Option<u64>,
    pub reason: String,
    /// Evaluation time in milliseconds since the Unix epoch.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<WindowScope>,
}

impl Decision {
    /// A Rollback decision raised outside the engine (abort, timeout, ...).
    pub fn rollback(source: DecisionSource, reason: impl Into<String>, timestamp: u64) -> Self {
        Self {
            verdict: Verdict::Rollback,
            source,
            rule: None,
            violation_start: None,
            reason: reason.into(),
            timestamp,
            scope: None,
        }
    }
}

// ── History ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ActionOutcome {
    Success { payload: String },
    Failure { reason: String },
    TimedOut,
}

impl ActionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// One command executor invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub at: u64,
    /// Phase index; `None` for rollback actions.
    pub phase: Option<usize>,
    pub action: String,
    pub kind: ActionKind,
    #[serde(flatten)]
    pub outcome: ActionOutcome,
}

/// One state-machine edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub at: u64,
    pub from: Stage,
    pub to: Stage,
    pub reason: String,
}

// ── Rollout record ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutState {
    pub id: RolloutId,
    pub target: String,
    pub plan: RolloutPlan,
    pub lease_token: String,
    status: RolloutStatus,
    stage: Stage,
    current_phase: usize,
    reason: Option<String>,
    manual_intervention: bool,
    rollback_attempts: u32,
    created_at: u64,
    updated_at: u64,
    transitions: Vec<Transition>,
    history: Vec<HistoryEntry>,
    decisions: Vec<Decision>,
    signals: Vec<Signal>,
}

impl RolloutState {
    pub fn new(id: &str, plan: RolloutPlan, lease_token: &str, now: u64) -> Self {
        Self {
            id: id.to_string(),
            target: plan.target.clone(),
            plan,
            lease_token: lease_token.to_string(),
            status: RolloutStatus::Pending,
            stage: Stage::Pending,
            current_phase: 0,
            reason: None,
            manual_intervention: false,
            rollback_attempts: 0,
            created_at: now,
            updated_at: now,
            transitions: Vec::new(),
            history: Vec::new(),
            decisions: Vec::new(),
            signals: Vec::new(),
        }
    }

    pub fn status(&self) -> RolloutStatus {
        self.status
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn current_phase(&self) -> usize {
        self.current_phase
    }

    /// Final human-readable reason, set on every terminal status.
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn manual_intervention(&self) -> bool {
        self.manual_intervention
    }

    pub fn rollback_attempts(&self) -> u32 {
        self.rollback_attempts
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn updated_at(&self) -> u64 {
        self.updated_at
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn decisions(&self) -> &[Decision] {
        &self.decisions
    }

    pub fn signals(&self) -> &[Signal] {
        &self.signals
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The rollback decision that ended forward progress, if any.
    pub fn rollback_trigger(&self) -> Option<&Decision> {
        self.decisions
            .iter()
            .find(|d| d.verdict == Verdict::Rollback)
    }

    /// Samples of one window attempt taken at or before `until`.
    pub fn signals_in<'a>(
        &'a self,
        scope: &'a WindowScope,
        until: u64,
    ) -> impl Iterator<Item = &'a Signal> + 'a {
        self.signals
            .iter()
            .filter(move |s| &s.scope == scope && s.timestamp <= until)
    }

    /// Move to `to`, rejecting edges the state machine does not have.
    pub fn transition(&mut self, to: Stage, at: u64, reason: impl Into<String>) -> StateResult<()> {
        let from = self.stage;
        let skips_phases = match (from, to) {
            (Stage::Verifying { phase }, Stage::Succeeded) => phase + 1 != self.plan.phases.len(),
            _ => false,
        };
        if skips_phases || !to.can_follow(from) || !self.status.can_transition_to(to.status()) {
            return Err(StateError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        if let Some(phase) = to.phase() {
            self.current_phase = phase;
        }
        self.transitions.push(Transition {
            at,
            from,
            to,
            reason: reason.into(),
        });
        self.stage = to;
        self.status = to.status();
        self.updated_at = at;
        Ok(())
    }

    /// Enter a terminal stage with the reason shown to operators.
    pub fn finish(
        &mut self,
        to: Stage,
        at: u64,
        reason: impl Into<String>,
        manual_intervention: bool,
    ) -> StateResult<()> {
        let reason = reason.into();
        self.transition(to, at, reason.clone())?;
        self.reason = Some(reason);
        self.manual_intervention = manual_intervention;
        Ok(())
    }

    pub fn record_decision(&mut self, decision: Decision) {
        self.updated_at = self.updated_at.max(decision.timestamp);
        self.decisions.push(decision);
    }

    pub fn record_action(&mut self, entry: HistoryEntry) {
        self.updated_at = self.updated_at.max(entry.at);
        self.history.push(entry);
    }

    pub fn note_rollback_attempt(&mut self) {
        self.rollback_attempts += 1;
    }

    /// Append a sample. Samples are time-ordered across the rollout and
    /// strictly increasing per signal within one window attempt. A window
    /// samples at its start, which may share a timestamp with the last
    /// tick of the window before it.
    pub fn record_signal(&mut self, signal: Signal) -> StateResult<()> {
        if let Some(last) = self.signals.last() {
            if signal.timestamp < last.timestamp {
                return Err(StateError::OutOfOrder(format!(
                    "{} at {} precedes last sample at {}",
                    signal.name, signal.timestamp, last.timestamp
                )));
            }
        }
        if let Some(prev) = self
            .signals
            .iter()
            .rev()
            .find(|s| s.name == signal.name && s.scope == signal.scope)
        {
            if signal.timestamp <= prev.timestamp {
                return Err(StateError::OutOfOrder(format!(
                    "{} sampled twice at {} in {}",
                    signal.name, signal.timestamp, signal.scope
                )));
            }
        }
        self.updated_at = self.updated_at.max(signal.timestamp);
        self.signals.push(signal);
        Ok(())
    }

    /// Terminate a rollout whose owner stopped renewing its lease. The
    /// record passes through `RollingBack` so the status edges stay
    /// intact; no revert was performed, hence the manual-intervention flag.
    pub fn mark_lease_expired(&mut self, at: u64) -> StateResult<()> {
        let reason = "LeaseExpired: owner stopped renewing the target lease";
        match self.status {
            RolloutStatus::Running => {
                self.transition(Stage::RollingBack, at, reason)?;
                self.finish(Stage::Failed, at, reason, true)
            }
            RolloutStatus::RollingBack => self.finish(Stage::Failed, at, reason, true),
            status if status.is_terminal() => Ok(()),
            status => Err(StateError::InvalidTransition {
                from: status.to_string(),
                to: Stage::Failed.to_string(),
            }),
        }
    }

    /// Key for the rollouts table.
    pub fn table_key(&self) -> &str {
        &self.id
    }
}

// ── Lease ─────────────────────────────────────────────────────────

/// Exclusive, renewable claim on a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub token: String,
    pub target: String,
    /// Rollout id holding the lease.
    pub owner: RolloutId,
    pub acquired_at: u64,
    pub renewed_at: u64,
    pub ttl_ms: u64,
}

impl Lease {
    pub fn expires_at(&self) -> u64 {
        self.renewed_at.saturating_add(self.ttl_ms)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at()
    }
}
