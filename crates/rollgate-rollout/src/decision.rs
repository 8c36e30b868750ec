//! Rollback decision engine.
//!
//! Evaluates the samples of one window attempt against the effective
//! rules of that window: the window's own rules followed by the plan's
//! policy rules. Rules are OR-combined. The function is pure, so any
//! stored decision can be re-derived from the stored signals, which is
//! what [`replay`] does for audits.
//!
//! A rule with `sustained_for = D` is satisfied at `now` when:
//!
//! - the latest sample of its signal lies in `(now - D, now]`,
//! - every sample in `(now - D, now]` is known and violating, and
//! - the sample history reaches back to `now - D`.
//!
//! With `D = 0` the latest sample alone decides. Unknown samples never
//! violate; a trailing run of more than `max_consecutive_unknown` of them
//! on any rule signal yields Hold when no rule is satisfied.

use serde::Serialize;

use rollgate_core::{ObservationWindow, RollbackPolicy, ThresholdRule};
use rollgate_health::WindowEvaluator;
use rollgate_state::{
    Decision, DecisionSource, RolloutState, Signal, Verdict, WindowScope,
};

#[derive(Debug, Clone)]
pub struct DecisionEngine {
    rules: Vec<ThresholdRule>,
    max_consecutive_unknown: u32,
}

impl DecisionEngine {
    pub fn new(rules: Vec<ThresholdRule>, max_consecutive_unknown: u32) -> Self {
        Self {
            rules,
            max_consecutive_unknown,
        }
    }

    /// Engine for one window: window rules first, then policy rules.
    pub fn for_window(policy: &RollbackPolicy, window: &ObservationWindow) -> Self {
        let rules = window
            .rules
            .iter()
            .chain(policy.rules.iter())
            .cloned()
            .collect();
        Self::new(rules, policy.max_consecutive_unknown)
    }

    pub fn rules(&self) -> &[ThresholdRule] {
        &self.rules
    }

    /// Distinct signal names referenced by the rules, in declaration order.
    pub fn signal_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for rule in &self.rules {
            if !names.contains(&rule.signal) {
                names.push(rule.signal.clone());
            }
        }
        names
    }

    /// Verdict over `samples` at time `now`. Samples after `now` and
    /// samples of other signals are ignored.
    pub fn evaluate(&self, samples: &[Signal], now: u64, scope: &WindowScope) -> Decision {
        // (priority, violation start, declaration index)
        let mut best: Option<(u32, u64, usize)> = None;
        for (idx, rule) in self.rules.iter().enumerate() {
            if let Some(start) = satisfied_since(rule, samples, now) {
                let key = (rule.priority, start, idx);
                if best.is_none_or(|current| key < current) {
                    best = Some(key);
                }
            }
        }

        if let Some((_, start, idx)) = best {
            let rule = &self.rules[idx];
            return Decision {
                verdict: Verdict::Rollback,
                source: DecisionSource::Engine,
                rule: Some(rule.clone()),
                violation_start: Some(start),
                reason: format!(
                    "threshold breached: {} ({:?}), violating since {start}",
                    rule.describe(),
                    rule.severity
                ),
                timestamp: now,
                scope: Some(scope.clone()),
            };
        }

        for name in self.signal_names() {
            let run = samples
                .iter()
                .filter(|s| s.name == name && s.timestamp <= now)
                .rev()
                .take_while(|s| s.is_unknown())
                .count();
            if run as u64 > u64::from(self.max_consecutive_unknown) {
                return Decision {
                    verdict: Verdict::Hold,
                    source: DecisionSource::Engine,
                    rule: None,
                    violation_start: None,
                    reason: format!(
                        "{name}: {run} consecutive unknown samples (limit {})",
                        self.max_consecutive_unknown
                    ),
                    timestamp: now,
                    scope: Some(scope.clone()),
                };
            }
        }

        let count = samples.iter().filter(|s| s.timestamp <= now).count();
        Decision {
            verdict: Verdict::Continue,
            source: DecisionSource::Engine,
            rule: None,
            violation_start: None,
            reason: format!("{count} samples within thresholds"),
            timestamp: now,
            scope: Some(scope.clone()),
        }
    }
}

impl WindowEvaluator for DecisionEngine {
    fn signals(&self) -> Vec<String> {
        self.signal_names()
    }

    fn evaluate(&self, samples: &[Signal], now: u64, scope: &WindowScope) -> Decision {
        DecisionEngine::evaluate(self, samples, now, scope)
    }
}

/// Start of the trailing violating run if `rule` is satisfied at `now`.
fn satisfied_since(rule: &ThresholdRule, samples: &[Signal], now: u64) -> Option<u64> {
    let series: Vec<&Signal> = samples
        .iter()
        .filter(|s| s.name == rule.signal && s.timestamp <= now)
        .collect();
    let violates = |s: &Signal| s.value.is_some_and(|v| rule.violated_by(v));

    let latest = series.last()?;
    if !violates(latest) {
        return None;
    }

    let span = rule.sustained_for.as_millis() as u64;
    if span > 0 {
        let horizon = now.checked_sub(span)?;
        if latest.timestamp <= horizon {
            return None;
        }
        if !series.iter().any(|s| s.timestamp <= horizon) {
            return None;
        }
        if !series
            .iter()
            .filter(|s| s.timestamp > horizon)
            .all(|s| violates(s))
        {
            return None;
        }
    }

    series
        .iter()
        .rev()
        .take_while(|s| violates(s))
        .last()
        .map(|s| s.timestamp)
}

// ── Replay ────────────────────────────────────────────────────────

/// One re-evaluated decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayEntry {
    /// Index into the rollout's decision history.
    pub index: usize,
    pub scope: WindowScope,
    pub timestamp: u64,
    pub recorded: Verdict,
    pub replayed: Verdict,
    pub matches: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayReport {
    pub rollout_id: String,
    pub entries: Vec<ReplayEntry>,
    /// Decisions that did not come from the engine (abort, timeouts, ...).
    pub skipped: usize,
}

impl ReplayReport {
    pub fn all_match(&self) -> bool {
        self.entries.iter().all(|e| e.matches)
    }
}

/// Re-run every engine decision of `state` against its stored signals.
pub fn replay(state: &RolloutState) -> ReplayReport {
    let mut entries = Vec::new();
    let mut skipped = 0;

    for (index, decision) in state.decisions().iter().enumerate() {
        let scope = match (&decision.source, &decision.scope) {
            (DecisionSource::Engine, Some(scope)) => scope,
            _ => {
                skipped += 1;
                continue;
            }
        };

        let replayed = match state.plan.window(scope.phase, &scope.window) {
            Some(window) => {
                let engine = DecisionEngine::for_window(&state.plan.policy, window);
                let samples: Vec<Signal> =
                    state.signals_in(scope, decision.timestamp).cloned().collect();
                engine.evaluate(&samples, decision.timestamp, scope)
            }
            None => {
                entries.push(ReplayEntry {
                    index,
                    scope: scope.clone(),
                    timestamp: decision.timestamp,
                    recorded: decision.verdict,
                    replayed: Verdict::Continue,
                    matches: false,
                });
                continue;
            }
        };

        let matches = replayed.verdict == decision.verdict
            && replayed.rule == decision.rule
            && replayed.violation_start == decision.violation_start;
        entries.push(ReplayEntry {
            index,
            scope: scope.clone(),
            timestamp: decision.timestamp,
            recorded: decision.verdict,
            replayed: replayed.verdict,
            matches,
        });
    }

    ReplayReport {
        rollout_id: state.id.clone(),
        entries,
        skipped,
    }
}
