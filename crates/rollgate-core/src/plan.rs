//! Rollout plan model.
//!
//! A plan is declared once and never mutated after the rollout starts.
//!
//! ```toml
//! target = "prod/checkout"
//! global_timeout = "45m"
//!
//! [[preflight]]
//! name = "cluster-reachable"
//! deadline = "10s"
//! command = "kubectl cluster-info"
//!
//! [[phases]]
//! name = "canary"
//! timeout = "5m"
//! action = { name = "deploy-canary", command = "./deploy.sh canary" }
//!
//! [[phases.windows]]
//! name = "immediate"
//! duration = "2m"
//! interval = "30s"
//! rules = [{ signal = "latency_ms", op = ">", threshold = 200.0, sustained_for = "1m" }]
//!
//! [policy]
//! max_retries = 2
//! rules = [{ signal = "error_rate", op = ">", threshold = 0.05, sustained_for = "2m" }]
//!
//! [rollback]
//! action = { name = "revert", command = "./deploy.sh revert" }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::{format_duration, serde_str};
use crate::error::{PlanError, PlanResult};

fn default_global_timeout() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_deadline() -> Duration {
    Duration::from_secs(30)
}

fn default_phase_timeout() -> Duration {
    Duration::from_secs(10 * 60)
}

fn default_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_rollback_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff() -> Duration {
    Duration::from_secs(5)
}

fn default_max_unknown() -> u32 {
    3
}

fn default_hold_retries() -> u32 {
    1
}

fn default_hold_cooldown() -> Duration {
    Duration::from_secs(30)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_approval_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

// ── Plan ──────────────────────────────────────────────────────────

/// A fully specified rollout: what to change, how to observe it, and how
/// to revert it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RolloutPlan {
    /// Identifier of the thing being changed (service, cluster, ...).
    pub target: String,
    /// Upper bound on the whole forward rollout.
    #[serde(with = "serde_str", default = "default_global_timeout")]
    pub global_timeout: Duration,
    #[serde(default)]
    pub preflight: Vec<PreflightCheck>,
    #[serde(default)]
    pub preflight_mode: PreflightMode,
    pub phases: Vec<Phase>,
    #[serde(default)]
    pub policy: RollbackPolicy,
    pub rollback: RollbackSpec,
    #[serde(default)]
    pub approval: ApprovalConfig,
}

/// A named, read-only probe run before anything is mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PreflightCheck {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(with = "serde_str", default = "default_deadline")]
    pub deadline: Duration,
    /// Adapter-specific probe command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

/// How preflight failures are reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreflightMode {
    /// Stop at the first failing check.
    #[default]
    FailFast,
    /// Run every check and report all failures.
    Aggregate,
}

/// One ordered step of the plan: an action and the windows observed after it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Phase {
    pub name: String,
    pub action: Action,
    #[serde(with = "serde_str", default = "default_phase_timeout")]
    pub timeout: Duration,
    #[serde(default)]
    pub windows: Vec<ObservationWindow>,
    /// Wait for the approval gate before running this phase's action.
    #[serde(default)]
    pub requires_approval: bool,
}

impl Phase {
    /// Windows in the order they are observed (increasing duration).
    pub fn windows_in_order(&self) -> Vec<&ObservationWindow> {
        let mut windows: Vec<&ObservationWindow> = self.windows.iter().collect();
        windows.sort_by_key(|w| w.duration);
        windows
    }
}

/// A side-effecting step handed to the command executor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Action {
    pub name: String,
    #[serde(default)]
    pub kind: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    #[default]
    Deploy,
    Rollback,
}

/// A bounded span during which signals are sampled and evaluated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObservationWindow {
    pub name: String,
    #[serde(with = "serde_str")]
    pub duration: Duration,
    #[serde(with = "serde_str", default = "default_interval")]
    pub interval: Duration,
    /// Thresholds that apply only to samples taken in this window.
    #[serde(default)]
    pub rules: Vec<ThresholdRule>,
}

impl ObservationWindow {
    /// Number of samples taken per signal: one at the start, then one per interval.
    pub fn tick_count(&self) -> u64 {
        let interval = self.interval.as_millis().max(1);
        (self.duration.as_millis() / interval) as u64 + 1
    }
}

/// A condition over one signal whose satisfaction triggers rollback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThresholdRule {
    pub signal: String,
    pub op: Comparison,
    pub threshold: f64,
    /// Every sample in this trailing span must violate. Zero means the
    /// latest sample alone decides.
    #[serde(with = "serde_str", default)]
    pub sustained_for: Duration,
    #[serde(default)]
    pub severity: Severity,
    /// Lower values win when several rules are satisfied at once.
    #[serde(default)]
    pub priority: u32,
}

impl ThresholdRule {
    /// Whether a single value violates this rule.
    pub fn violated_by(&self, value: f64) -> bool {
        self.op.violated(value, self.threshold)
    }

    pub fn describe(&self) -> String {
        format!(
            "{} {} {} sustained for {}",
            self.signal,
            self.op.symbol(),
            self.threshold,
            format_duration(self.sustained_for)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
}

impl Comparison {
    /// True when `value` is on the bad side of `threshold`.
    pub fn violated(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Gt => value > threshold,
            Self::Ge => value >= threshold,
            Self::Lt => value < threshold,
            Self::Le => value <= threshold,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Critical,
    Warning,
}

/// OR-combined rules plus the knobs governing holds and rollback retries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackPolicy {
    #[serde(default)]
    pub rules: Vec<ThresholdRule>,
    /// Rollback attempts after the first one fails.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(with = "serde_str", default = "default_retry_backoff")]
    pub retry_backoff: Duration,
    /// A trailing run of more Unknown samples than this yields Hold.
    #[serde(default = "default_max_unknown")]
    pub max_consecutive_unknown: u32,
    /// Window reruns allowed after a Hold before escalating to Rollback.
    #[serde(default = "default_hold_retries")]
    pub hold_retries: u32,
    #[serde(with = "serde_str", default = "default_hold_cooldown")]
    pub hold_cooldown: Duration,
}

impl Default for RollbackPolicy {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            max_retries: default_max_retries(),
            retry_backoff: default_retry_backoff(),
            max_consecutive_unknown: default_max_unknown(),
            hold_retries: default_hold_retries(),
            hold_cooldown: default_hold_cooldown(),
        }
    }
}

/// The plan-wide revert action. Rollback always returns the target to
/// its last known-good state, so there is one action for the whole plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackSpec {
    pub action: Action,
    #[serde(with = "serde_str", default = "default_rollback_timeout")]
    pub timeout: Duration,
    /// Window used to confirm health after the revert.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<ObservationWindow>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalConfig {
    #[serde(with = "serde_str", default = "default_poll_interval")]
    pub poll_interval: Duration,
    #[serde(with = "serde_str", default = "default_approval_timeout")]
    pub timeout: Duration,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            timeout: default_approval_timeout(),
        }
    }
}

// ── Loading and validation ────────────────────────────────────────

impl RolloutPlan {
    pub fn from_file(path: &Path) -> PlanResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| PlanError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> PlanResult<Self> {
        let mut plan: RolloutPlan = toml::from_str(content)?;
        plan.rollback.action.kind = ActionKind::Rollback;
        Ok(plan)
    }

    /// The window used for post-rollback verification: `rollback.verify`
    /// when declared, otherwise the shortest window of the first phase.
    pub fn rollback_verify_window(&self) -> Option<&ObservationWindow> {
        self.rollback.verify.as_ref().or_else(|| {
            self.phases
                .first()
                .and_then(|p| p.windows.iter().min_by_key(|w| w.duration))
        })
    }

    /// Look up a window by phase index and name. `None` for the phase
    /// selects the rollback verification window.
    pub fn window(&self, phase: Option<usize>, name: &str) -> Option<&ObservationWindow> {
        match phase {
            Some(i) => self
                .phases
                .get(i)
                .and_then(|p| p.windows.iter().find(|w| w.name == name)),
            None => self.rollback_verify_window().filter(|w| w.name == name),
        }
    }

    /// Check structural well-formedness.
    pub fn validate(&self) -> PlanResult<()> {
        let invalid = |msg: String| Err(PlanError::Invalid(msg));

        if self.target.trim().is_empty() {
            return invalid("target must not be empty".into());
        }
        if self.phases.is_empty() {
            return invalid("plan must declare at least one phase".into());
        }
        if self.global_timeout.is_zero() {
            return invalid("global_timeout must be greater than zero".into());
        }

        let mut names = HashSet::new();
        for check in &self.preflight {
            if check.name.trim().is_empty() {
                return invalid("preflight check with empty name".into());
            }
            if !names.insert(check.name.as_str()) {
                return invalid(format!("duplicate preflight check `{}`", check.name));
            }
        }

        let mut names = HashSet::new();
        for phase in &self.phases {
            if phase.name.trim().is_empty() {
                return invalid("phase with empty name".into());
            }
            if !names.insert(phase.name.as_str()) {
                return invalid(format!("duplicate phase `{}`", phase.name));
            }
            if phase.timeout.is_zero() {
                return invalid(format!("phase `{}` has a zero timeout", phase.name));
            }
            let mut windows = HashSet::new();
            for window in &phase.windows {
                if !windows.insert(window.name.as_str()) {
                    return invalid(format!(
                        "phase `{}` declares window `{}` twice",
                        phase.name, window.name
                    ));
                }
                validate_window(window, &format!("phase `{}`", phase.name))?;
            }
        }

        if let Some(window) = &self.rollback.verify {
            validate_window(window, "rollback")?;
        }
        if self.rollback.timeout.is_zero() {
            return invalid("rollback timeout must be greater than zero".into());
        }
        let longest = self.all_windows().map(|w| w.duration).max();
        for rule in &self.policy.rules {
            validate_rule(rule, "policy")?;
            if let Some(longest) = longest.filter(|d| rule.sustained_for > *d) {
                return invalid(format!(
                    "policy rule `{}` needs {} of samples but the longest window lasts {}",
                    rule.describe(),
                    format_duration(rule.sustained_for),
                    format_duration(longest)
                ));
            }
        }
        if self.approval.poll_interval.is_zero() {
            return invalid("approval poll_interval must be greater than zero".into());
        }

        Ok(())
    }

    /// Non-fatal problems: policy rules that outlast some of the windows
    /// they apply to and so cannot fire there.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        for rule in &self.policy.rules {
            for window in self.all_windows() {
                if rule.sustained_for > window.duration {
                    warnings.push(format!(
                        "policy rule `{}` cannot fire in window `{}` ({})",
                        rule.describe(),
                        window.name,
                        format_duration(window.duration)
                    ));
                }
            }
        }
        warnings
    }

    fn all_windows(&self) -> impl Iterator<Item = &ObservationWindow> {
        self.phases
            .iter()
            .flat_map(|p| p.windows.iter())
            .chain(self.rollback.verify.iter())
    }
}

fn validate_window(window: &ObservationWindow, owner: &str) -> PlanResult<()> {
    if window.name.trim().is_empty() {
        return Err(PlanError::Invalid(format!("{owner}: window with empty name")));
    }
    if window.duration.is_zero() || window.interval.is_zero() {
        return Err(PlanError::Invalid(format!(
            "{owner}: window `{}` needs a non-zero duration and interval",
            window.name
        )));
    }
    if window.interval > window.duration {
        return Err(PlanError::Invalid(format!(
            "{owner}: window `{}` samples less often than it lasts",
            window.name
        )));
    }
    for rule in &window.rules {
        validate_rule(rule, &format!("{owner} window `{}`", window.name))?;
        if rule.sustained_for > window.duration {
            return Err(PlanError::Invalid(format!(
                "{owner}: rule `{}` can never be satisfied within window `{}` ({})",
                rule.describe(),
                window.name,
                format_duration(window.duration)
            )));
        }
    }
    Ok(())
}

fn validate_rule(rule: &ThresholdRule, owner: &str) -> PlanResult<()> {
    if rule.signal.trim().is_empty() {
        return Err(PlanError::Invalid(format!("{owner}: rule with empty signal name")));
    }
    if !rule.threshold.is_finite() {
        return Err(PlanError::Invalid(format!(
            "{owner}: rule on `{}` has a non-finite threshold",
            rule.signal
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = r#"
target = "prod/checkout"
global_timeout = "45m"

[[preflight]]
name = "cluster-reachable"
description = "control plane answers"
deadline = "10s"
command = "true"

[[phases]]
name = "canary"
timeout = "5m"
action = { name = "deploy-canary", command = "./deploy.sh canary" }

[[phases.windows]]
name = "short"
duration = "5m"
interval = "30s"

[[phases.windows]]
name = "immediate"
duration = "2m"
interval = "30s"
rules = [{ signal = "latency_ms", op = ">", threshold = 200.0, sustained_for = "1m" }]

[[phases]]
name = "full"
action = { name = "deploy-all" }
requires_approval = true

[policy]
max_retries = 2
rules = [{ signal = "error_rate", op = ">=", threshold = 0.05, sustained_for = "2m", severity = "warning", priority = 1 }]

[rollback]
action = { name = "revert", command = "./deploy.sh revert" }
"#;

    #[test]
    fn parse_full_plan() {
        let plan = RolloutPlan::from_toml_str(PLAN).unwrap();
        assert_eq!(plan.target, "prod/checkout");
        assert_eq!(plan.global_timeout, Duration::from_secs(45 * 60));
        assert_eq!(plan.phases.len(), 2);
        assert_eq!(plan.phases[1].timeout, Duration::from_secs(600));
        assert!(plan.phases[1].requires_approval);
        assert_eq!(plan.policy.max_retries, 2);
        assert_eq!(plan.policy.hold_retries, 1);
        assert_eq!(plan.policy.rules[0].op, Comparison::Ge);
        assert_eq!(plan.policy.rules[0].severity, Severity::Warning);
        assert_eq!(plan.rollback.action.kind, ActionKind::Rollback);
        plan.validate().unwrap();
    }

    #[test]
    fn windows_observed_in_increasing_duration() {
        let plan = RolloutPlan::from_toml_str(PLAN).unwrap();
        let names: Vec<&str> = plan.phases[0]
            .windows_in_order()
            .iter()
            .map(|w| w.name.as_str())
            .collect();
        assert_eq!(names, ["immediate", "short"]);
    }

    #[test]
    fn verify_window_defaults_to_shortest_first_phase_window() {
        let plan = RolloutPlan::from_toml_str(PLAN).unwrap();
        let verify = plan.rollback_verify_window().unwrap();
        assert_eq!(verify.name, "immediate");
        assert!(plan.window(None, "immediate").is_some());
        assert!(plan.window(Some(0), "short").is_some());
        assert!(plan.window(Some(1), "short").is_none());
    }

    #[test]
    fn tick_count_includes_initial_sample() {
        let window = ObservationWindow {
            name: "immediate".into(),
            duration: Duration::from_secs(120),
            interval: Duration::from_secs(30),
            rules: vec![],
        };
        assert_eq!(window.tick_count(), 5);
    }

    #[test]
    fn comparison_semantics() {
        assert!(Comparison::Gt.violated(6.0, 5.0));
        assert!(!Comparison::Gt.violated(5.0, 5.0));
        assert!(Comparison::Ge.violated(5.0, 5.0));
        assert!(Comparison::Lt.violated(0.5, 1.0));
        assert!(Comparison::Le.violated(1.0, 1.0));
    }

    #[test]
    fn validate_rejects_empty_phases() {
        let mut plan = RolloutPlan::from_toml_str(PLAN).unwrap();
        plan.phases.clear();
        assert!(matches!(plan.validate(), Err(PlanError::Invalid(_))));
    }

    #[test]
    fn validate_rejects_duplicate_phase_names() {
        let mut plan = RolloutPlan::from_toml_str(PLAN).unwrap();
        plan.phases[1].name = "canary".into();
        let err = plan.validate().unwrap_err().to_string();
        assert!(err.contains("duplicate phase"));
    }

    #[test]
    fn validate_rejects_interval_longer_than_window() {
        let mut plan = RolloutPlan::from_toml_str(PLAN).unwrap();
        plan.phases[0].windows[0].interval = Duration::from_secs(600);
        assert!(plan.validate().is_err());
    }

    #[test]
    fn validate_rejects_nan_threshold() {
        let mut plan = RolloutPlan::from_toml_str(PLAN).unwrap();
        plan.policy.rules[0].threshold = f64::NAN;
        assert!(plan.validate().is_err());
    }

    #[test]
    fn validate_rejects_rule_outlasting_its_window() {
        let mut plan = RolloutPlan::from_toml_str(PLAN).unwrap();
        plan.phases[0].windows[1].rules[0].sustained_for = Duration::from_secs(180);
        let err = plan.validate().unwrap_err().to_string();
        assert!(err.contains("can never be satisfied"), "{err}");

        plan.phases[0].windows[1].rules[0].sustained_for = Duration::from_secs(120);
        plan.validate().unwrap();
    }

    #[test]
    fn policy_rule_longer_than_some_windows_warns() {
        let mut plan = RolloutPlan::from_toml_str(PLAN).unwrap();
        assert!(plan.warnings().is_empty());

        plan.policy.rules[0].sustained_for = Duration::from_secs(240);
        plan.validate().unwrap();
        let warnings = plan.warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("`immediate`"), "{}", warnings[0]);

        plan.policy.rules[0].sustained_for = Duration::from_secs(600);
        let err = plan.validate().unwrap_err().to_string();
        assert!(err.contains("longest window"), "{err}");
    }

    #[test]
    fn bad_duration_is_a_parse_error() {
        let broken = PLAN.replace("global_timeout = \"45m\"", "global_timeout = \"soon\"");
        assert!(matches!(
            RolloutPlan::from_toml_str(&broken),
            Err(PlanError::Toml(_))
        ));
    }

    #[test]
    fn json_roundtrip_keeps_durations_readable() {
        let plan = RolloutPlan::from_toml_str(PLAN).unwrap();
        let json = serde_json::to_value(&plan).unwrap();
        assert_eq!(json["global_timeout"], "45m");
        assert_eq!(json["phases"][0]["windows"][1]["interval"], "30s");
        let back: RolloutPlan = serde_json::from_value(json).unwrap();
        assert_eq!(back.global_timeout, plan.global_timeout);
        assert_eq!(back.phases[0].windows, plan.phases[0].windows);
        assert_eq!(back.rollback.action.kind, ActionKind::Rollback);
    }
}
