//! Shared fixtures for orchestrator integration tests.
//!
//! `FakeTarget` plays both the deployment executor and the metrics
//! backend: each signal answers from a script, one value per query, and
//! falls back to its baseline once the script runs dry or the target has
//! been reverted.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rollgate_core::{Action, ActionKind, RolloutPlan};
use rollgate_health::{DataPoint, QueryWindow, SignalSource, SourceError, SourceFuture};
use rollgate_rollout::events::NotifyFuture;
use rollgate_rollout::executor::ExecFuture;
use rollgate_rollout::{CommandExecutor, EventKind, EventNotifier, Orchestrator, RolloutEvent};
use rollgate_state::StateStore;

pub const TARGET: &str = "prod/checkout";

#[derive(Default)]
struct Inner {
    /// `None` entries answer with a source error.
    scripts: HashMap<String, VecDeque<Option<f64>>>,
    baselines: HashMap<String, f64>,
    failing: HashSet<String>,
    rollback_failures: u32,
    reverted: bool,
    executed: Vec<String>,
    delay: Duration,
}

#[derive(Default)]
pub struct FakeTarget {
    inner: Mutex<Inner>,
}

impl FakeTarget {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(self: &Arc<Self>, signal: &str, values: &[Option<f64>]) -> Arc<Self> {
        self.inner
            .lock()
            .unwrap()
            .scripts
            .insert(signal.to_string(), values.iter().copied().collect());
        self.clone()
    }

    pub fn baseline(self: &Arc<Self>, signal: &str, value: f64) -> Arc<Self> {
        self.inner
            .lock()
            .unwrap()
            .baselines
            .insert(signal.to_string(), value);
        self.clone()
    }

    pub fn fail_action(self: &Arc<Self>, name: &str) -> Arc<Self> {
        self.inner.lock().unwrap().failing.insert(name.to_string());
        self.clone()
    }

    /// The next `n` rollback actions fail.
    pub fn fail_rollbacks(self: &Arc<Self>, n: u32) -> Arc<Self> {
        self.inner.lock().unwrap().rollback_failures = n;
        self.clone()
    }

    /// Every action takes `delay` before answering.
    pub fn delay(self: &Arc<Self>, delay: Duration) -> Arc<Self> {
        self.inner.lock().unwrap().delay = delay;
        self.clone()
    }

    pub fn executed(&self) -> Vec<String> {
        self.inner.lock().unwrap().executed.clone()
    }

    pub fn reverted(&self) -> bool {
        self.inner.lock().unwrap().reverted
    }

    fn next_value(&self, signal: &str) -> Option<f64> {
        let mut inner = self.inner.lock().unwrap();
        let baseline = inner.baselines.get(signal).copied().unwrap_or(0.0);
        if inner.reverted {
            return Some(baseline);
        }
        match inner.scripts.get_mut(signal).and_then(|s| s.pop_front()) {
            Some(value) => value,
            None => Some(baseline),
        }
    }
}

impl CommandExecutor for FakeTarget {
    fn execute<'a>(&'a self, _target: &'a str, action: &'a Action) -> ExecFuture<'a> {
        Box::pin(async move {
            let delay = {
                let mut inner = self.inner.lock().unwrap();
                inner.executed.push(action.name.clone());
                inner.delay
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let mut inner = self.inner.lock().unwrap();
            match action.kind {
                ActionKind::Rollback if inner.rollback_failures > 0 => {
                    inner.rollback_failures -= 1;
                    Err("revert rejected by target".to_string())
                }
                ActionKind::Rollback => {
                    inner.reverted = true;
                    Ok("reverted".to_string())
                }
                ActionKind::Deploy if inner.failing.contains(&action.name) => {
                    Err(format!("{} exited with status 1", action.name))
                }
                ActionKind::Deploy => Ok(format!("{} applied", action.name)),
            }
        })
    }
}

impl SignalSource for FakeTarget {
    fn query<'a>(
        &'a self,
        _target: &'a str,
        signal: &'a str,
        window: QueryWindow,
    ) -> SourceFuture<'a> {
        let value = self.next_value(signal);
        Box::pin(async move {
            match value {
                Some(value) => Ok(vec![DataPoint {
                    timestamp: window.end,
                    value,
                }]),
                None => Err(SourceError::Unavailable("metrics backend down".into())),
            }
        })
    }
}

/// Keeps every delivered event.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<RolloutEvent>>,
}

impl RecordingNotifier {
    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().unwrap().iter().map(|e| e.kind).collect()
    }
}

impl EventNotifier for RecordingNotifier {
    fn notify<'a>(&'a self, event: &'a RolloutEvent) -> NotifyFuture<'a> {
        Box::pin(async move {
            self.events.lock().unwrap().push(event.clone());
        })
    }
}

pub fn orchestrator(target: &Arc<FakeTarget>) -> Orchestrator {
    Orchestrator::new(
        StateStore::open_in_memory().unwrap(),
        target.clone(),
        target.clone(),
    )
}

pub fn plan(toml: &str) -> RolloutPlan {
    RolloutPlan::from_toml_str(toml).unwrap()
}

/// One phase with a single two-minute window watching latency.
pub fn canary_plan(extra: &str) -> RolloutPlan {
    plan(&format!(
        r#"
target = "{TARGET}"
{extra}

[[phases]]
name = "canary"
action = {{ name = "deploy-canary" }}

[[phases.windows]]
name = "immediate"
duration = "2m"
interval = "30s"
rules = [{{ signal = "latency_ms", op = ">", threshold = 200.0, sustained_for = "1m" }}]

[rollback]
action = {{ name = "revert", kind = "rollback" }}
"#
    ))
}
