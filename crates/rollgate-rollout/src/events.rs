//! Lifecycle events.
//!
//! The state machine emits events into an unbounded channel; a dispatcher
//! task forwards them to every registered notifier in order. `emit` never
//! waits, so a slow or failing notifier cannot hold up a rollout.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RolloutStarted,
    PreflightPassed,
    PhaseStarted,
    ActionSucceeded,
    ActionFailed,
    WindowStarted,
    DecisionRecorded,
    ApprovalRequested,
    RollbackStarted,
    RollbackAttemptFailed,
    RolloutSucceeded,
    RolloutRolledBack,
    RolloutFailed,
    AbortRequested,
    LeaseReclaimed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutEvent {
    pub rollout_id: String,
    pub target: String,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub at: u64,
}

pub type NotifyFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// A sink for lifecycle events.
pub trait EventNotifier: Send + Sync {
    fn notify<'a>(&'a self, event: &'a RolloutEvent) -> NotifyFuture<'a>;
}

/// Logs every event through `tracing`.
pub struct TracingNotifier;

impl EventNotifier for TracingNotifier {
    fn notify<'a>(&'a self, event: &'a RolloutEvent) -> NotifyFuture<'a> {
        Box::pin(async move {
            let rollout = &event.rollout_id;
            let target = &event.target;
            let kind = &event.kind;
            let payload = &event.payload;
            match event.kind {
                EventKind::RolloutFailed => {
                    error!(%rollout, %target, ?kind, %payload, "rollout event")
                }
                EventKind::RollbackStarted
                | EventKind::RollbackAttemptFailed
                | EventKind::ActionFailed
                | EventKind::AbortRequested
                | EventKind::LeaseReclaimed => {
                    warn!(%rollout, %target, ?kind, %payload, "rollout event")
                }
                _ => info!(%rollout, %target, ?kind, %payload, "rollout event"),
            }
        })
    }
}

/// Per-rollout event channel. Cloning shares the channel; the dispatcher
/// exits once every clone is dropped and the queue is drained.
#[derive(Clone)]
pub struct EventBus {
    rollout_id: String,
    target: String,
    tx: mpsc::UnboundedSender<RolloutEvent>,
}

impl EventBus {
    /// Create the channel and spawn its dispatcher on the current runtime.
    pub fn spawn(rollout_id: &str, target: &str, notifiers: Vec<Arc<dyn EventNotifier>>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<RolloutEvent>();
        let id = rollout_id.to_string();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                for notifier in &notifiers {
                    notifier.notify(&event).await;
                }
            }
            debug!(rollout = %id, "event dispatcher finished");
        });
        Self {
            rollout_id: rollout_id.to_string(),
            target: target.to_string(),
            tx,
        }
    }

    pub fn emit(&self, kind: EventKind, payload: serde_json::Value, at: u64) {
        let event = RolloutEvent {
            rollout_id: self.rollout_id.clone(),
            target: self.target.clone(),
            kind,
            payload,
            at,
        };
        if self.tx.send(event).is_err() {
            debug!(rollout = %self.rollout_id, ?kind, "event dispatcher gone, event dropped");
        }
    }
}
