//! Orchestrator: the query surface over running and archived rollouts.
//!
//! `start` holds the target lease, runs preflight, creates the rollout
//! record and spawns two tasks per rollout: the phase executor, which
//! owns the record, and a lease renewer. Status readers never touch the
//! record directly; they read the executor's latest published snapshot,
//! or the store once the rollout has finished.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{RwLock, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use rollgate_core::{ActionKind, OrchestratorConfig, RolloutClock, RolloutPlan};
use rollgate_health::{CancelToken, HealthMonitor, Interrupt, SignalSource};
use rollgate_state::{
    ConcurrencyGuard, Lease, RolloutState, RolloutStatus, Stage, StateError, StateResult, StateStore,
};

use crate::approval::ApprovalGate;
use crate::controller::{PhaseExecutor, RecordKeeper};
use crate::error::{RolloutError, RolloutResult};
use crate::events::{EventBus, EventKind, EventNotifier};
use crate::executor::CommandExecutor;
use crate::preflight::{NoProbe, PreflightProbe, PreflightValidator, PreflightVerdict};

/// Result of an abort request. Each variant carries the snapshot at the
/// time of the request.
#[derive(Debug, Clone, PartialEq)]
pub enum AbortOutcome {
    Accepted(RolloutState),
    /// An abort is already pending, or the rollout is already rolling back.
    AlreadyRequested(RolloutState),
    AlreadyTerminal(RolloutState),
}

impl AbortOutcome {
    pub fn snapshot(&self) -> &RolloutState {
        match self {
            Self::Accepted(s) | Self::AlreadyRequested(s) | Self::AlreadyTerminal(s) => s,
        }
    }
}

/// Handles on a rollout whose executor task is still running.
struct ActiveRollout {
    snapshot: watch::Receiver<RolloutState>,
    stop: watch::Sender<Option<Interrupt>>,
    events: EventBus,
    clock: RolloutClock,
    /// Flips once the lease is released and the entry removed.
    finished: watch::Receiver<bool>,
}

#[derive(Clone)]
pub struct Orchestrator {
    store: StateStore,
    guard: ConcurrencyGuard,
    executor: Arc<dyn CommandExecutor>,
    source: Arc<dyn SignalSource>,
    probe: Arc<dyn PreflightProbe>,
    approval: Option<Arc<dyn ApprovalGate>>,
    notifiers: Vec<Arc<dyn EventNotifier>>,
    lease_ttl: Duration,
    renew_interval: Duration,
    query_timeout: Option<Duration>,
    active: Arc<RwLock<HashMap<String, ActiveRollout>>>,
}

impl Orchestrator {
    pub fn new(
        store: StateStore,
        executor: Arc<dyn CommandExecutor>,
        source: Arc<dyn SignalSource>,
    ) -> Self {
        let defaults = OrchestratorConfig::default();
        Self {
            guard: ConcurrencyGuard::new(store.clone()),
            store,
            executor,
            source,
            probe: Arc::new(NoProbe),
            approval: None,
            notifiers: Vec::new(),
            lease_ttl: defaults.lease_ttl,
            renew_interval: defaults.renew_interval(),
            query_timeout: None,
            active: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_config(mut self, config: &OrchestratorConfig) -> Self {
        self.lease_ttl = config.lease_ttl;
        self.renew_interval = config.renew_interval();
        self.query_timeout = config.query_timeout;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn PreflightProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_approval(mut self, gate: Arc<dyn ApprovalGate>) -> Self {
        self.approval = Some(gate);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn EventNotifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn guard(&self) -> &ConcurrencyGuard {
        &self.guard
    }

    /// Start a rollout. Returns the initial snapshot once the lease is
    /// held and preflight has passed; the rollout itself continues in the
    /// background.
    pub async fn start(&self, mut plan: RolloutPlan) -> RolloutResult<RolloutState> {
        plan.validate()?;
        plan.rollback.action.kind = ActionKind::Rollback;
        let id = uuid::Uuid::new_v4().to_string();
        let target = plan.target.clone();
        for warning in plan.warnings() {
            warn!(rollout = %id, %target, "{warning}");
        }

        let acquisition = self.guard.acquire(&target, &id, self.lease_ttl)?;
        let lease = acquisition.lease;
        info!(rollout = %id, %target, "lease acquired, running preflight");

        let verdict = PreflightValidator::new(self.probe.clone())
            .run(&target, &plan.preflight, plan.preflight_mode)
            .await;
        if let PreflightVerdict::NoGo {
            reason,
            failed_checks,
        } = verdict
        {
            warn!(rollout = %id, %target, %reason, "preflight NOGO, rollout not started");
            self.release(&lease);
            return Err(RolloutError::Validation {
                reason,
                failed_checks,
            });
        }

        let lease = self.guard.renew(&lease)?;
        let clock = RolloutClock::start();
        let mut state = RolloutState::new(&id, plan.clone(), &lease.token, clock.now_ms());
        if let Err(e) = state
            .transition(Stage::PreflightRunning, clock.now_ms(), "lease acquired, preflight GO")
            .and_then(|()| self.store.put_rollout(&state))
        {
            self.release(&lease);
            return Err(e.into());
        }

        let events = EventBus::spawn(&id, &target, self.notifiers.clone());
        let now = clock.now_ms();
        if let Some(previous) = &acquisition.reclaimed {
            events.emit(
                EventKind::LeaseReclaimed,
                json!({ "previous_owner": previous.owner, "expired_at": previous.expires_at() }),
                now,
            );
        }
        events.emit(
            EventKind::RolloutStarted,
            json!({ "phases": plan.phases.len(), "lease_token": lease.token }),
            now,
        );
        events.emit(
            EventKind::PreflightPassed,
            json!({ "checks": plan.preflight.len() }),
            now,
        );

        let (snapshot_tx, snapshot_rx) = watch::channel(state.clone());
        let (stop_tx, stop_rx) = watch::channel(None);
        let (finished_tx, finished_rx) = watch::channel(false);
        let cancel = CancelToken::new(stop_rx).with_deadline(Instant::now() + plan.global_timeout);

        self.active.write().await.insert(
            id.clone(),
            ActiveRollout {
                snapshot: snapshot_rx,
                stop: stop_tx.clone(),
                events: events.clone(),
                clock,
                finished: finished_rx,
            },
        );

        let keeper = RecordKeeper::new(state.clone(), self.store.clone(), snapshot_tx, events, clock);
        let mut monitor = HealthMonitor::new(self.source.clone(), &target, clock);
        if let Some(timeout) = self.query_timeout {
            monitor = monitor.with_query_timeout(timeout);
        }
        let executor = PhaseExecutor::new(
            keeper,
            self.executor.clone(),
            monitor,
            self.approval.clone(),
            cancel,
        );

        let (done_tx, done_rx) = watch::channel(false);
        let guard = self.guard.clone();
        let renewer = tokio::spawn(renew_lease(
            move |lease: &Lease| guard.renew(lease),
            lease.clone(),
            self.renew_interval,
            stop_tx,
            done_rx,
        ));

        let orchestrator = self.clone();
        tokio::spawn(async move {
            let finished = executor.run().await;
            let store = orchestrator.store.clone();
            let persisted = persist_terminal(|state| store.put_rollout(state), &finished).await;
            let _ = done_tx.send(true);
            let lost = renewer.await.unwrap_or(false);
            if !lost {
                orchestrator.release(&lease);
            }
            orchestrator.retire(&finished, persisted).await;
            finished_tx.send_replace(true);
            info!(
                rollout = %finished.id,
                target = %finished.target,
                status = %finished.status(),
                reason = finished.reason().unwrap_or_default(),
                "rollout task finished"
            );
        });

        info!(rollout = %id, %target, phases = plan.phases.len(), "rollout started");
        Ok(state)
    }

    /// Latest snapshot: live from the executor if running, else archived.
    pub async fn status(&self, id: &str) -> RolloutResult<RolloutState> {
        if let Some(entry) = self.active.read().await.get(id) {
            return Ok(entry.snapshot.borrow().clone());
        }
        self.store
            .get_rollout(id)?
            .ok_or_else(|| RolloutError::NotFound(id.to_string()))
    }

    /// All rollouts, oldest first, with live snapshots for running ones.
    pub async fn list(&self) -> RolloutResult<Vec<RolloutState>> {
        let mut rollouts = self.store.list_rollouts()?;
        let active = self.active.read().await;
        for rollout in &mut rollouts {
            if let Some(entry) = active.get(&rollout.id) {
                *rollout = entry.snapshot.borrow().clone();
            }
        }
        Ok(rollouts)
    }

    /// Request an abort. The running rollout treats it as an immediate
    /// Rollback verdict at its next suspension point or transition.
    pub async fn abort(&self, id: &str) -> RolloutResult<AbortOutcome> {
        {
            let active = self.active.read().await;
            if let Some(entry) = active.get(id) {
                let snapshot = entry.snapshot.borrow().clone();
                if snapshot.is_terminal() {
                    return Ok(AbortOutcome::AlreadyTerminal(snapshot));
                }
                if entry.stop.borrow().is_some() || snapshot.status() == RolloutStatus::RollingBack {
                    debug!(rollout = %id, "abort already in effect");
                    return Ok(AbortOutcome::AlreadyRequested(snapshot));
                }
                entry.stop.send_replace(Some(Interrupt::Aborted));
                entry
                    .events
                    .emit(EventKind::AbortRequested, json!({}), entry.clock.now_ms());
                info!(rollout = %id, target = %snapshot.target, "abort requested");
                return Ok(AbortOutcome::Accepted(snapshot));
            }
        }

        match self.store.get_rollout(id)? {
            Some(state) if state.is_terminal() => Ok(AbortOutcome::AlreadyTerminal(state)),
            Some(_) => Err(RolloutError::NotActive(id.to_string())),
            None => Err(RolloutError::NotFound(id.to_string())),
        }
    }

    /// Wait until rollout `id` is terminal and its lease released.
    pub async fn wait(&self, id: &str) -> RolloutResult<RolloutState> {
        let finished = self
            .active
            .read()
            .await
            .get(id)
            .map(|entry| entry.finished.clone());
        if let Some(mut finished) = finished {
            // An error means the task is gone; the store has the last word.
            let _ = finished.wait_for(|done| *done).await;
        }
        self.status(id).await
    }

    /// Drop a finished rollout from the active map. A record that never
    /// reached the store stays here so readers still see its final state.
    async fn retire(&self, finished: &RolloutState, persisted: bool) {
        if persisted {
            self.active.write().await.remove(&finished.id);
        } else {
            error!(
                rollout = %finished.id,
                status = %finished.status(),
                "final record not persisted; serving it from memory"
            );
        }
    }

    fn release(&self, lease: &Lease) {
        match self.guard.release(lease) {
            Ok(true) => {}
            Ok(false) => warn!(target = %lease.target, "lease already gone at release"),
            Err(e) => error!(target = %lease.target, error = %e, "failed to release lease"),
        }
    }
}

const PERSIST_ATTEMPTS: u32 = 5;
const PERSIST_BACKOFF: Duration = Duration::from_millis(200);

/// Write the terminal record, retrying with doubling backoff. Returns
/// whether the store now holds it.
async fn persist_terminal<P>(mut put: P, state: &RolloutState) -> bool
where
    P: FnMut(&RolloutState) -> StateResult<()>,
{
    let mut backoff = PERSIST_BACKOFF;
    for attempt in 1..=PERSIST_ATTEMPTS {
        match put(state) {
            Ok(()) => return true,
            Err(e) => {
                error!(rollout = %state.id, attempt, error = %e, "failed to persist final record");
                if attempt < PERSIST_ATTEMPTS {
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }
    false
}

/// Renew `lease` every `every` until `done` flips. Returns true if the
/// lease was lost, after signalling the executor. Store errors other than
/// expiry are retried until the lease's TTL has run out since the last
/// successful renewal.
async fn renew_lease<R>(
    renew: R,
    lease: Lease,
    every: Duration,
    stop: watch::Sender<Option<Interrupt>>,
    mut done: watch::Receiver<bool>,
) -> bool
where
    R: Fn(&Lease) -> StateResult<Lease>,
{
    let ttl = Duration::from_millis(lease.ttl_ms);
    let mut renewed = Instant::now();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(every) => match renew(&lease) {
                Ok(_) => renewed = Instant::now(),
                Err(e @ StateError::LeaseExpired { .. }) => {
                    error!(target = %lease.target, owner = %lease.owner, error = %e, "lease lost");
                    stop.send_replace(Some(Interrupt::LeaseLost));
                    return true;
                }
                Err(e) if renewed.elapsed() >= ttl => {
                    error!(target = %lease.target, owner = %lease.owner, error = %e, "lease renewal failing past its TTL");
                    stop.send_replace(Some(Interrupt::LeaseLost));
                    return true;
                }
                Err(e) => {
                    warn!(target = %lease.target, owner = %lease.owner, error = %e, "lease renewal failed, retrying");
                }
            },
            result = done.changed() => {
                if result.is_err() || *done.borrow() {
                    return false;
                }
            }
        }
    }
}
