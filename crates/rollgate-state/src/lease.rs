//! Per-target exclusive leases.
//!
//! A lease row lives in the `leases` table keyed by target. Acquire,
//! renew and release each run inside one redb write transaction; redb
//! admits a single writer at a time, so two acquires for the same target
//! are serialized and the second sees the first's row.
//!
//! An expired lease may be reclaimed by a new acquire. The abandoned
//! rollout's record is moved to `Failed` with `LeaseExpired` in the same
//! transaction, so no observer sees two live rollouts on one target.

use std::time::Duration;

use redb::ReadableTable;
use tracing::{debug, info, warn};

use rollgate_core::epoch_millis;

use crate::error::{StateError, StateResult};
use crate::store::StateStore;
use crate::tables::{LEASES, ROLLOUTS};
use crate::types::{Lease, RolloutState, RolloutStatus};

/// Result of a successful acquire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acquisition {
    pub lease: Lease,
    /// The expired lease this acquire replaced, if any.
    pub reclaimed: Option<Lease>,
}

/// Grants at most one live lease per target.
#[derive(Clone)]
pub struct ConcurrencyGuard {
    store: StateStore,
}

impl ConcurrencyGuard {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Acquire `target` for rollout `owner` using the wall clock.
    pub fn acquire(&self, target: &str, owner: &str, ttl: Duration) -> StateResult<Acquisition> {
        self.acquire_at(target, owner, ttl, epoch_millis())
    }

    pub fn acquire_at(
        &self,
        target: &str,
        owner: &str,
        ttl: Duration,
        now: u64,
    ) -> StateResult<Acquisition> {
        let txn = self.store.db.begin_write().map_err(map_err!(Transaction))?;

        let existing: Option<Lease> = {
            let table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            let row = table.get(target).map_err(map_err!(Read))?;
            match row {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            }
        };

        if let Some(current) = &existing {
            if !current.is_expired(now) {
                let owner = current.owner.clone();
                txn.abort().map_err(map_err!(Transaction))?;
                debug!(%target, %owner, "lease held, acquire refused");
                return Err(StateError::LeaseConflict {
                    target: target.to_string(),
                    owner,
                });
            }
        }

        if let Some(expired) = &existing {
            let mut rollouts = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            let abandoned: Option<RolloutState> = match rollouts
                .get(expired.owner.as_str())
                .map_err(map_err!(Read))?
            {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            if let Some(mut abandoned) = abandoned {
                match abandoned.status() {
                    RolloutStatus::Running | RolloutStatus::RollingBack => {
                        abandoned.mark_lease_expired(now)?;
                        let value =
                            serde_json::to_vec(&abandoned).map_err(map_err!(Serialize))?;
                        rollouts
                            .insert(abandoned.id.as_str(), value.as_slice())
                            .map_err(map_err!(Write))?;
                        warn!(
                            %target,
                            rollout = %abandoned.id,
                            "reclaimed expired lease; abandoned rollout marked failed"
                        );
                    }
                    status => {
                        debug!(%target, rollout = %abandoned.id, %status, "reclaimed expired lease");
                    }
                }
            }
        }

        let lease = Lease {
            token: uuid::Uuid::new_v4().to_string(),
            target: target.to_string(),
            owner: owner.to_string(),
            acquired_at: now,
            renewed_at: now,
            ttl_ms: ttl.as_millis() as u64,
        };
        {
            let mut table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            let value = serde_json::to_vec(&lease).map_err(map_err!(Serialize))?;
            table
                .insert(target, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;

        info!(%target, %owner, ttl_ms = lease.ttl_ms, "lease acquired");
        Ok(Acquisition {
            lease,
            reclaimed: existing,
        })
    }

    /// Extend a lease. Fails with `LeaseExpired` if the lease has lapsed
    /// or now belongs to someone else.
    pub fn renew(&self, lease: &Lease) -> StateResult<Lease> {
        self.renew_at(lease, epoch_millis())
    }

    pub fn renew_at(&self, lease: &Lease, now: u64) -> StateResult<Lease> {
        let lost = || StateError::LeaseExpired {
            target: lease.target.clone(),
        };
        let txn = self.store.db.begin_write().map_err(map_err!(Transaction))?;
        let renewed = {
            let mut table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            let current: Option<Lease> = match table
                .get(lease.target.as_str())
                .map_err(map_err!(Read))?
            {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            match current {
                Some(mut current) if current.token == lease.token && !current.is_expired(now) => {
                    current.renewed_at = now;
                    let value = serde_json::to_vec(&current).map_err(map_err!(Serialize))?;
                    table
                        .insert(lease.target.as_str(), value.as_slice())
                        .map_err(map_err!(Write))?;
                    Some(current)
                }
                _ => None,
            }
        };
        match renewed {
            Some(renewed) => {
                txn.commit().map_err(map_err!(Transaction))?;
                debug!(target = %renewed.target, "lease renewed");
                Ok(renewed)
            }
            None => {
                txn.abort().map_err(map_err!(Transaction))?;
                Err(lost())
            }
        }
    }

    /// Release a lease. Only the holder's token removes the row; returns
    /// whether anything was removed.
    pub fn release(&self, lease: &Lease) -> StateResult<bool> {
        let txn = self.store.db.begin_write().map_err(map_err!(Transaction))?;
        let released = {
            let mut table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            let holds = match table.get(lease.target.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    let current: Lease =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    current.token == lease.token
                }
                None => false,
            };
            if holds {
                table
                    .remove(lease.target.as_str())
                    .map_err(map_err!(Write))?;
            }
            holds
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(target = %lease.target, released, "lease released");
        Ok(released)
    }

    /// The unexpired lease on `target`, if any.
    pub fn current(&self, target: &str) -> StateResult<Option<Lease>> {
        self.current_at(target, epoch_millis())
    }

    pub fn current_at(&self, target: &str, now: u64) -> StateResult<Option<Lease>> {
        Ok(self
            .store
            .get_lease(target)?
            .filter(|lease| !lease.is_expired(now)))
    }

    pub fn list(&self) -> StateResult<Vec<Lease>> {
        self.store.list_leases()
    }
}
