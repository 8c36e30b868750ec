//! StateStore: redb-backed persistence for rollout records.
//!
//! Rollout records are JSON-serialized into redb's `&[u8]` value columns
//! and keyed by rollout id. Every `put_rollout` commits its own write
//! transaction, so a record read back after a crash is always one that
//! was fully written. The store supports both on-disk and in-memory
//! backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::StateResult;
use crate::tables::*;
use crate::types::*;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    pub(crate) db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        txn.open_table(LEASES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Rollouts ───────────────────────────────────────────────────

    /// Insert or replace a rollout record.
    pub fn put_rollout(&self, state: &RolloutState) -> StateResult<()> {
        let key = state.table_key();
        let value = serde_json::to_vec(state).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            table.insert(key, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, status = %state.status(), stage = %state.stage(), "rollout stored");
        Ok(())
    }

    pub fn get_rollout(&self, id: &str) -> StateResult<Option<RolloutState>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let state: RolloutState =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    /// List all rollouts, oldest first.
    pub fn list_rollouts(&self) -> StateResult<Vec<RolloutState>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let state: RolloutState =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(state);
        }
        results.sort_by(|a, b| a.created_at().cmp(&b.created_at()).then(a.id.cmp(&b.id)));
        Ok(results)
    }

    // ── Leases ─────────────────────────────────────────────────────

    /// Get the lease row for a target, expired or not.
    pub fn get_lease(&self, target: &str) -> StateResult<Option<Lease>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LEASES).map_err(map_err!(Table))?;
        match table.get(target).map_err(map_err!(Read))? {
            Some(guard) => {
                let lease: Lease =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(lease))
            }
            None => Ok(None),
        }
    }

    pub fn list_leases(&self) -> StateResult<Vec<Lease>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(LEASES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let lease: Lease =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(lease);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollgate_core::RolloutPlan;

    fn test_plan(target: &str) -> RolloutPlan {
        RolloutPlan::from_toml_str(&format!(
            r#"
target = "{target}"

[[phases]]
name = "canary"
action = {{ name = "deploy" }}

[rollback]
action = {{ name = "revert" }}
"#
        ))
        .unwrap()
    }

    fn test_rollout(id: &str, target: &str, created_at: u64) -> RolloutState {
        RolloutState::new(id, test_plan(target), "token", created_at)
    }

    // ── Rollout CRUD ───────────────────────────────────────────────

    #[test]
    fn put_and_get_rollout() {
        let store = StateStore::open_in_memory().unwrap();
        let mut state = test_rollout("r1", "prod/api", 1000);
        state.transition(Stage::PreflightRunning, 1001, "go").unwrap();
        store.put_rollout(&state).unwrap();

        let loaded = store.get_rollout("r1").unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.stage(), Stage::PreflightRunning);
    }

    #[test]
    fn get_nonexistent_rollout_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_rollout("nope").unwrap().is_none());
    }

    #[test]
    fn put_overwrites_previous_snapshot() {
        let store = StateStore::open_in_memory().unwrap();
        let mut state = test_rollout("r1", "prod/api", 1000);
        store.put_rollout(&state).unwrap();
        state.transition(Stage::PreflightRunning, 1001, "").unwrap();
        state.transition(Stage::Deploying { phase: 0 }, 1002, "").unwrap();
        store.put_rollout(&state).unwrap();

        let loaded = store.get_rollout("r1").unwrap().unwrap();
        assert_eq!(loaded.transitions().len(), 2);
        assert_eq!(store.list_rollouts().unwrap().len(), 1);
    }

    #[test]
    fn list_rollouts_sorted_by_creation() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_rollout(&test_rollout("b", "prod/api", 2000)).unwrap();
        store.put_rollout(&test_rollout("a", "prod/web", 3000)).unwrap();
        store.put_rollout(&test_rollout("c", "prod/api", 1000)).unwrap();

        let ids: Vec<String> = store
            .list_rollouts()
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, ["c", "b", "a"]);
    }

    // ── Persistence ────────────────────────────────────────────────

    #[test]
    fn on_disk_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.redb");
        {
            let store = StateStore::open(&path).unwrap();
            let mut state = test_rollout("r1", "prod/api", 1000);
            state.transition(Stage::PreflightRunning, 1001, "").unwrap();
            state.record_signal(Signal {
                name: "latency".into(),
                value: Some(12.5),
                timestamp: 1002,
                scope: WindowScope::new(Some(0), "immediate", 0),
            })
            .unwrap();
            store.put_rollout(&state).unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        let loaded = store.get_rollout("r1").unwrap().unwrap();
        assert_eq!(loaded.signals().len(), 1);
        assert_eq!(loaded.signals()[0].value, Some(12.5));
    }
}
