//! redb table definitions for the rollgate state store.
//!
//! Both tables use `&str` keys and `&[u8]` values (JSON-serialized types).

use redb::TableDefinition;

/// Rollout records keyed by rollout id.
pub const ROLLOUTS: TableDefinition<&str, &[u8]> = TableDefinition::new("rollouts");

/// Active leases keyed by target.
pub const LEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("leases");
