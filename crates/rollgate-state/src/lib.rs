//! rollgate-state: embedded state store for rollgate.
//!
//! Backed by [redb](https://docs.rs/redb). Holds two tables:
//!
//! - `rollouts`: the append-only [`RolloutState`] record of every rollout,
//!   keyed by rollout id. Terminal records stay here as the archive.
//! - `leases`: at most one [`Lease`] per target. The [`ConcurrencyGuard`]
//!   performs acquire/renew/release inside single redb write
//!   transactions, which redb serializes, so concurrent acquires for the
//!   same target cannot both succeed.
//!
//! All values are JSON-serialized into `&[u8]` columns. The `StateStore`
//! is `Clone` + `Send` + `Sync` and can be shared across tasks.

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| $crate::error::StateError::$variant(e.to_string())
    };
}

pub mod error;
pub mod lease;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use lease::{Acquisition, ConcurrencyGuard};
pub use store::StateStore;
pub use types::*;
