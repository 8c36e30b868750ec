//! rollgate-core: rollout plan model, configuration, and duration parsing.
//!
//! A [`RolloutPlan`] is the fully specified, immutable description of a
//! change: the target, ordered phases, observation windows with their
//! threshold rules, the rollback policy, and preflight checks. Plans are
//! written as TOML and validated before a rollout is started.

pub mod clock;
pub mod config;
pub mod duration;
pub mod error;
pub mod plan;

pub use clock::{RolloutClock, epoch_millis};
pub use config::OrchestratorConfig;
pub use duration::{format_duration, parse_duration};
pub use error::{PlanError, PlanResult};
pub use plan::*;
