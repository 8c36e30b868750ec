//! rollgate-rollout: the rollout orchestration control loop.
//!
//! Takes a declared [`RolloutPlan`](rollgate_core::RolloutPlan), holds the
//! target's lease, gates on preflight, executes phases in order, verifies
//! each phase through the health monitor, and reverts on breach.
//!
//! # Components
//!
//! - **`decision`**: deterministic rule evaluation and decision replay
//! - **`preflight`**: read-only go/no-go checks before any mutation
//! - **`executor`**: command executor trait and bounded action runs
//! - **`approval`**: optional manual sign-off between phases
//! - **`events`**: fire-and-forget lifecycle notifications
//! - **`controller`**: the phase state machine for one rollout
//! - **`rollback`**: revert with bounded retries and backoff
//! - **`orchestrator`**: start / status / abort / list / wait

pub mod approval;
pub mod controller;
pub mod decision;
pub mod error;
pub mod events;
pub mod executor;
pub mod orchestrator;
pub mod preflight;
pub mod rollback;

pub use approval::{ApprovalGate, ApprovalOutcome, ApprovalStatus, AutoApprove};
pub use decision::{DecisionEngine, ReplayEntry, ReplayReport, replay};
pub use error::{RolloutError, RolloutResult};
pub use events::{EventKind, EventNotifier, RolloutEvent, TracingNotifier};
pub use executor::CommandExecutor;
pub use orchestrator::{AbortOutcome, Orchestrator};
pub use preflight::{PreflightProbe, PreflightValidator, PreflightVerdict};
pub use rollback::RollbackExecutor;
