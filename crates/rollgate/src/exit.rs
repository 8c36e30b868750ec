//! Process exit codes for `rollgate run` and `rollgate validate`.

use rollgate_rollout::RolloutError;
use rollgate_state::RolloutStatus;

pub const SUCCEEDED: u8 = 0;
/// Plan invalid or preflight NOGO; nothing was changed.
pub const INVALID: u8 = 1;
/// Lease conflict, store failure or any other runtime error.
pub const RUNTIME: u8 = 2;
pub const ROLLED_BACK: u8 = 3;
/// Rollback failed or the lease was lost; manual intervention required.
pub const FAILED: u8 = 4;

pub fn for_status(status: RolloutStatus) -> u8 {
    match status {
        RolloutStatus::Succeeded => SUCCEEDED,
        RolloutStatus::RolledBack => ROLLED_BACK,
        RolloutStatus::Failed => FAILED,
        // Only reachable if the rollout task died before finishing.
        RolloutStatus::Pending | RolloutStatus::Running | RolloutStatus::RollingBack => RUNTIME,
    }
}

pub fn for_error(err: &RolloutError) -> u8 {
    match err {
        RolloutError::Plan(_) | RolloutError::Validation { .. } => INVALID,
        _ => RUNTIME,
    }
}
