//! rollgate-health: signal sampling for rollout verification.
//!
//! The monitor drives one observation window at a time: it samples every
//! signal the window's rules reference at a fixed interval, hands the
//! accumulated samples to an evaluator after each tick, and stops early
//! once the evaluator reaches a Hold or Rollback verdict.
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor::observe(window)
//!   ├── sample_tick() per interval
//!   │   └── SignalSource::query() → latest point | Unknown
//!   ├── WindowEvaluator::evaluate(samples) → Decision
//!   └── CancelToken (abort, lease loss, deadlines) checked at every wait
//! ```
//!
//! Source failures never abort a window. A failed or empty query is
//! recorded as an Unknown sample and left for the evaluator to judge.

pub mod cancel;
pub mod monitor;
pub mod sampler;
pub mod source;

pub use cancel::{CancelToken, Interrupt};
pub use monitor::{HealthMonitor, WindowEvaluator, WindowOutcome};
pub use sampler::sample_tick;
pub use source::{DataPoint, QueryWindow, SignalSource, SourceError, SourceFuture, SourceResult};
