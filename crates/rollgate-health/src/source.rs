//! Signal source abstraction.
//!
//! A source answers "what values did signal S have on target T during
//! this time range". It is read-only and may be slow or unavailable; the
//! sampler bounds every query with a timeout.

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

/// Result type alias for signal source queries.
pub type SourceResult<T> = Result<T, SourceError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SourceError {
    #[error("signal source unavailable: {0}")]
    Unavailable(String),

    #[error("unknown signal `{0}`")]
    UnknownSignal(String),

    #[error("malformed value for `{signal}`: {detail}")]
    Malformed { signal: String, detail: String },
}

/// Inclusive time range in milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryWindow {
    pub start: u64,
    pub end: u64,
}

impl QueryWindow {
    pub fn contains(&self, ts: u64) -> bool {
        ts >= self.start && ts <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataPoint {
    pub timestamp: u64,
    pub value: f64,
}

pub type SourceFuture<'a> = Pin<Box<dyn Future<Output = SourceResult<Vec<DataPoint>>> + Send + 'a>>;

/// Read-only access to time-series health signals.
pub trait SignalSource: Send + Sync {
    /// Points for `signal` on `target` within `window`, ordered by timestamp.
    fn query<'a>(&'a self, target: &'a str, signal: &'a str, window: QueryWindow)
    -> SourceFuture<'a>;
}
