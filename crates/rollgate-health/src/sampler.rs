//! One sampling tick.
//!
//! Queries each signal over the interval that just elapsed and keeps the
//! most recent point. A source error, an empty answer or a query that
//! outlives its timeout all produce an Unknown sample; the tick itself
//! never fails.

use std::time::Duration;

use tracing::{debug, warn};

use rollgate_state::{Signal, WindowScope};

use crate::source::{QueryWindow, SignalSource};

/// Sample every signal in `signals` once, stamping each sample with `now`.
pub async fn sample_tick(
    source: &dyn SignalSource,
    target: &str,
    signals: &[String],
    scope: &WindowScope,
    now: u64,
    interval: Duration,
    query_timeout: Duration,
) -> Vec<Signal> {
    let window = QueryWindow {
        start: now.saturating_sub(interval.as_millis() as u64),
        end: now,
    };

    let mut samples = Vec::with_capacity(signals.len());
    for name in signals {
        let value = match tokio::time::timeout(query_timeout, source.query(target, name, window))
            .await
        {
            Ok(Ok(points)) => {
                let latest = points
                    .iter()
                    .filter(|p| window.contains(p.timestamp) && p.value.is_finite())
                    .max_by_key(|p| p.timestamp)
                    .map(|p| p.value);
                if latest.is_none() {
                    debug!(%target, signal = %name, "no data points in sample interval");
                }
                latest
            }
            Ok(Err(e)) => {
                warn!(%target, signal = %name, error = %e, "signal query failed, sample unknown");
                None
            }
            Err(_) => {
                warn!(%target, signal = %name, timeout = ?query_timeout, "signal query timed out, sample unknown");
                None
            }
        };
        samples.push(Signal {
            name: name.clone(),
            value,
            timestamp: now,
            scope: scope.clone(),
        });
    }
    samples
}
