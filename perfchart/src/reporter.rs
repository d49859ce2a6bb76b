//! Windowed performance samplers
//!
//! A sampler turns a stream of raw per-operation observations into one
//! aggregate per reporting interval. Both variants share the same shape: a
//! warm-up delay during which observations are accumulated but discarded, a
//! silent reset tick at the end of warm-up, then one listener report per
//! interval until the sampler is closed, at which point a final aggregate is
//! delivered exactly once.
//!
//! Recording operations never block on reporting. The latency variant
//! records into a double-buffered histogram pair, the throughput variant
//! bumps atomic counters; the periodic tick runs on the tokio timer off the
//! recording path.
//!
//! Listener failures are absorbed: a failed `on_report` is logged and the
//! schedule proceeds to the next tick. Listeners are composed behind a
//! fanout that delivers to each in registration order, isolating their
//! failures from one another.

use std::time::Duration;

pub mod latency;
pub mod throughput;

/// Error type surfaced by listeners.
///
/// Listener failures are logged by the sampler, never propagated; the boxed
/// form lets callers plug in whatever error their sink produces.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced by the samplers in this module.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The sampler's driving task could not be joined.
    #[error("Sampler task failed to join: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Reporting window shared by both sampler variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Time before the first reporting attempt. The tick that ends the
    /// warm-up is consumed silently to discard warm-up noise.
    pub warmup: Duration,
    /// Period between reports once warm-up has elapsed.
    pub interval: Duration,
}

impl Window {
    /// Create a new [`Window`].
    ///
    /// # Panics
    ///
    /// Panics if `interval` is zero; a zero reporting period is a
    /// programming error.
    #[must_use]
    pub fn new(warmup: Duration, interval: Duration) -> Self {
        assert!(!interval.is_zero(), "reporting interval must be non-zero");
        Self { warmup, interval }
    }
}

impl Default for Window {
    fn default() -> Self {
        Self {
            warmup: Duration::from_millis(1),
            interval: Duration::from_secs(1),
        }
    }
}
