//! The throughput variant of the windowed sampler
//!
//! Worker threads bump monotonic message and byte counters through a
//! cloneable [`ThroughputHandle`]; a driving task reads the counters once
//! per reporting interval and reports the delta as a wall-clock-compensated
//! rate. Ticks drift, the timer never fires at the exact period, so the raw
//! delta is rescaled by the actually elapsed wall time: a tick that arrives
//! late reports a proportionally smaller per-interval figure instead of an
//! inflated one.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use perfchart_series::store::SeriesStore;
use tokio::{task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{Error, ListenerError, Window};

/// Rescale a counter delta to a per-interval rate compensated for timer
/// drift.
///
/// Returns `delta * interval / elapsed`, the count the interval would have
/// seen had the tick fired exactly on schedule. Zero elapsed wall time
/// yields a rate of zero rather than a division error.
#[must_use]
pub fn interval_rate(delta: u64, interval: Duration, elapsed: Duration) -> f64 {
    if elapsed.is_zero() {
        return 0.0;
    }
    delta as f64 * interval.as_nanos() as f64 / elapsed.as_nanos() as f64
}

/// Per-interval rates delivered to listeners.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntervalRates {
    /// Messages per reporting interval, drift-compensated.
    pub message_rate: f64,
    /// Bytes per reporting interval, drift-compensated.
    pub byte_rate: f64,
}

/// Totals delivered once at termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateSummary {
    /// Messages recorded after warm-up ended.
    pub total_messages: u64,
    /// Bytes recorded after warm-up ended.
    pub total_bytes: u64,
    /// Wall time between the end of warm-up and termination.
    pub elapsed: Duration,
}

/// Receiver of throughput aggregates.
pub trait ThroughputListener: Send {
    /// Called once per reporting interval with the rates observed since the
    /// previous tick.
    ///
    /// # Errors
    ///
    /// Failures are logged by the sampler and do not stop the schedule.
    fn on_report(&mut self, rates: &IntervalRates) -> Result<(), ListenerError>;

    /// Called exactly once at termination with the post-warm-up totals.
    ///
    /// # Errors
    ///
    /// Failures are logged by the sampler; listener resources are released
    /// regardless.
    fn on_terminate(&mut self, summary: &RateSummary) -> Result<(), ListenerError>;
}

/// Forwards each aggregate to all registered listeners in registration
/// order, isolating their failures from one another.
struct Fanout {
    listeners: Vec<Box<dyn ThroughputListener>>,
}

impl Fanout {
    fn new(listeners: Vec<Box<dyn ThroughputListener>>) -> Self {
        Self { listeners }
    }

    fn on_report(&mut self, rates: &IntervalRates) {
        for (idx, listener) in self.listeners.iter_mut().enumerate() {
            if let Err(err) = listener.on_report(rates) {
                warn!(listener = idx, "throughput listener failed to report: {err}");
            }
        }
    }

    fn on_terminate(&mut self, summary: &RateSummary) {
        for (idx, listener) in self.listeners.iter_mut().enumerate() {
            if let Err(err) = listener.on_terminate(summary) {
                warn!(
                    listener = idx,
                    "throughput listener failed to terminate: {err}"
                );
            }
        }
    }
}

/// Monotonic counters shared between recording handles and the tick task.
#[derive(Debug, Default)]
struct Totals {
    messages: AtomicU64,
    bytes: AtomicU64,
}

/// Cloneable recording handle for benchmark worker threads.
#[derive(Debug, Clone)]
pub struct ThroughputHandle {
    totals: Arc<Totals>,
}

impl ThroughputHandle {
    /// Record `messages` operations totalling `bytes`. Never blocks on
    /// reporting and never fails.
    pub fn record(&self, messages: u64, bytes: u64) {
        self.totals.messages.fetch_add(messages, Ordering::Relaxed);
        self.totals.bytes.fetch_add(bytes, Ordering::Relaxed);
    }
}

/// Tick state machine, driven by the sampler task and by tests directly.
struct Core {
    totals: Arc<Totals>,
    interval: Duration,
    warmed: bool,
    last_messages: u64,
    last_bytes: u64,
    last_tick: Option<Instant>,
    baseline_messages: u64,
    baseline_bytes: u64,
    warm_end: Option<Instant>,
    listener: Fanout,
}

impl Core {
    fn new(totals: Arc<Totals>, interval: Duration, listener: Fanout) -> Self {
        Self {
            totals,
            interval,
            warmed: false,
            last_messages: 0,
            last_bytes: 0,
            last_tick: None,
            baseline_messages: 0,
            baseline_bytes: 0,
            warm_end: None,
            listener,
        }
    }

    fn tick(&mut self, now: Instant) {
        let messages = self.totals.messages.load(Ordering::Relaxed);
        let bytes = self.totals.bytes.load(Ordering::Relaxed);
        if !self.warmed {
            // Warming -> Active. Counts recorded so far become the baseline
            // and no listener is invoked.
            self.warmed = true;
            self.baseline_messages = messages;
            self.baseline_bytes = bytes;
            self.warm_end = Some(now);
        } else {
            let elapsed = self
                .last_tick
                .map_or(Duration::ZERO, |last| now.duration_since(last));
            let rates = IntervalRates {
                message_rate: interval_rate(messages - self.last_messages, self.interval, elapsed),
                byte_rate: interval_rate(bytes - self.last_bytes, self.interval, elapsed),
            };
            self.listener.on_report(&rates);
        }
        self.last_messages = messages;
        self.last_bytes = bytes;
        self.last_tick = Some(now);
    }

    fn terminate(mut self, now: Instant) {
        let messages = self.totals.messages.load(Ordering::Relaxed);
        let bytes = self.totals.bytes.load(Ordering::Relaxed);
        let summary = RateSummary {
            total_messages: messages.saturating_sub(self.baseline_messages),
            total_bytes: bytes.saturating_sub(self.baseline_bytes),
            elapsed: self
                .warm_end
                .map_or(Duration::ZERO, |warm_end| now.duration_since(warm_end)),
        };
        self.listener.on_terminate(&summary);
    }
}

/// The throughput sampler.
///
/// Spawned with [`ThroughputReporter::spawn`]; terminated with
/// [`ThroughputReporter::close`], which delivers the post-warm-up totals to
/// listeners exactly once.
#[derive(Debug)]
pub struct ThroughputReporter {
    handle: ThroughputHandle,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ThroughputReporter {
    /// Spawn the sampler on the current tokio runtime.
    #[must_use]
    pub fn spawn(window: Window, listeners: Vec<Box<dyn ThroughputListener>>) -> Self {
        let totals = Arc::new(Totals::default());
        let mut core = Core::new(Arc::clone(&totals), window.interval, Fanout::new(listeners));
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        let task = tokio::spawn(async move {
            let start = time::Instant::now() + window.warmup;
            let mut ticker = time::interval_at(start, window.interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => core.tick(time::Instant::now().into_std()),
                }
            }
            core.terminate(time::Instant::now().into_std());
        });

        Self {
            handle: ThroughputHandle { totals },
            shutdown,
            task,
        }
    }

    /// A cloneable handle for recording from worker threads.
    #[must_use]
    pub fn handle(&self) -> ThroughputHandle {
        self.handle.clone()
    }

    /// Record `messages` operations totalling `bytes`.
    pub fn record(&self, messages: u64, bytes: u64) {
        self.handle.record(messages, bytes);
    }

    /// Terminate the sampler: cancel future ticks, let an in-flight tick
    /// finish, deliver the post-warm-up totals to listeners exactly once.
    ///
    /// # Errors
    ///
    /// Returns an error if the driving task panicked.
    pub async fn close(self) -> Result<(), Error> {
        self.shutdown.cancel();
        self.task.await?;
        Ok(())
    }
}

/// Listener that writes message-rate points into a [`SeriesStore`].
///
/// Each report appends one point to the series named `{test_name}` in group
/// `throughput`.
#[derive(Debug)]
pub struct SeriesThroughputListener {
    store: Arc<SeriesStore>,
    test_name: String,
}

impl SeriesThroughputListener {
    /// Create a listener writing into `store` under `test_name`.
    #[must_use]
    pub fn new(store: Arc<SeriesStore>, test_name: impl Into<String>) -> Self {
        Self {
            store,
            test_name: test_name.into(),
        }
    }
}

impl ThroughputListener for SeriesThroughputListener {
    fn on_report(&mut self, rates: &IntervalRates) -> Result<(), ListenerError> {
        self.store
            .append_auto_x(&self.test_name, "throughput", rates.message_rate);
        Ok(())
    }

    fn on_terminate(&mut self, _summary: &RateSummary) -> Result<(), ListenerError> {
        Ok(())
    }
}

/// Listener that logs each interval's rates.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogThroughputListener;

impl ThroughputListener for LogThroughputListener {
    fn on_report(&mut self, rates: &IntervalRates) -> Result<(), ListenerError> {
        info!(
            message_rate = rates.message_rate,
            byte_rate = rates.byte_rate,
            "throughput interval"
        );
        Ok(())
    }

    fn on_terminate(&mut self, summary: &RateSummary) -> Result<(), ListenerError> {
        info!(
            total_messages = summary.total_messages,
            total_bytes = summary.total_bytes,
            elapsed_secs = summary.elapsed.as_secs_f64(),
            "throughput summary"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use proptest::prelude::*;

    use super::*;

    #[derive(Clone, Default)]
    struct CollectingListener {
        reports: Arc<Mutex<Vec<IntervalRates>>>,
        terminations: Arc<Mutex<Vec<RateSummary>>>,
    }

    impl ThroughputListener for CollectingListener {
        fn on_report(&mut self, rates: &IntervalRates) -> Result<(), ListenerError> {
            self.reports.lock().unwrap().push(*rates);
            Ok(())
        }

        fn on_terminate(&mut self, summary: &RateSummary) -> Result<(), ListenerError> {
            self.terminations.lock().unwrap().push(*summary);
            Ok(())
        }
    }

    struct FailingListener;

    impl ThroughputListener for FailingListener {
        fn on_report(&mut self, _rates: &IntervalRates) -> Result<(), ListenerError> {
            Err("sink unavailable".into())
        }

        fn on_terminate(&mut self, _summary: &RateSummary) -> Result<(), ListenerError> {
            Err("sink unavailable".into())
        }
    }

    fn core_with(
        listeners: Vec<Box<dyn ThroughputListener>>,
    ) -> (Core, ThroughputHandle) {
        let totals = Arc::new(Totals::default());
        let handle = ThroughputHandle {
            totals: Arc::clone(&totals),
        };
        let core = Core::new(totals, Duration::from_secs(1), Fanout::new(listeners));
        (core, handle)
    }

    #[test]
    fn exact_interval_reports_raw_delta() {
        assert!((interval_rate(100, Duration::from_secs(1), Duration::from_secs(1)) - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn late_tick_deflates_the_rate() {
        // 100 messages over 2s of wall time at a 1s interval is 50/interval.
        let rate = interval_rate(100, Duration::from_secs(1), Duration::from_secs(2));
        assert!((rate - 50.0).abs() < 1e-9);
    }

    #[test]
    fn zero_elapsed_reports_zero() {
        assert_eq!(interval_rate(100, Duration::from_secs(1), Duration::ZERO), 0.0);
    }

    #[test]
    fn warmup_tick_is_silent_and_sets_the_baseline() {
        let listener = CollectingListener::default();
        let (mut core, handle) = core_with(vec![Box::new(listener.clone())]);
        let start = Instant::now();

        handle.record(500, 5_000);
        core.tick(start);
        assert!(listener.reports.lock().unwrap().is_empty(), "still warming");

        handle.record(100, 1_000);
        core.tick(start + Duration::from_secs(1));

        let reports = listener.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        // Only post-warm-up counts enter the rate.
        assert!((reports[0].message_rate - 100.0).abs() < 1e-6);
        assert!((reports[0].byte_rate - 1_000.0).abs() < 1e-6);
    }

    #[test]
    fn rates_are_per_interval_not_cumulative() {
        let listener = CollectingListener::default();
        let (mut core, handle) = core_with(vec![Box::new(listener.clone())]);
        let start = Instant::now();
        core.tick(start);

        handle.record(100, 0);
        core.tick(start + Duration::from_secs(1));
        handle.record(40, 0);
        core.tick(start + Duration::from_secs(2));

        let reports = listener.reports.lock().unwrap();
        assert!((reports[0].message_rate - 100.0).abs() < 1e-6);
        assert!((reports[1].message_rate - 40.0).abs() < 1e-6);
    }

    #[test]
    fn drift_compensation_uses_wall_time() {
        let listener = CollectingListener::default();
        let (mut core, handle) = core_with(vec![Box::new(listener.clone())]);
        let start = Instant::now();
        core.tick(start);

        // The tick lands half a second late.
        handle.record(300, 0);
        core.tick(start + Duration::from_millis(1_500));

        let reports = listener.reports.lock().unwrap();
        assert!((reports[0].message_rate - 200.0).abs() < 1e-6);
    }

    #[test]
    fn summary_excludes_warmup_counts() {
        let listener = CollectingListener::default();
        let (mut core, handle) = core_with(vec![Box::new(listener.clone())]);
        let start = Instant::now();

        handle.record(500, 5_000);
        core.tick(start);
        handle.record(100, 1_000);
        core.tick(start + Duration::from_secs(1));
        handle.record(50, 500);
        core.terminate(start + Duration::from_secs(3));

        let terminations = listener.terminations.lock().unwrap();
        assert_eq!(terminations.len(), 1, "on_terminate fires exactly once");
        assert_eq!(
            terminations[0],
            RateSummary {
                total_messages: 150,
                total_bytes: 1_500,
                elapsed: Duration::from_secs(3),
            }
        );
    }

    #[test]
    fn failing_listener_does_not_stop_delivery() {
        let healthy = CollectingListener::default();
        let (mut core, handle) = core_with(vec![
            Box::new(FailingListener),
            Box::new(healthy.clone()),
        ]);
        let start = Instant::now();
        core.tick(start);

        handle.record(10, 10);
        core.tick(start + Duration::from_secs(1));
        core.terminate(start + Duration::from_secs(2));

        assert_eq!(healthy.reports.lock().unwrap().len(), 1);
        assert_eq!(healthy.terminations.lock().unwrap().len(), 1);
    }

    #[test]
    fn series_listener_appends_message_rate_points() {
        let store = Arc::new(SeriesStore::new());
        let mut listener = SeriesThroughputListener::new(Arc::clone(&store), "my-test");

        listener
            .on_report(&IntervalRates {
                message_rate: 42.0,
                byte_rate: 4_200.0,
            })
            .unwrap();

        let snapshots = store.snapshot();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].key.name, "my-test");
        assert_eq!(snapshots[0].key.group, "throughput");
        assert_eq!(snapshots[0].xs, vec![1.0]);
        assert_eq!(snapshots[0].ys, vec![42.0]);
    }

    proptest! {
        // Compensation is exact up to floating point: scaling the rate
        // back by the elapsed wall time recovers the raw delta.
        #[test]
        fn compensation_inverts_to_the_raw_delta(
            delta in 0u64..1_000_000_000,
            interval_ms in 1u64..10_000,
            elapsed_ms in 1u64..10_000,
        ) {
            let interval = Duration::from_millis(interval_ms);
            let elapsed = Duration::from_millis(elapsed_ms);
            let rate = interval_rate(delta, interval, elapsed);

            prop_assert!(rate.is_finite());
            prop_assert!(rate >= 0.0);
            let recovered = rate * elapsed.as_nanos() as f64 / interval.as_nanos() as f64;
            prop_assert!((recovered - delta as f64).abs() <= delta as f64 * 1e-9 + 1e-6);
        }

        // A tick that fires exactly on schedule reports the delta as-is.
        #[test]
        fn on_schedule_tick_is_identity(
            delta in 0u64..1_000_000_000,
            interval_ms in 1u64..10_000,
        ) {
            let interval = Duration::from_millis(interval_ms);
            let rate = interval_rate(delta, interval, interval);
            prop_assert!((rate - delta as f64).abs() <= delta as f64 * 1e-12);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_sampler_reports_after_warmup() {
        let listener = CollectingListener::default();
        let reporter = ThroughputReporter::spawn(
            Window::new(Duration::from_secs(2), Duration::from_secs(1)),
            vec![Box::new(listener.clone())],
        );
        reporter.record(10, 100);

        time::sleep(Duration::from_millis(1_500)).await;
        assert!(listener.reports.lock().unwrap().is_empty(), "still warming");

        // Past the warm-up tick at t=2s; these counts are post-baseline.
        time::sleep(Duration::from_secs(1)).await;
        reporter.record(20, 200);
        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(listener.reports.lock().unwrap().len(), 1);

        reporter.close().await.unwrap();
        let terminations = listener.terminations.lock().unwrap();
        assert_eq!(terminations.len(), 1);
        assert_eq!(terminations[0].total_messages, 20);
    }
}
