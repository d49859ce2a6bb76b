//! The latency variant of the windowed sampler
//!
//! Worker threads record per-operation durations through a cloneable
//! [`LatencyHandle`]; a driving task swaps and drains a double-buffered
//! histogram pair once per reporting interval and hands the interval
//! histogram to the registered listeners. Interval histograms are also
//! folded into a running accumulated histogram which is delivered intact
//! when the sampler terminates.
//!
//! The recorder is an arena of two pre-allocated histograms with an atomic
//! index selecting the one recording threads write into. Each tick flips
//! the index and drains the buffer recorders were using, so recording never
//! blocks on reporting. A recorder that read the index just before the flip
//! can still land one observation in the buffer being drained; the
//! per-buffer lock makes that safe and the observation shifts to the next
//! interval at worst.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use hdrhistogram::Histogram;
use perfchart_series::store::SeriesStore;
use tokio::{task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{Error, ListenerError, Window};

// Histogram range: 1ns through 10s at 3 significant figures, the range any
// operation a benchmark would plausibly time falls into. Values beyond the
// ceiling are recorded saturated rather than dropped.
const HIGHEST_TRACKABLE_NANOS: u64 = 10_000_000_000;
const SIGNIFICANT_FIGURES: u8 = 3;

fn new_histogram() -> Histogram<u64> {
    Histogram::new_with_bounds(1, HIGHEST_TRACKABLE_NANOS, SIGNIFICANT_FIGURES)
        .expect("histogram bounds are valid")
}

/// Receiver of latency aggregates.
pub trait LatencyListener: Send {
    /// Called once per reporting interval with the observations recorded
    /// since the previous tick.
    ///
    /// # Errors
    ///
    /// Failures are logged by the sampler and do not stop the schedule.
    fn on_report(&mut self, interval: &Histogram<u64>) -> Result<(), ListenerError>;

    /// Called exactly once at termination with every post-warm-up
    /// observation.
    ///
    /// # Errors
    ///
    /// Failures are logged by the sampler; listener resources are released
    /// regardless.
    fn on_terminate(&mut self, accumulated: &Histogram<u64>) -> Result<(), ListenerError>;
}

/// Forwards each aggregate to all registered listeners in registration
/// order. A failing listener is logged and does not prevent delivery to the
/// remaining listeners.
struct Fanout {
    listeners: Vec<Box<dyn LatencyListener>>,
}

impl Fanout {
    fn new(listeners: Vec<Box<dyn LatencyListener>>) -> Self {
        Self { listeners }
    }

    fn on_report(&mut self, interval: &Histogram<u64>) {
        for (idx, listener) in self.listeners.iter_mut().enumerate() {
            if let Err(err) = listener.on_report(interval) {
                warn!(listener = idx, "latency listener failed to report: {err}");
            }
        }
    }

    fn on_terminate(&mut self, accumulated: &Histogram<u64>) {
        for (idx, listener) in self.listeners.iter_mut().enumerate() {
            if let Err(err) = listener.on_terminate(accumulated) {
                warn!(listener = idx, "latency listener failed to terminate: {err}");
            }
        }
    }
}

/// Double-buffered histogram recorder.
///
/// Recording threads write into the buffer selected by `active`; the
/// reporting tick flips `active` and drains the other buffer.
pub struct LatencyRecorder {
    active: AtomicUsize,
    buffers: [Mutex<Histogram<u64>>; 2],
}

impl std::fmt::Debug for LatencyRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LatencyRecorder")
            .field("active", &self.active.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl LatencyRecorder {
    fn new() -> Self {
        Self {
            active: AtomicUsize::new(0),
            buffers: [Mutex::new(new_histogram()), Mutex::new(new_histogram())],
        }
    }

    fn record(&self, nanos: u64) {
        let idx = self.active.load(Ordering::Acquire);
        self.buffers[idx]
            .lock()
            .expect("recorder lock poisoned")
            .saturating_record(nanos);
    }

    fn swap_and_drain(&self) -> Histogram<u64> {
        let drained_idx = self.active.fetch_xor(1, Ordering::AcqRel);
        let mut guard = self.buffers[drained_idx]
            .lock()
            .expect("recorder lock poisoned");
        let drained = guard.clone();
        guard.reset();
        drained
    }
}

/// Tick state machine, driven by the sampler task and by tests directly.
struct Core {
    recorder: Arc<LatencyRecorder>,
    accumulated: Histogram<u64>,
    warmed: bool,
    listener: Fanout,
}

impl Core {
    fn new(recorder: Arc<LatencyRecorder>, listener: Fanout) -> Self {
        Self {
            recorder,
            accumulated: new_histogram(),
            warmed: false,
            listener,
        }
    }

    fn tick(&mut self) {
        let interval = self.recorder.swap_and_drain();
        if !self.warmed {
            // Warming -> Active. The drained warm-up noise is discarded and
            // no listener is invoked.
            self.warmed = true;
            return;
        }
        self.accumulated
            .add(&interval)
            .expect("histograms share identical bounds");
        self.listener.on_report(&interval);
    }

    fn terminate(mut self) {
        self.listener.on_terminate(&self.accumulated);
    }
}

/// Cloneable recording handle for benchmark worker threads.
#[derive(Debug, Clone)]
pub struct LatencyHandle {
    recorder: Arc<LatencyRecorder>,
}

impl LatencyHandle {
    /// Record one operation's duration. Never blocks on reporting and never
    /// fails; durations beyond the trackable ceiling saturate.
    pub fn record(&self, latency: Duration) {
        let nanos = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        self.recorder.record(nanos);
    }
}

/// The latency sampler.
///
/// Spawned with [`LatencyReporter::spawn`]; terminated with
/// [`LatencyReporter::close`], which delivers the accumulated histogram to
/// listeners exactly once.
#[derive(Debug)]
pub struct LatencyReporter {
    handle: LatencyHandle,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl LatencyReporter {
    /// Spawn the sampler on the current tokio runtime.
    #[must_use]
    pub fn spawn(window: Window, listeners: Vec<Box<dyn LatencyListener>>) -> Self {
        let recorder = Arc::new(LatencyRecorder::new());
        let mut core = Core::new(Arc::clone(&recorder), Fanout::new(listeners));
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        let task = tokio::spawn(async move {
            let start = time::Instant::now() + window.warmup;
            let mut ticker = time::interval_at(start, window.interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => core.tick(),
                }
            }
            core.terminate();
        });

        Self {
            handle: LatencyHandle { recorder },
            shutdown,
            task,
        }
    }

    /// A cloneable handle for recording from worker threads.
    #[must_use]
    pub fn handle(&self) -> LatencyHandle {
        self.handle.clone()
    }

    /// Record one operation's duration.
    pub fn record(&self, latency: Duration) {
        self.handle.record(latency);
    }

    /// Terminate the sampler: cancel future ticks, let an in-flight tick
    /// finish, deliver the accumulated histogram to listeners exactly once.
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

/// Listener that writes percentile points into a [`SeriesStore`].
///
/// Each report appends one point per configured percentile to the series
/// named `[p{P}] {test_name}` in group `latency`, scaled by
/// `scaling_ratio` (1000.0 by default: nanoseconds in, microseconds out).
#[derive(Debug)]
pub struct SeriesLatencyListener {
    store: Arc<SeriesStore>,
    test_name: String,
    percentiles: Vec<f64>,
    scaling_ratio: f64,
}

impl SeriesLatencyListener {
    /// Create a listener writing into `store` under `test_name`.
    #[must_use]
    pub fn new(store: Arc<SeriesStore>, test_name: impl Into<String>) -> Self {
        Self {
            store,
            test_name: test_name.into(),
            percentiles: vec![50.0, 75.0, 90.0, 99.0],
            scaling_ratio: 1000.0,
        }
    }

    /// Replace the reported percentiles.
    #[must_use]
    pub fn percentiles(mut self, percentiles: Vec<f64>) -> Self {
        self.percentiles = percentiles;
        self
    }

    /// Replace the unit scaling ratio applied to recorded nanoseconds.
    #[must_use]
    pub fn scaling_ratio(mut self, scaling_ratio: f64) -> Self {
        self.scaling_ratio = scaling_ratio;
        self
    }
}

impl LatencyListener for SeriesLatencyListener {
    fn on_report(&mut self, interval: &Histogram<u64>) -> Result<(), ListenerError> {
        for percentile in &self.percentiles {
            let value = interval.value_at_quantile(percentile / 100.0) as f64 / self.scaling_ratio;
            let name = format!("[p{percentile}] {test}", test = self.test_name);
            self.store.append_auto_x(&name, "latency", value);
        }
        Ok(())
    }

    fn on_terminate(&mut self, _accumulated: &Histogram<u64>) -> Result<(), ListenerError> {
        Ok(())
    }
}

/// Listener that logs a percentile summary of each interval.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogLatencyListener;

impl LatencyListener for LogLatencyListener {
    fn on_report(&mut self, interval: &Histogram<u64>) -> Result<(), ListenerError> {
        info!(
            count = interval.len(),
            p50_ns = interval.value_at_quantile(0.50),
            p99_ns = interval.value_at_quantile(0.99),
            max_ns = interval.max(),
            "latency interval"
        );
        Ok(())
    }

    fn on_terminate(&mut self, accumulated: &Histogram<u64>) -> Result<(), ListenerError> {
        info!(
            count = accumulated.len(),
            p50_ns = accumulated.value_at_quantile(0.50),
            p99_ns = accumulated.value_at_quantile(0.99),
            max_ns = accumulated.max(),
            "latency summary"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct CollectingListener {
        reports: Arc<Mutex<Vec<Histogram<u64>>>>,
        terminations: Arc<Mutex<Vec<Histogram<u64>>>>,
    }

    impl CollectingListener {
        fn report_count(&self) -> usize {
            self.reports.lock().unwrap().len()
        }
    }

    impl LatencyListener for CollectingListener {
        fn on_report(&mut self, interval: &Histogram<u64>) -> Result<(), ListenerError> {
            self.reports.lock().unwrap().push(interval.clone());
            Ok(())
        }

        fn on_terminate(&mut self, accumulated: &Histogram<u64>) -> Result<(), ListenerError> {
            self.terminations.lock().unwrap().push(accumulated.clone());
            Ok(())
        }
    }

    struct FailingListener {
        calls: Arc<Mutex<usize>>,
    }

    impl LatencyListener for FailingListener {
        fn on_report(&mut self, _interval: &Histogram<u64>) -> Result<(), ListenerError> {
            *self.calls.lock().unwrap() += 1;
            Err("sink unavailable".into())
        }

        fn on_terminate(&mut self, _accumulated: &Histogram<u64>) -> Result<(), ListenerError> {
            Err("sink unavailable".into())
        }
    }

    fn core_with(listeners: Vec<Box<dyn LatencyListener>>) -> Core {
        Core::new(Arc::new(LatencyRecorder::new()), Fanout::new(listeners))
    }

    #[test]
    fn warmup_tick_is_silent_and_discards_noise() {
        let listener = CollectingListener::default();
        let mut core = core_with(vec![Box::new(listener.clone())]);

        // Observations recorded during warm-up...
        core.recorder.record(999);
        core.recorder.record(888);

        // ...are consumed by the reset tick without any report.
        core.tick();
        assert_eq!(listener.report_count(), 0);

        // The next tick reports only post-warm-up observations.
        core.recorder.record(10);
        core.tick();
        let reports = listener.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].len(), 1);
        assert_eq!(reports[0].max(), 10);
    }

    #[test]
    fn percentiles_read_off_interval_histogram() {
        let listener = CollectingListener::default();
        let mut core = core_with(vec![Box::new(listener.clone())]);
        core.tick(); // consume warm-up

        for nanos in [10, 20, 30, 40] {
            core.recorder.record(nanos);
        }
        core.tick();

        let reports = listener.reports.lock().unwrap();
        assert_eq!(reports[0].value_at_quantile(0.50), 20);
        assert_eq!(reports[0].value_at_quantile(1.0), 40);
    }

    #[test]
    fn interval_histograms_are_not_cumulative() {
        let listener = CollectingListener::default();
        let mut core = core_with(vec![Box::new(listener.clone())]);
        core.tick();

        core.recorder.record(10);
        core.tick();
        core.recorder.record(20);
        core.tick();

        let reports = listener.reports.lock().unwrap();
        assert_eq!(reports[0].len(), 1);
        assert_eq!(reports[1].len(), 1);
        assert_eq!(reports[1].max(), 20);
    }

    #[test]
    fn accumulated_histogram_delivered_at_termination() {
        let listener = CollectingListener::default();
        let mut core = core_with(vec![Box::new(listener.clone())]);
        core.tick();

        core.recorder.record(10);
        core.tick();
        core.recorder.record(20);
        core.recorder.record(30);
        core.tick();
        core.terminate();

        let terminations = listener.terminations.lock().unwrap();
        assert_eq!(terminations.len(), 1, "on_terminate fires exactly once");
        assert_eq!(terminations[0].len(), 3);
        assert_eq!(terminations[0].max(), 30);
    }

    #[test]
    fn failing_listener_does_not_stop_delivery() {
        let calls = Arc::new(Mutex::new(0));
        let healthy = CollectingListener::default();
        let mut core = core_with(vec![
            Box::new(FailingListener {
                calls: Arc::clone(&calls),
            }),
            Box::new(healthy.clone()),
        ]);
        core.tick();

        core.recorder.record(10);
        core.tick();
        core.recorder.record(20);
        core.tick();

        // The failing listener kept being invoked and the healthy one kept
        // receiving reports.
        assert_eq!(*calls.lock().unwrap(), 2);
        assert_eq!(healthy.report_count(), 2);
    }

    #[test]
    fn failing_listener_does_not_block_termination() {
        let calls = Arc::new(Mutex::new(0));
        let healthy = CollectingListener::default();
        let mut core = core_with(vec![
            Box::new(FailingListener {
                calls: Arc::clone(&calls),
            }),
            Box::new(healthy.clone()),
        ]);
        core.tick();

        core.recorder.record(10);
        core.tick();
        core.terminate();

        // The failing on_terminate is absorbed; the healthy listener still
        // receives the accumulated histogram.
        let terminations = healthy.terminations.lock().unwrap();
        assert_eq!(terminations.len(), 1);
        assert_eq!(terminations[0].len(), 1);
    }

    #[test]
    fn series_listener_writes_scaled_percentile_points() {
        let store = Arc::new(SeriesStore::new());
        let mut listener = SeriesLatencyListener::new(Arc::clone(&store), "my-test")
            .percentiles(vec![50.0])
            .scaling_ratio(1000.0);

        let mut histogram = new_histogram();
        for nanos in [10_000, 20_000, 30_000, 40_000] {
            histogram.saturating_record(nanos);
        }
        listener.on_report(&histogram).unwrap();

        let snapshots = store.snapshot();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].key.name, "[p50] my-test");
        assert_eq!(snapshots[0].key.group, "latency");
        assert_eq!(snapshots[0].xs, vec![1.0]);
        // 20_000ns at ratio 1000.0 reports as ~20us; 3 significant figures
        // keep the bucket within 1% of the recorded value.
        assert!((snapshots[0].ys[0] - 20.0).abs() < 0.2);
    }

    #[tokio::test(start_paused = true)]
    async fn no_reports_before_warmup_elapses() {
        let listener = CollectingListener::default();
        let reporter = LatencyReporter::spawn(
            Window::new(Duration::from_secs(5), Duration::from_secs(1)),
            vec![Box::new(listener.clone())],
        );
        reporter.record(Duration::from_micros(10));

        time::sleep(Duration::from_secs(4)).await;
        assert_eq!(listener.report_count(), 0, "still warming");

        // Warm-up tick at t=5 is consumed silently; first report lands at
        // t=6.
        time::sleep(Duration::from_millis(2500)).await;
        {
            let reports = listener.reports.lock().unwrap();
            assert_eq!(reports.len(), 1);
            assert_eq!(reports[0].len(), 0, "warm-up noise was discarded");
        }

        reporter.close().await.unwrap();
        assert_eq!(listener.terminations.lock().unwrap().len(), 1);
    }
}
