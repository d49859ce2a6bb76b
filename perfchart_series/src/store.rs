//! Concurrent store of named two-axis series
//!
//! This module solves the collection half of perfchart. Benchmark worker
//! threads produce a stream of per-interval aggregates -- a p99 latency here,
//! a messages-per-second figure there -- and those observations must land in
//! named, ordered datasets without the workers ever contending on a global
//! lock or blocking on the publish path. The core structure is
//! [`SeriesStore`], a map from `(name, group)` to [`Series`].
//!
//! A [`Series`] holds two equal-length axes, `x` and `y`, plus one
//! auto-increment counter per axis. Most callers supply only the dependent
//! value and let the store number the other axis for them:
//! [`Series::append_auto_x`] increments the `x` counter and appends the pair
//! `(counter, y)`. The counter is post-incremented, so indices are 1-based,
//! strictly increasing and gapless even under concurrent appenders -- the
//! increment and the paired axis pushes happen under the series' own lock.
//!
//! # Semantics
//!
//! * `get_or_create` is idempotent: the first caller for a `(name, group)`
//!   pair creates the series with both counters at zero, every caller
//!   receives a handle to the same series.
//! * Appends are total functions. They do not fail and they do not block on
//!   anything other than the owning series' lock, which is only ever held
//!   for the duration of two `Vec` pushes.
//! * `len(x) == len(y)` holds at every observation boundary.
//! * Series are never deleted; they live for the lifetime of the store.
//!
//! # Snapshots
//!
//! [`SeriesStore::snapshot`] returns a point-in-time clone of every series,
//! ordered by `(name, group)`. Individual series may keep growing while the
//! snapshot is taken; readers get exactly the observations that had landed
//! at the moment each series' lock was briefly held, which is all the
//! publish pipeline needs.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

use rustc_hash::FxHashMap;

/// Rendering kind assigned to every series.
pub const SCATTER: &str = "scatter";

/// Identity of a series: a display name plus a grouping label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    /// Display name, e.g. `[p99] my-test`.
    pub name: String,
    /// Grouping label, e.g. `latency` or `throughput`.
    pub group: String,
}

impl SeriesKey {
    /// Create a new [`SeriesKey`].
    #[must_use]
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
        }
    }
}

#[derive(Debug, Default)]
struct Axes {
    xs: Vec<f64>,
    ys: Vec<f64>,
}

/// A named two-axis ordered numeric dataset.
#[derive(Debug)]
pub struct Series {
    key: SeriesKey,
    color: Mutex<Option<String>>,
    x_index: AtomicU64,
    y_index: AtomicU64,
    axes: Mutex<Axes>,
}

impl Series {
    fn new(key: SeriesKey) -> Self {
        Self {
            key,
            color: Mutex::new(None),
            x_index: AtomicU64::new(0),
            y_index: AtomicU64::new(0),
            axes: Mutex::new(Axes::default()),
        }
    }

    /// The identity of this series.
    #[must_use]
    pub fn key(&self) -> &SeriesKey {
        &self.key
    }

    /// Set the rendering color hint carried into snapshots.
    pub fn set_color(&self, color: impl Into<String>) {
        *self.color.lock().expect("series lock poisoned") = Some(color.into());
    }

    /// Append `y`, auto-numbering the `x` axis.
    ///
    /// The `x` counter is post-incremented under the series lock, so the
    /// produced indices are 1-based, strictly increasing and gapless no
    /// matter how many threads append concurrently.
    pub fn append_auto_x(&self, y: f64) {
        let mut axes = self.axes.lock().expect("series lock poisoned");
        let index = self.x_index.fetch_add(1, Ordering::AcqRel) + 1;
        axes.xs.push(index as f64);
        axes.ys.push(y);
    }

    /// Append `x`, auto-numbering the `y` axis.
    pub fn append_auto_y(&self, x: f64) {
        let mut axes = self.axes.lock().expect("series lock poisoned");
        let index = self.y_index.fetch_add(1, Ordering::AcqRel) + 1;
        axes.xs.push(x);
        axes.ys.push(index as f64);
    }

    /// Append an explicit `(x, y)` pair, leaving both counters untouched.
    pub fn append_xy(&self, x: f64, y: f64) {
        let mut axes = self.axes.lock().expect("series lock poisoned");
        axes.xs.push(x);
        axes.ys.push(y);
    }

    /// Number of observations recorded so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.axes.lock().expect("series lock poisoned").xs.len()
    }

    /// True if no observation has been recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time copy of this series' axes.
    #[must_use]
    pub fn snapshot(&self) -> SeriesSnapshot {
        let axes = self.axes.lock().expect("series lock poisoned");
        SeriesSnapshot {
            key: self.key.clone(),
            kind: SCATTER.to_string(),
            color: self.color.lock().expect("series lock poisoned").clone(),
            xs: axes.xs.clone(),
            ys: axes.ys.clone(),
        }
    }
}

/// Point-in-time copy of one [`Series`].
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesSnapshot {
    /// The identity of the copied series.
    pub key: SeriesKey,
    /// Rendering kind, see [`SCATTER`].
    pub kind: String,
    /// Optional rendering color hint.
    pub color: Option<String>,
    /// The `x` axis at the moment of the copy.
    pub xs: Vec<f64>,
    /// The `y` axis at the moment of the copy.
    pub ys: Vec<f64>,
}

/// Concurrent map of named series.
///
/// The outer map lock is held only for lookup and insertion. All appends
/// contend solely on the per-series lock, keeping unrelated series fully
/// independent of one another.
#[derive(Debug, Default)]
pub struct SeriesStore {
    inner: Mutex<FxHashMap<SeriesKey, Arc<Series>>>,
}

impl SeriesStore {
    /// Create an empty [`SeriesStore`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the series for `(name, group)`, creating it on first use.
    pub fn get_or_create(&self, name: &str, group: &str) -> Arc<Series> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        if let Some(series) = inner.get(&SeriesKey::new(name, group)) {
            return Arc::clone(series);
        }
        let key = SeriesKey::new(name, group);
        let series = Arc::new(Series::new(key.clone()));
        inner.insert(key, Arc::clone(&series));
        series
    }

    /// Append `y` to `(name, group)`, auto-numbering the `x` axis.
    pub fn append_auto_x(&self, name: &str, group: &str, y: f64) {
        self.get_or_create(name, group).append_auto_x(y);
    }

    /// Append `x` to `(name, group)`, auto-numbering the `y` axis.
    pub fn append_auto_y(&self, name: &str, group: &str, x: f64) {
        self.get_or_create(name, group).append_auto_y(x);
    }

    /// Append an explicit `(x, y)` pair to `(name, group)`.
    pub fn append_xy(&self, name: &str, group: &str, x: f64, y: f64) {
        self.get_or_create(name, group).append_xy(x, y);
    }

    /// Number of distinct series collected so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("store lock poisoned").len()
    }

    /// True if no series has been created yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time copy of every series, ordered by `(name, group)`.
    ///
    /// Series may keep growing while the copy is taken; the publish path
    /// must tolerate the remote lagging the live store by design.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SeriesSnapshot> {
        let series: Vec<Arc<Series>> = {
            let inner = self.inner.lock().expect("store lock poisoned");
            inner.values().map(Arc::clone).collect()
        };
        let mut snapshots: Vec<SeriesSnapshot> =
            series.iter().map(|series| series.snapshot()).collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }
}
