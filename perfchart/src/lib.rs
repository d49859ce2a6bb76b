//! The perfchart benchmark reporting library.
//!
//! Benchmark code records raw per-operation observations -- durations and
//! message/byte counts -- into windowed samplers. After a warm-up period the
//! samplers fold each reporting interval into one aggregate and hand it to
//! listeners, which typically write points into a shared
//! [`perfchart_series::store::SeriesStore`]. On a longer period the publish
//! pipeline merges the collected series into a remote chart document, under
//! the optimistic-concurrency protection of a version-control push or as
//! fire-and-forget posts to a hosted document store.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::perf)]
#![deny(clippy::suspicious)]
#![deny(clippy::complexity)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod config;
pub mod dump;
pub mod publisher;
pub mod reporter;
