//! JSON model of the shared chart document
//!
//! The remote artifact perfchart publishes into is a chart description: a
//! `traces` array of series records surrounded by arbitrary template
//! metadata, chart layout mostly. Other publishers write into the same
//! document concurrently, so decoding must tolerate fields this crate has
//! never heard of and encoding must hand them back untouched. Both
//! [`Trace`] and [`ChartDocument`] carry a flattened extra map for exactly
//! that purpose.
//!
//! Merging is replace-by-name: a local series evicts any remote entry with
//! the same name before being appended, while entries under other names are
//! preserved. Repeating a merge with the same snapshot therefore converges
//! instead of duplicating, which is what makes a crashed-and-repeated
//! publish attempt safe.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::store::{SeriesSnapshot, SCATTER};

/// Errors produced when manipulating a [`ChartDocument`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A series could not be encoded into a document entry.
    #[error("Failed to encode trace {name}: {source}")]
    Encode {
        /// Name of the offending series.
        name: String,
        /// The underlying error.
        #[source]
        source: serde_json::Error,
    },
}

/// Line rendering hint carried by a [`Trace`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LineStyle {
    /// Color of the rendered line.
    pub color: String,
}

fn default_kind() -> String {
    SCATTER.to_string()
}

/// One series record inside the chart document's `traces` array.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trace {
    /// Display name of the series.
    pub name: String,
    /// Grouping label of the series.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// The `x` axis samples.
    #[serde(default)]
    pub x: Vec<f64>,
    /// The `y` axis samples.
    #[serde(default)]
    pub y: Vec<f64>,
    /// Rendering kind, `scatter` for everything this crate produces.
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    /// Optional line rendering hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<LineStyle>,
    /// Fields this crate does not model, preserved across decode/encode.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl From<&SeriesSnapshot> for Trace {
    fn from(snapshot: &SeriesSnapshot) -> Self {
        Self {
            name: snapshot.key.name.clone(),
            group: Some(snapshot.key.group.clone()),
            x: snapshot.xs.clone(),
            y: snapshot.ys.clone(),
            kind: snapshot.kind.clone(),
            line: snapshot
                .color
                .clone()
                .map(|color| LineStyle { color }),
            extra: Map::new(),
        }
    }
}

/// The shared chart document: a `traces` array plus preserved template
/// metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChartDocument {
    /// Series records. Entries written by other publishers are kept as raw
    /// JSON so that fields unknown to this crate survive a merge.
    #[serde(default)]
    pub traces: Vec<Value>,
    /// Template metadata, chart layout and the like, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChartDocument {
    /// Merge `traces` into the document, replace-by-name.
    ///
    /// For every incoming trace any existing entry with the same name is
    /// removed, then the incoming trace is appended. Entries under other
    /// names, including those added by concurrent publishers, are left
    /// alone. Merging the same snapshot twice converges to one entry per
    /// name.
    ///
    /// # Errors
    ///
    /// Returns an error if a trace cannot be encoded to JSON.
    pub fn merge_traces(&mut self, traces: &[Trace]) -> Result<(), Error> {
        for trace in traces {
            self.traces.retain(|existing| {
                existing.get("name").and_then(Value::as_str) != Some(trace.name.as_str())
            });
            let value = serde_json::to_value(trace).map_err(|source| Error::Encode {
                name: trace.name.clone(),
                source,
            })?;
            self.traces.push(value);
        }
        Ok(())
    }

    /// Names of the series currently present in the `traces` array.
    #[must_use]
    pub fn trace_names(&self) -> Vec<&str> {
        self.traces
            .iter()
            .filter_map(|trace| trace.get("name").and_then(Value::as_str))
            .collect()
    }
}
