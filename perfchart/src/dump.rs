//! On-disk snapshots of collected series
//!
//! Benchmark runs and publish runs are decoupled through the filesystem:
//! a run dumps each collected series as one JSON file into a traces
//! folder, and the publish step later loads every file in that folder
//! back into trace records. Series names carry characters that are not
//! filename-safe, `[p99] my-test` say, so file names are sanitized while
//! the series name inside the file stays exact.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use perfchart_series::{document::Trace, store::SeriesSnapshot};
use tracing::{debug, warn};

/// Errors produced when dumping or loading series files.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The folder could not be created or read.
    #[error("Failed to access {path}: {source}")]
    Folder {
        /// The offending path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
    /// A series could not be encoded.
    #[error("Failed to encode series {name}: {source}")]
    Encode {
        /// Name of the offending series.
        name: String,
        /// The underlying error.
        #[source]
        source: serde_json::Error,
    },
    /// The folder holds no loadable series files.
    #[error("No series files found in {path}")]
    Empty {
        /// The folder that was searched.
        path: PathBuf,
    },
}

/// Turn a series name into a filename stem, keeping characters that are
/// safe on every filesystem we care about and replacing the rest.
fn file_stem(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ' ' | '[' | ']') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Write each snapshot as one pretty-printed JSON file under `folder`,
/// creating the folder if needed. Existing files for the same series are
/// overwritten.
///
/// # Errors
///
/// Returns an error if the folder or a file cannot be written, or a series
/// cannot be encoded.
pub async fn dump_snapshot(folder: &Path, snapshots: &[SeriesSnapshot]) -> Result<(), Error> {
    tokio::fs::create_dir_all(folder)
        .await
        .map_err(|source| Error::Folder {
            path: folder.to_path_buf(),
            source,
        })?;

    let mut used = HashSet::new();
    for snapshot in snapshots {
        let trace = Trace::from(snapshot);
        let encoded =
            serde_json::to_string_pretty(&trace).map_err(|source| Error::Encode {
                name: snapshot.key.name.clone(),
                source,
            })?;
        // The stem carries the group, so a name reused across groups maps
        // to distinct files; sanitization can still collapse distinct
        // names, in which case a numeric suffix keeps both series.
        let base = file_stem(&format!(
            "{name}.{group}",
            name = snapshot.key.name,
            group = snapshot.key.group
        ));
        let mut stem = base.clone();
        let mut suffix = 1u32;
        while !used.insert(stem.clone()) {
            suffix += 1;
            stem = format!("{base}-{suffix}");
            warn!(
                series = %snapshot.key.name,
                file = %stem,
                "series file name collides after sanitization"
            );
        }
        let path = folder.join(format!("{stem}.json"));
        debug!(series = %snapshot.key.name, path = %path.display(), "dumping series");
        tokio::fs::write(&path, encoded)
            .await
            .map_err(|source| Error::Folder { path, source })?;
    }
    Ok(())
}

/// Load every series file under `folder`.
///
/// Files that are not valid trace JSON are logged and skipped; an empty or
/// entirely unparseable folder is an error, since publishing nothing is
/// never what the caller meant.
///
/// # Errors
///
/// Returns an error if the folder cannot be read or holds no loadable
/// series.
pub async fn load_traces(folder: &Path) -> Result<Vec<Trace>, Error> {
    let mut entries = tokio::fs::read_dir(folder)
        .await
        .map_err(|source| Error::Folder {
            path: folder.to_path_buf(),
            source,
        })?;

    let mut traces = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|source| Error::Folder {
            path: folder.to_path_buf(),
            source,
        })?
    {
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "json") {
            continue;
        }
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| Error::Folder {
                path: path.clone(),
                source,
            })?;
        match serde_json::from_str::<Trace>(&contents) {
            Ok(trace) => traces.push(trace),
            Err(err) => {
                warn!(path = %path.display(), "skipping unparseable series file: {err}");
            }
        }
    }

    if traces.is_empty() {
        return Err(Error::Empty {
            path: folder.to_path_buf(),
        });
    }
    // Directory iteration order is unspecified; charts should not reshuffle
    // between runs.
    traces.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(traces)
}
