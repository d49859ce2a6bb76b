//! This module controls configuration parsing for the end user, providing
//! a convenience mechanism to read from YAML files and map onto the
//! runtime options of the samplers and the publish pipeline.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::reporter::Window;

/// Environment variable the publish credential is read from. Secrets stay
/// out of config files.
pub const SECRET_ENV_VAR: &str = "PERFCHART_SECRET";

/// Errors produced when loading a [`Config`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The config file could not be read.
    #[error("Failed to read config {path}: {source}")]
    Read {
        /// The offending path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The config file could not be parsed.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// The reporting interval is zero.
    #[error("Reporting interval must be non-zero")]
    ZeroInterval,
    /// The publish credential environment variable is not set.
    #[error("Environment variable {SECRET_ENV_VAR} is not set")]
    MissingSecret,
}

fn default_traces_folder() -> PathBuf {
    PathBuf::from("./target/traces/")
}

fn default_charts_folder() -> PathBuf {
    PathBuf::from("./target/charts/")
}

fn default_warmup_millis() -> u64 {
    1
}

fn default_interval_millis() -> u64 {
    1_000
}

fn default_percentiles() -> Vec<f64> {
    vec![50.0, 75.0, 90.0, 99.0]
}

fn default_scaling_ratio() -> f64 {
    1_000.0
}

fn default_test_name() -> String {
    "benchmark".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_chart_path() -> PathBuf {
    PathBuf::from("chart.json")
}

fn default_jsonbin_url() -> String {
    crate::publisher::jsonbin::DEFAULT_URL.to_string()
}

/// Main configuration struct for this program.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Folder benchmark runs dump their series files into.
    #[serde(default = "default_traces_folder")]
    pub traces_folder: PathBuf,
    /// Folder merged chart documents are written into locally.
    #[serde(default = "default_charts_folder")]
    pub charts_folder: PathBuf,
    /// Chart template, a local file path or an `http(s)` URL. Used as the
    /// document baseline when the remote chart does not exist yet.
    #[serde(default)]
    pub chart_template: Option<String>,
    /// Sampler options.
    #[serde(default)]
    pub report: ReportConfig,
    /// Where merged charts are published to. Absent means local-only.
    #[serde(default)]
    pub publish: Option<PublishConfig>,
}

impl Config {
    /// Parse a [`Config`] from YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if the contents are not a valid config.
    pub fn from_yaml(contents: &str) -> Result<Self, Error> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Read and parse a [`Config`] from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_path(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path).map_err(|source| Error::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&contents)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            traces_folder: default_traces_folder(),
            charts_folder: default_charts_folder(),
            chart_template: None,
            report: ReportConfig::default(),
            publish: None,
        }
    }
}

/// Sampler options.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ReportConfig {
    /// Name series are filed under.
    #[serde(default = "default_test_name")]
    pub test_name: String,
    /// Milliseconds of warm-up before the first report.
    #[serde(default = "default_warmup_millis")]
    pub warmup_millis: u64,
    /// Milliseconds between reports.
    #[serde(default = "default_interval_millis")]
    pub interval_millis: u64,
    /// Percentiles reported by the latency sampler.
    #[serde(default = "default_percentiles")]
    pub percentiles: Vec<f64>,
    /// Ratio recorded nanoseconds are divided by before charting.
    #[serde(default = "default_scaling_ratio")]
    pub scaling_ratio: f64,
}

impl ReportConfig {
    /// The reporting window these options describe.
    ///
    /// # Errors
    ///
    /// Returns an error if the interval is zero.
    pub fn window(&self) -> Result<Window, Error> {
        if self.interval_millis == 0 {
            return Err(Error::ZeroInterval);
        }
        Ok(Window::new(
            Duration::from_millis(self.warmup_millis),
            Duration::from_millis(self.interval_millis),
        ))
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            test_name: default_test_name(),
            warmup_millis: default_warmup_millis(),
            interval_millis: default_interval_millis(),
            percentiles: default_percentiles(),
            scaling_ratio: default_scaling_ratio(),
        }
    }
}

/// Publish destination.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case", deny_unknown_fields)]
pub enum PublishConfig {
    /// Merge into one shared document in a git repository, under
    /// conflict-retry protection.
    Git {
        /// Clone URL of the repository.
        url: String,
        /// Branch the document lives on.
        #[serde(default = "default_branch")]
        branch: String,
        /// Path of the document inside the repository.
        #[serde(default = "default_chart_path")]
        path: PathBuf,
    },
    /// Post each series to a hosted bin service, fire-and-forget.
    Jsonbin {
        /// Service endpoint.
        #[serde(default = "default_jsonbin_url")]
        url: String,
        /// Collection bins are filed under.
        #[serde(default)]
        collection: Option<String>,
    },
    /// Post the whole run as one batch to a trace-collection service,
    /// attributed to a repository and commit.
    ReportService {
        /// Service endpoint.
        url: String,
        /// Owner of the repository under test.
        owner: String,
        /// Repository under test.
        repo: String,
        /// Commit the run was executed against.
        sha: String,
    },
}

/// Read the publish credential from the environment.
///
/// # Errors
///
/// Returns an error if [`SECRET_ENV_VAR`] is not set.
pub fn secret_from_env() -> Result<String, Error> {
    std::env::var(SECRET_ENV_VAR).map_err(|_| Error::MissingSecret)
}
