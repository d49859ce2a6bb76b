//! Batch publishing to a trace-collection service
//!
//! The third publish channel: the whole snapshot is posted in one request
//! to a service that files benchmark results by repository and commit.
//! The run's identity, owner, repository and commit sha, rides both in the
//! endpoint path and in the request body, so the service can attribute the
//! traces without parsing the URL. One shot per call, no merge and no
//! conflict retry; the service owns deduplication across runs.

use perfchart_series::{document::Trace, store::SeriesSnapshot};
use serde::Serialize;
use tracing::{debug, info};

/// Errors produced by the trace-collection client.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wrapper for [`reqwest::Error`].
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Identity of the benchmark run being reported.
#[derive(Debug, Clone, Serialize)]
pub struct RunContext {
    /// Owner of the repository under test.
    pub owner: String,
    /// Repository under test.
    pub repo: String,
    /// Commit the run was executed against.
    pub sha: String,
}

/// One run's results: the identity envelope plus every collected trace.
#[derive(Debug, Serialize)]
struct RunReport<'a> {
    #[serde(flatten)]
    context: &'a RunContext,
    traces: &'a [Trace],
}

/// Client posting whole-run results to a trace-collection service.
#[derive(Debug)]
pub struct ReportServiceClient {
    client: reqwest::Client,
    url: String,
    context: RunContext,
}

impl ReportServiceClient {
    /// Create a client posting to `url` on behalf of `context`.
    #[must_use]
    pub fn new(url: impl Into<String>, context: RunContext) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            context,
        }
    }

    /// Endpoint the report is posted to: the service URL extended with the
    /// run identity path segments.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!(
            "{url}/{owner}/{repo}/{sha}",
            url = self.url.trim_end_matches('/'),
            owner = self.context.owner,
            repo = self.context.repo,
            sha = self.context.sha,
        )
    }

    /// Post every snapshot as one batch report. An empty snapshot posts
    /// nothing and succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the service answers with a
    /// non-success status.
    pub async fn publish_snapshot(&self, snapshots: &[SeriesSnapshot]) -> Result<(), Error> {
        if snapshots.is_empty() {
            debug!("no series collected, skipping report");
            return Ok(());
        }
        let traces: Vec<Trace> = snapshots.iter().map(Trace::from).collect();
        let report = RunReport {
            context: &self.context,
            traces: &traces,
        };
        self.client
            .post(self.endpoint())
            .json(&report)
            .send()
            .await?
            .error_for_status()?;
        info!(
            traces = traces.len(),
            sha = %self.context.sha,
            "run report posted"
        );
        Ok(())
    }
}
