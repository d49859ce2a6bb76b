//! Hosted-bin publishing, the fire-and-forget alternative to git
//!
//! Instead of merging into one shared document under push/retry
//! protection, each series is posted to a hosted JSON document store as
//! its own bin. There is no concurrency control and no retry: a series
//! that fails to upload is logged and skipped, the remaining series are
//! posted regardless, and the per-series outcomes are handed back to the
//! caller.

use perfchart_series::{document::Trace, store::SeriesSnapshot};
use serde::Deserialize;
use tracing::{debug, warn};

/// Default service endpoint bins are created under.
pub const DEFAULT_URL: &str = "https://api.jsonbin.io/b";

/// Errors produced by the bin client.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wrapper for [`reqwest::Error`].
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// The service answered but reported a failure.
    #[error("Bin service rejected the request: {0}")]
    Api(String),
    /// The service reported success without returning a bin id.
    #[error("Bin service returned no id")]
    MissingId,
}

/// Response envelope of the bin service.
#[derive(Debug, Deserialize)]
pub struct BinResponse {
    /// Whether the service accepted the request.
    #[serde(default)]
    pub success: bool,
    /// Id of the created bin, on success.
    #[serde(default)]
    pub id: Option<String>,
    /// Failure detail, on error.
    #[serde(default)]
    pub message: Option<String>,
}

/// Outcome of posting one series.
#[derive(Debug)]
pub struct SeriesOutcome {
    /// Name of the series.
    pub name: String,
    /// Id of the created bin, or the upload error.
    pub result: Result<String, Error>,
}

/// Client for the hosted bin service.
#[derive(Debug)]
pub struct JsonbinClient {
    client: reqwest::Client,
    url: String,
    secret: String,
    collection: Option<String>,
}

impl JsonbinClient {
    /// Create a client posting to `url`, authenticating with `secret` and
    /// filing bins under `collection` when given.
    #[must_use]
    pub fn new(url: impl Into<String>, secret: impl Into<String>, collection: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            secret: secret.into(),
            collection,
        }
    }

    /// Fetch a JSON document from `url`. Used to resolve chart templates
    /// hosted on the service.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the body is not JSON.
    pub async fn get(&self, url: &str) -> Result<serde_json::Value, Error> {
        let value = self
            .client
            .get(url)
            .header("secret-key", &self.secret)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(value)
    }

    /// Create one bin holding `body`, returning its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the service reports a
    /// failure.
    pub async fn create(&self, body: &serde_json::Value) -> Result<String, Error> {
        let mut request = self
            .client
            .post(&self.url)
            .header("secret-key", &self.secret)
            .header("versioning", "false")
            .json(body);
        if let Some(collection) = &self.collection {
            request = request.header("collection-id", collection);
        }
        let response: BinResponse = request.send().await?.json().await?;
        if !response.success {
            return Err(Error::Api(
                response.message.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        response.id.ok_or(Error::MissingId)
    }

    /// Post each snapshot as its own bin, fire-and-forget.
    ///
    /// A failed upload is logged and does not stop the remaining series;
    /// the per-series outcomes are returned for callers that want them.
    pub async fn publish_series(&self, snapshots: &[SeriesSnapshot]) -> Vec<SeriesOutcome> {
        let mut outcomes = Vec::with_capacity(snapshots.len());
        for snapshot in snapshots {
            let trace = Trace::from(snapshot);
            let body = match serde_json::to_value(&trace) {
                Ok(body) => body,
                Err(err) => {
                    warn!(series = %snapshot.key.name, "failed to encode series: {err}");
                    continue;
                }
            };
            let result = self.create(&body).await;
            match &result {
                Ok(id) => debug!(series = %snapshot.key.name, id = %id, "series posted"),
                Err(err) => warn!(series = %snapshot.key.name, "failed to post series: {err}"),
            }
            outcomes.push(SeriesOutcome {
                name: snapshot.key.name.clone(),
                result,
            });
        }
        outcomes
    }
}
