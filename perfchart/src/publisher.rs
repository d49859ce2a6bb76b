//! The chart publish pipeline
//!
//! Periodically folds the collected series into a shared remote chart
//! document. The remote is a versioned store behind the
//! [`VersionControl`] trait, git in production, and concurrent publishers
//! are expected: the pipeline works optimistically, merging its snapshot
//! into the freshly pulled document and pushing, and when the push comes
//! back rejected it re-syncs to the remote tip and merges again. Each
//! retry re-reads both sides, so a lost race never clobbers the winner's
//! traces. Merging is replace-by-name, which makes a repeated publish of
//! the same snapshot converge instead of duplicating entries.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use perfchart_series::{
    document::{ChartDocument, Trace},
    store::{SeriesSnapshot, SeriesStore},
};
use tokio::{task::JoinHandle, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod git;
pub mod jsonbin;
pub mod report_service;

use git::{PushOutcome, VersionControl};

/// Attempts made before a publish round gives up. Conflicts resolve in a
/// handful of retries in practice; the generous ceiling covers a swarm of
/// concurrent publishers hammering the same document.
pub const DEFAULT_MAX_RETRIES: usize = 1_000;

/// Pause between conflict retries.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

/// Errors produced by the publish pipeline.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A version-control operation failed.
    #[error("Version control error: {0}")]
    Git(#[from] git::Error),
    /// The remote chart document could not be decoded or encoded.
    #[error("Chart document error: {0}")]
    Document(#[from] serde_json::Error),
    /// The snapshot could not be merged into the document.
    #[error("Merge error: {0}")]
    Merge(#[from] perfchart_series::document::Error),
    /// Every push attempt came back rejected.
    #[error("Publish abandoned after {attempts} rejected attempts")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: usize,
    },
    /// Shutdown was requested while waiting to retry.
    #[error("Publish cancelled by shutdown")]
    Cancelled,
    /// The periodic publish task could not be joined.
    #[error("Publish task failed to join: {0}")]
    Join(#[from] tokio::task::JoinError),
}

fn commit_message(snapshots: &[SeriesSnapshot]) -> String {
    let mut message = String::from("Update benchmark traces:\n");
    for snapshot in snapshots {
        message.push('\n');
        message.push_str(&snapshot.key.name);
    }
    message
}

/// Publishes [`SeriesStore`] snapshots into a shared remote chart document.
#[derive(Debug)]
pub struct ChartPublisher<T> {
    remote: T,
    store: Arc<SeriesStore>,
    branch: String,
    path: PathBuf,
    template: ChartDocument,
    max_retries: usize,
    backoff: Duration,
}

impl<T> ChartPublisher<T>
where
    T: VersionControl,
{
    /// Create a publisher writing the document at `path` on `branch`.
    #[must_use]
    pub fn new(
        remote: T,
        store: Arc<SeriesStore>,
        branch: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            remote,
            store,
            branch: branch.into(),
            path: path.into(),
            template: ChartDocument::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: DEFAULT_BACKOFF,
        }
    }

    /// Document used as the baseline when the remote file does not exist
    /// yet, chart layout typically.
    #[must_use]
    pub fn template(mut self, template: ChartDocument) -> Self {
        self.template = template;
        self
    }

    /// Replace the retry ceiling.
    #[must_use]
    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Replace the pause between conflict retries.
    #[must_use]
    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run one publish round, retrying rejected pushes until accepted or
    /// the retry ceiling is hit. An empty store is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error on version-control or encoding failure, or when
    /// every attempt came back rejected.
    pub async fn publish(&self) -> Result<(), Error> {
        self.publish_with_shutdown(&CancellationToken::new()).await
    }

    /// [`publish`][Self::publish], abandoning the retry wait when
    /// `shutdown` fires.
    ///
    /// # Errors
    ///
    /// As [`publish`][Self::publish], plus [`Error::Cancelled`] when
    /// shutdown interrupts a retry backoff.
    pub async fn publish_with_shutdown(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<(), Error> {
        if self.store.is_empty() {
            debug!("no series collected, skipping publish");
            return Ok(());
        }

        self.remote.checkout(&self.branch).await?;
        self.remote.pull().await?;

        let mut attempts = 0;
        loop {
            attempts += 1;
            // The snapshot is taken fresh each attempt so a retry publishes
            // points recorded while we were waiting, not a stale view.
            match self.attempt().await? {
                PushOutcome::Accepted => {
                    info!(attempts, "chart published");
                    return Ok(());
                }
                PushOutcome::Rejected if attempts > self.max_retries => {
                    return Err(Error::RetriesExhausted { attempts });
                }
                PushOutcome::Rejected => {
                    warn!(attempt = attempts, "push rejected, re-syncing and retrying");
                    tokio::select! {
                        () = shutdown.cancelled() => return Err(Error::Cancelled),
                        () = time::sleep(self.backoff) => {}
                    }
                    self.remote.fetch().await?;
                    self.remote
                        .hard_reset(&format!("origin/{branch}", branch = self.branch))
                        .await?;
                }
            }
        }
    }

    async fn attempt(&self) -> Result<PushOutcome, Error> {
        let snapshots = self.store.snapshot();
        let mut document = match self.remote.read_file(&self.path).await? {
            Some(contents) => serde_json::from_str(&contents)?,
            None => self.template.clone(),
        };

        let traces: Vec<Trace> = snapshots.iter().map(Trace::from).collect();
        document.merge_traces(&traces)?;

        let encoded = serde_json::to_string_pretty(&document)?;
        self.remote.write_file(&self.path, &encoded).await?;
        self.remote.add(&self.path).await?;
        self.remote.commit(&commit_message(&snapshots)).await?;
        Ok(self.remote.push().await?)
    }

    /// Spawn a task publishing every `period` until the handle is closed.
    #[must_use]
    pub fn spawn_periodic(self, period: Duration) -> PublishHandle
    where
        T: 'static,
    {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => return Ok(()),
                    _ = ticker.tick() => {
                        match self.publish_with_shutdown(&token).await {
                            Ok(()) | Err(Error::Cancelled) => {}
                            Err(err) => warn!("periodic publish failed: {err}"),
                        }
                        if token.is_cancelled() {
                            return Ok(());
                        }
                    }
                }
            }
        });
        PublishHandle { shutdown, task }
    }
}

/// Handle over a periodic publish task.
#[derive(Debug)]
pub struct PublishHandle {
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), Error>>,
}

impl PublishHandle {
    /// Stop the periodic schedule and wait for the task to wind down.
    ///
    /// # Errors
    ///
    /// Returns an error if the publish task panicked.
    pub async fn close(self) -> Result<(), Error> {
        self.shutdown.cancel();
        self.task.await?
    }
}
