//! Merge dumped benchmark series into a chart document and publish it.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use perfchart::config::{self, Config, PublishConfig};
use perfchart::dump;
use perfchart::publisher::{
    git::GitCli,
    jsonbin::JsonbinClient,
    report_service::{ReportServiceClient, RunContext},
    ChartPublisher,
};
use perfchart_series::{
    document::{ChartDocument, Trace},
    store::SeriesStore,
};
use tokio::runtime::Builder;
use tracing::{debug, info, warn};
use tracing_subscriber::{filter::EnvFilter, util::SubscriberInitExt};

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Config(#[from] config::Error),
    #[error(transparent)]
    Dump(#[from] dump::Error),
    #[error(transparent)]
    Publish(#[from] perfchart::publisher::Error),
    #[error(transparent)]
    Git(#[from] perfchart::publisher::git::Error),
    #[error(transparent)]
    Report(#[from] perfchart::publisher::report_service::Error),
    #[error("Failed to fetch template: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Invalid chart document: {0}")]
    Document(#[from] serde_json::Error),
    #[error(transparent)]
    Merge(#[from] perfchart_series::document::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(version, about = "Merge dumped benchmark series into a chart document and publish it")]
struct Opts {
    /// Path of the configuration file
    #[arg(short, long, default_value = "perfchart.yaml")]
    config: PathBuf,
    /// Folder series files are loaded from, overriding the configuration
    #[arg(short, long)]
    input: Option<PathBuf>,
    /// Folder the merged chart is written into, overriding the configuration
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Chart template, a file path or URL, overriding the configuration
    #[arg(short, long)]
    template: Option<String>,
}

fn load_config(opts: &Opts) -> Result<Config, Error> {
    let mut config = if opts.config.exists() {
        Config::from_path(&opts.config)?
    } else {
        debug!(path = %opts.config.display(), "no config file, using defaults");
        Config::default()
    };
    if let Some(input) = &opts.input {
        config.traces_folder.clone_from(input);
    }
    if let Some(output) = &opts.output {
        config.charts_folder.clone_from(output);
    }
    if let Some(template) = &opts.template {
        config.chart_template = Some(template.clone());
    }
    Ok(config)
}

async fn load_template(source: Option<&str>) -> Result<ChartDocument, Error> {
    match source {
        None => Ok(ChartDocument::default()),
        Some(url) if url.starts_with("http://") || url.starts_with("https://") => {
            debug!(url, "fetching chart template");
            let value: serde_json::Value = reqwest::get(url)
                .await?
                .error_for_status()?
                .json()
                .await?;
            Ok(serde_json::from_value(value)?)
        }
        Some(path) => {
            let contents = tokio::fs::read_to_string(path).await?;
            Ok(serde_json::from_str(&contents)?)
        }
    }
}

/// Rebuild an in-memory store from dumped traces so the publisher works
/// off the same snapshot machinery a live benchmark would.
fn rebuild_store(traces: &[Trace]) -> Arc<SeriesStore> {
    let store = Arc::new(SeriesStore::new());
    for trace in traces {
        let group = trace.group.as_deref().unwrap_or_default();
        let series = store.get_or_create(&trace.name, group);
        if let Some(line) = &trace.line {
            series.set_color(&line.color);
        }
        for (x, y) in trace.x.iter().zip(&trace.y) {
            series.append_xy(*x, *y);
        }
    }
    store
}

async fn run(opts: Opts) -> Result<(), Error> {
    let config = load_config(&opts)?;

    let traces = dump::load_traces(&config.traces_folder).await?;
    info!(
        series = traces.len(),
        folder = %config.traces_folder.display(),
        "loaded series"
    );
    let store = rebuild_store(&traces);
    let template = load_template(config.chart_template.as_deref()).await?;

    // Always materialize the merged chart locally, publishing or not.
    let mut local = template.clone();
    local.merge_traces(&traces)?;
    tokio::fs::create_dir_all(&config.charts_folder).await?;
    let local_path = config.charts_folder.join("chart.json");
    tokio::fs::write(&local_path, serde_json::to_string_pretty(&local)?).await?;
    info!(path = %local_path.display(), "wrote merged chart");

    match config.publish {
        None => {}
        Some(PublishConfig::Git { url, branch, path }) => {
            let workdir = tempfile::tempdir()?;
            let remote = GitCli::clone_repo(&url, workdir.path().join("repo")).await?;
            let publisher = ChartPublisher::new(remote, store, branch, path).template(template);
            publisher.publish().await?;
        }
        Some(PublishConfig::ReportService {
            url,
            owner,
            repo,
            sha,
        }) => {
            let client = ReportServiceClient::new(url, RunContext { owner, repo, sha });
            client.publish_snapshot(&store.snapshot()).await?;
        }
        Some(PublishConfig::Jsonbin { url, collection }) => {
            let secret = config::secret_from_env()?;
            let client = JsonbinClient::new(url, secret, collection);
            let outcomes = client.publish_series(&store.snapshot()).await;
            let posted = outcomes.iter().filter(|o| o.result.is_ok()).count();
            if posted < outcomes.len() {
                warn!(
                    failed = outcomes.len() - posted,
                    "some series failed to post"
                );
            }
            for outcome in &outcomes {
                if let Ok(id) = &outcome.result {
                    info!(series = %outcome.name, id = %id, "series posted");
                }
            }
        }
    }
    Ok(())
}

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish()
        .init();

    let opts = Opts::parse();
    debug!("CLI options: {opts:?}");

    let runtime = Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(run(opts))
}
