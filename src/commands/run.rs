//! Implementation of the `run` subcommand.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use batchwright_engine::BatchClient;
use batchwright_engine::Engine;
use batchwright_engine::FileJournal;
use batchwright_engine::JobState;
use batchwright_engine::StateJournal;
use clap::Parser;
use colored::Colorize as _;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::BackendConfig;
use crate::config::Config;
use crate::jobs::read_submit_file;

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug, Clone)]
pub struct Args {
    /// The submit file (JSON or YAML) listing the jobs to run.
    #[arg(value_name = "SUBMIT_FILE")]
    pub submit_file: PathBuf,

    /// The configuration file to use.
    #[arg(short, long, value_name = "TOML")]
    pub config: Option<PathBuf>,

    /// Overrides the directory job logs and the journal are written to.
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Disables color output.
    #[arg(long)]
    pub no_color: bool,
}

/// Builds the client for the configured backend.
fn client(config: &Config) -> Arc<dyn BatchClient> {
    match &config.backend {
        BackendConfig::Local(local) => Arc::new(local.client(&config.engine)),
    }
}

/// Formats a job state for the summary.
fn state_label(state: &JobState, colorize: bool) -> String {
    let label = state.to_string();
    if !colorize {
        return label;
    }

    match state {
        JobState::Succeeded => label.green().to_string(),
        JobState::Failed | JobState::Unsubmitted => label.red().to_string(),
        _ => label.yellow().to_string(),
    }
}

/// Runs the `run` command.
pub async fn run(args: Args) -> Result<()> {
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(output_dir) = args.output_dir {
        config.engine.monitor.output_dir = output_dir;
    }

    let submit = read_submit_file(&args.submit_file).await?;
    if submit.jobs.is_empty() {
        warn!(
            "submit file `{path}` contains no jobs",
            path = args.submit_file.display()
        );
    }

    let output_dir = &config.engine.monitor.output_dir;
    tokio::fs::create_dir_all(output_dir)
        .await
        .with_context(|| {
            format!(
                "failed to create output directory `{path}`",
                path = output_dir.display()
            )
        })?;

    let journal_path = config.engine.monitor.journal_path();
    let journal: Arc<dyn StateJournal> =
        Arc::new(FileJournal::open(&journal_path).await.with_context(|| {
            format!(
                "failed to open journal `{path}`",
                path = journal_path.display()
            )
        })?);

    let client = client(&config);
    let mut engine = Engine::new(config.engine, client, journal)
        .await
        .context("failed to provision batch resources")?;
    engine.monitor()?;

    let token = engine.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            error!("interrupted: cancelling outstanding jobs and releasing resources");
            token.cancel();
        }
    });

    for job in submit.jobs {
        let id = job.id.clone();
        if let Err(e) = engine.submit(job) {
            error!("failed to submit job `{id}`: {e}");
        }
    }
    engine.signal_done();

    let report = engine.await_termination().await?;
    info!(
        succeeded = report.succeeded,
        failed = report.failed,
        unsubmitted = report.unsubmitted,
        outstanding = report.outstanding,
        "all jobs finished"
    );

    let colorize = !args.no_color && std::io::IsTerminal::is_terminal(&std::io::stdout());
    for record in engine.jobs() {
        println!(
            "{id} -> {state}",
            id = record.local_id(),
            state = state_label(record.state(), colorize)
        );
    }

    if !report.resources_released {
        warn!("not every created resource could be deleted");
    }

    if !report.all_succeeded() {
        bail!(
            "{count} job(s) did not succeed",
            count = report.failed + report.unsubmitted + report.outstanding
        );
    }

    Ok(())
}
