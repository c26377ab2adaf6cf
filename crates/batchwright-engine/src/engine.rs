//! The engine.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

use crate::EngineError;
use crate::EngineResult;
use crate::client::BatchClient;
use crate::config::Config;
use crate::job::BatchJob;
use crate::job::JobRecord;
use crate::job::JobState;
use crate::job::JobTable;
use crate::journal::StateJournal;
use crate::logs::LogRetriever;
use crate::monitor::Monitor;
use crate::monitor::Teardown;
use crate::monitor::TerminationReport;
use crate::pool::WorkerPool;
use crate::resources::ProvisionedResources;
use crate::resources::ResourceController;
use crate::submit::SubmissionPipeline;
use crate::submit::SubmissionReceiver;

/// The lifecycle of the engine's monitor.
#[derive(Debug)]
enum MonitorState {
    /// The monitor has not been started.
    Idle {
        /// The receiving end of the submission pipeline.
        submissions: SubmissionReceiver,
    },
    /// The monitor is running.
    Running(JoinHandle<TerminationReport>),
    /// The monitor finished with the given report.
    Finished(TerminationReport),
    /// The monitor task panicked or was aborted.
    Failed(String),
}

/// Submits jobs to a remote batch service and tracks them to completion.
///
/// Creating an engine provisions its resources. Jobs may be submitted at any
/// time until [`Engine::signal_done`] is called; once the monitor has seen
/// every submitted job finish, it releases the resources and
/// [`Engine::await_termination`] returns.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use batchwright_engine::*;
/// # async fn example(client: Arc<dyn BatchClient>) -> EngineResult<()> {
/// let journal = Arc::new(MemoryJournal::new());
/// let mut engine = Engine::new(Config::default(), client, journal).await?;
/// engine.monitor()?;
/// engine.submit(BatchJob::new("align_1", JobCommand::default()))?;
/// engine.signal_done();
/// engine.await_termination().await?;
/// assert_eq!(engine.job_state("align_1"), Some(JobState::Succeeded));
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Engine {
    /// The engine configuration.
    config: Config,
    /// The batch client.
    client: Arc<dyn BatchClient>,
    /// The state journal.
    journal: Arc<dyn StateJournal>,
    /// The job table.
    jobs: JobTable,
    /// Provisions and tears down resources.
    controller: ResourceController,
    /// The provisioned resources.
    resources: ProvisionedResources,
    /// The pool submit calls run on.
    pool: WorkerPool,
    /// The submission pipeline.
    pipeline: SubmissionPipeline,
    /// The monitor.
    monitor: MonitorState,
    /// Cancels the monitor and every submit call.
    token: CancellationToken,
}

impl Engine {
    /// Creates an engine, provisioning its resources.
    ///
    /// Fails if the configuration is invalid or a resource does not become
    /// valid; in that case no job can be submitted.
    pub async fn new(
        config: Config,
        client: Arc<dyn BatchClient>,
        journal: Arc<dyn StateJournal>,
    ) -> EngineResult<Self> {
        config.validate()?;

        let controller = ResourceController::new(client.clone(), &config);
        let resources = controller.create_all().await?;
        info!(
            job_definition = resources.job_definition.handle,
            compute_environment = resources.compute_environment.handle,
            job_queue = resources.job_queue.handle,
            "resources are ready"
        );

        let token = CancellationToken::new();
        let pool = WorkerPool::new(config.pool.workers, config.pool.shutdown_grace(), &token);
        let jobs = JobTable::new();
        let (pipeline, submissions) = SubmissionPipeline::new(
            client.clone(),
            jobs.clone(),
            pool.clone(),
            &resources.job_queue.handle,
            &resources.job_definition.handle,
            resources.bucket.as_ref().map(|b| b.name.clone()),
        );

        Ok(Self {
            config,
            client,
            journal,
            jobs,
            controller,
            resources,
            pool,
            pipeline,
            monitor: MonitorState::Idle { submissions },
            token,
        })
    }

    /// Gets the engine configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Gets the resources the engine runs jobs on.
    pub fn resources(&self) -> &ProvisionedResources {
        &self.resources
    }

    /// Starts the monitor.
    ///
    /// Fails if the monitor was already started.
    pub fn monitor(&mut self) -> EngineResult<()> {
        let submissions = match std::mem::replace(
            &mut self.monitor,
            MonitorState::Finished(TerminationReport::default()),
        ) {
            MonitorState::Idle { submissions } => submissions,
            state => {
                self.monitor = state;
                return Err(EngineError::MonitorAlreadyStarted);
            }
        };

        let monitor = Monitor::new(
            self.client.clone(),
            self.jobs.clone(),
            self.journal.clone(),
            LogRetriever::new(self.client.clone(), &self.config.monitor),
            &self.resources.job_queue.handle,
            self.config.monitor.poll_interval(),
            self.token.clone(),
            submissions,
        );

        let teardown = Teardown {
            controller: self.controller.clone(),
            resources: self.resources.clone(),
            pool: self.pool.clone(),
        };

        debug!("starting monitor");
        self.monitor = MonitorState::Running(tokio::spawn(monitor.run(teardown)));
        Ok(())
    }

    /// Submits a job.
    ///
    /// Returns as soon as the submit call is dispatched; the outcome is
    /// observed by the monitor. Fails if [`Engine::signal_done`] was called,
    /// the id was used before or the engine is shutting down.
    pub fn submit(&self, job: BatchJob) -> EngineResult<()> {
        self.pipeline.submit(job)
    }

    /// Signals that no more jobs will be submitted.
    ///
    /// Calling this more than once has no further effect.
    pub fn signal_done(&self) {
        if self.pipeline.close() {
            debug!("no more jobs will be submitted");
        }
    }

    /// Waits for the monitor to finish.
    ///
    /// The monitor finishes once [`Engine::signal_done`] was called and every
    /// submitted job either finished or failed to submit, or when the engine
    /// is cancelled. Waiting again returns the same report, or the same error
    /// if the monitor task did not complete.
    pub async fn await_termination(&mut self) -> EngineResult<TerminationReport> {
        let handle = match &mut self.monitor {
            MonitorState::Idle { .. } => return Err(EngineError::MonitorNotStarted),
            MonitorState::Finished(report) => return Ok(report.clone()),
            MonitorState::Failed(message) => return Err(EngineError::Join(message.clone())),
            MonitorState::Running(handle) => handle,
        };

        match handle.await {
            Ok(report) => {
                self.monitor = MonitorState::Finished(report.clone());
                Ok(report)
            }
            Err(e) => {
                let message = e.to_string();
                self.monitor = MonitorState::Failed(message.clone());
                Err(EngineError::Join(message))
            }
        }
    }

    /// Gets the state of a job.
    ///
    /// This remains valid after the engine terminates.
    pub fn job_state(&self, local_id: &str) -> Option<JobState> {
        self.jobs.state(local_id)
    }

    /// Gets a copy of every job record, in submission order.
    pub fn jobs(&self) -> Vec<JobRecord> {
        self.jobs.snapshot()
    }

    /// Cancels the engine.
    ///
    /// The monitor stops at its next suspension point and tears down as if
    /// every job had finished; in-flight submit calls are cancelled.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Gets a token that is cancelled along with the engine.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }
}
