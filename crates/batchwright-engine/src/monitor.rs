//! The monitor loop.
//!
//! The monitor is the only task that moves jobs out of `Unsubmitted`. Each
//! cycle it:
//!
//! 1. collects finished submit calls, recording the remote ids of accepted
//!    jobs as active;
//! 2. lists the succeeded jobs on the queue, finishes the matching active
//!    jobs and retrieves their logs;
//! 3. sleeps for the poll interval;
//! 4. lists the failed jobs on the queue and finishes the matching active
//!    jobs;
//! 5. sleeps again and describes the jobs still active, journaling changed
//!    intermediate statuses.
//!
//! The loop ends once the submission channel is closed and drained, no submit
//! call is in flight and no job is active (or when the engine is cancelled).
//! The engine's resources are then torn down and the worker pool shut down.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::client::BatchClient;
use crate::client::RemoteJobStatus;
use crate::job::JobState;
use crate::job::JobTable;
use crate::journal::StateJournal;
use crate::logs::LogRetriever;
use crate::logs::log_stream_name;
use crate::pool::WorkerPool;
use crate::resources::ProvisionedResources;
use crate::resources::ResourceController;
use crate::submit::PendingSubmission;
use crate::submit::SubmissionReceiver;

/// The outcome of a monitor run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminationReport {
    /// The number of jobs that succeeded.
    pub succeeded: usize,
    /// The number of jobs that failed.
    pub failed: usize,
    /// The number of jobs whose submit call failed.
    pub unsubmitted: usize,
    /// The number of jobs still outstanding when the monitor stopped.
    ///
    /// This is only non-zero if the engine was cancelled.
    pub outstanding: usize,
    /// Whether every resource the engine created was deleted.
    pub resources_released: bool,
}

impl TerminationReport {
    /// Determines if every submitted job succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0 && self.unsubmitted == 0 && self.outstanding == 0
    }
}

/// Everything the monitor needs to tear down once it is done.
#[derive(Debug)]
pub(crate) struct Teardown {
    /// The controller deleting the resources.
    pub(crate) controller: ResourceController,
    /// The resources to delete.
    pub(crate) resources: ProvisionedResources,
    /// The pool to shut down.
    pub(crate) pool: WorkerPool,
}

/// The state of the monitor loop.
#[derive(Debug)]
pub(crate) struct Monitor {
    /// The batch client.
    client: Arc<dyn BatchClient>,
    /// The job table.
    jobs: JobTable,
    /// The journal transitions are recorded in.
    journal: Arc<dyn StateJournal>,
    /// Retrieves the logs of succeeded jobs.
    logs: LogRetriever,
    /// The handle of the queue jobs were submitted to.
    job_queue: String,
    /// The interval between status queries.
    poll_interval: Duration,
    /// Cancels the loop.
    token: CancellationToken,
    /// The receiving end of the submission pipeline.
    submissions: SubmissionReceiver,
    /// Whether the submission channel may still deliver submissions.
    open: bool,
    /// Submit calls in flight.
    pending: Vec<PendingSubmission>,
    /// Submitted jobs not known to be finished, keyed by remote id.
    active: IndexMap<String, String>,
    /// The remote ids of finished jobs.
    done: HashSet<String>,
}

impl Monitor {
    /// Constructs a new monitor.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        client: Arc<dyn BatchClient>,
        jobs: JobTable,
        journal: Arc<dyn StateJournal>,
        logs: LogRetriever,
        job_queue: impl Into<String>,
        poll_interval: Duration,
        token: CancellationToken,
        submissions: SubmissionReceiver,
    ) -> Self {
        Self {
            client,
            jobs,
            journal,
            logs,
            job_queue: job_queue.into(),
            poll_interval,
            token,
            submissions,
            open: true,
            pending: Vec::new(),
            active: IndexMap::new(),
            done: HashSet::new(),
        }
    }

    /// Runs the loop to completion, then tears down.
    pub(crate) async fn run(mut self, teardown: Teardown) -> TerminationReport {
        info!(queue = self.job_queue, "monitor started");

        loop {
            self.collect_submissions().await;
            if self.is_finished() || self.token.is_cancelled() {
                break;
            }

            if !self.active.is_empty() {
                self.reconcile(RemoteJobStatus::Succeeded).await;
            }

            if !self.sleep().await {
                break;
            }

            if !self.active.is_empty() {
                self.reconcile(RemoteJobStatus::Failed).await;
            }

            if !self.active.is_empty() {
                if !self.sleep().await {
                    break;
                }

                self.observe().await;
            }
        }

        if self.token.is_cancelled() {
            warn!(
                pending = self.pending.len(),
                active = self.active.len(),
                "monitor cancelled"
            );
        } else {
            info!("all jobs finished");
        }

        let resources_released = teardown.controller.delete_all(&teardown.resources).await;
        teardown.pool.shutdown().await;

        let mut report = TerminationReport {
            resources_released,
            outstanding: self.active.len(),
            ..Default::default()
        };

        for record in self.jobs.snapshot() {
            match record.state() {
                JobState::Succeeded => report.succeeded += 1,
                JobState::Failed => report.failed += 1,
                JobState::Unsubmitted => report.unsubmitted += 1,
                _ => {}
            }
        }

        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            unsubmitted = report.unsubmitted,
            outstanding = report.outstanding,
            "monitor finished"
        );
        report
    }

    /// Determines if there is nothing left to wait for.
    fn is_finished(&self) -> bool {
        !self.open && self.pending.is_empty() && self.active.is_empty()
    }

    /// Sleeps for the poll interval.
    ///
    /// Returns `false` if the monitor was cancelled while sleeping.
    async fn sleep(&self) -> bool {
        tokio::select! {
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(self.poll_interval) => true,
        }
    }

    /// Drains the submission channel and records the outcome of every
    /// finished submit call.
    async fn collect_submissions(&mut self) {
        while self.open {
            match self.submissions.try_recv() {
                Ok(pending) => self.pending.push(pending),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    debug!("submission channel closed");
                    self.open = false;
                }
            }
        }

        let (finished, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|p| p.task.is_finished());
        self.pending = pending;

        for PendingSubmission { local_id, task } in finished {
            let remote_id = match task.await {
                Ok(Some(Ok(remote_id))) => remote_id,
                Ok(Some(Err(e))) => {
                    warn!(job = local_id, error = %e, "failed to submit job");
                    continue;
                }
                Ok(None) => {
                    warn!(job = local_id, "submit call was cancelled");
                    continue;
                }
                Err(e) => {
                    warn!(job = local_id, error = %e, "submit task did not complete");
                    continue;
                }
            };

            let submitted = self
                .jobs
                .update(&local_id, |r| r.mark_submitted(remote_id.clone()))
                .unwrap_or(false);
            if !submitted {
                continue;
            }

            info!(job = local_id, remote_id, "job submitted");
            self.record(&local_id, &remote_id, &JobState::Submitted)
                .await;
            self.active.insert(remote_id, local_id);
        }
    }

    /// Finishes the active jobs the queue lists with a terminal status.
    ///
    /// Returns the number of jobs finished. Listing the same jobs again
    /// finishes nothing.
    async fn reconcile(&mut self, status: RemoteJobStatus) -> usize {
        let state = match status {
            RemoteJobStatus::Succeeded => JobState::Succeeded,
            RemoteJobStatus::Failed => JobState::Failed,
            _ => return 0,
        };

        let summaries = match self.client.list_jobs(&self.job_queue, status).await {
            Ok(summaries) => summaries,
            Err(e) => {
                warn!(%status, error = %e, "failed to list jobs");
                return 0;
            }
        };

        let mut finished = Vec::new();
        for summary in summaries {
            if self.done.contains(&summary.remote_id) {
                continue;
            }

            let Some(local_id) = self.active.shift_remove(&summary.remote_id) else {
                continue;
            };

            self.done.insert(summary.remote_id.clone());
            let changed = self
                .jobs
                .update(&local_id, |r| r.mark_terminal(state.clone()))
                .unwrap_or(false);
            if changed {
                info!(job = local_id, remote_id = summary.remote_id, %state, "job finished");
                self.record(&local_id, &summary.remote_id, &state).await;
            }

            finished.push((local_id, summary.remote_id));
        }

        if state == JobState::Succeeded && !finished.is_empty() {
            self.retrieve_logs(&finished).await;
        }

        finished.len()
    }

    /// Describes the active jobs and journals changed intermediate statuses.
    ///
    /// Terminal statuses are left to [`Monitor::reconcile`]; `SUBMITTED` was
    /// journaled when the submit call completed.
    async fn observe(&mut self) {
        let ids: Vec<String> = self.active.keys().cloned().collect();
        let details = match self.client.describe_jobs(&ids).await {
            Ok(details) => details,
            Err(e) => {
                warn!(error = %e, "failed to describe jobs");
                return;
            }
        };

        for detail in details {
            if [
                RemoteJobStatus::Submitted,
                RemoteJobStatus::Succeeded,
                RemoteJobStatus::Failed,
            ]
            .iter()
            .any(|s| detail.status == s.as_str())
            {
                continue;
            }

            let Some(local_id) = self.active.get(&detail.remote_id).cloned() else {
                continue;
            };

            let changed = self
                .jobs
                .update(&local_id, |r| r.observe(&detail.status))
                .unwrap_or(false);
            if changed {
                debug!(job = local_id, status = detail.status, "job status changed");
                self.record(
                    &local_id,
                    &detail.remote_id,
                    &JobState::Other(detail.status.clone()),
                )
                .await;
            }
        }
    }

    /// Retrieves the logs of the given succeeded jobs.
    ///
    /// Failures are logged and otherwise ignored.
    async fn retrieve_logs(&self, finished: &[(String, String)]) {
        let ids: Vec<String> = finished.iter().map(|(_, r)| r.clone()).collect();
        let details = match self.client.describe_jobs(&ids).await {
            Ok(details) => details,
            Err(e) => {
                warn!(error = %e, "failed to describe succeeded jobs; their logs are not retrieved");
                return;
            }
        };

        for (local_id, remote_id) in finished {
            let Some(task_ref) = details
                .iter()
                .find(|d| &d.remote_id == remote_id)
                .and_then(|d| d.task_ref.as_deref())
            else {
                warn!(job = local_id, remote_id, "no task reference for job; its log is not retrieved");
                continue;
            };

            let Some(definition) = self.jobs.get(local_id).map(|r| r.job_definition().to_string())
            else {
                continue;
            };

            let stream = log_stream_name(&definition, task_ref);
            match self.logs.retrieve(local_id, &stream).await {
                Ok(log) => {
                    debug!(job = local_id, path = %log.path.display(), "wrote job log");
                }
                Err(e) => {
                    warn!(job = local_id, stream, error = %e, "failed to retrieve job log");
                }
            }
        }
    }

    /// Records a transition in the journal.
    async fn record(&self, local_id: &str, remote_id: &str, state: &JobState) {
        if let Err(e) = self.journal.record(local_id, remote_id, state).await {
            warn!(job = local_id, %state, error = %e, "failed to journal state transition");
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::client::JobSummary;
    use crate::config::MonitorConfig;
    use crate::journal::MemoryJournal;
    use crate::scripted::ScriptedClient;
    use crate::submit::SubmissionPipeline;

    struct Harness {
        client: Arc<ScriptedClient>,
        journal: Arc<MemoryJournal>,
        jobs: JobTable,
        monitor: Monitor,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ScriptedClient::default());
        let journal = Arc::new(MemoryJournal::new());
        let jobs = JobTable::new();
        let config = MonitorConfig {
            output_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let pool = WorkerPool::new(2, Duration::from_secs(60), &CancellationToken::new());
        let (pipeline, rx) = SubmissionPipeline::new(
            client.clone(),
            jobs.clone(),
            pool,
            "queue",
            "definition",
            None,
        );
        drop(pipeline);

        let monitor = Monitor::new(
            client.clone(),
            jobs.clone(),
            journal.clone(),
            LogRetriever::new(client.clone(), &config),
            "queue",
            config.poll_interval(),
            CancellationToken::new(),
            rx,
        );

        Harness {
            client,
            journal,
            jobs,
            monitor,
            _dir: dir,
        }
    }

    /// Makes a job active as if its submit call had completed.
    fn activate(h: &mut Harness, local_id: &str, remote_id: &str) {
        h.jobs.insert(crate::job::JobRecord::new(
            crate::job::BatchJob::new(local_id, Default::default()),
            "queue",
            "definition",
        ));
        h.jobs.update(local_id, |r| r.mark_submitted(remote_id));
        h.monitor
            .active
            .insert(remote_id.to_string(), local_id.to_string());
    }

    #[tokio::test]
    async fn reconciliation_is_idempotent() {
        let mut h = harness();
        activate(&mut h, "a", "r-a");
        activate(&mut h, "b", "r-b");
        h.client.set_listed(
            RemoteJobStatus::Failed,
            vec![
                JobSummary {
                    remote_id: "r-a".to_string(),
                    name: "a".to_string(),
                },
                JobSummary {
                    remote_id: "r-unknown".to_string(),
                    name: "other".to_string(),
                },
            ],
        );

        assert_eq!(h.monitor.reconcile(RemoteJobStatus::Failed).await, 1);
        assert_eq!(h.monitor.reconcile(RemoteJobStatus::Failed).await, 0);
        assert_eq!(h.journal.states("a"), [JobState::Failed]);
        assert_eq!(h.jobs.state("a"), Some(JobState::Failed));
        assert_eq!(h.monitor.active.len(), 1);
        assert_eq!(h.monitor.done.len(), 1);
    }

    #[tokio::test]
    async fn finished_ids_are_not_counted_twice() {
        let mut h = harness();
        activate(&mut h, "a", "r-a");
        h.client.set_listed(
            RemoteJobStatus::Succeeded,
            vec![JobSummary {
                remote_id: "r-a".to_string(),
                name: "a".to_string(),
            }],
        );
        h.client.set_listed(
            RemoteJobStatus::Failed,
            vec![JobSummary {
                remote_id: "r-a".to_string(),
                name: "a".to_string(),
            }],
        );

        assert_eq!(h.monitor.reconcile(RemoteJobStatus::Succeeded).await, 1);
        assert_eq!(h.monitor.reconcile(RemoteJobStatus::Failed).await, 0);
        assert_eq!(h.jobs.state("a"), Some(JobState::Succeeded));
        assert_eq!(h.journal.states("a"), [JobState::Succeeded]);
    }

    #[tokio::test]
    async fn list_failures_are_retried_later() {
        let mut h = harness();
        activate(&mut h, "a", "r-a");
        h.client.fail_lists(1);
        h.client.set_listed(
            RemoteJobStatus::Succeeded,
            vec![JobSummary {
                remote_id: "r-a".to_string(),
                name: "a".to_string(),
            }],
        );

        assert_eq!(h.monitor.reconcile(RemoteJobStatus::Succeeded).await, 0);
        assert_eq!(h.jobs.state("a"), Some(JobState::Submitted));
        assert_eq!(h.monitor.reconcile(RemoteJobStatus::Succeeded).await, 1);
    }

    #[tokio::test]
    async fn observe_journals_only_changes() {
        let mut h = harness();
        activate(&mut h, "a", "r-a");
        activate(&mut h, "b", "r-b");

        h.client.set_detail_status("r-a", "RUNNABLE");
        h.client.set_detail_status("r-b", "SUCCEEDED");
        h.monitor.observe().await;
        h.monitor.observe().await;
        h.client.set_detail_status("r-a", "RUNNING");
        h.monitor.observe().await;

        assert_eq!(
            h.journal.states("a"),
            [
                JobState::Other("RUNNABLE".to_string()),
                JobState::Other("RUNNING".to_string())
            ]
        );
        assert!(h.journal.states("b").is_empty());
        assert_eq!(h.jobs.state("b"), Some(JobState::Submitted));
    }
}
