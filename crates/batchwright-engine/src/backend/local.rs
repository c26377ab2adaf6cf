//! Implementation of the local backend.
//!
//! The local backend emulates a batch control plane in process: resources
//! pass through their transitional statuses before settling, jobs run as
//! host processes and their output becomes the events of a log stream.
//!
//! Warning: jobs are spawned as processes on the host without any isolation.

use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use indexmap::IndexMap;
use tokio::process::Command;
use tracing::debug;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::client::BatchClient;
use crate::client::ClientError;
use crate::client::ClientResult;
use crate::client::CreateResourceRequest;
use crate::client::JobDetail;
use crate::client::JobSummary;
use crate::client::LogEvent;
use crate::client::LogEventsPage;
use crate::client::RemoteJobStatus;
use crate::client::ResourceDetail;
use crate::client::ResourceKind;
use crate::client::ResourceStatus;
use crate::client::SubmitJobRequest;
use crate::job::JobCommand;
use crate::logs::log_stream_name;

/// The prefix of the handles of local resources.
const HANDLE_PREFIX: &str = "arn:local:batch";

/// The prefix of local task references.
const TASK_PREFIX: &str = "arn:local:ecs:task";

/// The prefix of local log tokens.
const TOKEN_PREFIX: &str = "f/";

/// The default number of describe calls a resource spends in a transitional
/// status.
const DEFAULT_SETTLE_DESCRIBES: usize = 1;

/// The default maximum number of events in a log page.
const DEFAULT_PAGE_SIZE: usize = 100;

/// A resource of the local control plane.
#[derive(Debug)]
struct LocalResource {
    /// The kind of the resource.
    kind: ResourceKind,
    /// The status the resource reports.
    status: ResourceStatus,
    /// The status the resource settles to.
    target: Option<ResourceStatus>,
    /// The describe calls remaining before the resource settles.
    remaining: usize,
    /// Whether the resource accepts work.
    enabled: bool,
    /// The compute environment a queue is bound to.
    compute_environment: Option<String>,
}

impl LocalResource {
    /// Starts a transition to the given status.
    fn transition(&mut self, through: ResourceStatus, to: ResourceStatus, describes: usize) {
        if describes == 0 {
            self.status = to;
            self.target = None;
        } else {
            self.status = through;
            self.target = Some(to);
            self.remaining = describes;
        }
    }

    /// Accounts for a describe call, settling the resource when due.
    fn tick(&mut self) {
        if self.target.is_none() {
            return;
        }

        if self.remaining == 0 {
            self.status = self.target.take().unwrap_or(ResourceStatus::Valid);
        } else {
            self.remaining -= 1;
        }
    }

    /// Determines if the resource can be used.
    fn is_usable(&self) -> bool {
        self.enabled && self.status == ResourceStatus::Valid
    }
}

/// A job of the local control plane.
#[derive(Debug)]
struct LocalJob {
    /// The job name.
    name: String,
    /// The handle of the queue the job was submitted to.
    job_queue: String,
    /// The current status.
    status: RemoteJobStatus,
    /// The reason for the status.
    reason: Option<String>,
    /// The task reference, once the job started.
    task_ref: Option<String>,
}

/// The state of the local control plane.
#[derive(Debug, Default)]
struct LocalState {
    /// Resources, keyed by handle.
    resources: IndexMap<String, LocalResource>,
    /// Jobs, keyed by remote id.
    jobs: IndexMap<String, LocalJob>,
    /// Log events, keyed by group and stream.
    logs: IndexMap<(String, String), Vec<LogEvent>>,
    /// Buckets, keyed by name, with the directory holding their objects.
    buckets: IndexMap<String, PathBuf>,
}

/// A batch client emulating the control plane locally.
#[derive(Debug, Clone)]
pub struct LocalBatchClient {
    /// The directory jobs run in.
    work_dir: PathBuf,
    /// The log group job output is written to.
    log_group: String,
    /// The describe calls a resource spends in a transitional status.
    settle_describes: usize,
    /// The maximum number of events in a log page.
    page_size: usize,
    /// The control plane state.
    state: Arc<Mutex<LocalState>>,
}

impl LocalBatchClient {
    /// Constructs a local client running jobs in the given directory and
    /// writing their output to the given log group.
    pub fn new(work_dir: impl Into<PathBuf>, log_group: impl Into<String>) -> Self {
        Self {
            work_dir: work_dir.into(),
            log_group: log_group.into(),
            settle_describes: DEFAULT_SETTLE_DESCRIBES,
            page_size: DEFAULT_PAGE_SIZE,
            state: Default::default(),
        }
    }

    /// Sets how many describe calls a resource spends in a transitional
    /// status.
    pub fn with_settle_describes(mut self, describes: usize) -> Self {
        self.settle_describes = describes;
        self
    }

    /// Sets the maximum number of events in a log page.
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size.max(1);
        self
    }

    /// Gets the directory holding the objects of a known bucket.
    fn bucket_dir(&self, bucket: &str) -> ClientResult<PathBuf> {
        self.state()
            .buckets
            .get(bucket)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(bucket.to_string()))
    }

    /// Locks the control plane state.
    fn state(&self) -> std::sync::MutexGuard<'_, LocalState> {
        self.state.lock().expect("failed to lock local backend state")
    }

    /// Runs a job to completion and records its outcome.
    async fn run_job(self, remote_id: String, job_definition: String, command: JobCommand) {
        let task_ref = format!("{TASK_PREFIX}/{id}", id = Uuid::new_v4());
        let stream = log_stream_name(&job_definition, &task_ref);

        {
            let mut state = self.state();
            if let Some(job) = state.jobs.get_mut(&remote_id) {
                job.status = RemoteJobStatus::Running;
                job.task_ref = Some(task_ref);
            }
        }

        let (status, reason, lines) = match self.execute(&command).await {
            Ok((code, lines)) if code == 0 => (RemoteJobStatus::Succeeded, None, lines),
            Ok((code, lines)) => (
                RemoteJobStatus::Failed,
                Some(format!("Essential container in task exited with code {code}")),
                lines,
            ),
            Err(e) => (
                RemoteJobStatus::Failed,
                Some(format!("{e:#}")),
                Vec::new(),
            ),
        };

        info!(remote_id, %status, "local job finished");

        let mut state = self.state();
        let timestamp = Utc::now().timestamp_millis();
        state
            .logs
            .entry((self.log_group.clone(), stream))
            .or_default()
            .extend(lines.into_iter().map(|message| LogEvent { timestamp, message }));

        if let Some(job) = state.jobs.get_mut(&remote_id) {
            job.status = status;
            job.reason = reason;
        }
    }

    /// Executes a job's command, returning its exit code and output lines.
    async fn execute(&self, command: &JobCommand) -> Result<(i32, Vec<String>)> {
        let args = shlex::split(&command.arguments)
            .ok_or_else(|| anyhow!("invalid arguments `{args}`", args = command.arguments))?;

        tokio::fs::create_dir_all(&self.work_dir)
            .await
            .with_context(|| {
                format!(
                    "failed to create directory `{path}`",
                    path = self.work_dir.display()
                )
            })?;

        let output = Command::new(&command.executable)
            .args(&args)
            .envs(command.environment.iter().map(|v| (&v.name, &v.value)))
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to spawn `{exe}`", exe = command.executable))?;

        let lines = String::from_utf8_lossy(&output.stdout)
            .lines()
            .chain(String::from_utf8_lossy(&output.stderr).lines())
            .map(str::to_string)
            .collect();

        // A process terminated by a signal has no exit code.
        Ok((output.status.code().unwrap_or(-1), lines))
    }
}

#[async_trait]
impl BatchClient for LocalBatchClient {
    async fn submit_job(&self, request: &SubmitJobRequest) -> ClientResult<String> {
        let remote_id = Uuid::new_v4().to_string();

        {
            let mut state = self.state();
            let queue = state
                .resources
                .get(&request.job_queue)
                .ok_or_else(|| ClientError::NotFound(request.job_queue.clone()))?;
            if !queue.is_usable() {
                return Err(ClientError::Service(format!(
                    "job queue `{queue}` is not valid and enabled",
                    queue = request.job_queue
                )));
            }

            if !state.resources.contains_key(&request.job_definition) {
                return Err(ClientError::NotFound(request.job_definition.clone()));
            }

            state.jobs.insert(
                remote_id.clone(),
                LocalJob {
                    name: request.job_name.clone(),
                    job_queue: request.job_queue.clone(),
                    status: RemoteJobStatus::Runnable,
                    reason: None,
                    task_ref: None,
                },
            );
        }

        debug!(job = request.job_name, remote_id, "accepted local job");
        tokio::spawn(self.clone().run_job(
            remote_id.clone(),
            request.job_definition.clone(),
            request.command.clone(),
        ));

        Ok(remote_id)
    }

    async fn list_jobs(
        &self,
        job_queue: &str,
        status: RemoteJobStatus,
    ) -> ClientResult<Vec<JobSummary>> {
        Ok(self
            .state()
            .jobs
            .iter()
            .filter(|(_, j)| j.job_queue == job_queue && j.status == status)
            .map(|(id, j)| JobSummary {
                remote_id: id.clone(),
                name: j.name.clone(),
            })
            .collect())
    }

    async fn describe_jobs(&self, remote_ids: &[String]) -> ClientResult<Vec<JobDetail>> {
        let state = self.state();
        Ok(remote_ids
            .iter()
            .filter_map(|id| {
                state.jobs.get(id).map(|j| JobDetail {
                    remote_id: id.clone(),
                    name: j.name.clone(),
                    status: j.status.to_string(),
                    status_reason: j.reason.clone(),
                    task_ref: j.task_ref.clone(),
                })
            })
            .collect())
    }

    async fn create_resource(
        &self,
        kind: ResourceKind,
        request: &CreateResourceRequest,
    ) -> ClientResult<String> {
        let mut state = self.state();

        if kind == ResourceKind::JobQueue {
            let environment = request.compute_environment.as_deref().ok_or_else(|| {
                ClientError::Service("a job queue requires a compute environment".to_string())
            })?;
            if !state
                .resources
                .get(environment)
                .is_some_and(LocalResource::is_usable)
            {
                return Err(ClientError::Service(format!(
                    "compute environment `{environment}` is not valid and enabled"
                )));
            }
        }

        let path = match kind {
            ResourceKind::ComputeEnvironment => "compute-environment",
            ResourceKind::JobQueue => "job-queue",
            ResourceKind::JobDefinition => "job-definition",
        };

        let mut handle = format!("{HANDLE_PREFIX}:{path}/{name}", name = request.name);
        if kind == ResourceKind::JobDefinition {
            let revision = state
                .resources
                .keys()
                .filter(|h| h.starts_with(&format!("{handle}:")))
                .count()
                + 1;
            handle = format!("{handle}:{revision}");
        } else if state
            .resources
            .get(&handle)
            .is_some_and(|r| r.status != ResourceStatus::Deleted)
        {
            return Err(ClientError::Service(format!(
                "{kind} `{name}` already exists",
                name = request.name
            )));
        }

        let mut resource = LocalResource {
            kind,
            status: ResourceStatus::Creating,
            target: None,
            remaining: 0,
            enabled: true,
            compute_environment: request.compute_environment.clone(),
        };
        resource.transition(
            ResourceStatus::Creating,
            ResourceStatus::Valid,
            self.settle_describes,
        );

        debug!(%kind, handle, "created local resource");
        state.resources.insert(handle.clone(), resource);
        Ok(handle)
    }

    async fn describe_resource(
        &self,
        kind: ResourceKind,
        handle: &str,
    ) -> ClientResult<Option<ResourceDetail>> {
        let mut state = self.state();
        let Some(resource) = state.resources.get_mut(handle) else {
            return Ok(None);
        };

        if resource.kind != kind {
            return Ok(None);
        }

        resource.tick();
        if resource.status == ResourceStatus::Deleted {
            state.resources.shift_remove(handle);
            return Ok(None);
        }

        Ok(Some(ResourceDetail {
            handle: handle.to_string(),
            status: resource.status.clone(),
            enabled: resource.enabled,
        }))
    }

    async fn disable_resource(&self, kind: ResourceKind, handle: &str) -> ClientResult<()> {
        let mut state = self.state();
        let resource = state
            .resources
            .get_mut(handle)
            .filter(|r| r.kind == kind)
            .ok_or_else(|| ClientError::NotFound(handle.to_string()))?;

        resource.enabled = false;
        resource.transition(
            ResourceStatus::Updating,
            ResourceStatus::Valid,
            self.settle_describes,
        );
        Ok(())
    }

    async fn delete_resource(&self, kind: ResourceKind, handle: &str) -> ClientResult<()> {
        let mut state = self.state();

        if kind == ResourceKind::ComputeEnvironment
            && state
                .resources
                .values()
                .any(|r| r.compute_environment.as_deref() == Some(handle))
        {
            return Err(ClientError::Service(format!(
                "compute environment `{handle}` still has a job queue"
            )));
        }

        if kind == ResourceKind::JobQueue
            && state.jobs.values().any(|j| {
                j.job_queue == handle
                    && matches!(
                        j.status,
                        RemoteJobStatus::Runnable | RemoteJobStatus::Running
                    )
            })
        {
            warn!(handle, "deleting a local job queue with unfinished jobs");
        }

        let resource = state
            .resources
            .get_mut(handle)
            .filter(|r| r.kind == kind)
            .ok_or_else(|| ClientError::NotFound(handle.to_string()))?;

        if resource.enabled {
            return Err(ClientError::Service(format!(
                "{kind} `{handle}` must be disabled before it is deleted"
            )));
        }

        resource.transition(
            ResourceStatus::Deleting,
            ResourceStatus::Deleted,
            self.settle_describes,
        );
        resource.compute_environment = None;
        Ok(())
    }

    async fn get_log_events(
        &self,
        log_group: &str,
        log_stream: &str,
        token: Option<&str>,
    ) -> ClientResult<LogEventsPage> {
        let start = match token {
            Some(token) => token
                .strip_prefix(TOKEN_PREFIX)
                .and_then(|i| i.parse::<usize>().ok())
                .ok_or_else(|| ClientError::Service(format!("invalid log token `{token}`")))?,
            None => 0,
        };

        let state = self.state();
        let events = state
            .logs
            .get(&(log_group.to_string(), log_stream.to_string()))
            .ok_or_else(|| ClientError::NotFound(format!("{log_group}/{log_stream}")))?;

        let start = start.min(events.len());
        let end = (start + self.page_size).min(events.len());
        Ok(LogEventsPage {
            events: events[start..end].to_vec(),
            next_token: Some(format!("{TOKEN_PREFIX}{end}")),
        })
    }

    async fn create_bucket(&self, name: &str) -> ClientResult<String> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(ClientError::Service(format!("invalid bucket name `{name}`")));
        }

        let dir = self.work_dir.join(name);
        {
            let mut state = self.state();
            if state.buckets.contains_key(name) {
                return Err(ClientError::Service(format!("bucket `{name}` already exists")));
            }
            state.buckets.insert(name.to_string(), dir.clone());
        }

        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            self.state().buckets.shift_remove(name);
            return Err(e.into());
        }

        debug!(bucket = name, "created local bucket");
        Ok(name.to_string())
    }

    async fn bucket_exists(&self, bucket: &str) -> ClientResult<bool> {
        Ok(self.state().buckets.contains_key(bucket))
    }

    async fn put_object(&self, bucket: &str, key: &str, path: &Path) -> ClientResult<()> {
        let dir = self.bucket_dir(bucket)?;
        let file_name = Path::new(key)
            .file_name()
            .filter(|n| *n == key)
            .ok_or_else(|| ClientError::Service(format!("invalid object key `{key}`")))?;

        tokio::fs::copy(path, dir.join(file_name))
            .await
            .with_context(|| format!("failed to upload `{path}`", path = path.display()))?;
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> ClientResult<()> {
        let dir = self.bucket_dir(bucket)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        self.state().buckets.shift_remove(bucket);
        debug!(bucket, "deleted local bucket");
        Ok(())
    }
}
