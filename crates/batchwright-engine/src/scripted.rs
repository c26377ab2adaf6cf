//! An in-memory batch client whose responses are scripted by tests.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use indexmap::IndexMap;

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

/// Builds a log page from messages.
pub(crate) fn page(messages: &[&str], next_token: Option<&str>) -> LogEventsPage {
    LogEventsPage {
        events: messages
            .iter()
            .enumerate()
            .map(|(i, m)| LogEvent {
                timestamp: i as i64,
                message: m.to_string(),
            })
            .collect(),
        next_token: next_token.map(str::to_string),
    }
}

/// A resource created through the scripted client.
#[derive(Debug)]
struct Resource {
    /// The kind of the resource.
    kind: ResourceKind,
    /// The name the resource was created with.
    name: String,
    /// The spec the resource was created with.
    spec: Option<serde_json::Value>,
    /// The compute environment a queue was bound to.
    compute_environment: Option<String>,
    /// Whether the resource accepts work.
    enabled: bool,
    /// Whether the resource was deleted.
    deleted: bool,
}

/// A job submitted through the scripted client.
#[derive(Debug)]
struct Job {
    /// The job name.
    name: String,
    /// The current remote status.
    status: String,
}

/// The mutable state of the scripted client.
#[derive(Debug, Default)]
struct State {
    /// Created resources, keyed by handle.
    resources: IndexMap<String, Resource>,
    /// Scripted describe results per resource kind; the last one sticks.
    resource_scripts: HashMap<ResourceKind, VecDeque<ResourceStatus>>,
    /// The number of describe calls per resource kind.
    describes: HashMap<ResourceKind, usize>,
    /// Handles whose disable call fails.
    failing_disables: HashSet<String>,
    /// Deleted handles, in order.
    deleted: Vec<String>,
    /// Submitted jobs, keyed by remote id.
    jobs: IndexMap<String, Job>,
    /// Every submit request, in order.
    submitted: Vec<SubmitJobRequest>,
    /// The status a job takes on submission, keyed by job name.
    planned: HashMap<String, String>,
    /// Job names whose submission fails.
    failing_submits: HashSet<String>,
    /// Explicit list results, overriding the submitted jobs.
    listed: HashMap<RemoteJobStatus, Vec<JobSummary>>,
    /// The number of upcoming list calls that fail.
    failing_lists: usize,
    /// Scripted log pages per stream.
    logs: HashMap<String, VecDeque<LogEventsPage>>,
    /// The tokens log pages were requested with, per stream.
    log_tokens: HashMap<String, Vec<Option<String>>>,
    /// The object keys of each bucket, in upload order.
    buckets: IndexMap<String, Vec<String>>,
    /// Object keys whose upload fails.
    failing_uploads: HashSet<String>,
}

/// A batch client for tests.
///
/// Resources converge to `VALID` immediately unless a script says otherwise,
/// and submitted jobs stay `SUBMITTED` unless planned or updated.
#[derive(Debug, Default)]
pub(crate) struct ScriptedClient {
    /// The client state.
    state: Mutex<State>,
}

impl ScriptedClient {
    /// Locks the state.
    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("failed to lock scripted state")
    }

    /// Scripts the statuses reported for resources of a kind.
    pub(crate) fn script_resource(
        &self,
        kind: ResourceKind,
        statuses: impl IntoIterator<Item = ResourceStatus>,
    ) {
        self.state()
            .resource_scripts
            .insert(kind, statuses.into_iter().collect());
    }

    /// Makes disabling the given resource fail.
    pub(crate) fn fail_disable(&self, handle: &str) {
        self.state().failing_disables.insert(handle.to_string());
    }

    /// Gets the kinds and names of created resources, in order.
    pub(crate) fn created(&self) -> Vec<(ResourceKind, String)> {
        self.state()
            .resources
            .values()
            .map(|r| (r.kind, r.name.clone()))
            .collect()
    }

    /// Gets the compute environment the named queue was bound to.
    pub(crate) fn queue_environment(&self, name: &str) -> Option<String> {
        self.state()
            .resources
            .values()
            .find(|r| r.name == name)
            .and_then(|r| r.compute_environment.clone())
    }

    /// Gets the spec the named resource was created with.
    pub(crate) fn spec(&self, name: &str) -> Option<serde_json::Value> {
        self.state()
            .resources
            .values()
            .find(|r| r.name == name)
            .and_then(|r| r.spec.clone())
    }

    /// Gets the number of describe calls made for a resource kind.
    pub(crate) fn describe_count(&self, kind: ResourceKind) -> usize {
        self.state().describes.get(&kind).copied().unwrap_or(0)
    }

    /// Gets the deleted resource handles and bucket names, in order.
    pub(crate) fn deleted(&self) -> Vec<String> {
        self.state().deleted.clone()
    }

    /// Sets the status a job takes as soon as it is submitted.
    pub(crate) fn plan(&self, name: &str, status: RemoteJobStatus) {
        self.state()
            .planned
            .insert(name.to_string(), status.as_str().to_string());
    }

    /// Makes submitting the named job fail.
    pub(crate) fn fail_submit(&self, name: &str) {
        self.state().failing_submits.insert(name.to_string());
    }

    /// Gets every submit request, in order.
    pub(crate) fn submitted(&self) -> Vec<SubmitJobRequest> {
        self.state().submitted.clone()
    }

    /// Overrides the result of listing jobs with a status.
    pub(crate) fn set_listed(&self, status: RemoteJobStatus, jobs: Vec<JobSummary>) {
        self.state().listed.insert(status, jobs);
    }

    /// Makes the next `count` list calls fail.
    pub(crate) fn fail_lists(&self, count: usize) {
        self.state().failing_lists = count;
    }

    /// Sets the status reported for a remote job.
    pub(crate) fn set_detail_status(&self, remote_id: &str, status: &str) {
        let mut state = self.state();
        let job = state.jobs.entry(remote_id.to_string()).or_insert(Job {
            name: remote_id.to_string(),
            status: String::new(),
        });
        job.status = status.to_string();
    }

    /// Scripts the pages of a log stream.
    pub(crate) fn script_log(&self, stream: &str, pages: impl IntoIterator<Item = LogEventsPage>) {
        self.state()
            .logs
            .insert(stream.to_string(), pages.into_iter().collect());
    }

    /// Adds a bucket that exists independently of the engine.
    pub(crate) fn add_bucket(&self, name: &str) {
        self.state().buckets.insert(name.to_string(), Vec::new());
    }

    /// Gets the object keys of a bucket, or `None` if it does not exist.
    pub(crate) fn bucket_objects(&self, name: &str) -> Option<Vec<String>> {
        self.state().buckets.get(name).cloned()
    }

    /// Makes uploading an object with the given key fail.
    pub(crate) fn fail_upload(&self, key: &str) {
        self.state().failing_uploads.insert(key.to_string());
    }

    /// Gets the tokens a log stream was requested with, in order.
    pub(crate) fn log_tokens(&self, stream: &str) -> Vec<Option<String>> {
        self.state()
            .log_tokens
            .get(stream)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl BatchClient for ScriptedClient {
    async fn submit_job(&self, request: &SubmitJobRequest) -> ClientResult<String> {
        let mut state = self.state();
        state.submitted.push(request.clone());
        if state.failing_submits.contains(&request.job_name) {
            return Err(ClientError::Service(format!(
                "cannot submit `{name}`",
                name = request.job_name
            )));
        }

        let remote_id = format!("remote-{name}", name = request.job_name);
        let status = state
            .planned
            .get(&request.job_name)
            .cloned()
            .unwrap_or_else(|| RemoteJobStatus::Submitted.as_str().to_string());
        state.jobs.insert(
            remote_id.clone(),
            Job {
                name: request.job_name.clone(),
                status,
            },
        );
        Ok(remote_id)
    }

    async fn list_jobs(
        &self,
        _job_queue: &str,
        status: RemoteJobStatus,
    ) -> ClientResult<Vec<JobSummary>> {
        let mut state = self.state();
        if state.failing_lists > 0 {
            state.failing_lists -= 1;
            return Err(ClientError::Timeout);
        }

        if let Some(listed) = state.listed.get(&status) {
            return Ok(listed.clone());
        }

        Ok(state
            .jobs
            .iter()
            .filter(|(_, j)| j.status == status.as_str())
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
                    status: j.status.clone(),
                    status_reason: None,
                    task_ref: Some(format!("arn:scripted:ecs:task/{id}")),
                })
            })
            .collect())
    }

    async fn create_resource(
        &self,
        kind: ResourceKind,
        request: &CreateResourceRequest,
    ) -> ClientResult<String> {
        let tag = match kind {
            ResourceKind::ComputeEnvironment => "compute-environment",
            ResourceKind::JobQueue => "job-queue",
            ResourceKind::JobDefinition => "job-definition",
        };
        let handle = format!("arn:scripted:batch:{tag}/{name}:1", name = request.name);
        self.state().resources.insert(
            handle.clone(),
            Resource {
                kind,
                name: request.name.clone(),
                spec: request.spec.clone(),
                compute_environment: request.compute_environment.clone(),
                enabled: true,
                deleted: false,
            },
        );
        Ok(handle)
    }

    async fn describe_resource(
        &self,
        kind: ResourceKind,
        handle: &str,
    ) -> ClientResult<Option<ResourceDetail>> {
        let mut state = self.state();
        *state.describes.entry(kind).or_default() += 1;

        let enabled = state.resources.get(handle).map(|r| r.enabled).unwrap_or(true);
        let scripted = state.resource_scripts.get_mut(&kind).and_then(|script| {
            if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            }
        });

        if let Some(status) = scripted {
            let enabled = enabled
                && !matches!(
                    status,
                    ResourceStatus::Disabled | ResourceStatus::Deleting | ResourceStatus::Deleted
                );
            return Ok(Some(ResourceDetail {
                handle: handle.to_string(),
                status,
                enabled,
            }));
        }

        match state.resources.get(handle) {
            Some(r) if r.deleted => Ok(None),
            _ => Ok(Some(ResourceDetail {
                handle: handle.to_string(),
                status: ResourceStatus::Valid,
                enabled,
            })),
        }
    }

    async fn disable_resource(&self, _kind: ResourceKind, handle: &str) -> ClientResult<()> {
        let mut state = self.state();
        if state.failing_disables.contains(handle) {
            return Err(ClientError::Service(format!("cannot disable `{handle}`")));
        }

        match state.resources.get_mut(handle) {
            Some(r) => {
                r.enabled = false;
                Ok(())
            }
            None => Err(ClientError::NotFound(handle.to_string())),
        }
    }

    async fn delete_resource(&self, _kind: ResourceKind, handle: &str) -> ClientResult<()> {
        let mut state = self.state();
        match state.resources.get_mut(handle) {
            Some(r) => r.deleted = true,
            None => return Err(ClientError::NotFound(handle.to_string())),
        }

        state.deleted.push(handle.to_string());
        Ok(())
    }

    async fn get_log_events(
        &self,
        _log_group: &str,
        log_stream: &str,
        token: Option<&str>,
    ) -> ClientResult<LogEventsPage> {
        let mut state = self.state();
        state
            .log_tokens
            .entry(log_stream.to_string())
            .or_default()
            .push(token.map(str::to_string));

        Ok(state
            .logs
            .get_mut(log_stream)
            .and_then(VecDeque::pop_front)
            .unwrap_or_default())
    }

    async fn create_bucket(&self, name: &str) -> ClientResult<String> {
        let mut state = self.state();
        if state.buckets.contains_key(name) {
            return Err(ClientError::Service(format!("bucket `{name}` already exists")));
        }

        state.buckets.insert(name.to_string(), Vec::new());
        Ok(name.to_string())
    }

    async fn bucket_exists(&self, bucket: &str) -> ClientResult<bool> {
        Ok(self.state().buckets.contains_key(bucket))
    }

    async fn put_object(&self, bucket: &str, key: &str, path: &Path) -> ClientResult<()> {
        if !path.is_file() {
            return Err(ClientError::NotFound(path.display().to_string()));
        }

        let mut state = self.state();
        if state.failing_uploads.contains(key) {
            return Err(ClientError::Service(format!("cannot upload `{key}`")));
        }

        match state.buckets.get_mut(bucket) {
            Some(objects) => {
                objects.push(key.to_string());
                Ok(())
            }
            None => Err(ClientError::NotFound(bucket.to_string())),
        }
    }

    async fn delete_bucket(&self, bucket: &str) -> ClientResult<()> {
        let mut state = self.state();
        if state.buckets.shift_remove(bucket).is_none() {
            return Err(ClientError::NotFound(bucket.to_string()));
        }

        state.deleted.push(bucket.to_string());
        Ok(())
    }
}
