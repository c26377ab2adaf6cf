//! The capability set consumed from a remote batch compute service.
//!
//! The engine never speaks a wire protocol directly; every remote interaction
//! goes through an implementation of [`BatchClient`]. Implementations are
//! expected to apply their own request timeouts.

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::job::JobCommand;

/// Errors returned by a [`BatchClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// The service rejected the request.
    #[error("the batch service rejected the request: {0}")]
    Service(String),

    /// The referenced entity does not exist.
    #[error("`{0}` was not found")]
    NotFound(String),

    /// The request did not complete in time.
    #[error("the request to the batch service timed out")]
    Timeout,

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Any other error.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type for client operations.
pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// The statuses a remote job moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteJobStatus {
    /// The job was accepted but not yet evaluated for scheduling.
    Submitted,
    /// The job is waiting on dependencies.
    Pending,
    /// The job may be placed on a compute resource.
    Runnable,
    /// The job has been placed and is starting.
    Starting,
    /// The job is running.
    Running,
    /// The job exited successfully.
    Succeeded,
    /// The job failed.
    Failed,
}

impl RemoteJobStatus {
    /// Gets the wire representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "SUBMITTED",
            Self::Pending => "PENDING",
            Self::Runnable => "RUNNABLE",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }

    /// Determines if the status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for RemoteJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to submit a job.
#[derive(Debug, Clone, bon::Builder)]
pub struct SubmitJobRequest {
    /// The name of the job; this is the engine's local id.
    #[builder(into)]
    pub job_name: String,
    /// The handle of the queue to submit to.
    #[builder(into)]
    pub job_queue: String,
    /// The handle of the job definition to use.
    #[builder(into)]
    pub job_definition: String,
    /// The submission payload.
    pub command: JobCommand,
}

/// A job as returned by a list call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSummary {
    /// The remote id of the job.
    pub remote_id: String,
    /// The name the job was submitted with.
    pub name: String,
}

/// A job as returned by a describe call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDetail {
    /// The remote id of the job.
    pub remote_id: String,
    /// The name the job was submitted with.
    pub name: String,
    /// The raw status reported by the service.
    pub status: String,
    /// The reason given for the status, if any.
    pub status_reason: Option<String>,
    /// A reference to the task (container) that ran the job, if it started.
    pub task_ref: Option<String>,
}

/// The kinds of resources provisioned for an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// The pool of execution capacity jobs are scheduled onto.
    ComputeEnvironment,
    /// The admission queue bound to a compute environment.
    JobQueue,
    /// The template describing how a job runs.
    JobDefinition,
}

impl ResourceKind {
    /// Gets the suffix appended to the engine prefix to name a created
    /// resource of this kind.
    pub fn name_suffix(&self) -> &'static str {
        match self {
            Self::ComputeEnvironment => "-compute-env",
            Self::JobQueue => "-job-queue",
            Self::JobDefinition => "-job-definition",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ComputeEnvironment => write!(f, "compute environment"),
            Self::JobQueue => write!(f, "job queue"),
            Self::JobDefinition => write!(f, "job definition"),
        }
    }
}

/// The provisioning status of a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceStatus {
    /// The resource is being created.
    Creating,
    /// The resource is usable.
    Valid,
    /// The resource is being updated.
    Updating,
    /// The resource has been disabled.
    Disabled,
    /// The resource is being deleted.
    Deleting,
    /// The resource has been deleted.
    Deleted,
    /// The resource could not be provisioned.
    Invalid,
    /// A status the engine does not know about.
    Other(String),
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Creating => write!(f, "CREATING"),
            Self::Valid => write!(f, "VALID"),
            Self::Updating => write!(f, "UPDATING"),
            Self::Disabled => write!(f, "DISABLED"),
            Self::Deleting => write!(f, "DELETING"),
            Self::Deleted => write!(f, "DELETED"),
            Self::Invalid => write!(f, "INVALID"),
            Self::Other(s) => write!(f, "{s}"),
        }
    }
}

/// A resource as returned by a describe call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDetail {
    /// The handle of the resource.
    pub handle: String,
    /// The provisioning status.
    pub status: ResourceStatus,
    /// Whether the resource accepts work.
    pub enabled: bool,
}

/// A request to create a resource.
#[derive(Debug, Clone, bon::Builder)]
pub struct CreateResourceRequest {
    /// The name of the resource.
    #[builder(into)]
    pub name: String,
    /// The service-specific description of the resource, if any.
    pub spec: Option<serde_json::Value>,
    /// The compute environment a job queue binds to.
    #[builder(into)]
    pub compute_environment: Option<String>,
}

/// A single log event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    /// The time of the event, in milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// The message of the event.
    pub message: String,
}

/// A page of log events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogEventsPage {
    /// The events in the page.
    pub events: Vec<LogEvent>,
    /// The token to request the next page with.
    pub next_token: Option<String>,
}

/// A client of a remote batch compute service.
#[async_trait]
pub trait BatchClient: Send + Sync + fmt::Debug {
    /// Submits a job, returning its remote id.
    async fn submit_job(&self, request: &SubmitJobRequest) -> ClientResult<String>;

    /// Lists the jobs on a queue with the given status.
    async fn list_jobs(
        &self,
        job_queue: &str,
        status: RemoteJobStatus,
    ) -> ClientResult<Vec<JobSummary>>;

    /// Describes the given jobs.
    ///
    /// Unknown ids are omitted from the result.
    async fn describe_jobs(&self, remote_ids: &[String]) -> ClientResult<Vec<JobDetail>>;

    /// Creates a resource, returning its handle.
    async fn create_resource(
        &self,
        kind: ResourceKind,
        request: &CreateResourceRequest,
    ) -> ClientResult<String>;

    /// Describes a resource.
    ///
    /// Returns `None` if the service no longer knows the resource.
    async fn describe_resource(
        &self,
        kind: ResourceKind,
        handle: &str,
    ) -> ClientResult<Option<ResourceDetail>>;

    /// Requests that a resource stop accepting work.
    async fn disable_resource(&self, kind: ResourceKind, handle: &str) -> ClientResult<()>;

    /// Requests deletion of a resource.
    async fn delete_resource(&self, kind: ResourceKind, handle: &str) -> ClientResult<()>;

    /// Gets a page of events from a log stream.
    async fn get_log_events(
        &self,
        log_group: &str,
        log_stream: &str,
        token: Option<&str>,
    ) -> ClientResult<LogEventsPage>;

    /// Creates a storage bucket, returning its name.
    async fn create_bucket(&self, name: &str) -> ClientResult<String>;

    /// Returns whether a storage bucket exists.
    async fn bucket_exists(&self, bucket: &str) -> ClientResult<bool>;

    /// Uploads a local file to a bucket under the given key.
    async fn put_object(&self, bucket: &str, key: &str, path: &Path) -> ClientResult<()>;

    /// Deletes every object in a bucket and then the bucket itself.
    async fn delete_bucket(&self, bucket: &str) -> ClientResult<()>;
}
