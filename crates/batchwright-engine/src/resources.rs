//! Provisioning and teardown of the resources jobs run on.
//!
//! The batch service is eventually consistent: a create or disable request
//! returning successfully says nothing about when the resource is usable (or
//! gone). Every mutation is therefore followed by a converge poll that
//! describes the resource until it reaches the expected status.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio_retry2::Retry;
use tokio_retry2::RetryError;
use tokio_retry2::strategy::ExponentialFactorBackoff;
use tokio_retry2::strategy::FixedInterval;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::EngineError;
use crate::EngineResult;
use crate::client::BatchClient;
use crate::client::ClientError;
use crate::client::CreateResourceRequest;
use crate::client::ResourceDetail;
use crate::client::ResourceKind;
use crate::client::ResourceStatus;
use crate::config::BucketSource;
use crate::config::Config;
use crate::config::ConfigError;
use crate::config::ConvergeConfig;
use crate::config::ResourceSource;
use crate::config::ResourcesConfig;

/// The suffix of a created bucket's name.
const BUCKET_SUFFIX: &str = "-bucket";

/// A resource used by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedResource {
    /// The kind of the resource.
    pub kind: ResourceKind,
    /// The handle of the resource.
    pub handle: String,
    /// Whether the engine created the resource and must delete it on exit.
    pub delete_on_exit: bool,
}

/// The resources used by an engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedResources {
    /// The job definition jobs are submitted with.
    pub job_definition: ProvisionedResource,
    /// The compute environment jobs run in.
    pub compute_environment: ProvisionedResource,
    /// The job queue jobs are submitted to.
    pub job_queue: ProvisionedResource,
    /// The bucket job input files are uploaded to, if any.
    pub bucket: Option<ProvisionedBucket>,
}

/// A storage bucket job input files are uploaded to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedBucket {
    /// The name of the bucket.
    pub name: String,
    /// Whether the engine created the bucket and must delete it on exit.
    pub delete_on_exit: bool,
}

/// The outcome of tearing down one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    /// The resource was not created by the engine and was left alone.
    Kept,
    /// The resource was deleted.
    Deleted,
    /// The resource could not be disabled or deleted.
    Failed,
}

/// Creates, validates, disables and deletes the engine's resources.
#[derive(Debug, Clone)]
pub struct ResourceController {
    /// The batch client.
    client: Arc<dyn BatchClient>,
    /// The prefix of created resource names.
    prefix: String,
    /// Which resources to create or reuse.
    resources: ResourcesConfig,
    /// Converge poll settings.
    converge: ConvergeConfig,
}

impl ResourceController {
    /// Constructs a controller for the given configuration.
    pub fn new(client: Arc<dyn BatchClient>, config: &Config) -> Self {
        Self {
            client,
            prefix: config.prefix.clone(),
            resources: config.resources.clone(),
            converge: config.converge.clone(),
        }
    }

    /// Provisions the job definition, compute environment and job queue, in
    /// that order, followed by the input bucket if one is configured.
    ///
    /// Each resource is usable once this returns; a resource that does not
    /// converge within the attempt budget is a fatal error.
    pub async fn create_all(&self) -> EngineResult<ProvisionedResources> {
        let job_definition = self
            .provision(
                ResourceKind::JobDefinition,
                self.resources.job_definition.as_deref(),
                None,
            )
            .await?;

        let compute_environment = self
            .provision(
                ResourceKind::ComputeEnvironment,
                self.resources.compute_environment.as_deref(),
                None,
            )
            .await?;

        let job_queue = self
            .provision(
                ResourceKind::JobQueue,
                self.resources.job_queue.as_deref(),
                Some(&compute_environment.handle),
            )
            .await?;

        let bucket = self.provision_bucket().await?;

        Ok(ProvisionedResources {
            job_definition,
            compute_environment,
            job_queue,
            bucket,
        })
    }

    /// Tears down the resources the engine created: the job queue, then the
    /// compute environment, then the job definition and finally the bucket.
    ///
    /// The compute environment is left in place if its queue could not be
    /// deleted. Returns `true` if nothing was left behind.
    pub async fn delete_all(&self, resources: &ProvisionedResources) -> bool {
        let queue = self.delete(&resources.job_queue).await;

        let environment = if queue == Teardown::Failed {
            if resources.compute_environment.delete_on_exit {
                warn!(
                    handle = resources.compute_environment.handle,
                    "not deleting compute environment because its job queue was not deleted"
                );
                Teardown::Failed
            } else {
                Teardown::Kept
            }
        } else {
            self.delete(&resources.compute_environment).await
        };

        let definition = self.delete(&resources.job_definition).await;

        let bucket = match &resources.bucket {
            Some(bucket) => self.delete_bucket(bucket).await,
            None => Teardown::Kept,
        };

        [queue, environment, definition, bucket]
            .iter()
            .all(|t| *t != Teardown::Failed)
    }

    /// Obtains the input bucket, if one is configured.
    async fn provision_bucket(&self) -> EngineResult<Option<ProvisionedBucket>> {
        match BucketSource::parse(self.resources.bucket.as_deref()) {
            None => Ok(None),
            Some(BucketSource::Existing(name)) => {
                if !self.client.bucket_exists(&name).await? {
                    return Err(ClientError::NotFound(name).into());
                }

                info!(bucket = name, "using existing bucket");
                Ok(Some(ProvisionedBucket {
                    name,
                    delete_on_exit: false,
                }))
            }
            Some(BucketSource::Create) => {
                let name = self
                    .client
                    .create_bucket(&format!("{prefix}{BUCKET_SUFFIX}", prefix = self.prefix))
                    .await?;
                info!(bucket = name, "created bucket");
                Ok(Some(ProvisionedBucket {
                    name,
                    delete_on_exit: true,
                }))
            }
        }
    }

    /// Empties and deletes the bucket if the engine created it.
    async fn delete_bucket(&self, bucket: &ProvisionedBucket) -> Teardown {
        if !bucket.delete_on_exit {
            debug!(bucket = bucket.name, "keeping bucket that was not created by the engine");
            return Teardown::Kept;
        }

        match self.client.delete_bucket(&bucket.name).await {
            Ok(()) => {
                info!(bucket = bucket.name, "deleted bucket");
                Teardown::Deleted
            }
            Err(e) => {
                warn!(bucket = bucket.name, error = %e, "failed to delete bucket");
                Teardown::Failed
            }
        }
    }

    /// Obtains a single resource and waits for it to become valid.
    async fn provision(
        &self,
        kind: ResourceKind,
        value: Option<&str>,
        compute_environment: Option<&str>,
    ) -> EngineResult<ProvisionedResource> {
        let (handle, delete_on_exit) = match ResourceSource::parse(value) {
            ResourceSource::Existing(handle) => {
                info!(%kind, handle, "using existing resource");
                (handle, false)
            }
            ResourceSource::Create(path) => {
                let spec = match path {
                    Some(path) => Some(read_spec(&path).await?),
                    None => None,
                };

                let request = CreateResourceRequest::builder()
                    .name(format!("{prefix}{suffix}", prefix = self.prefix, suffix = kind.name_suffix()))
                    .maybe_spec(spec)
                    .maybe_compute_environment(compute_environment)
                    .build();

                let handle = self.client.create_resource(kind, &request).await?;
                info!(%kind, name = request.name, handle, "created resource");
                (handle, true)
            }
        };

        self.wait_until_valid(kind, &handle).await?;
        Ok(ProvisionedResource {
            kind,
            handle,
            delete_on_exit,
        })
    }

    /// Polls a resource until it is valid.
    ///
    /// `Creating`, `Updating` and a missing resource are retried at a fixed
    /// interval until the attempt budget is spent; any other status fails
    /// immediately.
    async fn wait_until_valid(&self, kind: ResourceKind, handle: &str) -> EngineResult<()> {
        let attempts = self.converge.create_attempts;
        let strategy = FixedInterval::new(self.converge.interval()).take(attempts.saturating_sub(1));

        Retry::spawn_notify(
            strategy,
            || async move {
                let not_ready = || EngineError::ResourceNotReady {
                    kind,
                    handle: handle.to_string(),
                    attempts,
                };

                match self.client.describe_resource(kind, handle).await {
                    Ok(Some(ResourceDetail {
                        status: ResourceStatus::Valid,
                        ..
                    })) => Ok(()),
                    Ok(Some(ResourceDetail {
                        status: ResourceStatus::Creating | ResourceStatus::Updating,
                        ..
                    }))
                    | Ok(None) => Err(RetryError::transient(not_ready())),
                    Ok(Some(detail)) => Err(RetryError::permanent(EngineError::ResourceFailed {
                        kind,
                        handle: handle.to_string(),
                        status: detail.status.to_string(),
                    })),
                    Err(e) => Err(RetryError::transient(EngineError::Client(e))),
                }
            },
            {
                let handle = handle.to_string();
                move |e: &EngineError, _: Duration| {
                    debug!(%kind, handle, error = %e, "resource is not valid yet");
                }
            },
        )
        .await?;

        info!(%kind, handle, "resource is valid");
        Ok(())
    }

    /// Disables and deletes a single resource if the engine created it.
    async fn delete(&self, resource: &ProvisionedResource) -> Teardown {
        let ProvisionedResource {
            kind,
            handle,
            delete_on_exit,
        } = resource;

        if !delete_on_exit {
            debug!(%kind, handle, "keeping resource that was not created by the engine");
            return Teardown::Kept;
        }

        if let Err(e) = self.disable(*kind, handle).await {
            warn!(%kind, handle, error = %e, "failed to disable resource; it will not be deleted");
            return Teardown::Failed;
        }

        if let Err(e) = self.client.delete_resource(*kind, handle).await {
            warn!(%kind, handle, error = %e, "failed to delete resource");
            return Teardown::Failed;
        }

        if let Err(e) = self.wait_until_deleted(*kind, handle).await {
            warn!(%kind, handle, error = %e, "failed to confirm resource deletion");
            return Teardown::Failed;
        }

        info!(%kind, handle, "deleted resource");
        Teardown::Deleted
    }

    /// Disables a resource and waits for the change to settle.
    ///
    /// Fails unless the resource is reported disabled (or gone) afterwards.
    async fn disable(&self, kind: ResourceKind, handle: &str) -> anyhow::Result<()> {
        self.client.disable_resource(kind, handle).await?;

        let strategy = FixedInterval::new(self.converge.interval())
            .take(self.converge.disable_attempts.saturating_sub(1));

        let detail = Retry::spawn(strategy, || async move {
            match self.client.describe_resource(kind, handle).await {
                Ok(Some(ResourceDetail {
                    status: ResourceStatus::Updating,
                    ..
                })) => Err(RetryError::transient(anyhow!(
                    "{kind} `{handle}` is still updating"
                ))),
                Ok(detail) => Ok(detail),
                Err(e) => Err(RetryError::transient(anyhow::Error::from(e))),
            }
        })
        .await?;

        match detail {
            None => Ok(()),
            Some(detail) if !detail.enabled || detail.status == ResourceStatus::Disabled => Ok(()),
            Some(detail) => Err(anyhow!(
                "{kind} `{handle}` is not disabled (status `{status}`)",
                status = detail.status
            )),
        }
    }

    /// Polls a resource until it is deleted or no longer known.
    ///
    /// The poll is unbounded; its interval doubles up to the configured
    /// ceiling.
    async fn wait_until_deleted(&self, kind: ResourceKind, handle: &str) -> anyhow::Result<()> {
        let strategy = deletion_backoff(&self.converge);

        Retry::spawn_notify(
            strategy,
            || async move {
                match self.client.describe_resource(kind, handle).await {
                    Ok(None)
                    | Ok(Some(ResourceDetail {
                        status: ResourceStatus::Deleted,
                        ..
                    })) => Ok(()),
                    Ok(Some(detail)) => Err(RetryError::transient(anyhow!(
                        "{kind} `{handle}` is {status}",
                        status = detail.status
                    ))),
                    Err(e) => Err(RetryError::transient(anyhow::Error::from(e))),
                }
            },
            {
                let handle = handle.to_string();
                move |e: &anyhow::Error, next: Duration| {
                    debug!(%kind, handle, error = %e, next = ?next, "resource is not deleted yet");
                }
            },
        )
        .await
    }
}

/// The interval strategy of the deletion poll.
///
/// Intervals start at the configured initial interval and double up to the
/// configured ceiling; an initial interval above the ceiling is clamped.
fn deletion_backoff(converge: &ConvergeConfig) -> ExponentialFactorBackoff {
    let initial = u64::try_from(converge.delete_initial_interval().as_millis()).unwrap_or(u64::MAX);
    ExponentialFactorBackoff::from_millis(initial, 2.0).max_delay(converge.delete_max_interval())
}

/// Reads a JSON resource spec file.
async fn read_spec(path: &Path) -> EngineResult<serde_json::Value> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ConfigError::ResourceSpec {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    serde_json::from_str(&text).map_err(|e| {
        ConfigError::ResourceSpec {
            path: path.to_path_buf(),
            message: e.to_string(),
        }
        .into()
    })
}
