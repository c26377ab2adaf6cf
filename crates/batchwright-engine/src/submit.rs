//! The submission pipeline.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::EngineError;
use crate::EngineResult;
use crate::client::BatchClient;
use crate::client::ClientError;
use crate::client::ClientResult;
use crate::client::SubmitJobRequest;
use crate::job::BatchJob;
use crate::job::JobRecord;
use crate::job::JobTable;
use crate::job::TRANSFER_INPUT_FILES;
use crate::job::is_valid_job_id;
use crate::pool::WorkerPool;

/// A submit call in flight.
#[derive(Debug)]
pub(crate) struct PendingSubmission {
    /// The local id of the job being submitted.
    pub(crate) local_id: String,
    /// The task performing the submit call.
    ///
    /// Resolves to `None` if the call was cancelled.
    pub(crate) task: JoinHandle<Option<ClientResult<String>>>,
}

/// The receiving end of the pipeline, owned by the monitor.
pub(crate) type SubmissionReceiver = mpsc::UnboundedReceiver<PendingSubmission>;

/// Accepts jobs and dispatches their submit calls to the worker pool.
///
/// Every dispatched call is handed to the monitor over a channel; closing
/// the pipeline drops the sending end, which is how the monitor learns that
/// no more jobs will arrive.
#[derive(Debug)]
pub struct SubmissionPipeline {
    /// The batch client.
    client: Arc<dyn BatchClient>,
    /// The job table.
    jobs: JobTable,
    /// The pool submit calls run on.
    pool: WorkerPool,
    /// The handle of the queue jobs are submitted to.
    job_queue: String,
    /// The handle of the job definition jobs are submitted with.
    job_definition: String,
    /// The bucket input files are uploaded to, if any.
    bucket: Option<String>,
    /// The sending end of the channel to the monitor.
    ///
    /// This is `None` once the pipeline is closed.
    sender: Mutex<Option<mpsc::UnboundedSender<PendingSubmission>>>,
}

impl SubmissionPipeline {
    /// Constructs a new pipeline along with the receiver the monitor drains.
    pub(crate) fn new(
        client: Arc<dyn BatchClient>,
        jobs: JobTable,
        pool: WorkerPool,
        job_queue: impl Into<String>,
        job_definition: impl Into<String>,
        bucket: Option<String>,
    ) -> (Self, SubmissionReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                client,
                jobs,
                pool,
                job_queue: job_queue.into(),
                job_definition: job_definition.into(),
                bucket,
                sender: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Submits a job without waiting for the remote call to complete.
    ///
    /// The job's input files are uploaded to the bucket on the worker pool
    /// before the submit call; a failed upload leaves the job unsubmitted.
    pub fn submit(&self, job: BatchJob) -> EngineResult<()> {
        if !is_valid_job_id(&job.id) {
            return Err(EngineError::InvalidJobId(job.id));
        }

        // Holding a clone of the sender keeps the channel open until the
        // submission is handed over, even if the pipeline is closed meanwhile.
        let sender = self
            .sender
            .lock()
            .expect("failed to lock submission sender")
            .clone()
            .ok_or_else(|| EngineError::SubmissionsClosed(job.id.clone()))?;

        let request = SubmitJobRequest::builder()
            .job_name(job.id.clone())
            .job_queue(self.job_queue.clone())
            .job_definition(self.job_definition.clone())
            .command(job.command.clone())
            .build();

        let uploads = self.uploads(&job)?;

        let local_id = job.id.clone();
        if !self
            .jobs
            .insert(JobRecord::new(job, &self.job_queue, &self.job_definition))
        {
            return Err(EngineError::DuplicateJob(local_id));
        }

        let client = self.client.clone();
        let task = self
            .pool
            .spawn(async move {
                if let Some((bucket, files)) = &uploads {
                    upload(client.as_ref(), bucket, files).await?;
                }
                client.submit_job(&request).await
            })
            .ok_or_else(|| EngineError::PoolClosed(local_id.clone()))?;

        debug!(job = local_id, "dispatched submit call");
        sender
            .send(PendingSubmission { local_id, task })
            .map_err(|e| {
                e.0.task.abort();
                EngineError::PoolClosed(e.0.local_id)
            })
    }

    /// Closes the pipeline; later submissions fail.
    ///
    /// Returns `false` if the pipeline was already closed.
    pub fn close(&self) -> bool {
        self.sender
            .lock()
            .expect("failed to lock submission sender")
            .take()
            .is_some()
    }

    /// Checks the input files of a job, returning the uploads to perform.
    ///
    /// Returns `None` if the job lists no input files.
    fn uploads(&self, job: &BatchJob) -> EngineResult<Option<(String, Vec<PathBuf>)>> {
        let files = job.command.input_files();
        if files.is_empty() {
            return Ok(None);
        }

        let transfer_error = |reason: String| EngineError::InputTransfer {
            job: job.id.clone(),
            reason,
        };

        let bucket = self.bucket.clone().ok_or_else(|| {
            transfer_error(format!("`{TRANSFER_INPUT_FILES}` is set but no bucket is configured"))
        })?;

        if let Some(missing) = files.iter().find(|f| !f.is_file()) {
            return Err(transfer_error(format!(
                "input file `{path}` does not exist",
                path = missing.display()
            )));
        }

        Ok(Some((bucket, files)))
    }
}

/// Uploads files to a bucket, keyed by their file names.
async fn upload(client: &dyn BatchClient, bucket: &str, files: &[PathBuf]) -> ClientResult<()> {
    for file in files {
        let key = file.file_name().and_then(|n| n.to_str()).ok_or_else(|| {
            ClientError::Service(format!("cannot upload `{path}`", path = file.display()))
        })?;
        client.put_object(bucket, key, file).await?;
        debug!(bucket, key, "uploaded input file");
    }

    Ok(())
}
