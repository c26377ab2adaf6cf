//! Retrieval of job logs.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::io::BufWriter;
use tracing::debug;
use tracing::warn;

use crate::EngineResult;
use crate::client::BatchClient;
use crate::config::MonitorConfig;

/// The marker preceding the name in a job definition handle.
const JOB_DEFINITION_MARKER: &str = "job-definition/";

/// Computes the name of the log stream of a job.
///
/// The stream is named `<definition>/default/<task>`, where `<definition>` is
/// the job definition name (without its `:revision` suffix) and `<task>` is
/// the last `/` segment of the task reference.
pub fn log_stream_name(job_definition: &str, task_ref: &str) -> String {
    let definition = job_definition
        .rsplit_once(JOB_DEFINITION_MARKER)
        .map(|(_, name)| name)
        .unwrap_or(job_definition);
    let definition = definition
        .split_once(':')
        .map(|(name, _)| name)
        .unwrap_or(definition);
    let task = task_ref.rsplit('/').next().unwrap_or(task_ref);
    format!("{definition}/default/{task}")
}

/// The result of retrieving a job's log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievedLog {
    /// The file the log was written to.
    pub path: PathBuf,
    /// The number of pages fetched.
    pub pages: usize,
    /// The number of events written.
    pub events: usize,
}

/// Fetches log streams page by page and writes them to `<local id>.out`.
#[derive(Debug, Clone)]
pub struct LogRetriever {
    /// The batch client.
    client: Arc<dyn BatchClient>,
    /// The log group streams are read from.
    log_group: String,
    /// The maximum number of pages fetched per stream.
    max_pages: usize,
    /// The directory log files are written to.
    output_dir: PathBuf,
}

impl LogRetriever {
    /// Constructs a retriever from the monitor configuration.
    pub fn new(client: Arc<dyn BatchClient>, config: &MonitorConfig) -> Self {
        Self {
            client,
            log_group: config.log_group.clone(),
            max_pages: config.max_log_pages,
            output_dir: config.output_dir.clone(),
        }
    }

    /// Gets the path of the log file for a job.
    pub fn log_path(&self, local_id: &str) -> PathBuf {
        self.output_dir.join(format!("{local_id}.out"))
    }

    /// Retrieves the given log stream into the job's log file.
    ///
    /// Pages are requested until the service hands back the token it was
    /// given, hands back no token at all, or the page limit is reached. Each event
    /// message becomes one line of the file.
    pub async fn retrieve(&self, local_id: &str, stream: &str) -> EngineResult<RetrievedLog> {
        let path = self.log_path(local_id);
        write_stream(self, stream, &path).await
    }
}

/// Writes every page of a stream to the given path.
async fn write_stream(
    retriever: &LogRetriever,
    stream: &str,
    path: &Path,
) -> EngineResult<RetrievedLog> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut writer = BufWriter::new(tokio::fs::File::create(path).await?);
    let mut token: Option<String> = None;
    let mut pages = 0;
    let mut events = 0;

    loop {
        let page = retriever
            .client
            .get_log_events(&retriever.log_group, stream, token.as_deref())
            .await?;
        pages += 1;

        for event in &page.events {
            writer.write_all(event.message.as_bytes()).await?;
            writer.write_all(b"\n").await?;
        }
        events += page.events.len();

        if page.next_token.is_none() || page.next_token == token {
            break;
        }

        if pages >= retriever.max_pages {
            warn!(
                stream,
                pages, "log stream has more pages than allowed; the log is truncated"
            );
            break;
        }

        token = page.next_token;
    }

    writer.flush().await?;
    debug!(stream, pages, events, path = %path.display(), "retrieved job log");

    Ok(RetrievedLog {
        path: path.to_path_buf(),
        pages,
        events,
    })
}
