//! The job state journal.

use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::SecondsFormat;
use chrono::Utc;
use tokio::io::AsyncWriteExt;

use crate::job::JobState;

/// A single journaled state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    /// When the transition was observed.
    pub timestamp: DateTime<Utc>,
    /// The local id of the job.
    pub local_id: String,
    /// The remote id of the job.
    pub remote_id: String,
    /// The state the job moved to.
    pub state: JobState,
}

impl fmt::Display for JournalEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{timestamp} {local} {remote} {state}",
            timestamp = self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            local = self.local_id,
            remote = self.remote_id,
            state = self.state,
        )
    }
}

/// A sink for job state transitions.
///
/// Only the monitor writes to the journal, so the entries of a job appear in
/// the order its transitions were observed.
#[async_trait]
pub trait StateJournal: Send + Sync + fmt::Debug {
    /// Records that a job moved to the given state.
    async fn record(&self, local_id: &str, remote_id: &str, state: &JobState)
    -> std::io::Result<()>;
}

/// A journal appending one line per transition to a file.
#[derive(Debug)]
pub struct FileJournal {
    /// The path of the journal file.
    path: PathBuf,
    /// The open journal file.
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl FileJournal {
    /// Opens (or creates) the journal file at the given path for appending.
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        Ok(Self {
            path: path.to_path_buf(),
            file: tokio::sync::Mutex::new(file),
        })
    }

    /// Gets the path of the journal file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StateJournal for FileJournal {
    async fn record(
        &self,
        local_id: &str,
        remote_id: &str,
        state: &JobState,
    ) -> std::io::Result<()> {
        let entry = JournalEntry {
            timestamp: Utc::now(),
            local_id: local_id.to_string(),
            remote_id: remote_id.to_string(),
            state: state.clone(),
        };

        let mut file = self.file.lock().await;
        file.write_all(format!("{entry}\n").as_bytes()).await?;
        file.flush().await
    }
}

/// A journal keeping its entries in memory.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    /// The recorded entries.
    entries: Mutex<Vec<JournalEntry>>,
}

impl MemoryJournal {
    /// Constructs an empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets a copy of the recorded entries.
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries
            .lock()
            .expect("failed to lock journal entries")
            .clone()
    }

    /// Gets the states recorded for a job, in order.
    pub fn states(&self, local_id: &str) -> Vec<JobState> {
        self.entries
            .lock()
            .expect("failed to lock journal entries")
            .iter()
            .filter(|e| e.local_id == local_id)
            .map(|e| e.state.clone())
            .collect()
    }
}

#[async_trait]
impl StateJournal for MemoryJournal {
    async fn record(
        &self,
        local_id: &str,
        remote_id: &str,
        state: &JobState,
    ) -> std::io::Result<()> {
        self.entries
            .lock()
            .expect("failed to lock journal entries")
            .push(JournalEntry {
                timestamp: Utc::now(),
                local_id: local_id.to_string(),
                remote_id: remote_id.to_string(),
                state: state.clone(),
            });
        Ok(())
    }
}
