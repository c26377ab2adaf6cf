//! Jobs and the job table.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;

/// The environment variable listing the local files uploaded for a job.
///
/// The value is a comma-separated list of paths.
pub const TRANSFER_INPUT_FILES: &str = "TRANSFER_INPUT_FILES";

/// The maximum length of a job id.
const MAX_JOB_ID_LEN: usize = 128;

/// Determines if a string is usable as a job id.
///
/// Ids name the job's log file, so they are restricted to 1 to 128 ASCII
/// letters, digits, hyphens and underscores.
pub fn is_valid_job_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_JOB_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// The lifecycle state of a job.
///
/// The state machine is linear: `Unsubmitted -> Submitted -> {Succeeded |
/// Failed}`. While a job is outstanding, the state may instead hold the last
/// non-terminal status reported by the remote service, echoed verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobState {
    /// The submit call has not completed (or failed).
    Unsubmitted,
    /// The remote service accepted the job.
    Submitted,
    /// The job completed successfully.
    Succeeded,
    /// The job failed.
    Failed,
    /// A non-terminal remote status (e.g. `RUNNABLE`).
    Other(String),
}

impl JobState {
    /// Determines if the state is terminal.
    ///
    /// Terminal states are absorbing.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsubmitted => write!(f, "unsubmitted"),
            Self::Submitted => write!(f, "submitted"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Other(status) => write!(f, "{status}"),
        }
    }
}

/// An environment variable passed to a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentVariable {
    /// The name of the variable.
    pub name: String,
    /// The value of the variable.
    pub value: String,
}

/// The submission payload of a job.
///
/// Apart from the input files it lists, the engine does not interpret the
/// payload; it is forwarded to the remote service as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCommand {
    /// The executable to invoke.
    pub executable: String,
    /// The arguments to the executable, as a single shell-style string.
    #[serde(default)]
    pub arguments: String,
    /// The environment of the job.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub environment: Vec<EnvironmentVariable>,
}

impl JobCommand {
    /// Gets the local files to upload before the job is submitted.
    ///
    /// These are listed in the `TRANSFER_INPUT_FILES` variable; blank entries
    /// are ignored.
    pub fn input_files(&self) -> Vec<PathBuf> {
        self.environment
            .iter()
            .filter(|v| v.name == TRANSFER_INPUT_FILES)
            .flat_map(|v| v.value.split(','))
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(PathBuf::from)
            .collect()
    }
}

/// A job to submit to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchJob {
    /// The caller-assigned id of the job.
    ///
    /// The id is also used as the remote job name.
    #[serde(rename = "jobName")]
    pub id: String,
    /// The submission payload.
    #[serde(flatten)]
    pub command: JobCommand,
}

impl BatchJob {
    /// Constructs a new job with the given id and command.
    pub fn new(id: impl Into<String>, command: JobCommand) -> Self {
        Self {
            id: id.into(),
            command,
        }
    }
}

/// The engine's record of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    /// The caller-assigned id.
    local_id: String,
    /// The id assigned by the remote service.
    ///
    /// This is `Some` iff the state is not [`JobState::Unsubmitted`].
    remote_id: Option<String>,
    /// The current state.
    state: JobState,
    /// The submission payload.
    command: JobCommand,
    /// The handle of the job queue the job was submitted to.
    job_queue: String,
    /// The handle of the job definition the job was submitted with.
    job_definition: String,
}

impl JobRecord {
    /// Creates an unsubmitted record for the given job.
    pub fn new(job: BatchJob, job_queue: impl Into<String>, job_definition: impl Into<String>) -> Self {
        Self {
            local_id: job.id,
            remote_id: None,
            state: JobState::Unsubmitted,
            command: job.command,
            job_queue: job_queue.into(),
            job_definition: job_definition.into(),
        }
    }

    /// Gets the caller-assigned id of the job.
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Gets the remote id of the job, if it was submitted.
    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }

    /// Gets the current state of the job.
    pub fn state(&self) -> &JobState {
        &self.state
    }

    /// Gets the submission payload of the job.
    pub fn command(&self) -> &JobCommand {
        &self.command
    }

    /// Gets the handle of the job queue.
    pub fn job_queue(&self) -> &str {
        &self.job_queue
    }

    /// Gets the handle of the job definition.
    pub fn job_definition(&self) -> &str {
        &self.job_definition
    }

    /// Records a successful submission.
    ///
    /// Returns `false` (and leaves the record untouched) unless the job is
    /// still unsubmitted.
    pub(crate) fn mark_submitted(&mut self, remote_id: impl Into<String>) -> bool {
        if self.state != JobState::Unsubmitted {
            return false;
        }

        self.remote_id = Some(remote_id.into());
        self.state = JobState::Submitted;
        true
    }

    /// Moves the job to a terminal state.
    ///
    /// Returns `false` if the job is unsubmitted or already terminal.
    ///
    /// # Panics
    ///
    /// Panics if the given state is not terminal.
    pub(crate) fn mark_terminal(&mut self, state: JobState) -> bool {
        assert!(state.is_terminal(), "state `{state}` is not terminal");
        if self.state == JobState::Unsubmitted || self.state.is_terminal() {
            return false;
        }

        self.state = state;
        true
    }

    /// Echoes a non-terminal remote status into the record.
    ///
    /// Returns `true` if the observed status differs from the current state.
    pub(crate) fn observe(&mut self, status: &str) -> bool {
        if self.state == JobState::Unsubmitted || self.state.is_terminal() {
            return false;
        }

        if matches!(&self.state, JobState::Other(s) if s == status) {
            return false;
        }

        self.state = JobState::Other(status.to_string());
        true
    }
}

/// The table of jobs known to an engine, keyed by local id.
///
/// Records are kept in submission order and are never removed. Cloning the
/// table produces another handle to the same records.
#[derive(Debug, Clone, Default)]
pub struct JobTable {
    /// The records, guarded by a single lock.
    ///
    /// The lock is never held across an await point.
    inner: Arc<Mutex<IndexMap<String, JobRecord>>>,
}

impl JobTable {
    /// Constructs an empty job table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a record.
    ///
    /// Returns `false` if a record with the same local id exists; the existing
    /// record is left untouched.
    pub(crate) fn insert(&self, record: JobRecord) -> bool {
        let mut jobs = self.inner.lock().expect("failed to lock job table");
        if jobs.contains_key(record.local_id()) {
            return false;
        }

        jobs.insert(record.local_id.clone(), record);
        true
    }

    /// Determines if a record with the given local id exists.
    pub fn contains(&self, local_id: &str) -> bool {
        self.inner
            .lock()
            .expect("failed to lock job table")
            .contains_key(local_id)
    }

    /// Gets the state of a job.
    pub fn state(&self, local_id: &str) -> Option<JobState> {
        self.inner
            .lock()
            .expect("failed to lock job table")
            .get(local_id)
            .map(|r| r.state.clone())
    }

    /// Gets a copy of a job's record.
    pub fn get(&self, local_id: &str) -> Option<JobRecord> {
        self.inner
            .lock()
            .expect("failed to lock job table")
            .get(local_id)
            .cloned()
    }

    /// Gets a copy of every record, in submission order.
    pub fn snapshot(&self) -> Vec<JobRecord> {
        self.inner
            .lock()
            .expect("failed to lock job table")
            .values()
            .cloned()
            .collect()
    }

    /// Gets the number of records.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("failed to lock job table").len()
    }

    /// Determines if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies an update to a record while holding the lock.
    ///
    /// Returns `None` if no such record exists.
    pub(crate) fn update<R>(&self, local_id: &str, f: impl FnOnce(&mut JobRecord) -> R) -> Option<R> {
        self.inner
            .lock()
            .expect("failed to lock job table")
            .get_mut(local_id)
            .map(f)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn record(id: &str) -> JobRecord {
        JobRecord::new(
            BatchJob::new(id, JobCommand::default()),
            "queue",
            "definition",
        )
    }

    #[test]
    fn terminal_states_are_absorbing() {
        let mut r = record("a");
        assert!(!r.mark_terminal(JobState::Succeeded));
        assert_eq!(r.state(), &JobState::Unsubmitted);

        assert!(r.mark_submitted("remote-a"));
        assert!(!r.mark_submitted("remote-b"));
        assert_eq!(r.remote_id(), Some("remote-a"));

        assert!(r.observe("RUNNING"));
        assert!(!r.observe("RUNNING"));
        assert_eq!(r.state(), &JobState::Other("RUNNING".to_string()));

        assert!(r.mark_terminal(JobState::Failed));
        assert!(!r.mark_terminal(JobState::Succeeded));
        assert!(!r.observe("RUNNABLE"));
        assert!(!r.mark_submitted("remote-c"));
        assert_eq!(r.state(), &JobState::Failed);
    }

    #[test]
    fn remote_id_tracks_submission() {
        let mut r = record("a");
        assert_eq!(r.remote_id(), None);
        assert!(!r.observe("RUNNING"));
        r.mark_submitted("remote-a");
        assert_eq!(r.state(), &JobState::Submitted);
        assert_eq!(r.remote_id(), Some("remote-a"));
    }

    #[test]
    fn table_rejects_duplicates() {
        let table = JobTable::new();
        assert!(table.insert(record("a")));
        assert!(table.insert(record("b")));
        table.update("a", |r| r.mark_submitted("remote-a"));
        assert!(!table.insert(record("a")));

        assert_eq!(table.len(), 2);
        assert_eq!(table.state("a"), Some(JobState::Submitted));
        assert_eq!(table.state("c"), None);
        assert_eq!(
            table
                .snapshot()
                .iter()
                .map(|r| r.local_id().to_string())
                .collect::<Vec<_>>(),
            ["a", "b"]
        );
    }

    #[test]
    fn job_from_submit_file_entry() {
        let job: BatchJob = serde_json::from_str(
            r#"{
                "jobName": "preprocess_1",
                "executable": "wrapper.sh",
                "arguments": "-n 60",
                "environment": [{ "name": "TRANSFER_INPUT_FILES", "value": "./f.in" }]
            }"#,
        )
        .unwrap();

        assert_eq!(job.id, "preprocess_1");
        assert_eq!(job.command.executable, "wrapper.sh");
        assert_eq!(job.command.arguments, "-n 60");
        assert_eq!(job.command.environment.len(), 1);
        assert_eq!(job.command.environment[0].name, "TRANSFER_INPUT_FILES");
        assert_eq!(job.command.input_files(), [PathBuf::from("./f.in")]);
    }

    #[test]
    fn input_files_are_comma_separated() {
        let command = JobCommand {
            executable: "run.sh".to_string(),
            arguments: String::new(),
            environment: vec![
                EnvironmentVariable {
                    name: "OTHER".to_string(),
                    value: "x.in".to_string(),
                },
                EnvironmentVariable {
                    name: TRANSFER_INPUT_FILES.to_string(),
                    value: "a.in, data/b.in,,".to_string(),
                },
            ],
        };
        assert_eq!(
            command.input_files(),
            [PathBuf::from("a.in"), PathBuf::from("data/b.in")]
        );
        assert!(JobCommand::default().input_files().is_empty());
    }

    #[test]
    fn job_ids_are_file_name_safe() {
        for id in ["a", "preprocess_1", "align-1", &"x".repeat(128)] {
            assert!(is_valid_job_id(id), "`{id}` should be valid");
        }

        for id in ["", "../../x", "a/b", "a b", "ünicode", ".", &"x".repeat(129)] {
            assert!(!is_valid_job_id(id), "`{id}` should be invalid");
        }
    }
}
