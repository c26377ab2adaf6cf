//! Engine errors.

use thiserror::Error;

use crate::client::ClientError;
use crate::client::ResourceKind;
use crate::config::ConfigError;

/// Errors surfaced to callers of the engine.
///
/// Only fatal conditions are represented here; recoverable remote failures
/// encountered while monitoring are logged and retried instead.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A job was submitted after `signal_done` was called.
    #[error("received signal to exit: cannot accept job `{0}`")]
    SubmissionsClosed(String),

    /// A job was submitted with a local id that is not usable as a file name.
    #[error(
        "job id `{0}` is invalid: ids must be 1 to 128 letters, digits, `-` or `_`"
    )]
    InvalidJobId(String),

    /// A job was submitted with a local id that was already used.
    #[error("a job with id `{0}` was already submitted")]
    DuplicateJob(String),

    /// The input files of a job could not be transferred.
    #[error("cannot transfer input files of job `{job}`: {reason}")]
    InputTransfer {
        /// The local id of the job.
        job: String,
        /// Why the transfer is not possible.
        reason: String,
    },

    /// The worker pool has shut down and cannot accept more work.
    #[error("the worker pool is shut down and cannot accept job `{0}`")]
    PoolClosed(String),

    /// The monitor was awaited before it was started.
    #[error("the monitor has not been started")]
    MonitorNotStarted,

    /// The monitor was started more than once.
    #[error("the monitor has already been started")]
    MonitorAlreadyStarted,

    /// A provisioned resource never reached a usable state.
    #[error("{kind} `{handle}` is still not valid after {attempts} attempt(s)")]
    ResourceNotReady {
        /// The kind of the resource.
        kind: ResourceKind,
        /// The handle of the resource.
        handle: String,
        /// The number of status checks performed.
        attempts: usize,
    },

    /// A provisioned resource entered a state it cannot recover from.
    #[error("{kind} `{handle}` entered status `{status}`")]
    ResourceFailed {
        /// The kind of the resource.
        kind: ResourceKind,
        /// The handle of the resource.
        handle: String,
        /// The offending status.
        status: String,
    },

    /// A remote call failed where the failure cannot be recovered from.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The monitor task panicked or was aborted.
    #[error("the monitor task did not complete: {0}")]
    Join(String),
}

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;
