//! An engine submitting jobs to a remote batch compute service and tracking
//! them to completion.
//!
//! The engine provisions a job definition, compute environment and job queue
//! (or reuses existing ones), submits jobs asynchronously on a bounded worker
//! pool and reconciles their remote statuses from a single monitor task. Each
//! state transition is journaled, the logs of succeeded jobs are retrieved
//! and the provisioned resources are torn down once every job finished.
//!
//! The remote service is abstracted by [`BatchClient`]; [`LocalBatchClient`]
//! emulates one on the local host.

mod backend;
pub mod client;
pub mod config;
mod engine;
mod error;
pub mod job;
pub mod journal;
pub mod logs;
mod monitor;
mod pool;
pub mod resources;
#[cfg(test)]
mod scripted;
mod submit;

pub use backend::LocalBatchClient;
pub use client::BatchClient;
pub use client::ClientError;
pub use config::Config;
pub use config::ConfigError;
pub use engine::Engine;
pub use error::EngineError;
pub use error::EngineResult;
pub use job::BatchJob;
pub use job::EnvironmentVariable;
pub use job::JobCommand;
pub use job::JobRecord;
pub use job::JobState;
pub use journal::FileJournal;
pub use journal::MemoryJournal;
pub use journal::StateJournal;
pub use monitor::TerminationReport;
pub use pool::WorkerPool;
pub use resources::ProvisionedBucket;
pub use resources::ProvisionedResources;
