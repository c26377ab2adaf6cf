//! Implementation of batchwright CLI commands.

pub mod config;
pub mod run;
