//! Implementations of [`BatchClient`](crate::BatchClient).

mod local;

pub use local::LocalBatchClient;
