use thiserror::Error;

/// Errors raised while building a [`WindowedCounter`](crate::WindowedCounter).
///
/// Nothing fails once a counter exists: `add`, `count` and `stop` are total.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CounterError {
    /// The window/bucket parameters cannot describe a usable ring of buckets.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// The OS refused to start the rotation worker thread.
    #[error("failed to start rotation worker: {0}")]
    Spawn(String),
}
