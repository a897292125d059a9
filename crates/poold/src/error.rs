use crate::store::StoreError;
use pool_common::FramingError;
use thiserror::Error;

/// Errors that can occur while operating the pool coordinator.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Packet framing or parsing failed; fatal to the connection.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),
    /// A well-formed packet arrived in a state that does not allow it.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    /// Underlying transport I/O error.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    /// Persistence command failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    /// An in-flight block request was cancelled by a newer chain height.
    /// Not an error to the miner; the caller retries.
    #[error("stale generation")]
    StaleGeneration,
    /// The peer is banned.
    #[error("banned")]
    Banned,
    /// The miner did not complete LOGIN within the allowed time.
    #[error("login timed out")]
    LoginTimeout,
    /// The component is shutting down.
    #[error("shutting down")]
    Shutdown,
}
