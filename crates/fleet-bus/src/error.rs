//! Event bus and lease error types.

use fleet_core::Transient;
use thiserror::Error;

/// Result type alias for bus operations.
pub type BusResult<T> = Result<T, BusError>;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus connection failed: {0}")]
    Connect(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("malformed event payload: {0}")]
    Codec(String),

    #[error("lease operation failed: {0}")]
    Lease(String),

    #[error("bus closed")]
    Closed,
}

impl BusError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connect(_) | Self::Publish(_) | Self::Subscribe(_) | Self::Lease(_)
        )
    }
}

impl Transient for BusError {
    fn is_transient(&self) -> bool {
        BusError::is_transient(self)
    }
}
