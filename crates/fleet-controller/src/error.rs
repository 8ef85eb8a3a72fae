//! Controller error types.

use std::time::Duration;

use fleet_bus::BusError;
use fleet_cluster::DriverError;
use fleet_core::Transient;
use fleet_state::StateError;
use thiserror::Error;

/// Result type alias for controller operations.
pub type ControllerResult<T> = Result<T, ControllerError>;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("store: {0}")]
    State(#[from] StateError),

    #[error("bus: {0}")]
    Bus(#[from] BusError),

    #[error("cluster: {0}")]
    Driver(#[from] DriverError),

    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("write to {0} conflicted again after refresh")]
    RepeatedConflict(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("unknown template: {0}")]
    UnknownTemplate(String),
}

impl ControllerError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::State(e) => e.is_transient(),
            Self::Bus(e) => e.is_transient(),
            Self::Driver(e) => e.is_transient(),
            Self::Timeout { .. } | Self::RepeatedConflict(_) => true,
            Self::InstanceNotFound(_) | Self::UnknownTemplate(_) => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::State(e) if e.is_conflict())
    }
}

impl Transient for ControllerError {
    fn is_transient(&self) -> bool {
        ControllerError::is_transient(self)
    }
}
