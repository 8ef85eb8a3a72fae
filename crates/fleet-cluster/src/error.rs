//! Cluster driver error types.

use fleet_core::Transient;
use thiserror::Error;

/// Result type alias for cluster driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("cluster client unavailable: {0}")]
    Client(String),

    #[error("cluster API error {code}: {message}")]
    Api { code: u16, message: String },

    #[error("invalid pod manifest: {0}")]
    Manifest(String),

    #[error("watch failed: {0}")]
    Watch(String),

    #[error("injected failure: {0}")]
    Injected(String),
}

impl DriverError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Client(_) | Self::Watch(_) | Self::Injected(_) => true,
            Self::Api { code, .. } => *code == 429 || *code >= 500,
            Self::Manifest(_) => false,
        }
    }
}

impl Transient for DriverError {
    fn is_transient(&self) -> bool {
        DriverError::is_transient(self)
    }
}

impl From<kube::Error> for DriverError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(resp) => DriverError::Api {
                code: resp.code,
                message: resp.message,
            },
            other => DriverError::Client(other.to_string()),
        }
    }
}
