use std::time::Duration;

use thiserror::Error;

use crate::common::error::DeployerError::GenericError;

#[derive(Debug, Error)]
pub enum DeployerError {
    #[error("{0}")]
    LocationConfig(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Could not acquire a `{resource_type}` resource within {timeout:?}")]
    AcquisitionTimeout {
        resource_type: String,
        timeout: Duration,
    },
    #[error("Acquisition error: {0}")]
    Acquisition(String),
    #[error("Cluster index {index} was already recorded for project {project}")]
    DuplicateIndex { project: String, index: usize },
    #[error("Lease of project {0} was lost, its heartbeat keeps failing")]
    LeaseLost(String),
    #[error("Clusters of this run were already provisioned")]
    AlreadyProvisioned,
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Error: {0}")]
    GenericError(String),
}

impl From<serde_json::error::Error> for DeployerError {
    fn from(e: serde_json::error::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<anyhow::Error> for DeployerError {
    fn from(error: anyhow::Error) -> Self {
        Self::GenericError(format!("{error:?}"))
    }
}

impl From<String> for DeployerError {
    fn from(e: String) -> Self {
        GenericError(e)
    }
}

pub fn error<T>(message: String) -> crate::Result<T> {
    Err(GenericError(message))
}
