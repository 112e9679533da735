// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CourierError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Failed to parse kubeconfig: {0}")]
    KubeconfigError(String),

    #[error("Secret data not found for key {0}")]
    DataNotFound(String),

    #[error("Secret store error: {0}")]
    StoreError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Static misconfiguration that repeating the reconciliation will not fix.
    #[error("Inconsistent state: {0}")]
    Inconsistent(String),

    #[error("Invalid configuration: {0}")]
    ConfigurationError(String),

    #[error("{sync}; reverting to the checkpoint also failed: {revert}")]
    RevertFailed {
        sync: Box<CourierError>,
        revert: Box<CourierError>,
    },

    #[error("Cleanup failed for {} object(s): {}", .0.len(), .0.join("; "))]
    CleanupFailed(Vec<String>),

    #[error("Finalizer error: {0}")]
    FinalizerError(#[source] Box<kube_runtime::finalizer::Error<CourierError>>),

    #[error("Missing object key: {0}")]
    MissingObjectKey(&'static str),
}

impl CourierError {
    /// Optimistic-concurrency conflict reported by the API server.
    pub fn is_conflict(&self) -> bool {
        matches!(self, CourierError::KubeError(kube::Error::Api(e)) if e.code == 409)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CourierError::KubeError(kube::Error::Api(e)) if e.code == 404)
    }

    /// Errors that are recorded on the target status but never retried.
    ///
    /// A failed revert is never structural, whatever the sync error was.
    pub fn is_structural(&self) -> bool {
        matches!(self, CourierError::Inconsistent(_))
    }

    pub fn is_data_unavailable(&self) -> bool {
        matches!(self, CourierError::DataNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, CourierError>;

#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> CourierError {
    CourierError::KubeError(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{} error", reason),
        reason: reason.to_string(),
        code,
    }))
}
