use thiserror::Error;

use crate::api::ApiError;
use crate::platform::PlatformError;

/// Ride tracker error types
#[derive(Error, Debug, Clone)]
pub enum TrackerError {
    #[error("Location permission denied")]
    PermissionDenied,

    #[error("Location services unavailable")]
    ServiceUnavailable,

    #[error("Location subscription failed: {0}")]
    SubscriptionFailed(String),

    #[error("Tracking start failed: {0}")]
    TrackingStartFailed(String),

    #[error("Transmission failed: {0}")]
    TransmissionFailed(String),

    #[error("Invalid tracking state: {0}")]
    InvalidState(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for tracker operations
pub type TResult<T> = Result<T, TrackerError>;

impl From<ApiError> for TrackerError {
    fn from(err: ApiError) -> Self {
        TrackerError::TransmissionFailed(err.to_string())
    }
}

impl From<PlatformError> for TrackerError {
    fn from(err: PlatformError) -> Self {
        TrackerError::SubscriptionFailed(err.to_string())
    }
}

impl From<std::io::Error> for TrackerError {
    fn from(err: std::io::Error) -> Self {
        TrackerError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for TrackerError {
    fn from(err: serde_json::Error) -> Self {
        TrackerError::Storage(err.to_string())
    }
}

impl TrackerError {
    /// Errors that should never leave the steady-state flush path.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TrackerError::TransmissionFailed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_maps_to_transmission_failure() {
        let err: TrackerError = ApiError::HttpStatus(503).into();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("503"));
    }

    #[test]
    fn test_start_errors_are_not_retryable() {
        assert!(!TrackerError::PermissionDenied.is_retryable());
        assert!(!TrackerError::ServiceUnavailable.is_retryable());
    }
}
