use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::types::{RideId, TrackPoint};

/// Backend request errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    #[error("Network timeout")]
    NetworkTimeout,

    #[error("HTTP error: {0}")]
    HttpStatus(u16),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::NetworkTimeout
        } else if err.is_decode() {
            ApiError::Parse(err.to_string())
        } else if let Some(status) = err.status() {
            ApiError::HttpStatus(status.as_u16())
        } else {
            ApiError::Transport(err.to_string())
        }
    }
}

/// Shared ride lifecycle status as reported by `GET /shared-rides/{id}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RideStatus {
    Scheduled,
    Confirmed,
    Ongoing,
    Completed,
    Cancelled,
    #[serde(other)]
    Unknown,
}

impl RideStatus {
    /// Only ongoing rides accept track points.
    pub fn accepts_tracking(self) -> bool {
        self == RideStatus::Ongoing
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RideSnapshot {
    pub status: RideStatus,
}

/// Response body of a successful track upload.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct TrackingReceipt {
    #[serde(default, alias = "currentDistanceKm")]
    pub current_distance_km: Option<f64>,
    #[serde(default)]
    pub polyline: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Remote side of the tracker: batch upload and ride status lookup.
#[async_trait]
pub trait TrackingBackend: Send + Sync {
    async fn post_track(&self, ride_id: RideId, points: &[TrackPoint]) -> Result<TrackingReceipt, ApiError>;

    async fn fetch_ride(&self, ride_id: RideId) -> Result<RideSnapshot, ApiError>;
}

/// reqwest-backed client for the ride-sharing REST API
///
/// # Endpoints
/// - `POST {base}/rides/{rideId}/track` with an ordered JSON array of points
/// - `GET {base}/shared-rides/{rideId}`
///
/// # Error Handling
/// - Non-2xx: `HttpStatus`, the caller keeps its buffer
/// - Timeout / connection failure: treated as transient
/// - Unparseable upload receipt: tolerated, an empty receipt is returned
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    auth_token: Option<String>,
}

impl HttpBackend {
    pub fn new(base_url: &str, auth_token: Option<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("ride_tracker_rs/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        HttpBackend {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token,
        }
    }

    fn track_url(&self, ride_id: RideId) -> String {
        format!("{}/rides/{}/track", self.base_url, ride_id)
    }

    fn ride_url(&self, ride_id: RideId) -> String {
        format!("{}/shared-rides/{}", self.base_url, ride_id)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl TrackingBackend for HttpBackend {
    async fn post_track(&self, ride_id: RideId, points: &[TrackPoint]) -> Result<TrackingReceipt, ApiError> {
        let response = self
            .authorize(self.client.post(self.track_url(ride_id)))
            .json(points)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::HttpStatus(status.as_u16()));
        }

        let body = response.text().await?;
        match serde_json::from_str::<TrackingReceipt>(&body) {
            Ok(receipt) => Ok(receipt),
            Err(e) => {
                log::debug!("Unparsed tracking receipt for ride {}: {}", ride_id, e);
                Ok(TrackingReceipt::default())
            }
        }
    }

    async fn fetch_ride(&self, ride_id: RideId) -> Result<RideSnapshot, ApiError> {
        let response = self
            .authorize(self.client.get(self.ride_url(ride_id)))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::HttpStatus(status.as_u16()));
        }

        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| ApiError::Parse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_urls() {
        let backend = HttpBackend::new("http://api.example/api/v1/", None, Duration::from_secs(5));
        assert_eq!(backend.track_url(RideId(42)), "http://api.example/api/v1/rides/42/track");
        assert_eq!(backend.ride_url(RideId(42)), "http://api.example/api/v1/shared-rides/42");
    }

    #[test]
    fn test_ride_status_parsing() {
        let snapshot: RideSnapshot =
            serde_json::from_str(r#"{"shared_ride_id": 42, "status": "ONGOING"}"#).unwrap();
        assert!(snapshot.status.accepts_tracking());

        let snapshot: RideSnapshot = serde_json::from_str(r#"{"status": "COMPLETED"}"#).unwrap();
        assert_eq!(snapshot.status, RideStatus::Completed);
        assert!(!snapshot.status.accepts_tracking());

        let snapshot: RideSnapshot = serde_json::from_str(r#"{"status": "DRIVER_ARRIVED"}"#).unwrap();
        assert_eq!(snapshot.status, RideStatus::Unknown);
    }

    #[test]
    fn test_receipt_accepts_both_casings() {
        let receipt: TrackingReceipt =
            serde_json::from_str(r#"{"currentDistanceKm": 1.25, "polyline": "abc", "status": "OK"}"#).unwrap();
        assert_eq!(receipt.current_distance_km, Some(1.25));

        let receipt: TrackingReceipt = serde_json::from_str(r#"{"current_distance_km": 2.5}"#).unwrap();
        assert_eq!(receipt.current_distance_km, Some(2.5));
        assert_eq!(receipt.status, None);
    }

    #[test]
    fn test_api_error_display() {
        let errors = vec![
            ApiError::NetworkTimeout,
            ApiError::HttpStatus(500),
            ApiError::Parse("bad".to_string()),
            ApiError::Transport("refused".to_string()),
        ];
        for err in errors {
            assert!(!err.to_string().is_empty());
        }
    }
}
