//! Platform collaborator seams: location, permissions, notifications.
//!
//! The tracker never talks to an OS API directly. Hosts implement these
//! traits (Android/iOS bridges, the headless desktop platform in
//! [`headless`], or test doubles) and hand them to the controller.

pub mod headless;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::{RawFix, RideId};

/// Errors reported by platform collaborators.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlatformError {
    #[error("Location provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Nothing to stop")]
    NotSubscribed,

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Platform error: {0}")]
    Other(String),
}

/// Requested positioning accuracy class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccuracyLevel {
    High,
    Balanced,
    Low,
}

/// Accuracy/interval profile requested from the platform location API.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionProfile {
    pub name: String,
    pub accuracy: AccuracyLevel,
    pub interval_ms: u64,
    pub distance_interval_m: f64,
    pub deferred_updates_ms: u64,
}

impl AcquisitionProfile {
    /// High accuracy, 10 s / 10 m updates, batched every 30 s.
    pub fn full() -> Self {
        AcquisitionProfile {
            name: "full".to_string(),
            accuracy: AccuracyLevel::High,
            interval_ms: 10_000,
            distance_interval_m: 10.0,
            deferred_updates_ms: 30_000,
        }
    }

    /// Lower accuracy and longer interval, tried after `full` fails.
    pub fn degraded() -> Self {
        AcquisitionProfile {
            name: "degraded".to_string(),
            accuracy: AccuracyLevel::Balanced,
            interval_ms: 30_000,
            distance_interval_m: 50.0,
            deferred_updates_ms: 60_000,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Handler registered with the location API at subscribe time.
///
/// Batches are queued unbounded so the platform callback never blocks and
/// never drops fixes.
#[derive(Clone, Debug)]
pub struct FixSink {
    tx: mpsc::UnboundedSender<Vec<RawFix>>,
}

impl FixSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Vec<RawFix>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (FixSink { tx }, rx)
    }

    /// Deliver one batch; returns false once the tracker has gone away.
    pub fn deliver(&self, batch: Vec<RawFix>) -> bool {
        self.tx.send(batch).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[async_trait]
pub trait LocationSource: Send + Sync {
    /// GPS / location services switched on at the OS level.
    async fn services_enabled(&self) -> bool;

    async fn subscribe(&self, profile: &AcquisitionProfile, sink: FixSink) -> Result<(), PlatformError>;

    /// Stop updates. `NotSubscribed` is tolerated by callers.
    async fn unsubscribe(&self) -> Result<(), PlatformError>;

    /// Whether updates are still being delivered.
    async fn is_subscribed(&self) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionStatus {
    Granted,
    Denied,
}

impl PermissionStatus {
    pub fn is_granted(self) -> bool {
        self == PermissionStatus::Granted
    }
}

#[async_trait]
pub trait PermissionApi: Send + Sync {
    async fn request_foreground(&self) -> PermissionStatus;

    async fn request_background(&self) -> PermissionStatus;

    /// Platforms without a separate background grant skip the request.
    fn supports_background(&self) -> bool {
        true
    }
}

/// Opaque reference to a presented notification.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationHandle(pub String);

/// Content of the persistent "tracking active" notification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NotificationContent {
    pub ride_id: RideId,
    pub title: String,
    pub body: String,
    /// High-importance, non-dismissable
    pub sticky: bool,
}

impl NotificationContent {
    pub fn tracking(ride_id: RideId) -> Self {
        NotificationContent {
            ride_id,
            title: format!("Tracking ride #{}", ride_id),
            body: "GPS is active".to_string(),
            sticky: true,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn present(&self, content: &NotificationContent) -> Result<NotificationHandle, PlatformError>;

    async fn dismiss(&self, handle: &NotificationHandle) -> Result<(), PlatformError>;

    async fn is_presented(&self, handle: &NotificationHandle) -> bool;
}

/// The host's platform implementations, handed to the controller together.
#[derive(Clone)]
pub struct Platform {
    pub location: Arc<dyn LocationSource>,
    pub permissions: Arc<dyn PermissionApi>,
    pub notifier: Arc<dyn Notifier>,
}

impl Platform {
    /// Desktop platform with no GPS provider.
    pub fn headless() -> Self {
        Platform {
            location: Arc::new(headless::HeadlessLocation::unavailable()),
            permissions: Arc::new(headless::GrantAllPermissions),
            notifier: Arc::new(headless::LogNotifier::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profiles_degrade() {
        let full = AcquisitionProfile::full();
        let degraded = AcquisitionProfile::degraded();
        assert!(degraded.interval() > full.interval());
        assert!(degraded.distance_interval_m > full.distance_interval_m);
        assert_eq!(full.accuracy, AccuracyLevel::High);
    }

    #[tokio::test]
    async fn test_fix_sink_delivery() {
        let (sink, mut rx) = FixSink::channel();
        assert!(sink.deliver(vec![RawFix::new(1.0, 2.0, 0, 5.0)]));

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 1);

        drop(rx);
        assert!(sink.is_closed());
        assert!(!sink.deliver(Vec::new()));
    }

    #[test]
    fn test_notification_content() {
        let content = NotificationContent::tracking(RideId(42));
        assert!(content.title.contains("42"));
        assert!(content.sticky);
    }
}
