//! Desktop stand-ins for the platform APIs, used by the CLI.
//!
//! There is no GPS on a headless host: the location source either fails to
//! subscribe (exercising the simulation fallback) or replays a recorded
//! track at a fixed cadence.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;

use super::{
    AcquisitionProfile, FixSink, LocationSource, NotificationContent, NotificationHandle, Notifier,
    PermissionApi, PermissionStatus, PlatformError,
};
use crate::types::RawFix;

/// Location source backed by a recorded track, or by nothing at all.
pub struct HeadlessLocation {
    track: Vec<RawFix>,
    cadence: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HeadlessLocation {
    /// No provider: every subscription attempt fails.
    pub fn unavailable() -> Self {
        HeadlessLocation {
            track: Vec::new(),
            cadence: Duration::from_secs(1),
            task: Mutex::new(None),
        }
    }

    /// Replays `track`, one fix per `cadence`, re-stamped with the current time.
    pub fn replay(track: Vec<RawFix>, cadence: Duration) -> Self {
        HeadlessLocation {
            track,
            cadence,
            task: Mutex::new(None),
        }
    }

    fn take_task(&self) -> Option<JoinHandle<()>> {
        self.task.lock().ok().and_then(|mut guard| guard.take())
    }
}

#[async_trait]
impl LocationSource for HeadlessLocation {
    async fn services_enabled(&self) -> bool {
        true
    }

    async fn subscribe(&self, profile: &AcquisitionProfile, sink: FixSink) -> Result<(), PlatformError> {
        if self.track.is_empty() {
            return Err(PlatformError::ProviderUnavailable(format!(
                "no GPS provider for profile '{}'",
                profile.name
            )));
        }

        if let Some(previous) = self.take_task() {
            previous.abort();
        }

        let track = self.track.clone();
        let cadence = self.cadence;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cadence);
            for mut fix in track {
                ticker.tick().await;
                fix.timestamp_ms = chrono::Utc::now().timestamp_millis();
                if !sink.deliver(vec![fix]) {
                    break;
                }
            }
            log::info!("Replay track exhausted");
        });

        let mut guard = self
            .task
            .lock()
            .map_err(|_| PlatformError::Other("replay task lock poisoned".to_string()))?;
        *guard = Some(handle);
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<(), PlatformError> {
        match self.take_task() {
            Some(handle) => {
                handle.abort();
                Ok(())
            }
            None => Err(PlatformError::NotSubscribed),
        }
    }

    async fn is_subscribed(&self) -> bool {
        self.task
            .lock()
            .ok()
            .map(|guard| guard.as_ref().map(|h| !h.is_finished()).unwrap_or(false))
            .unwrap_or(false)
    }
}

/// Permission API that grants everything.
pub struct GrantAllPermissions;

#[async_trait]
impl PermissionApi for GrantAllPermissions {
    async fn request_foreground(&self) -> PermissionStatus {
        PermissionStatus::Granted
    }

    async fn request_background(&self) -> PermissionStatus {
        PermissionStatus::Granted
    }
}

/// Notifier that writes notifications to the log.
#[derive(Default)]
pub struct LogNotifier {
    next_id: AtomicU64,
    presented: Mutex<HashSet<NotificationHandle>>,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn present(&self, content: &NotificationContent) -> Result<NotificationHandle, PlatformError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = NotificationHandle(format!("ride-tracking-{}", id));
        log::info!("[notification] {}: {}", content.title, content.body);
        self.presented
            .lock()
            .map_err(|_| PlatformError::Notification("lock poisoned".to_string()))?
            .insert(handle.clone());
        Ok(handle)
    }

    async fn dismiss(&self, handle: &NotificationHandle) -> Result<(), PlatformError> {
        let removed = self
            .presented
            .lock()
            .map_err(|_| PlatformError::Notification("lock poisoned".to_string()))?
            .remove(handle);
        if removed {
            log::info!("[notification] dismissed {}", handle.0);
            Ok(())
        } else {
            Err(PlatformError::Notification(format!("unknown handle {}", handle.0)))
        }
    }

    async fn is_presented(&self, handle: &NotificationHandle) -> bool {
        self.presented
            .lock()
            .map(|set| set.contains(handle))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RideId;

    #[tokio::test]
    async fn test_unavailable_source_rejects_subscription() {
        let source = HeadlessLocation::unavailable();
        let (sink, _rx) = FixSink::channel();

        let err = source.subscribe(&AcquisitionProfile::full(), sink).await.unwrap_err();
        assert!(matches!(err, PlatformError::ProviderUnavailable(_)));
        assert_eq!(source.unsubscribe().await, Err(PlatformError::NotSubscribed));
        assert!(!source.is_subscribed().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_delivers_track_in_order() {
        let track = vec![
            RawFix::new(1.0, 1.0, 0, 5.0),
            RawFix::new(2.0, 2.0, 0, 5.0),
        ];
        let source = HeadlessLocation::replay(track, Duration::from_secs(1));
        let (sink, mut rx) = FixSink::channel();

        source.subscribe(&AcquisitionProfile::full(), sink).await.unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first[0].latitude, 1.0);
        assert_eq!(second[0].latitude, 2.0);
        assert!(source.unsubscribe().await.is_ok());
    }

    #[tokio::test]
    async fn test_log_notifier_lifecycle() {
        let notifier = LogNotifier::new();
        let handle = notifier
            .present(&NotificationContent::tracking(RideId(3)))
            .await
            .unwrap();

        assert!(notifier.is_presented(&handle).await);
        notifier.dismiss(&handle).await.unwrap();
        assert!(!notifier.is_presented(&handle).await);
        assert!(notifier.dismiss(&handle).await.is_err());
    }
}
