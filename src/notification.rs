use std::sync::Arc;

use crate::platform::{NotificationContent, NotificationHandle, Notifier};
use crate::types::RideId;

/// Keeps exactly one persistent "tracking active" notification per session.
pub struct NotificationLifecycleManager {
    notifier: Arc<dyn Notifier>,
    handle: Option<NotificationHandle>,
    ride_id: Option<RideId>,
}

impl NotificationLifecycleManager {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        NotificationLifecycleManager {
            notifier,
            handle: None,
            ride_id: None,
        }
    }

    pub fn handle(&self) -> Option<&NotificationHandle> {
        self.handle.as_ref()
    }

    pub fn is_shown(&self) -> bool {
        self.handle.is_some()
    }

    /// Present the notification for `ride_id`, replacing any previous one.
    /// Presentation failure is logged; tracking continues without it.
    pub async fn show(&mut self, ride_id: RideId) {
        self.hide().await;

        match self.notifier.present(&NotificationContent::tracking(ride_id)).await {
            Ok(handle) => {
                log::debug!("Tracking notification {} shown for ride {}", handle.0, ride_id);
                self.handle = Some(handle);
                self.ride_id = Some(ride_id);
            }
            Err(e) => {
                log::warn!("Failed to show tracking notification for ride {}: {}", ride_id, e);
            }
        }
    }

    /// Dismiss by handle. An already-invalid handle counts as hidden; the
    /// handle is cleared either way.
    pub async fn hide(&mut self) {
        self.ride_id = None;
        if let Some(handle) = self.handle.take() {
            if let Err(e) = self.notifier.dismiss(&handle).await {
                log::debug!("Notification {} already gone: {}", handle.0, e);
            }
        }
    }

    /// Re-create the notification if the OS reaped it while tracking goes on.
    /// Returns true when a new notification was presented.
    pub async fn ensure_alive(&mut self) -> bool {
        let (Some(handle), Some(ride_id)) = (self.handle.clone(), self.ride_id) else {
            return false;
        };

        if self.notifier.is_presented(&handle).await {
            return false;
        }

        log::warn!("Tracking notification for ride {} was removed; re-creating", ride_id);
        self.handle = None;
        self.show(ride_id).await;
        self.handle.is_some()
    }
}
