// lifecycle.rs: reacts to app foreground/background transitions.
//
// Holds no state of its own. The pending ride lives in the controller's
// session and is consumed exactly once through `take_pending_ride`.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::controller::TrackingController;
use crate::types::{AppState, RideId};

/// What the bridge did in response to one transition.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeAction {
    /// A pending ride was started (or failed to start)
    StartedPending { ride_id: RideId, started: bool },
    /// Foreground with an active session: subscription and notification checked
    Verified { reacquired: bool, notification_restored: bool },
    /// Background while tracking: notification checked
    Guarded { notification_restored: bool },
    Nothing,
}

pub struct AppLifecycleBridge {
    controller: Arc<TrackingController>,
}

impl AppLifecycleBridge {
    pub fn new(controller: Arc<TrackingController>) -> Self {
        AppLifecycleBridge { controller }
    }

    pub async fn on_app_state(&self, state: AppState) -> BridgeAction {
        match state {
            AppState::Foreground => self.on_foreground().await,
            AppState::Background => self.on_background().await,
        }
    }

    async fn on_foreground(&self) -> BridgeAction {
        if let Some(ride_id) = self.controller.take_pending_ride() {
            log::info!("App foregrounded; starting pending ride {}", ride_id);
            let started = match self.controller.start_tracking(ride_id).await {
                Ok(started) => started,
                Err(e) => {
                    log::error!("Pending ride {} failed to start: {}", ride_id, e);
                    false
                }
            };
            return BridgeAction::StartedPending { ride_id, started };
        }

        if !self.controller.get_tracking_status().is_tracking {
            return BridgeAction::Nothing;
        }

        let reacquired = match self.controller.verify_acquisition().await {
            Ok(reacquired) => reacquired,
            Err(e) => {
                log::error!("Could not restore location updates: {}", e);
                false
            }
        };
        let notification_restored = self.controller.ensure_notification_alive().await;
        BridgeAction::Verified {
            reacquired,
            notification_restored,
        }
    }

    async fn on_background(&self) -> BridgeAction {
        if !self.controller.get_tracking_status().is_tracking {
            return BridgeAction::Nothing;
        }
        BridgeAction::Guarded {
            notification_restored: self.controller.ensure_notification_alive().await,
        }
    }

    /// Handle transitions until the sender goes away.
    pub async fn run(self, mut app_state: watch::Receiver<AppState>) {
        while app_state.changed().await.is_ok() {
            let state = *app_state.borrow_and_update();
            let action = self.on_app_state(state).await;
            log::debug!("App {:?}: {:?}", state, action);
        }
    }

    pub fn spawn(self, app_state: watch::Receiver<AppState>) -> JoinHandle<()> {
        tokio::spawn(self.run(app_state))
    }
}
