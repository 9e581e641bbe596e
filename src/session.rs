use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{TResult, TrackerError};
use crate::types::RideId;

/// Tracking state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackingState {
    /// No ride tracked
    Idle,
    /// Start requested while the app was backgrounded
    PendingStart,
    /// Platform location updates flowing
    Active,
    /// Synthetic fixes from the motion simulator
    Simulating,
    /// Tearing down; final flush in progress
    Stopping,
}

impl TrackingState {
    pub fn is_tracking(self) -> bool {
        matches!(self, TrackingState::Active | TrackingState::Simulating)
    }
}

/// Controller-owned part of the tracking session.
///
/// The fix buffer, flush timestamps and ride status cache belong to the
/// uploader; the notification handle belongs to the notification manager.
#[derive(Debug, Clone)]
pub struct TrackingSession {
    ride_id: Option<RideId>,
    state: TrackingState,
    background_allowed: bool,
    started_at: Option<DateTime<Utc>>,
}

impl TrackingSession {
    /// Create new session in Idle state
    pub fn new() -> Self {
        TrackingSession {
            ride_id: None,
            state: TrackingState::Idle,
            background_allowed: false,
            started_at: None,
        }
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    pub fn ride_id(&self) -> Option<RideId> {
        self.ride_id
    }

    pub fn background_allowed(&self) -> bool {
        self.background_allowed
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Record a start request that must wait for the foreground (Idle → PendingStart)
    pub fn defer_start(&mut self, ride_id: RideId) -> TResult<()> {
        match self.state {
            TrackingState::Idle | TrackingState::PendingStart => {
                self.ride_id = Some(ride_id);
                self.state = TrackingState::PendingStart;
                Ok(())
            }
            other => Err(TrackerError::InvalidState(format!(
                "cannot defer start while {:?}",
                other
            ))),
        }
    }

    /// Consume the pending ride exactly once (PendingStart → Idle)
    pub fn take_pending(&mut self) -> Option<RideId> {
        if self.state != TrackingState::PendingStart {
            return None;
        }
        self.state = TrackingState::Idle;
        self.ride_id.take()
    }

    /// Transition to Active (Idle | PendingStart → Active)
    pub fn activate(&mut self, ride_id: RideId, background_allowed: bool) -> TResult<()> {
        match self.state {
            TrackingState::Idle | TrackingState::PendingStart => {
                self.ride_id = Some(ride_id);
                self.state = TrackingState::Active;
                self.background_allowed = background_allowed;
                self.started_at = Some(Utc::now());
                Ok(())
            }
            TrackingState::Simulating => Err(TrackerError::InvalidState(
                "simulation in progress; stop it before real acquisition".to_string(),
            )),
            other => Err(TrackerError::InvalidState(format!("cannot activate while {:?}", other))),
        }
    }

    /// Transition to Simulating (Idle | PendingStart → Simulating)
    pub fn begin_simulation(&mut self, ride_id: RideId) -> TResult<()> {
        match self.state {
            TrackingState::Idle | TrackingState::PendingStart => {
                self.ride_id = Some(ride_id);
                self.state = TrackingState::Simulating;
                self.started_at = Some(Utc::now());
                Ok(())
            }
            TrackingState::Active => Err(TrackerError::InvalidState(
                "real acquisition in progress; simulation cannot run alongside it".to_string(),
            )),
            other => Err(TrackerError::InvalidState(format!(
                "cannot start simulation while {:?}",
                other
            ))),
        }
    }

    /// Transition to Stopping (Active | Simulating → Stopping).
    /// Returns false when there was nothing to stop.
    pub fn begin_stopping(&mut self) -> bool {
        if self.state.is_tracking() {
            self.state = TrackingState::Stopping;
            true
        } else {
            false
        }
    }

    /// Back to Idle, from any state
    pub fn reset(&mut self) {
        self.ride_id = None;
        self.state = TrackingState::Idle;
        self.background_allowed = false;
        self.started_at = None;
    }
}

impl Default for TrackingSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only tracking snapshot returned by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingStatus {
    pub is_tracking: bool,
    pub ride_id: Option<RideId>,
    pub state: TrackingState,
    pub buffer_size: usize,
    pub last_flush_at: Option<DateTime<Utc>>,
}
