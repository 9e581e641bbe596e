//! Ride location tracking: acquisition, buffering, batched upload and
//! simulated movement for a ride-sharing client.
//!
//! [`controller::TrackingController`] is the entry point. Hosts provide
//! platform implementations ([`platform::Platform`]) and a backend
//! ([`api::TrackingBackend`]); [`lifecycle::AppLifecycleBridge`] feeds app
//! foreground/background transitions back into the controller.

pub mod api;
pub mod config;
pub mod controller;
pub mod error;
pub mod flush_timer;
pub mod geo;
pub mod lifecycle;
pub mod live_status;
pub mod notification;
pub mod platform;
pub mod session;
pub mod simulator;
pub mod spool;
pub mod types;
pub mod uploader;

#[cfg(test)]
mod testing;

pub use api::{HttpBackend, RideStatus, TrackingBackend};
pub use config::TrackerConfig;
pub use controller::TrackingController;
pub use error::{TResult, TrackerError};
pub use lifecycle::AppLifecycleBridge;
pub use session::{TrackingState, TrackingStatus};
pub use simulator::{RideRoute, SimulationRequest};
pub use types::{AppState, GeoPoint, LocationFix, RawFix, RideId};
pub use uploader::FlushOutcome;
