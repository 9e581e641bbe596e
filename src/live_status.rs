use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::controller::TrackingController;
use crate::session::TrackingStatus;
use crate::uploader::UploadStats;

/// Snapshot written to disk for dashboards and shell scripts.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LiveStatus {
    pub timestamp: DateTime<Utc>,
    pub tracking: TrackingStatus,
    pub uploads: UploadStats,
    pub active_profile: Option<String>,
    pub simulation_progress: Option<f64>,
    // Last accepted position
    pub last_lat: Option<f64>,
    pub last_lng: Option<f64>,
    pub last_accuracy_m: Option<f64>,
}

impl LiveStatus {
    pub async fn capture(controller: &TrackingController) -> Self {
        let last = controller.uploader().last_fix();
        Self {
            timestamp: Utc::now(),
            tracking: controller.get_tracking_status(),
            uploads: controller.upload_stats(),
            active_profile: controller.active_profile().await,
            simulation_progress: controller.simulation_progress().await,
            last_lat: last.as_ref().map(|f| f.latitude),
            last_lng: last.as_ref().map(|f| f.longitude),
            last_accuracy_m: last.as_ref().map(|f| f.accuracy_m),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}
