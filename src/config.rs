// config.rs: tunables for acquisition, buffering, flushing and simulation.
//
// Defaults reproduce the mobile client's production values. A JSON file may
// override any subset of fields; missing fields keep their defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{TResult, TrackerError};
use crate::platform::AcquisitionProfile;

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    // ── Backend ──
    pub base_url: String,
    pub auth_token: Option<String>,
    pub request_timeout_secs: u64,

    // ── Ingestion ──
    pub max_accuracy_m: f64,

    // ── Flush policy ──
    pub max_buffer_size: usize,
    pub flush_interval_ms: u64,
    /// Periodic due-check for quiescent buffers; `None` = ingestion-triggered only
    pub flush_tick_ms: Option<u64>,
    pub ride_status_ttl_ms: u64,

    // ── Acquisition (tried in order before simulation) ──
    pub profiles: Vec<AcquisitionProfile>,

    // ── Simulation ──
    pub sim_step_ms: u64,
    pub sim_accuracy_m: f64,
    pub sim_default_speed_mps: f64,
    /// Whether the fallback simulation (after acquisition failure) skips the backend
    pub fallback_local_only: bool,

    // ── Spool ──
    pub spool_dir: Option<String>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        TrackerConfig {
            base_url: "http://localhost:8081/api/v1".to_string(),
            auth_token: None,
            request_timeout_secs: 30,
            max_accuracy_m: 50.0,
            max_buffer_size: 5,
            flush_interval_ms: 30_000,
            flush_tick_ms: None,
            ride_status_ttl_ms: 30_000,
            profiles: vec![AcquisitionProfile::full(), AcquisitionProfile::degraded()],
            sim_step_ms: 2_000,
            sim_accuracy_m: 5.0,
            sim_default_speed_mps: 8.33,
            fallback_local_only: false,
            spool_dir: None,
        }
    }
}

impl TrackerConfig {
    /// Load from a JSON file, falling back to defaults for absent fields.
    pub fn from_json_file(path: impl AsRef<Path>) -> TResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| TrackerError::Config(format!("{}: {}", path.display(), e)))?;
        let config: TrackerConfig = serde_json::from_str(&text)
            .map_err(|e| TrackerError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> TResult<()> {
        if self.max_buffer_size == 0 {
            return Err(TrackerError::Config("max_buffer_size must be > 0".to_string()));
        }
        if self.sim_step_ms == 0 {
            return Err(TrackerError::Config("sim_step_ms must be > 0".to_string()));
        }
        if self.max_accuracy_m.is_nan() || self.max_accuracy_m <= 0.0 {
            return Err(TrackerError::Config("max_accuracy_m must be positive".to_string()));
        }
        if self.flush_tick_ms == Some(0) {
            return Err(TrackerError::Config("flush_tick_ms must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn flush_tick(&self) -> Option<Duration> {
        self.flush_tick_ms.map(Duration::from_millis)
    }

    pub fn ride_status_ttl(&self) -> Duration {
        Duration::from_millis(self.ride_status_ttl_ms)
    }

    pub fn sim_step(&self) -> Duration {
        Duration::from_millis(self.sim_step_ms)
    }
}
