use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::{TResult, TrackerError};
use crate::types::{LocationFix, RideId};

/// Fixes that could not be delivered when a session ended (JSON-serializable)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpooledBatch {
    pub ride_id: RideId,
    pub saved_at: DateTime<Utc>,
    pub fixes: Vec<LocationFix>,
}

impl SpooledBatch {
    pub fn new(ride_id: RideId, fixes: Vec<LocationFix>) -> Self {
        SpooledBatch {
            ride_id,
            saved_at: Utc::now(),
            fixes,
        }
    }

    /// Append newer fixes, keeping arrival order.
    fn merge(&mut self, newer: SpooledBatch) {
        self.fixes.extend(newer.fixes);
        self.saved_at = newer.saved_at;
    }
}

/// Durable store for un-sent fixes, keyed by ride.
pub trait BatchSpool: Send + Sync {
    /// Persist a batch; batches for the same ride accumulate in order.
    fn save(&self, batch: SpooledBatch) -> TResult<()>;

    /// Remove and return everything spooled for `ride_id`.
    fn take(&self, ride_id: RideId) -> TResult<Option<SpooledBatch>>;

    fn rides(&self) -> TResult<Vec<RideId>>;
}

/// One JSON file per ride under a spool directory.
pub struct FileSpool {
    dir: PathBuf,
}

impl FileSpool {
    pub fn new(dir: impl Into<PathBuf>) -> TResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(FileSpool { dir })
    }

    fn path_for(&self, ride_id: RideId) -> PathBuf {
        self.dir.join(format!("ride_{}.json", ride_id))
    }

    fn read(&self, ride_id: RideId) -> TResult<Option<SpooledBatch>> {
        let path = self.path_for(ride_id);
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&text)?))
    }
}

impl BatchSpool for FileSpool {
    fn save(&self, batch: SpooledBatch) -> TResult<()> {
        let merged = match self.read(batch.ride_id)? {
            Some(mut existing) => {
                existing.merge(batch);
                existing
            }
            None => batch,
        };

        // Write-then-rename so a crash never leaves a truncated spool file
        let path = self.path_for(merged.ride_id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&merged)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn take(&self, ride_id: RideId) -> TResult<Option<SpooledBatch>> {
        let batch = self.read(ride_id)?;
        if batch.is_some() {
            fs::remove_file(self.path_for(ride_id))?;
        }
        Ok(batch)
    }

    fn rides(&self) -> TResult<Vec<RideId>> {
        let mut rides = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name
                .strip_prefix("ride_")
                .and_then(|rest| rest.strip_suffix(".json"))
                .and_then(|id| id.parse::<u64>().ok())
            {
                rides.push(RideId(id));
            }
        }
        rides.sort();
        Ok(rides)
    }
}

/// Process-local spool, used when no spool directory is configured.
#[derive(Default)]
pub struct MemorySpool {
    batches: Mutex<HashMap<RideId, SpooledBatch>>,
}

impl MemorySpool {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BatchSpool for MemorySpool {
    fn save(&self, batch: SpooledBatch) -> TResult<()> {
        let mut batches = self
            .batches
            .lock()
            .map_err(|_| TrackerError::Storage("spool lock poisoned".to_string()))?;
        match batches.get_mut(&batch.ride_id) {
            Some(existing) => existing.merge(batch),
            None => {
                batches.insert(batch.ride_id, batch);
            }
        }
        Ok(())
    }

    fn take(&self, ride_id: RideId) -> TResult<Option<SpooledBatch>> {
        let mut batches = self
            .batches
            .lock()
            .map_err(|_| TrackerError::Storage("spool lock poisoned".to_string()))?;
        Ok(batches.remove(&ride_id))
    }

    fn rides(&self) -> TResult<Vec<RideId>> {
        let batches = self
            .batches
            .lock()
            .map_err(|_| TrackerError::Storage("spool lock poisoned".to_string()))?;
        let mut rides: Vec<RideId> = batches.keys().copied().collect();
        rides.sort();
        Ok(rides)
    }
}
