// uploader.rs: fix buffer, flush policy and ride-status cache.
//
// The buffer lock is never held across an await. A flush copies the
// buffered fixes, releases the lock for the network round trip, and on
// success drains exactly the transmitted prefix, so fixes ingested while a
// request is in flight stay queued for the next flush.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::api::{RideStatus, TrackingBackend, TrackingReceipt};
use crate::config::TrackerConfig;
use crate::error::{TResult, TrackerError};
use crate::types::{LocationFix, RideId, TrackPoint};

/// Result of one flush attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    /// Nothing buffered (or no session bound)
    Empty,
    /// Batch accepted by the backend and removed from the buffer
    Sent { count: usize, receipt: TrackingReceipt },
    /// Ride not ongoing (or status unknown); buffer retained
    Deferred { status: Option<RideStatus>, retained: usize },
    /// Local-only session: fixes cleared without transmission
    Discarded { count: usize },
    /// Another flush holds the gate; nothing done
    InFlight,
}

/// Result of one ingestion call.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestOutcome {
    pub accepted: usize,
    pub rejected: usize,
    pub flush: Option<FlushOutcome>,
}

/// Cumulative upload counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadStats {
    pub batches_sent: u64,
    /// Fixes removed from the buffer after an accepted upload. Fixes posted
    /// while the buffer was requeued or unbound stay buffered and are not
    /// counted until a later upload drains them.
    pub points_sent: u64,
    pub points_discarded: u64,
    pub deferred_flushes: u64,
    pub failed_flushes: u64,
    pub rejected_fixes: u64,
}

#[derive(Debug, Clone, Copy)]
struct UploadTarget {
    ride_id: RideId,
    local_only: bool,
}

#[derive(Debug, Clone, Copy)]
struct CachedStatus {
    ride_id: RideId,
    value: RideStatus,
    fetched_at: Instant,
}

struct BufferState {
    target: Option<UploadTarget>,
    fixes: VecDeque<LocationFix>,
    last_flush_at: Instant,
    last_flush_wall: Option<DateTime<Utc>>,
    status_cache: Option<CachedStatus>,
    last_fix: Option<LocationFix>,
    stats: UploadStats,
}

/// Buffers accepted fixes and batches them to the backend.
pub struct BufferedUploader {
    backend: Arc<dyn TrackingBackend>,
    max_accuracy_m: f64,
    max_buffer_size: usize,
    flush_interval: Duration,
    status_ttl: Duration,
    state: Mutex<BufferState>,
    flush_gate: tokio::sync::Mutex<()>,
    positions: broadcast::Sender<LocationFix>,
}

impl BufferedUploader {
    pub fn new(config: &TrackerConfig, backend: Arc<dyn TrackingBackend>) -> Self {
        let (positions, _) = broadcast::channel(64);
        BufferedUploader {
            backend,
            max_accuracy_m: config.max_accuracy_m,
            max_buffer_size: config.max_buffer_size,
            flush_interval: config.flush_interval(),
            status_ttl: config.ride_status_ttl(),
            state: Mutex::new(BufferState {
                target: None,
                fixes: VecDeque::new(),
                last_flush_at: Instant::now(),
                last_flush_wall: None,
                status_cache: None,
                last_fix: None,
                stats: UploadStats::default(),
            }),
            flush_gate: tokio::sync::Mutex::new(()),
            positions,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, BufferState> {
        // A panic while holding the lock cannot leave the buffer half-written
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ─── Session binding ─────────────────────────────────────────────────────

    /// Start accepting fixes for `ride_id`; the flush interval restarts now.
    pub fn bind(&self, ride_id: RideId, local_only: bool) {
        let mut state = self.lock_state();
        state.target = Some(UploadTarget { ride_id, local_only });
        state.last_flush_at = Instant::now();
    }

    /// Stop accepting fixes and hand back whatever is still buffered.
    pub fn unbind(&self) -> Vec<LocationFix> {
        let mut state = self.lock_state();
        state.target = None;
        state.fixes.drain(..).collect()
    }

    pub fn bound_ride(&self) -> Option<RideId> {
        self.lock_state().target.map(|t| t.ride_id)
    }

    pub fn is_local_only(&self) -> bool {
        self.lock_state().target.map(|t| t.local_only).unwrap_or(false)
    }

    /// Put previously spooled fixes ahead of anything buffered since.
    pub fn requeue_front(&self, fixes: Vec<LocationFix>) {
        let mut state = self.lock_state();
        if state.target.is_none() {
            log::warn!("Dropping requeue of {} fixes: no ride bound", fixes.len());
            return;
        }
        for fix in fixes.into_iter().rev() {
            state.fixes.push_front(fix);
        }
    }

    // ─── Ingestion ───────────────────────────────────────────────────────────

    /// Filter and append fixes without evaluating the flush condition.
    pub fn append<I, F>(&self, fixes: I) -> (usize, usize)
    where
        I: IntoIterator<Item = F>,
        F: Into<LocationFix>,
    {
        let mut state = self.lock_state();
        if state.target.is_none() {
            log::debug!("Ignoring fixes: no ride bound");
            return (0, 0);
        }

        let mut accepted = 0;
        let mut rejected = 0;
        for fix in fixes {
            let fix: LocationFix = fix.into();
            // NaN accuracy fails the comparison and is rejected too
            if fix.accuracy_m <= self.max_accuracy_m {
                let _ = self.positions.send(fix.clone());
                state.last_fix = Some(fix.clone());
                state.fixes.push_back(fix);
                accepted += 1;
            } else {
                rejected += 1;
            }
        }
        state.stats.rejected_fixes += rejected as u64;
        (accepted, rejected)
    }

    /// Append fixes, then flush if the buffer is full or the interval elapsed.
    pub async fn ingest<I, F>(&self, fixes: I) -> TResult<IngestOutcome>
    where
        I: IntoIterator<Item = F>,
        F: Into<LocationFix>,
    {
        let (accepted, rejected) = self.append(fixes);

        let flush = if self.should_flush() {
            Some(self.try_flush().await?)
        } else {
            None
        };

        Ok(IngestOutcome {
            accepted,
            rejected,
            flush,
        })
    }

    /// Buffer non-empty and (size threshold reached or interval elapsed).
    pub fn should_flush(&self) -> bool {
        let state = self.lock_state();
        !state.fixes.is_empty()
            && (state.fixes.len() >= self.max_buffer_size
                || state.last_flush_at.elapsed() >= self.flush_interval)
    }

    // ─── Flushing ────────────────────────────────────────────────────────────

    /// Flush now, waiting for any in-flight flush to finish first.
    pub async fn flush(&self) -> TResult<FlushOutcome> {
        let _gate = self.flush_gate.lock().await;
        self.flush_gated().await
    }

    /// Flush only if the policy says so; used by the periodic tick.
    pub async fn flush_if_due(&self) -> TResult<Option<FlushOutcome>> {
        if !self.should_flush() {
            return Ok(None);
        }
        self.try_flush().await.map(Some)
    }

    /// Threshold-triggered flush: skipped when another flush is in flight,
    /// the condition is re-evaluated on the next ingestion.
    async fn try_flush(&self) -> TResult<FlushOutcome> {
        match self.flush_gate.try_lock() {
            Ok(_gate) => self.flush_gated().await,
            Err(_) => Ok(FlushOutcome::InFlight),
        }
    }

    async fn flush_gated(&self) -> TResult<FlushOutcome> {
        let (target, batch) = {
            let state = self.lock_state();
            match state.target {
                Some(target) if !state.fixes.is_empty() => {
                    (target, state.fixes.iter().cloned().collect::<Vec<_>>())
                }
                _ => return Ok(FlushOutcome::Empty),
            }
        };
        let count = batch.len();

        if target.local_only {
            let mut state = self.lock_state();
            let n = count.min(state.fixes.len());
            state.fixes.drain(..n);
            state.last_flush_at = Instant::now();
            state.last_flush_wall = Some(Utc::now());
            state.stats.points_discarded += n as u64;
            log::debug!("Local-only session: cleared {} simulated fixes", n);
            return Ok(FlushOutcome::Discarded { count: n });
        }

        let status = self.ride_status(target.ride_id).await;
        if !status.map(RideStatus::accepts_tracking).unwrap_or(false) {
            self.lock_state().stats.deferred_flushes += 1;
            log::info!(
                "Ride {} status {:?}; deferring flush of {} fixes",
                target.ride_id,
                status,
                count
            );
            return Ok(FlushOutcome::Deferred {
                status,
                retained: count,
            });
        }

        let points: Vec<TrackPoint> = batch.iter().map(TrackPoint::from).collect();
        match self.backend.post_track(target.ride_id, &points).await {
            Ok(receipt) => {
                let mut state = self.lock_state();
                // The buffer may have been unbound or requeued meanwhile;
                // only drop fixes that are still the ones we sent.
                let sent_prefix = state
                    .fixes
                    .iter()
                    .zip(batch.iter())
                    .take_while(|(buffered, sent)| buffered == sent)
                    .count();
                state.fixes.drain(..sent_prefix);
                state.last_flush_at = Instant::now();
                state.last_flush_wall = Some(Utc::now());
                state.stats.batches_sent += 1;
                state.stats.points_sent += sent_prefix as u64;
                log::info!(
                    "Sent {} location points for ride {} (distance {:?} km)",
                    count,
                    target.ride_id,
                    receipt.current_distance_km
                );
                Ok(FlushOutcome::Sent { count, receipt })
            }
            Err(e) => {
                self.lock_state().stats.failed_flushes += 1;
                log::warn!(
                    "Failed to send {} location points for ride {}: {}",
                    count,
                    target.ride_id,
                    e
                );
                Err(TrackerError::from(e))
            }
        }
    }

    // ─── Ride status cache ───────────────────────────────────────────────────

    /// Cached ride status lookup; a failed fetch is never fatal.
    pub async fn ride_status(&self, ride_id: RideId) -> Option<RideStatus> {
        if let Some(status) = self.cached_status(ride_id) {
            return Some(status);
        }

        match self.backend.fetch_ride(ride_id).await {
            Ok(snapshot) => {
                self.lock_state().status_cache = Some(CachedStatus {
                    ride_id,
                    value: snapshot.status,
                    fetched_at: Instant::now(),
                });
                Some(snapshot.status)
            }
            Err(e) => {
                log::warn!("Ride status lookup for {} failed: {}", ride_id, e);
                // A concurrent lookup may have refreshed the cache meanwhile
                self.cached_status(ride_id)
            }
        }
    }

    fn cached_status(&self, ride_id: RideId) -> Option<RideStatus> {
        let state = self.lock_state();
        state
            .status_cache
            .filter(|c| c.ride_id == ride_id && c.fetched_at.elapsed() < self.status_ttl)
            .map(|c| c.value)
    }

    pub fn invalidate_status(&self) {
        self.lock_state().status_cache = None;
    }

    // ─── Introspection ───────────────────────────────────────────────────────

    pub fn len(&self) -> usize {
        self.lock_state().fixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn buffered(&self) -> Vec<LocationFix> {
        self.lock_state().fixes.iter().cloned().collect()
    }

    /// Most recently accepted fix, flushed or not.
    pub fn last_fix(&self) -> Option<LocationFix> {
        self.lock_state().last_fix.clone()
    }

    pub fn last_flush_at(&self) -> Option<DateTime<Utc>> {
        self.lock_state().last_flush_wall
    }

    pub fn stats(&self) -> UploadStats {
        self.lock_state().stats.clone()
    }

    /// Every accepted fix, real or simulated.
    pub fn subscribe_positions(&self) -> broadcast::Receiver<LocationFix> {
        self.positions.subscribe()
    }
}
