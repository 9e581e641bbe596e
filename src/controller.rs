// controller.rs: public tracking lifecycle API.
//
// Lifecycle operations (start, stop, simulate, verify) are serialized by an
// async operation lock that also owns the running tasks and the
// notification manager. The session state itself sits behind a plain mutex
// so status snapshots never wait on a lifecycle operation in progress.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::api::TrackingBackend;
use crate::config::TrackerConfig;
use crate::error::{TResult, TrackerError};
use crate::flush_timer::FlushTimer;
use crate::notification::NotificationLifecycleManager;
use crate::platform::{AcquisitionProfile, FixSink, LocationSource, PermissionApi, Platform};
use crate::session::{TrackingSession, TrackingState, TrackingStatus};
use crate::simulator::{MotionSimulator, RideRoute, SimulationRequest, SimulationSession};
use crate::spool::{BatchSpool, SpooledBatch};
use crate::types::{AppState, LocationFix, RawFix, RideId};
use crate::uploader::{BufferedUploader, FlushOutcome, UploadStats};

// ─── Fix pump ────────────────────────────────────────────────────────────────

/// Moves platform batches from the subscription sink into the uploader.
struct FixPump {
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl FixPump {
    fn spawn(
        ride_id: RideId,
        mut batches: mpsc::UnboundedReceiver<Vec<RawFix>>,
        uploader: Arc<BufferedUploader>,
    ) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        // Keep whatever the platform already delivered
                        let mut drained = 0;
                        while let Ok(batch) = batches.try_recv() {
                            drained += uploader.append(batch).0;
                        }
                        if drained > 0 {
                            log::debug!("Drained {} pending fixes for ride {}", drained, ride_id);
                        }
                        break;
                    }
                    batch = batches.recv() => {
                        let Some(batch) = batch else {
                            log::warn!("Location updates for ride {} stopped", ride_id);
                            break;
                        };
                        if let Err(e) = uploader.ingest(batch).await {
                            log::warn!("Flush after ingestion failed for ride {}: {}", ride_id, e);
                        }
                    }
                }
            }
        });

        FixPump {
            shutdown: Some(shutdown_tx),
            handle,
        }
    }

    fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Err(e) = (&mut self.handle).await {
            log::warn!("Fix pump ended abnormally: {}", e);
        }
    }
}

// ─── Controller ──────────────────────────────────────────────────────────────

/// Tasks and handles owned by the current session.
struct Running {
    pump: Option<FixPump>,
    simulator: Option<MotionSimulator>,
    flush_timer: Option<FlushTimer>,
    profile: Option<AcquisitionProfile>,
    notification: NotificationLifecycleManager,
}

pub struct TrackingController {
    config: TrackerConfig,
    location: Arc<dyn LocationSource>,
    permissions: Arc<dyn PermissionApi>,
    uploader: Arc<BufferedUploader>,
    spool: Arc<dyn BatchSpool>,
    app_state: watch::Receiver<AppState>,
    session: Mutex<TrackingSession>,
    ops: tokio::sync::Mutex<Running>,
    routes: Mutex<HashMap<RideId, RideRoute>>,
}

impl TrackingController {
    pub fn new(
        config: TrackerConfig,
        platform: Platform,
        backend: Arc<dyn TrackingBackend>,
        spool: Arc<dyn BatchSpool>,
        app_state: watch::Receiver<AppState>,
    ) -> TResult<Self> {
        config.validate()?;
        let uploader = Arc::new(BufferedUploader::new(&config, backend));

        Ok(TrackingController {
            location: platform.location,
            permissions: platform.permissions,
            uploader,
            spool,
            app_state,
            session: Mutex::new(TrackingSession::new()),
            ops: tokio::sync::Mutex::new(Running {
                pump: None,
                simulator: None,
                flush_timer: None,
                profile: None,
                notification: NotificationLifecycleManager::new(platform.notifier),
            }),
            routes: Mutex::new(HashMap::new()),
            config,
        })
    }

    fn lock_session(&self) -> MutexGuard<'_, TrackingSession> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_routes(&self) -> MutexGuard<'_, HashMap<RideId, RideRoute>> {
        self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn uploader(&self) -> &Arc<BufferedUploader> {
        &self.uploader
    }

    // ─── Start ───────────────────────────────────────────────────────────────

    /// Begin tracking `ride_id`.
    ///
    /// Returns `Ok(false)` when the app is backgrounded: the ride is recorded
    /// as pending and started by the lifecycle bridge on the next foreground
    /// transition. Returns `Ok(true)` once fixes are flowing, either from the
    /// platform or from a simulation over the ride's registered route.
    pub async fn start_tracking(&self, ride_id: RideId) -> TResult<bool> {
        let mut running = self.ops.lock().await;

        if !self.location.services_enabled().await {
            log::warn!("Cannot track ride {}: location services disabled", ride_id);
            return Err(TrackerError::ServiceUnavailable);
        }

        let foreground = self.app_state.borrow().is_foreground();
        if !foreground {
            return self.defer_start(&mut running, ride_id).await;
        }

        self.uploader.invalidate_status();
        if let Err(e) = self.teardown(&mut running).await {
            log::warn!("Previous session ended with an error: {}", e);
        }

        if !self.permissions.request_foreground().await.is_granted() {
            log::warn!("Foreground location permission denied for ride {}", ride_id);
            self.lock_session().reset();
            return Err(TrackerError::PermissionDenied);
        }

        let background_allowed = if self.permissions.supports_background() {
            let granted = self.permissions.request_background().await.is_granted();
            if !granted {
                log::warn!("Background location denied; ride {} tracks in foreground only", ride_id);
            }
            granted
        } else {
            false
        };

        running.notification.show(ride_id).await;
        self.uploader.bind(ride_id, false);

        match self.acquire(&mut running, ride_id).await {
            Ok(profile) => {
                let activated = self.lock_session().activate(ride_id, background_allowed);
                if let Err(e) = activated {
                    self.abort_start(&mut running).await;
                    return Err(e);
                }
                self.restore_spooled(ride_id);
                self.start_flush_timer(&mut running);
                log::info!("Tracking ride {} with profile '{}'", ride_id, profile.name);
                Ok(true)
            }
            Err(acquire_err) => {
                let route = self.lock_routes().get(&ride_id).cloned();
                let Some(route) = route else {
                    log::error!("Tracking ride {} failed: {}", ride_id, acquire_err);
                    self.abort_start(&mut running).await;
                    return Err(acquire_err);
                };

                log::warn!(
                    "Acquisition failed for ride {} ({}); simulating along registered route",
                    ride_id,
                    acquire_err
                );
                let request = route.to_request(self.config.sim_default_speed_mps, self.config.fallback_local_only);
                match self.launch_simulation(&mut running, ride_id, &request) {
                    Ok(()) => Ok(true),
                    Err(e) => {
                        self.abort_start(&mut running).await;
                        Err(e)
                    }
                }
            }
        }
    }

    async fn defer_start(&self, running: &mut Running, ride_id: RideId) -> TResult<bool> {
        let current = {
            let session = self.lock_session();
            (session.state(), session.ride_id())
        };

        if current.0.is_tracking() && current.1 == Some(ride_id) {
            log::debug!("Ride {} already tracking; background start ignored", ride_id);
            return Ok(true);
        }
        if current.0.is_tracking() {
            self.teardown(running).await?;
        }

        self.lock_session().defer_start(ride_id)?;
        running.notification.show(ride_id).await;
        log::info!("App in background; ride {} pending until foreground", ride_id);
        Ok(false)
    }

    /// Subscribe with each configured profile in order until one succeeds.
    async fn acquire(&self, running: &mut Running, ride_id: RideId) -> TResult<AcquisitionProfile> {
        let mut failures = Vec::new();

        for profile in &self.config.profiles {
            let (sink, batches) = FixSink::channel();
            match self.location.subscribe(profile, sink).await {
                Ok(()) => {
                    running.pump = Some(FixPump::spawn(ride_id, batches, self.uploader.clone()));
                    running.profile = Some(profile.clone());
                    return Ok(profile.clone());
                }
                Err(e) => {
                    log::warn!("Location subscription '{}' failed: {}", profile.name, e);
                    failures.push(format!("{}: {}", profile.name, e));
                }
            }
        }

        if failures.is_empty() {
            return Err(TrackerError::TrackingStartFailed(
                "no acquisition profiles configured".to_string(),
            ));
        }
        Err(TrackerError::TrackingStartFailed(format!(
            "all acquisition profiles failed ({})",
            failures.join("; ")
        )))
    }

    /// Undo a partially completed start: nothing is left running or shown.
    async fn abort_start(&self, running: &mut Running) {
        if let Some(simulator) = running.simulator.take() {
            simulator.stop().await;
        }
        if running.pump.is_some() {
            let _ = self.location.unsubscribe().await;
        }
        if let Some(pump) = running.pump.take() {
            pump.stop().await;
        }
        running.profile = None;

        let ride_id = self.uploader.bound_ride();
        let residue = self.uploader.unbind();
        if let Some(ride_id) = ride_id {
            if let Err(e) = self.spool_residue(ride_id, residue) {
                log::error!("Lost buffered fixes for ride {}: {}", ride_id, e);
            }
        }

        running.notification.hide().await;
        self.lock_session().reset();
    }

    // ─── Simulation ──────────────────────────────────────────────────────────

    /// Run an intentionally requested simulation. Only allowed while idle.
    pub async fn start_simulation(&self, ride_id: RideId, request: SimulationRequest) -> TResult<()> {
        let mut running = self.ops.lock().await;

        let state = self.lock_session().state();
        if state != TrackingState::Idle {
            return Err(TrackerError::InvalidState(format!(
                "cannot start simulation while {:?}",
                state
            )));
        }

        self.uploader.invalidate_status();
        running.notification.show(ride_id).await;
        self.uploader.bind(ride_id, request.local_only);

        if let Err(e) = self.launch_simulation(&mut running, ride_id, &request) {
            self.abort_start(&mut running).await;
            return Err(e);
        }
        Ok(())
    }

    /// Plan and spawn a simulation, then enter `Simulating`.
    fn launch_simulation(&self, running: &mut Running, ride_id: RideId, request: &SimulationRequest) -> TResult<()> {
        let session = SimulationSession::plan(request, self.config.sim_step())?;
        self.lock_session().begin_simulation(ride_id)?;

        self.uploader.bind(ride_id, request.local_only);
        if !request.local_only {
            self.restore_spooled(ride_id);
        }

        running.simulator = Some(MotionSimulator::spawn(
            ride_id,
            session,
            self.uploader.clone(),
            self.config.sim_accuracy_m,
        ));
        self.start_flush_timer(running);
        Ok(())
    }

    /// End a running simulation and its session.
    pub async fn stop_simulation(&self) -> TResult<()> {
        let mut running = self.ops.lock().await;

        let state = self.lock_session().state();
        match state {
            TrackingState::Simulating => {}
            TrackingState::Idle => return Ok(()),
            other => {
                return Err(TrackerError::InvalidState(format!(
                    "no simulation running ({:?})",
                    other
                )))
            }
        }
        self.teardown(&mut running).await
    }

    /// Progress of the running simulation in [0, 1].
    pub async fn simulation_progress(&self) -> Option<f64> {
        let running = self.ops.lock().await;
        running.simulator.as_ref().map(MotionSimulator::progress)
    }

    /// Fallback geometry for `ride_id`, used if real acquisition fails.
    pub fn register_route(&self, ride_id: RideId, route: RideRoute) {
        self.lock_routes().insert(ride_id, route);
    }

    // ─── Stop ────────────────────────────────────────────────────────────────

    /// End the current session. Idempotent.
    ///
    /// Cancels the simulation and the platform subscription, keeps fixes the
    /// platform already delivered, makes one final flush and hides the
    /// notification. Whatever the final flush could not deliver is spooled
    /// for the next start of the same ride; the buffer is always empty and
    /// the state `Idle` afterwards.
    pub async fn stop_tracking(&self) -> TResult<()> {
        let mut running = self.ops.lock().await;
        self.teardown(&mut running).await
    }

    async fn teardown(&self, running: &mut Running) -> TResult<()> {
        let (state, ride_id) = {
            let mut session = self.lock_session();
            let state = session.state();
            if state.is_tracking() {
                session.begin_stopping();
            }
            (state, session.ride_id())
        };

        if !state.is_tracking() {
            running.notification.hide().await;
            self.lock_session().reset();
            return Ok(());
        }

        if let Some(simulator) = running.simulator.take() {
            simulator.stop().await;
        }
        if let Some(timer) = running.flush_timer.take() {
            timer.stop().await;
        }
        if running.pump.is_some() {
            if let Err(e) = self.location.unsubscribe().await {
                log::debug!("Unsubscribe: {}", e);
            }
        }
        if let Some(pump) = running.pump.take() {
            pump.stop().await;
        }
        running.profile = None;

        match self.uploader.flush().await {
            Ok(FlushOutcome::Deferred { status, retained }) => {
                log::warn!("Final flush deferred (status {:?}); spooling {} fixes", status, retained);
            }
            Ok(outcome) => log::debug!("Final flush: {:?}", outcome),
            Err(e) => log::warn!("Final flush failed: {}", e),
        }

        let residue = self.uploader.unbind();
        let spooled = match ride_id {
            Some(ride_id) => self.spool_residue(ride_id, residue),
            None => Ok(()),
        };

        running.notification.hide().await;
        self.lock_session().reset();
        log::info!("Tracking stopped{}", ride_id.map(|r| format!(" for ride {}", r)).unwrap_or_default());
        spooled
    }

    fn spool_residue(&self, ride_id: RideId, residue: Vec<LocationFix>) -> TResult<()> {
        if residue.is_empty() {
            return Ok(());
        }
        let count = residue.len();
        self.spool.save(SpooledBatch::new(ride_id, residue))?;
        log::info!("Spooled {} undelivered fixes for ride {}", count, ride_id);
        Ok(())
    }

    fn restore_spooled(&self, ride_id: RideId) {
        match self.spool.take(ride_id) {
            Ok(Some(batch)) => {
                log::info!("Re-queued {} spooled fixes for ride {}", batch.fixes.len(), ride_id);
                self.uploader.requeue_front(batch.fixes);
            }
            Ok(None) => {}
            Err(e) => log::warn!("Could not read spool for ride {}: {}", ride_id, e),
        }
    }

    fn start_flush_timer(&self, running: &mut Running) {
        if let Some(period) = self.config.flush_tick() {
            running.flush_timer = Some(FlushTimer::spawn(self.uploader.clone(), period));
        }
    }

    // ─── Status & flushing ───────────────────────────────────────────────────

    pub fn get_tracking_status(&self) -> TrackingStatus {
        let (state, ride_id) = {
            let session = self.lock_session();
            (session.state(), session.ride_id())
        };
        TrackingStatus {
            is_tracking: state.is_tracking(),
            ride_id,
            state,
            buffer_size: self.uploader.len(),
            last_flush_at: self.uploader.last_flush_at(),
        }
    }

    pub fn upload_stats(&self) -> UploadStats {
        self.uploader.stats()
    }

    /// Flush now regardless of thresholds.
    pub async fn force_flush(&self) -> TResult<FlushOutcome> {
        self.uploader.flush().await
    }

    /// Every accepted fix, real or simulated.
    pub fn subscribe_positions(&self) -> broadcast::Receiver<LocationFix> {
        self.uploader.subscribe_positions()
    }

    // ─── Lifecycle hooks ─────────────────────────────────────────────────────

    /// Consume the pending ride, if any. Returns it at most once.
    pub fn take_pending_ride(&self) -> Option<RideId> {
        self.lock_session().take_pending()
    }

    /// Re-subscribe if the platform silently stopped delivering updates.
    /// Returns true when a new subscription was made.
    pub async fn verify_acquisition(&self) -> TResult<bool> {
        let mut running = self.ops.lock().await;

        let (state, ride_id) = {
            let session = self.lock_session();
            (session.state(), session.ride_id())
        };
        let Some(ride_id) = ride_id.filter(|_| state == TrackingState::Active) else {
            return Ok(false);
        };

        let pump_alive = running.pump.as_ref().map(FixPump::is_running).unwrap_or(false);
        if pump_alive && self.location.is_subscribed().await {
            return Ok(false);
        }

        log::warn!("Location updates for ride {} stopped silently; re-acquiring", ride_id);
        let _ = self.location.unsubscribe().await;
        if let Some(pump) = running.pump.take() {
            pump.stop().await;
        }

        match self.acquire(&mut running, ride_id).await {
            Ok(profile) => {
                log::info!("Re-acquired ride {} with profile '{}'", ride_id, profile.name);
                Ok(true)
            }
            Err(e) => Err(TrackerError::SubscriptionFailed(e.to_string())),
        }
    }

    /// Re-create the tracking notification if the OS removed it.
    pub async fn ensure_notification_alive(&self) -> bool {
        let mut running = self.ops.lock().await;
        let state = self.lock_session().state();
        if state.is_tracking() || state == TrackingState::PendingStart {
            running.notification.ensure_alive().await
        } else {
            false
        }
    }

    pub async fn notification_shown(&self) -> bool {
        self.ops.lock().await.notification.is_shown()
    }

    pub async fn active_profile(&self) -> Option<String> {
        self.ops.lock().await.profile.as_ref().map(|p| p.name.clone())
    }
}
