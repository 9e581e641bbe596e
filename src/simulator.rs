// simulator.rs: synthetic movement along a route or a straight line.
//
// SimulationSession is the pure planner (distance, duration, progress per
// step). MotionSimulator drives it from a tokio interval and feeds every
// position through the same ingestion path as platform fixes.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::error::{TResult, TrackerError};
use crate::geo::{decode_polyline, haversine_distance, interpolate_route, lerp, path_length};
use crate::types::{GeoPoint, LocationFix, RideId};
use crate::uploader::BufferedUploader;

/// Progress within this distance of 1.0 counts as arrived.
const COMPLETION_EPSILON: f64 = 1e-9;

// ─── Requests ────────────────────────────────────────────────────────────────

/// Parameters for one simulated trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationRequest {
    pub start: GeoPoint,
    pub end: GeoPoint,
    pub speed_mps: f64,
    #[serde(default)]
    pub route_points: Option<Vec<GeoPoint>>,
    /// Google encoded polyline, used when `route_points` is absent
    #[serde(default)]
    pub polyline: Option<String>,
    /// Fixes are buffered and cleared locally, never transmitted
    #[serde(default)]
    pub local_only: bool,
}

impl SimulationRequest {
    pub fn new(start: GeoPoint, end: GeoPoint, speed_mps: f64) -> Self {
        SimulationRequest {
            start,
            end,
            speed_mps,
            route_points: None,
            polyline: None,
            local_only: false,
        }
    }

    pub fn with_route(mut self, points: Vec<GeoPoint>) -> Self {
        self.route_points = Some(points);
        self
    }

    pub fn with_polyline(mut self, encoded: impl Into<String>) -> Self {
        self.polyline = Some(encoded.into());
        self
    }

    pub fn local_only(mut self, local_only: bool) -> Self {
        self.local_only = local_only;
        self
    }

    /// Explicit points win over the polyline; fewer than two points means
    /// a straight line between start and end.
    fn resolved_route(&self) -> Option<Vec<GeoPoint>> {
        let points = match (&self.route_points, &self.polyline) {
            (Some(points), _) => points.clone(),
            (None, Some(encoded)) => decode_polyline(encoded),
            (None, None) => return None,
        };
        (points.len() >= 2).then_some(points)
    }
}

/// Fallback geometry registered for a ride, used when real acquisition fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideRoute {
    pub start: GeoPoint,
    pub end: GeoPoint,
    #[serde(default)]
    pub route_points: Option<Vec<GeoPoint>>,
}

impl RideRoute {
    pub fn new(start: GeoPoint, end: GeoPoint) -> Self {
        RideRoute {
            start,
            end,
            route_points: None,
        }
    }

    pub fn from_polyline(start: GeoPoint, end: GeoPoint, encoded: &str) -> Self {
        let points = decode_polyline(encoded);
        RideRoute {
            start,
            end,
            route_points: (!points.is_empty()).then_some(points),
        }
    }

    pub fn to_request(&self, speed_mps: f64, local_only: bool) -> SimulationRequest {
        SimulationRequest {
            start: self.start,
            end: self.end,
            speed_mps,
            route_points: self.route_points.clone(),
            polyline: None,
            local_only,
        }
    }
}

// ─── Session planner ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SimulationSession {
    start: GeoPoint,
    end: GeoPoint,
    route: Option<Vec<GeoPoint>>,
    speed_mps: f64,
    local_only: bool,
    total_distance_m: f64,
    duration_secs: f64,
    duration: Duration,
    step: Duration,
    steps_taken: u64,
    progress: f64,
}

impl SimulationSession {
    pub fn plan(request: &SimulationRequest, step: Duration) -> TResult<Self> {
        if !request.speed_mps.is_finite() || request.speed_mps <= 0.0 {
            return Err(TrackerError::InvalidState(format!(
                "simulation speed must be positive, got {}",
                request.speed_mps
            )));
        }
        if step.is_zero() {
            return Err(TrackerError::Config("simulation step must be > 0".to_string()));
        }

        let route = request.resolved_route();
        let total_distance_m = match &route {
            Some(points) => path_length(points),
            None => haversine_distance(request.start, request.end),
        };
        let duration_secs = total_distance_m / request.speed_mps;
        let duration = Duration::try_from_secs_f64(duration_secs).map_err(|_| {
            TrackerError::InvalidState(format!(
                "{:.0} m at {} m/s is not a representable trip duration",
                total_distance_m, request.speed_mps
            ))
        })?;

        Ok(SimulationSession {
            start: request.start,
            end: request.end,
            route,
            speed_mps: request.speed_mps,
            local_only: request.local_only,
            total_distance_m,
            duration_secs,
            duration,
            step,
            steps_taken: 0,
            progress: 0.0,
        })
    }

    pub fn total_distance_m(&self) -> f64 {
        self.total_distance_m
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn speed_mps(&self) -> f64 {
        self.speed_mps
    }

    pub fn step(&self) -> Duration {
        self.step
    }

    pub fn is_local_only(&self) -> bool {
        self.local_only
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn is_complete(&self) -> bool {
        self.progress >= 1.0
    }

    pub fn position_at(&self, progress: f64) -> GeoPoint {
        match &self.route {
            Some(points) => interpolate_route(points, progress).unwrap_or(self.end),
            None => lerp(self.start, self.end, progress),
        }
    }

    /// Advance one step and return the new position; `None` once arrived.
    pub fn advance(&mut self) -> Option<GeoPoint> {
        if self.is_complete() {
            return None;
        }
        self.steps_taken += 1;
        let elapsed = self.steps_taken as f64 * self.step.as_secs_f64();
        let progress = if self.duration_secs > 0.0 {
            (elapsed / self.duration_secs).min(1.0)
        } else {
            1.0
        };
        self.progress = if progress >= 1.0 - COMPLETION_EPSILON {
            1.0
        } else {
            progress
        };
        Some(self.position_at(self.progress))
    }
}

// ─── Runner ──────────────────────────────────────────────────────────────────

/// Background task stepping a SimulationSession into the uploader.
pub struct MotionSimulator {
    ride_id: RideId,
    local_only: bool,
    progress: watch::Receiver<f64>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl MotionSimulator {
    pub fn spawn(
        ride_id: RideId,
        mut session: SimulationSession,
        uploader: Arc<BufferedUploader>,
        accuracy_m: f64,
    ) -> Self {
        let (progress_tx, progress) = watch::channel(0.0);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let local_only = session.is_local_only();

        log::info!(
            "Simulating ride {}: {:.0} m at {:.2} m/s ({:.1} s{})",
            ride_id,
            session.total_distance_m(),
            session.speed_mps(),
            session.duration().as_secs_f64(),
            if local_only { ", local only" } else { "" }
        );

        let handle = tokio::spawn(async move {
            let step = session.step();
            let mut ticker = interval_at(Instant::now() + step, step);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        log::debug!("Simulation for ride {} cancelled", ride_id);
                        break;
                    }
                    _ = ticker.tick() => {}
                }

                let Some(point) = session.advance() else { break };
                let _ = progress_tx.send(session.progress());

                let fix = LocationFix::synthetic(point, accuracy_m);
                if let Err(e) = uploader.ingest(std::iter::once(fix)).await {
                    log::warn!("Simulated fix for ride {} not flushed: {}", ride_id, e);
                }

                if session.is_complete() {
                    log::info!("Simulation for ride {} reached destination", ride_id);
                    break;
                }
            }
        });

        MotionSimulator {
            ride_id,
            local_only,
            progress,
            shutdown: Some(shutdown_tx),
            handle,
        }
    }

    pub fn ride_id(&self) -> RideId {
        self.ride_id
    }

    pub fn is_local_only(&self) -> bool {
        self.local_only
    }

    pub fn progress(&self) -> f64 {
        *self.progress.borrow()
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Cancel the timer and wait for an in-progress step to finish.
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Err(e) = (&mut self.handle).await {
            log::warn!("Simulation task for ride {} ended abnormally: {}", self.ride_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{RideStatus, TrackingBackend};
    use crate::config::TrackerConfig;
    use crate::geo::EARTH_RADIUS_M;
    use crate::testing::MockBackend;
    use approx::assert_relative_eq;

    /// Start and end exactly `meters` apart along a meridian.
    fn north_of_origin(meters: f64) -> (GeoPoint, GeoPoint) {
        let d_lat = (meters / EARTH_RADIUS_M).to_degrees();
        (GeoPoint::new(0.0, 0.0), GeoPoint::new(d_lat, 0.0))
    }

    #[test]
    fn test_hundred_meters_at_ten_mps_takes_five_steps() {
        let (start, end) = north_of_origin(100.0);
        let request = SimulationRequest::new(start, end, 10.0);
        let mut session = SimulationSession::plan(&request, Duration::from_secs(2)).unwrap();

        assert_relative_eq!(session.total_distance_m(), 100.0, epsilon = 1e-6);
        assert_relative_eq!(session.duration().as_secs_f64(), 10.0, epsilon = 1e-6);

        let mut positions = Vec::new();
        while let Some(point) = session.advance() {
            positions.push(point);
        }
        assert_eq!(positions.len(), 5);
        assert!(session.is_complete());
        assert_relative_eq!(positions[0].lat, end.lat * 0.2, epsilon = 1e-12);
        assert_eq!(*positions.last().unwrap(), end);
    }

    #[test]
    fn test_route_interpolation_uses_segment_index() {
        let route = vec![
            GeoPoint::new(0.0, 0.0),
            GeoPoint::new(0.001, 0.0),
            GeoPoint::new(0.001, 0.001),
        ];
        let request = SimulationRequest::new(route[0], route[2], 5.0).with_route(route.clone());
        let session = SimulationSession::plan(&request, Duration::from_secs(2)).unwrap();

        assert_relative_eq!(session.total_distance_m(), path_length(&route));
        // Halfway by index lands on the middle vertex
        let mid = session.position_at(0.5);
        assert_relative_eq!(mid.lat, 0.001, epsilon = 1e-12);
        assert_relative_eq!(mid.lng, 0.0, epsilon = 1e-12);
        assert_eq!(session.position_at(1.0), route[2]);
    }

    #[test]
    fn test_polyline_route_and_degenerate_inputs() {
        let start = GeoPoint::new(38.5, -120.2);
        let end = GeoPoint::new(43.252, -126.453);
        let request =
            SimulationRequest::new(start, end, 10.0).with_polyline("_p~iF~ps|U_ulLnnqC_mqNvxq`@");
        let session = SimulationSession::plan(&request, Duration::from_secs(2)).unwrap();
        assert!(session.total_distance_m() > haversine_distance(start, end));

        // A single-point route falls back to the straight line
        let request = SimulationRequest::new(start, end, 10.0).with_route(vec![start]);
        let session = SimulationSession::plan(&request, Duration::from_secs(2)).unwrap();
        assert_relative_eq!(session.total_distance_m(), haversine_distance(start, end));

        // Zero-length trip arrives on the first step
        let request = SimulationRequest::new(start, start, 10.0);
        let mut session = SimulationSession::plan(&request, Duration::from_secs(2)).unwrap();
        assert_eq!(session.advance(), Some(start));
        assert_eq!(session.advance(), None);

        let request = SimulationRequest::new(start, end, 0.0);
        assert!(SimulationSession::plan(&request, Duration::from_secs(2)).is_err());
    }

    #[test]
    fn test_unrepresentable_trip_duration_rejected() {
        // 100 km at 1e-15 m/s would last longer than a Duration can hold
        let (start, end) = north_of_origin(100_000.0);
        let request = SimulationRequest::new(start, end, 1e-15);
        let result = SimulationSession::plan(&request, Duration::from_secs(2));
        assert!(matches!(result, Err(TrackerError::InvalidState(_))));

        // Slow but representable trips still plan
        let request = SimulationRequest::new(start, end, 1e-3);
        let session = SimulationSession::plan(&request, Duration::from_secs(2)).unwrap();
        assert_relative_eq!(session.duration().as_secs_f64(), 1e8, max_relative = 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulator_feeds_uploader_until_arrival() {
        let backend = Arc::new(MockBackend::with_status(RideStatus::Ongoing));
        let dyn_backend: Arc<dyn TrackingBackend> = backend.clone();
        let uploader = Arc::new(BufferedUploader::new(&TrackerConfig::default(), dyn_backend));
        uploader.bind(RideId(3), false);
        let mut feed = uploader.subscribe_positions();

        let (start, end) = north_of_origin(100.0);
        let session =
            SimulationSession::plan(&SimulationRequest::new(start, end, 10.0), Duration::from_secs(2))
                .unwrap();
        let started = Instant::now();
        let simulator = MotionSimulator::spawn(RideId(3), session, uploader.clone(), 5.0);
        assert!(simulator.is_running());

        // Four of five steps done just before the tenth second
        tokio::time::sleep(Duration::from_millis(9_900)).await;
        assert!(simulator.is_running());
        assert!(simulator.progress() < 1.0);
        assert_relative_eq!(simulator.progress(), 0.8, epsilon = 1e-6);

        tokio::time::sleep(Duration::from_millis(100)).await;
        for _ in 0..50 {
            if !simulator.is_running() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(Instant::now() - started, Duration::from_secs(10));
        assert!(!simulator.is_running());
        assert_eq!(simulator.progress(), 1.0);

        let mut received = Vec::new();
        while let Ok(fix) = feed.try_recv() {
            received.push(fix);
        }
        assert_eq!(received.len(), 5);
        assert!(received.iter().all(|f| f.accuracy_m == 5.0));

        // The fifth fix filled the buffer and triggered a flush
        assert_eq!(backend.posted_points(), 5);
        assert!(uploader.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_steps() {
        let backend = Arc::new(MockBackend::with_status(RideStatus::Ongoing));
        let dyn_backend: Arc<dyn TrackingBackend> = backend.clone();
        let uploader = Arc::new(BufferedUploader::new(&TrackerConfig::default(), dyn_backend));
        uploader.bind(RideId(3), true);

        let (start, end) = north_of_origin(1_000.0);
        let session =
            SimulationSession::plan(&SimulationRequest::new(start, end, 10.0), Duration::from_secs(2))
                .unwrap();
        let simulator = MotionSimulator::spawn(RideId(3), session, uploader.clone(), 5.0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(uploader.len(), 2);
        simulator.stop().await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(uploader.len(), 2);
    }
}
