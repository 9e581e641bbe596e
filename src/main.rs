use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{sleep, Duration, Instant};

use ride_tracker_rs::api::{ApiError, RideSnapshot, TrackingReceipt};
use ride_tracker_rs::live_status::LiveStatus;
use ride_tracker_rs::platform::headless::HeadlessLocation;
use ride_tracker_rs::platform::Platform;
use ride_tracker_rs::spool::{BatchSpool, FileSpool, MemorySpool};
use ride_tracker_rs::types::TrackPoint;
use ride_tracker_rs::{
    AppLifecycleBridge, AppState, GeoPoint, HttpBackend, RawFix, RideId, RideRoute, RideStatus,
    SimulationRequest, TrackerConfig, TrackingBackend, TrackingController,
};

#[derive(Parser, Debug)]
#[command(name = "ride_tracker")]
#[command(about = "Track a ride from a recorded GPS file or a simulated trip", long_about = None)]
struct Args {
    /// Run time in seconds (0 = until the simulation arrives or Ctrl-C)
    #[arg(value_name = "SECONDS", default_value = "0")]
    duration: u64,

    /// Ride to track
    #[arg(long)]
    ride_id: u64,

    /// JSON config file; CLI flags override it
    #[arg(long)]
    config: Option<String>,

    /// Backend base URL
    #[arg(long)]
    base_url: Option<String>,

    /// Static bearer token
    #[arg(long, env = "RIDE_TRACKER_TOKEN")]
    token: Option<String>,

    /// Trip start as "lat,lng"
    #[arg(long, value_parser = parse_point)]
    from: Option<GeoPoint>,

    /// Trip end as "lat,lng"
    #[arg(long, value_parser = parse_point)]
    to: Option<GeoPoint>,

    /// Encoded route polyline between --from and --to
    #[arg(long)]
    polyline: Option<String>,

    /// Simulated speed in m/s
    #[arg(long)]
    speed: Option<f64>,

    /// Run an explicit simulation instead of real acquisition
    #[arg(long)]
    simulate: bool,

    /// Simulated fixes are never sent to the backend
    #[arg(long)]
    local_only: bool,

    /// Replay a JSON array of raw fixes as the GPS source
    #[arg(long)]
    replay: Option<String>,

    /// Milliseconds between replayed fixes
    #[arg(long, default_value = "1000")]
    replay_cadence_ms: u64,

    /// Log uploads instead of sending them
    #[arg(long)]
    dry_run: bool,

    /// Write a live status JSON file every few seconds
    #[arg(long)]
    status_file: Option<String>,

    /// Directory for undelivered fixes
    #[arg(long)]
    spool_dir: Option<String>,
}

fn parse_point(s: &str) -> Result<GeoPoint, String> {
    let (lat, lng) = s
        .split_once(',')
        .ok_or_else(|| format!("expected \"lat,lng\", got \"{}\"", s))?;
    let lat: f64 = lat.trim().parse().map_err(|e| format!("latitude: {}", e))?;
    let lng: f64 = lng.trim().parse().map_err(|e| format!("longitude: {}", e))?;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
        return Err(format!("coordinate out of range: {}", s));
    }
    Ok(GeoPoint::new(lat, lng))
}

/// Accepts every upload and reports every ride as ongoing.
struct DryRunBackend;

#[async_trait]
impl TrackingBackend for DryRunBackend {
    async fn post_track(&self, ride_id: RideId, points: &[TrackPoint]) -> Result<TrackingReceipt, ApiError> {
        for p in points {
            log::info!("[dry-run] ride {} @ {} ({:.6}, {:.6}) ±{:.0} m", ride_id, p.timestamp, p.lat, p.lng, p.accuracy);
        }
        Ok(TrackingReceipt::default())
    }

    async fn fetch_ride(&self, _ride_id: RideId) -> Result<RideSnapshot, ApiError> {
        Ok(RideSnapshot {
            status: RideStatus::Ongoing,
        })
    }
}

fn load_config(args: &Args) -> Result<TrackerConfig> {
    let mut config = match &args.config {
        Some(path) => TrackerConfig::from_json_file(path)?,
        None => TrackerConfig::default(),
    };
    if let Some(base_url) = &args.base_url {
        config.base_url = base_url.clone();
    }
    if args.token.is_some() {
        config.auth_token = args.token.clone();
    }
    if let Some(speed) = args.speed {
        config.sim_default_speed_mps = speed;
    }
    if args.local_only {
        config.fallback_local_only = true;
    }
    if args.spool_dir.is_some() {
        config.spool_dir = args.spool_dir.clone();
    }
    config.validate()?;
    Ok(config)
}

fn load_track(path: &str) -> Result<Vec<RawFix>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
    let track: Vec<RawFix> = serde_json::from_str(&text).with_context(|| format!("parsing {}", path))?;
    if track.is_empty() {
        bail!("{} contains no fixes", path);
    }
    Ok(track)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = load_config(&args)?;
    let ride_id = RideId(args.ride_id);

    log::info!("Ride Tracker starting");
    log::info!("  Ride: {}", ride_id);
    log::info!("  Backend: {}", if args.dry_run { "dry run" } else { config.base_url.as_str() });
    log::info!("  Duration: {} seconds (0=until done)", args.duration);

    let backend: Arc<dyn TrackingBackend> = if args.dry_run {
        Arc::new(DryRunBackend)
    } else {
        Arc::new(HttpBackend::new(
            &config.base_url,
            config.auth_token.clone(),
            Duration::from_secs(config.request_timeout_secs),
        ))
    };

    let spool: Arc<dyn BatchSpool> = match &config.spool_dir {
        Some(dir) => Arc::new(FileSpool::new(dir)?),
        None => Arc::new(MemorySpool::new()),
    };

    let mut platform = Platform::headless();
    if let Some(path) = &args.replay {
        let track = load_track(path)?;
        log::info!("  Replaying {} fixes from {}", track.len(), path);
        platform.location = Arc::new(HeadlessLocation::replay(
            track,
            Duration::from_millis(args.replay_cadence_ms),
        ));
    }

    let (app_state, app_rx) = watch::channel(AppState::Foreground);
    let controller = Arc::new(TrackingController::new(config.clone(), platform, backend, spool, app_rx.clone())?);
    let bridge = AppLifecycleBridge::new(controller.clone()).spawn(app_rx);

    let route = match (args.from, args.to) {
        (Some(start), Some(end)) => Some(match &args.polyline {
            Some(encoded) => RideRoute::from_polyline(start, end, encoded),
            None => RideRoute::new(start, end),
        }),
        (None, None) => None,
        _ => bail!("--from and --to must be given together"),
    };

    if args.simulate {
        let Some(route) = route else {
            bail!("--simulate needs --from and --to");
        };
        let request = route.to_request(config.sim_default_speed_mps, args.local_only);
        controller.start_simulation(ride_id, request).await?;
    } else {
        if let Some(route) = route {
            controller.register_route(ride_id, route);
        }
        controller.start_tracking(ride_id).await?;
    }

    let started = Instant::now();
    let deadline = (args.duration > 0).then(|| started + Duration::from_secs(args.duration));
    let mut ctrl_c = Box::pin(tokio::signal::ctrl_c());

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                log::info!("Interrupted");
                break;
            }
            _ = sleep(Duration::from_secs(2)) => {}
        }

        if let Some(path) = &args.status_file {
            if let Err(e) = LiveStatus::capture(&controller).await.save(path) {
                log::warn!("Failed to write status file {}: {}", path, e);
            }
        }

        if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
            break;
        }
        let arrived = controller.simulation_progress().await.map(|p| p >= 1.0).unwrap_or(false);
        if arrived && deadline.is_none() {
            log::info!("Simulation reached destination");
            break;
        }
    }

    controller.stop_tracking().await?;
    drop(app_state);
    let _ = bridge.await;

    let stats = controller.upload_stats();
    log::info!(
        "Done after {:.1}s: {} batches / {} points sent, {} deferred, {} failed, {} rejected",
        started.elapsed().as_secs_f64(),
        stats.batches_sent,
        stats.points_sent,
        stats.deferred_flushes,
        stats.failed_flushes,
        stats.rejected_fixes
    );
    if let Some(path) = &args.status_file {
        LiveStatus::capture(&controller).await.save(path)?;
    }
    Ok(())
}
