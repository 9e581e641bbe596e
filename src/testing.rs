//! Test doubles for the platform and backend collaborators.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::api::{ApiError, RideSnapshot, RideStatus, TrackingBackend, TrackingReceipt};
use crate::platform::{
    AcquisitionProfile, FixSink, LocationSource, NotificationContent, NotificationHandle, Notifier,
    PermissionApi, PermissionStatus, PlatformError,
};
use crate::types::{RawFix, RideId, TrackPoint};

pub fn raw_fix(lat: f64, accuracy: f64) -> RawFix {
    RawFix::new(lat, 106.7, 1_700_000_000_000, accuracy)
}

// ─── Backend ─────────────────────────────────────────────────────────────────

pub struct MockBackend {
    status: Mutex<Result<RideStatus, ApiError>>,
    post_error: Mutex<Option<ApiError>>,
    posted: Mutex<Vec<(RideId, Vec<TrackPoint>)>>,
    status_calls: AtomicUsize,
    hold: Mutex<Option<Arc<Notify>>>,
    post_started: Notify,
}

impl MockBackend {
    pub fn with_status(status: RideStatus) -> Self {
        MockBackend {
            status: Mutex::new(Ok(status)),
            post_error: Mutex::new(None),
            posted: Mutex::new(Vec::new()),
            status_calls: AtomicUsize::new(0),
            hold: Mutex::new(None),
            post_started: Notify::new(),
        }
    }

    pub fn set_status(&self, status: Result<RideStatus, ApiError>) {
        *self.status.lock().unwrap() = status;
    }

    pub fn fail_posts(&self, error: Option<ApiError>) {
        *self.post_error.lock().unwrap() = error;
    }

    /// Posts block until the returned notify fires.
    pub fn hold_posts(&self) -> Arc<Notify> {
        let release = Arc::new(Notify::new());
        *self.hold.lock().unwrap() = Some(release.clone());
        release
    }

    pub async fn wait_post_started(&self) {
        self.post_started.notified().await;
    }

    pub fn posted(&self) -> Vec<(RideId, Vec<TrackPoint>)> {
        self.posted.lock().unwrap().clone()
    }

    pub fn posted_points(&self) -> usize {
        self.posted.lock().unwrap().iter().map(|(_, p)| p.len()).sum()
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TrackingBackend for MockBackend {
    async fn post_track(&self, ride_id: RideId, points: &[TrackPoint]) -> Result<TrackingReceipt, ApiError> {
        self.post_started.notify_one();
        let hold = self.hold.lock().unwrap().clone();
        if let Some(release) = hold {
            release.notified().await;
        }
        if let Some(err) = self.post_error.lock().unwrap().clone() {
            return Err(err);
        }
        self.posted.lock().unwrap().push((ride_id, points.to_vec()));
        Ok(TrackingReceipt {
            current_distance_km: Some(0.5),
            polyline: None,
            status: Some("OK".to_string()),
        })
    }

    async fn fetch_ride(&self, _ride_id: RideId) -> Result<RideSnapshot, ApiError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.status
            .lock()
            .unwrap()
            .clone()
            .map(|status| RideSnapshot { status })
    }
}

// ─── Location ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockLocation {
    disabled: Mutex<bool>,
    failing: Mutex<HashSet<String>>,
    subscription: Mutex<Option<(AcquisitionProfile, FixSink)>>,
    subscribe_calls: AtomicUsize,
    unsubscribe_calls: AtomicUsize,
}

impl MockLocation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_services_enabled(&self, enabled: bool) {
        *self.disabled.lock().unwrap() = !enabled;
    }

    /// Make subscriptions with the named profile fail.
    pub fn fail_profile(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    pub fn fail_all(&self) {
        self.fail_profile("full");
        self.fail_profile("degraded");
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    /// Deliver a batch through the registered sink, as the OS would.
    pub fn emit(&self, batch: Vec<RawFix>) -> bool {
        match self.subscription.lock().unwrap().as_ref() {
            Some((_, sink)) => sink.deliver(batch),
            None => false,
        }
    }

    /// Drop the subscription without telling anyone.
    pub fn kill(&self) {
        *self.subscription.lock().unwrap() = None;
    }

    pub fn active_profile(&self) -> Option<String> {
        self.subscription
            .lock()
            .unwrap()
            .as_ref()
            .map(|(profile, _)| profile.name.clone())
    }

    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn unsubscribe_calls(&self) -> usize {
        self.unsubscribe_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocationSource for MockLocation {
    async fn services_enabled(&self) -> bool {
        !*self.disabled.lock().unwrap()
    }

    async fn subscribe(&self, profile: &AcquisitionProfile, sink: FixSink) -> Result<(), PlatformError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(&profile.name) {
            return Err(PlatformError::ProviderUnavailable(profile.name.clone()));
        }
        *self.subscription.lock().unwrap() = Some((profile.clone(), sink));
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<(), PlatformError> {
        self.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
        match self.subscription.lock().unwrap().take() {
            Some(_) => Ok(()),
            None => Err(PlatformError::NotSubscribed),
        }
    }

    async fn is_subscribed(&self) -> bool {
        self.subscription.lock().unwrap().is_some()
    }
}

// ─── Permissions ─────────────────────────────────────────────────────────────

pub struct MockPermissions {
    pub foreground: Mutex<PermissionStatus>,
    pub background: Mutex<PermissionStatus>,
    pub background_requests: AtomicUsize,
}

impl MockPermissions {
    pub fn granted() -> Self {
        MockPermissions {
            foreground: Mutex::new(PermissionStatus::Granted),
            background: Mutex::new(PermissionStatus::Granted),
            background_requests: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, foreground: PermissionStatus, background: PermissionStatus) {
        *self.foreground.lock().unwrap() = foreground;
        *self.background.lock().unwrap() = background;
    }
}

#[async_trait]
impl PermissionApi for MockPermissions {
    async fn request_foreground(&self) -> PermissionStatus {
        *self.foreground.lock().unwrap()
    }

    async fn request_background(&self) -> PermissionStatus {
        self.background_requests.fetch_add(1, Ordering::SeqCst);
        *self.background.lock().unwrap()
    }
}

// ─── Notifications ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockNotifier {
    presented: Mutex<Vec<(NotificationHandle, NotificationContent)>>,
    next_id: AtomicUsize,
    present_calls: AtomicUsize,
    fail_dismiss: Mutex<bool>,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// The OS silently removes every notification.
    pub fn reap_all(&self) {
        self.presented.lock().unwrap().clear();
    }

    pub fn fail_dismiss(&self, fail: bool) {
        *self.fail_dismiss.lock().unwrap() = fail;
    }

    pub fn visible(&self) -> Vec<NotificationContent> {
        self.presented
            .lock()
            .unwrap()
            .iter()
            .map(|(_, content)| content.clone())
            .collect()
    }

    pub fn present_calls(&self) -> usize {
        self.present_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn present(&self, content: &NotificationContent) -> Result<NotificationHandle, PlatformError> {
        self.present_calls.fetch_add(1, Ordering::SeqCst);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = NotificationHandle(format!("mock-{}", id));
        self.presented
            .lock()
            .unwrap()
            .push((handle.clone(), content.clone()));
        Ok(handle)
    }

    async fn dismiss(&self, handle: &NotificationHandle) -> Result<(), PlatformError> {
        if *self.fail_dismiss.lock().unwrap() {
            return Err(PlatformError::Notification("dismiss rejected".to_string()));
        }
        let mut presented = self.presented.lock().unwrap();
        let before = presented.len();
        presented.retain(|(h, _)| h != handle);
        if presented.len() == before {
            return Err(PlatformError::Notification(format!("unknown handle {}", handle.0)));
        }
        Ok(())
    }

    async fn is_presented(&self, handle: &NotificationHandle) -> bool {
        self.presented.lock().unwrap().iter().any(|(h, _)| h == handle)
    }
}
