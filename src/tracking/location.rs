use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

use crate::error::GeolocationError;
use crate::models::driver::{DriverPresence, LocationFix};
use crate::models::order::{Order, OrderStatus};
use crate::models::screen::Notice;
use crate::models::session::Role;
use crate::state::TrackerState;
use crate::tracking::task::{Liveness, TaskHandle};

/// A device position provider.
pub trait LocationSource: Send + Sync {
    /// Continuous watch: yields every new fix or positioning failure.
    fn watch(&self) -> BoxStream<'static, Result<LocationFix, GeolocationError>>;
}

/// First fix of `source`, bounded by `timeout`.
pub async fn current_position(
    source: &dyn LocationSource,
    timeout: Duration,
) -> Result<LocationFix, GeolocationError> {
    let mut fixes = source.watch();
    match tokio::time::timeout(timeout, fixes.next()).await {
        Ok(Some(result)) => result,
        Ok(None) => Err(GeolocationError::Unavailable(
            "location source closed".to_string(),
        )),
        Err(_) => Err(GeolocationError::Timeout),
    }
}

/// Source fed by the host (a GPS daemon, a device bridge, a test).
#[derive(Debug, Clone)]
pub struct ChannelLocationSource {
    tx: watch::Sender<Option<Result<LocationFix, GeolocationError>>>,
}

impl ChannelLocationSource {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    pub fn push(&self, fix: LocationFix) {
        self.tx.send_replace(Some(Ok(fix)));
    }

    pub fn fail(&self, err: GeolocationError) {
        self.tx.send_replace(Some(Err(err)));
    }
}

impl Default for ChannelLocationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl LocationSource for ChannelLocationSource {
    fn watch(&self) -> BoxStream<'static, Result<LocationFix, GeolocationError>> {
        WatchStream::new(self.tx.subscribe())
            .filter_map(|item| async move { item })
            .boxed()
    }
}

/// A device that does not move, or has no positioning hardware at all.
#[derive(Debug, Clone, Copy)]
pub struct FixedLocationSource {
    fix: Option<LocationFix>,
}

impl FixedLocationSource {
    pub fn new(fix: Option<LocationFix>) -> Self {
        Self { fix }
    }
}

impl LocationSource for FixedLocationSource {
    fn watch(&self) -> BoxStream<'static, Result<LocationFix, GeolocationError>> {
        let first = match self.fix {
            Some(fix) => Ok(fix),
            None => Err(GeolocationError::Unavailable(
                "no positioning configured".to_string(),
            )),
        };
        stream::once(async move { first })
            .chain(stream::pending())
            .boxed()
    }
}

/// Pushes every fix of `source` to the backend while the driver is online,
/// mirroring it into the driver's presence and the session store.
pub fn spawn_location_publisher(
    state: Arc<TrackerState>,
    source: Arc<dyn LocationSource>,
    presence: watch::Sender<DriverPresence>,
) -> TaskHandle {
    let gauge = state.metrics.active_location_watches.clone();
    TaskHandle::spawn("location-publisher", Some(gauge), move |alive| {
        publish_locations(state, source, presence, alive)
    })
}

async fn publish_locations(
    state: Arc<TrackerState>,
    source: Arc<dyn LocationSource>,
    presence: watch::Sender<DriverPresence>,
    alive: Liveness,
) {
    let mut fixes = source.watch();
    let mut last_error: Option<GeolocationError> = None;

    while let Some(item) = fixes.next().await {
        if !alive.is_alive() {
            return;
        }

        let fix = match item {
            Ok(fix) => {
                last_error = None;
                fix
            }
            Err(err) => {
                if last_error.as_ref() != Some(&err) {
                    warn!(error = %err, "driver position unavailable");
                    state.notify(Notice::warning(err.remediation()));
                    last_error = Some(err);
                }
                continue;
            }
        };

        presence.send_modify(|presence| {
            presence.last_location = Some(fix);
            presence.last_location_at = Some(Utc::now());
        });
        state.store.set_last_location(&fix);

        let Some(token) = state.store.token(Role::Driver) else {
            continue;
        };
        let started = Instant::now();
        let result = state.api.push_location(&token, &fix).await;
        let elapsed = started.elapsed().as_secs_f64();
        if !alive.is_alive() {
            return;
        }

        match result {
            Ok(()) => state.metrics.record_poll("location_push", "ok", elapsed),
            Err(err) if err.is_auth() => {
                state
                    .metrics
                    .record_poll("location_push", "unauthorized", elapsed);
                state.expire_session(Role::Driver);
                return;
            }
            Err(err) => {
                state.metrics.record_poll("location_push", "error", elapsed);
                debug!(error = %err, "location push failed");
            }
        }
    }
}

/// Polls the position of the driver assigned to the order published on
/// `orders`. Waits while no driver is known and stops once the order is
/// terminal. Missing positions keep the previous value.
pub async fn run_driver_location_poller(
    state: Arc<TrackerState>,
    mut orders: watch::Receiver<Option<Order>>,
    positions: watch::Sender<Option<LocationFix>>,
    alive: Liveness,
) {
    loop {
        let (driver_id, status) = {
            let snapshot = orders.borrow_and_update();
            let order: Option<&Order> = snapshot.as_ref();
            (
                order.and_then(|o| o.driver_id().map(str::to_string)),
                order.map(|o| o.status),
            )
        };

        if status.is_some_and(OrderStatus::is_terminal) {
            debug!("order finished, driver location poller stopping");
            return;
        }

        let Some(driver_id) = driver_id else {
            if orders.changed().await.is_err() || !alive.is_alive() {
                return;
            }
            continue;
        };

        let Some(token) = state.store.token(Role::Client) else {
            return;
        };

        let started = Instant::now();
        let result = state.api.driver_location(&token, &driver_id).await;
        if !alive.is_alive() {
            return;
        }
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(Some(fix)) => {
                state.metrics.record_poll("driver_location", "ok", elapsed);
                positions.send_replace(Some(fix));
            }
            Ok(None) => state.metrics.record_poll("driver_location", "empty", elapsed),
            Err(err) if err.is_auth() => {
                state
                    .metrics
                    .record_poll("driver_location", "unauthorized", elapsed);
                state.expire_session(Role::Client);
                return;
            }
            Err(err) => {
                state.metrics.record_poll("driver_location", "error", elapsed);
                debug!(driver_id = %driver_id, error = %err, "driver location poll failed");
            }
        }

        let intervals = &state.config.intervals;
        let pause = if status == Some(OrderStatus::InProgress) {
            intervals.live_location_poll
        } else {
            intervals.location_poll
        };
        tokio::time::sleep(pause).await;
        if !alive.is_alive() {
            return;
        }
    }
}

pub fn spawn_driver_location_poller(
    state: Arc<TrackerState>,
    orders: watch::Receiver<Option<Order>>,
    positions: watch::Sender<Option<LocationFix>>,
) -> TaskHandle {
    info!("driver location poller started");
    TaskHandle::spawn("driver-location-poller", None, move |alive| {
        run_driver_location_poller(state, orders, positions, alive)
    })
}
