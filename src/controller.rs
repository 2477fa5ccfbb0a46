use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::client_flow;
use crate::error::TrackerError;
use crate::geo::{RidePhase, RouteProgress};
use crate::guard::{self, GuardTrigger};
use crate::models::driver::LocationFix;
use crate::models::order::{Order, OrderStatus};
use crate::models::screen::{Screen, UiEvent};
use crate::models::session::Role;
use crate::presence::PresenceChannel;
use crate::state::TrackerState;
use crate::tracking::location::{self, LocationSource};
use crate::tracking::poller::{self, WatchScreen};
use crate::tracking::task::TaskHandle;

/// Live views of a tracked order.
#[derive(Debug, Clone)]
pub struct TrackingView {
    pub order: watch::Receiver<Option<Order>>,
    pub driver_position: watch::Receiver<Option<LocationFix>>,
}

impl TrackingView {
    /// Distance, ETA and completion of the current leg, from the latest
    /// snapshot. `None` until the first snapshot arrives.
    pub fn progress(&self, client: Option<&LocationFix>) -> Option<RouteProgress> {
        let order = self.order.borrow();
        let order = order.as_ref()?;
        let phase = match order.status {
            OrderStatus::InProgress | OrderStatus::Completed => RidePhase::ToDestination,
            _ => RidePhase::ToPickup,
        };
        let driver = *self.driver_position.borrow();

        Some(RouteProgress::compute(
            phase,
            driver.as_ref(),
            client,
            order.start.as_ref(),
            order.destination.as_ref(),
        ))
    }
}

struct ClientTracking {
    order_id: String,
    screen: watch::Sender<WatchScreen>,
    view: TrackingView,
    poller: TaskHandle,
    _driver_locator: TaskHandle,
}

struct GuardTask {
    _handle: TaskHandle,
    triggers: mpsc::Sender<GuardTrigger>,
}

/// Owns every background task of one device session: at most one client
/// tracking set, the driver presence channel and the resume guard.
pub struct SessionController {
    state: Arc<TrackerState>,
    role: Role,
    tracking: Mutex<Option<ClientTracking>>,
    presence: Option<PresenceChannel>,
    guard: Mutex<Option<GuardTask>>,
}

impl SessionController {
    pub fn new(state: Arc<TrackerState>, role: Role, source: Arc<dyn LocationSource>) -> Self {
        let presence = (role == Role::Driver).then(|| PresenceChannel::new(state.clone(), source));
        Self {
            state,
            role,
            tracking: Mutex::new(None),
            presence,
            guard: Mutex::new(None),
        }
    }

    pub fn state(&self) -> &Arc<TrackerState> {
        &self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.state.subscribe()
    }

    pub fn presence(&self) -> Option<&PresenceChannel> {
        self.presence.as_ref()
    }

    /// Starts polling `order_id` and its driver's position. A running set
    /// for the same order is kept and told about the new screen; any other
    /// is replaced.
    pub fn track_order(&self, order_id: &str, screen: WatchScreen) -> TrackingView {
        let mut tracking = lock(&self.tracking);
        if let Some(current) = tracking.as_ref() {
            if current.order_id == order_id && !current.poller.is_finished() {
                current.screen.send_if_modified(|watched| {
                    let changed = *watched != screen;
                    *watched = screen;
                    changed
                });
                return current.view.clone();
            }
        }

        // Old handles go first so their gauges drop before the new ones rise.
        if tracking.take().is_some() {
            debug!("previous order tracking replaced");
        }

        let (order_tx, order_rx) = watch::channel(None);
        let (position_tx, position_rx) = watch::channel(None);
        let (screen_tx, screen_rx) = watch::channel(screen);

        let state = self.state.clone();
        let id = order_id.to_string();
        let poller = TaskHandle::spawn(
            "order-poller",
            Some(self.state.metrics.active_order_pollers.clone()),
            move |alive| poller::run_order_poller(state, id, screen_rx, order_tx, alive),
        );
        let driver_locator =
            location::spawn_driver_location_poller(self.state.clone(), order_rx.clone(), position_tx);

        let view = TrackingView {
            order: order_rx,
            driver_position: position_rx,
        };
        *tracking = Some(ClientTracking {
            order_id: order_id.to_string(),
            screen: screen_tx,
            view: view.clone(),
            poller,
            _driver_locator: driver_locator,
        });
        info!(order_id, ?screen, "order tracking started");
        view
    }

    pub fn tracked_order(&self) -> Option<String> {
        lock(&self.tracking).as_ref().map(|t| t.order_id.clone())
    }

    pub fn stop_tracking(&self) {
        if let Some(previous) = lock(&self.tracking).take() {
            info!(order_id = %previous.order_id, "order tracking stopped");
        }
    }

    /// Aligns the background tasks with the screen now shown: the waiting
    /// and live trip screens keep their order tracked, any other screen
    /// stops tracking.
    pub fn on_screen(&self, screen: &Screen) {
        self.state.set_current_screen(screen.clone());
        match screen {
            Screen::Waiting { order_id } => {
                self.track_order(order_id, WatchScreen::Waiting);
            }
            Screen::LiveTrip { order_id } => {
                self.track_order(order_id, WatchScreen::LiveTrip);
            }
            _ => self.stop_tracking(),
        }
    }

    /// Starts the resume guard for this session's role.
    pub fn start_guard(&self) {
        let (handle, triggers) = guard::spawn_guard(self.state.clone(), self.role);
        *lock(&self.guard) = Some(GuardTask {
            _handle: handle,
            triggers,
        });
    }

    /// Focus and visibility changes re-run the guard. Ignored when it is
    /// not running or already has checks queued.
    pub fn trigger_guard(&self, trigger: GuardTrigger) {
        if let Some(guard) = lock(&self.guard).as_ref() {
            if guard.triggers.try_send(trigger).is_err() {
                debug!(?trigger, "guard busy, trigger dropped");
            }
        }
    }

    /// Client cancellation. Tracking is paused around the request so the
    /// poller does not report the cancellation a second time, and resumed
    /// when the backend refuses it.
    pub async fn cancel_order(&self, order_id: &str) -> Result<(), TrackerError> {
        let screen = match self.state.current_screen() {
            Screen::LiveTrip { .. } => WatchScreen::LiveTrip,
            _ => WatchScreen::Waiting,
        };
        let was_tracking = self.tracked_order().as_deref() == Some(order_id);
        self.stop_tracking();

        let result =
            client_flow::cancel_order(&self.state, order_id, client_flow::CLIENT_CANCEL_REASON).await;
        if let Err(err) = &result {
            if was_tracking && !err.is_auth() {
                self.track_order(order_id, screen);
            }
        }
        result
    }

    /// Stops everything; a driver is reported offline on the way out.
    pub async fn shutdown(&self) {
        lock(&self.guard).take();
        self.stop_tracking();
        if let Some(presence) = &self.presence {
            if presence.is_online().await {
                if let Err(err) = presence.set_online(false).await {
                    warn!(error = %err, "could not report driver offline");
                }
            }
            presence.teardown().await;
        }
        info!(role = %self.role, "session controller stopped");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
