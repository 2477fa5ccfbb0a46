use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::Intervals;
use crate::models::order::{Order, OrderStatus};
use crate::models::screen::{Notice, Screen};
use crate::models::session::Role;
use crate::state::TrackerState;
use crate::tracking::task::Liveness;

pub const RIDE_STARTING_NOTICE: &str =
    "Votre course va débuter. Redirection vers le suivi en temps réel...";
pub const RIDE_CANCELLED_NOTICE: &str = "Le conducteur a annulé la commande.";

/// Client screen an order is being watched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchScreen {
    /// Waiting for the driver to pick the client up.
    Waiting,
    LiveTrip,
}

impl WatchScreen {
    pub fn poll_interval(self, intervals: &Intervals) -> Duration {
        match self {
            WatchScreen::Waiting => intervals.waiting_poll,
            WatchScreen::LiveTrip => intervals.live_trip_poll,
        }
    }

    pub fn screen(self, order_id: &str) -> Screen {
        let order_id = order_id.to_string();
        match self {
            WatchScreen::Waiting => Screen::Waiting { order_id },
            WatchScreen::LiveTrip => Screen::LiveTrip { order_id },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEffect {
    /// Ride started while the client was still waiting.
    RideStarting,
    Completed,
    Cancelled,
}

/// Transition handler for one watched order. Feed it every observed status;
/// it returns the side effects to run, each at most once.
#[derive(Debug, Clone)]
pub struct OrderWatch {
    screen: WatchScreen,
    last: Option<OrderStatus>,
    start_notified: bool,
    finished: bool,
}

impl OrderWatch {
    pub fn new(screen: WatchScreen) -> Self {
        Self {
            screen,
            last: None,
            start_notified: false,
            finished: false,
        }
    }

    pub fn screen(&self) -> WatchScreen {
        self.screen
    }

    pub fn last_status(&self) -> Option<OrderStatus> {
        self.last
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// The client moved to `screen` on their own. Once they see the live
    /// trip, the ride start is no longer announced.
    pub fn view_from(&mut self, screen: WatchScreen) {
        self.screen = screen;
        if screen == WatchScreen::LiveTrip {
            self.start_notified = true;
        }
    }

    pub fn observe(&mut self, status: OrderStatus) -> Vec<WatchEffect> {
        if self.finished {
            return Vec::new();
        }
        // Responses may arrive out of order; never step backwards.
        if self.last.is_some_and(|last| status.rank() < last.rank()) {
            debug!(status = %status, "ignoring stale order snapshot");
            return Vec::new();
        }
        self.last = Some(status);

        match status {
            OrderStatus::Searching | OrderStatus::Pending | OrderStatus::Assigned => Vec::new(),
            OrderStatus::InProgress => {
                if self.screen == WatchScreen::Waiting && !self.start_notified {
                    self.start_notified = true;
                    self.screen = WatchScreen::LiveTrip;
                    vec![WatchEffect::RideStarting]
                } else {
                    Vec::new()
                }
            }
            OrderStatus::Completed => {
                self.finished = true;
                vec![WatchEffect::Completed]
            }
            OrderStatus::Cancelled => {
                self.finished = true;
                vec![WatchEffect::Cancelled]
            }
        }
    }
}

/// Polls one order for the client until it completes, is cancelled, the
/// session is rejected or the owning handle is dropped. Accepted snapshots
/// are published on `snapshots`; `screens` reports where the client is
/// looking at the order from.
pub async fn run_order_poller(
    state: Arc<TrackerState>,
    order_id: String,
    mut screens: watch::Receiver<WatchScreen>,
    snapshots: watch::Sender<Option<Order>>,
    alive: Liveness,
) {
    let screen = *screens.borrow_and_update();
    let mut order_watch = OrderWatch::new(screen);
    info!(order_id = %order_id, ?screen, "order poller started");

    if state.store.token(Role::Client).is_none() {
        info!(order_id = %order_id, "no client session, sending to login");
        state.navigate(Screen::login_for(Role::Client));
        return;
    }

    loop {
        // Lost mid-poll: whoever cleared it has already redirected.
        let Some(token) = state.store.token(Role::Client) else {
            debug!(order_id = %order_id, "no client session, order poller stopping");
            return;
        };

        let started = Instant::now();
        let result = state.api.get_order(&token, &order_id).await;
        if !alive.is_alive() {
            return;
        }
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(order) => {
                state.metrics.record_poll("order", "ok", elapsed);
                if screens.has_changed().unwrap_or(false) {
                    order_watch.view_from(*screens.borrow_and_update());
                }
                let status = order.status;
                let effects = order_watch.observe(status);
                if order_watch.last_status() == Some(status) {
                    snapshots.send_replace(Some(order));
                }
                for effect in effects {
                    apply_effect(&state, &order_id, effect);
                }
                if order_watch.is_finished() {
                    info!(order_id = %order_id, status = %status, "order poller finished");
                    return;
                }
            }
            Err(err) if err.is_auth() => {
                state.metrics.record_poll("order", "unauthorized", elapsed);
                state.expire_session(Role::Client);
                return;
            }
            Err(err) => {
                state.metrics.record_poll("order", "error", elapsed);
                debug!(order_id = %order_id, error = %err, "order poll failed, retrying next tick");
            }
        }

        tokio::time::sleep(order_watch.screen().poll_interval(&state.config.intervals)).await;
        if !alive.is_alive() {
            return;
        }
    }
}

fn apply_effect(state: &TrackerState, order_id: &str, effect: WatchEffect) {
    match effect {
        WatchEffect::RideStarting => {
            state.notify(Notice::info(RIDE_STARTING_NOTICE));
            state.navigate(WatchScreen::LiveTrip.screen(order_id));
        }
        WatchEffect::Completed => {
            state.navigate(Screen::TripSummary {
                order_id: order_id.to_string(),
            });
        }
        WatchEffect::Cancelled => {
            state.store.clear_last_order_id();
            state.notify(Notice::error(RIDE_CANCELLED_NOTICE));
            state.navigate(Screen::PreOrder);
        }
    }
}
