use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{Mutex, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::backend::OrderEventStream;
use crate::error::{GeolocationError, TrackerError};
use crate::models::driver::{DriverPresence, DriverStats, LocationFix};
use crate::models::events::OrderEvent;
use crate::models::order::{Order, OrderOffer};
use crate::models::screen::Notice;
use crate::models::session::Role;
use crate::presence::board::DriverBoard;
use crate::state::TrackerState;
use crate::tracking::location::{self, LocationSource};
use crate::tracking::task::{Liveness, TaskHandle};

const DRIVER_CANCEL_REASON: &str = "Driver cancellation from UI";
const CLIENT_CANCELLED_NOTICE: &str = "Commande annulée par le client.";
const DRIVER_CANCELLED_NOTICE: &str = "Course annulée.";
const NO_ACTIVE_ORDER: &str = "Aucune course en cours";

/// Background tasks alive while the driver is online. Dropping the set
/// closes the stream and stops every timer.
struct OnlineTasks {
    _event_stream: TaskHandle,
    _heartbeat: TaskHandle,
    _location: TaskHandle,
    _queue_poll: TaskHandle,
    _stats_poll: TaskHandle,
}

/// State reachable from the background tasks.
struct PresenceShared {
    state: Arc<TrackerState>,
    presence_tx: watch::Sender<DriverPresence>,
    board: Mutex<DriverBoard>,
    cancel_clear: Mutex<Option<TaskHandle>>,
}

/// Driver side of the session: online toggle, pending queue, accepted order
/// and the push events that mutate them.
pub struct PresenceChannel {
    shared: Arc<PresenceShared>,
    source: Arc<dyn LocationSource>,
    online: Mutex<Option<OnlineTasks>>,
    /// Held for a whole toggle so overlapping calls apply in order.
    toggle: Mutex<()>,
}

impl PresenceChannel {
    pub fn new(state: Arc<TrackerState>, source: Arc<dyn LocationSource>) -> Self {
        let (presence_tx, _rx) = watch::channel(DriverPresence {
            last_location: state.store.last_location(),
            ..DriverPresence::default()
        });
        Self {
            shared: Arc::new(PresenceShared {
                state,
                presence_tx,
                board: Mutex::new(DriverBoard::default()),
                cancel_clear: Mutex::new(None),
            }),
            source,
            online: Mutex::new(None),
            toggle: Mutex::new(()),
        }
    }

    pub async fn snapshot(&self) -> DriverBoard {
        self.shared.board.lock().await.clone()
    }

    pub async fn is_online(&self) -> bool {
        self.online.lock().await.is_some()
    }

    /// Online flag, latest own position and last acknowledged heartbeat.
    pub fn presence(&self) -> watch::Receiver<DriverPresence> {
        self.shared.presence_tx.subscribe()
    }

    /// Persists the toggle, then (re)starts or stops the online tasks. Any
    /// previous set is torn down first, so toggling never accumulates timers.
    /// A toggle that starts while another is in flight waits for it.
    pub async fn set_online(&self, online: bool) -> Result<(), TrackerError> {
        let _toggle = self.toggle.lock().await;
        self.teardown().await;
        {
            let mut board = self.shared.board.lock().await;
            if online {
                board.online = true;
            } else {
                board.go_offline();
            }
        }
        self.shared.mark_online(online);

        let state = &self.shared.state;
        let token = match state.store.token(Role::Driver) {
            Some(token) => token,
            None if !online => return Ok(()),
            None => {
                self.shared.board.lock().await.go_offline();
                self.shared.mark_online(false);
                return state.require_token(Role::Driver).map(|_| ());
            }
        };

        match state.api.set_driver_status(&token, online).await {
            Ok(()) => {}
            Err(err) if err.is_auth() => {
                self.shared.board.lock().await.go_offline();
                self.shared.mark_online(false);
                state.expire_session(Role::Driver);
                return Err(err);
            }
            Err(err) => warn!(online, error = %err, "presence update failed"),
        }

        if online {
            let tasks = self.spawn_online_tasks(token);
            *self.online.lock().await = Some(tasks);
            info!("driver online");
        } else {
            info!("driver offline");
        }
        Ok(())
    }

    /// Stops every online task and the pending cancel-clear timer.
    /// Safe to call any number of times.
    pub async fn teardown(&self) {
        // The event stream stops first; it cannot schedule a timer after the take.
        if self.online.lock().await.take().is_some() {
            debug!("presence tasks torn down");
        }
        self.shared.cancel_clear.lock().await.take();
    }

    /// Reads the persisted toggle and restores it.
    pub async fn load_online_status(&self) -> Result<bool, TrackerError> {
        let state = &self.shared.state;
        let Some(token) = state.store.token(Role::Driver) else {
            return Ok(false);
        };
        let status = match state.api.driver_status(&token).await {
            Ok(status) => status,
            Err(err) if err.is_auth() => {
                state.expire_session(Role::Driver);
                return Err(err);
            }
            Err(err) => {
                debug!(error = %err, "online status unavailable");
                return Ok(false);
            }
        };

        if status.online {
            self.set_online(true).await?;
        }
        Ok(status.online)
    }

    /// Restores the accepted order persisted before a restart, if the backend
    /// still considers it active. A terminal order drops the pointer.
    pub async fn resume(&self) -> Result<Option<Order>, TrackerError> {
        let state = &self.shared.state;
        let (Some(token), Some(order_id)) = (
            state.store.token(Role::Driver),
            state.store.last_driver_order_id(),
        ) else {
            return Ok(None);
        };

        let order = match state.api.get_order(&token, &order_id).await {
            Ok(order) => order,
            Err(err) if err.is_auth() => {
                state.expire_session(Role::Driver);
                return Err(err);
            }
            Err(err) => {
                debug!(order_id = %order_id, error = %err, "resume fetch failed");
                return Ok(None);
            }
        };

        if order.status.is_driver_active() {
            info!(order_id = %order_id, status = %order.status, "resuming accepted order");
            self.shared.board.lock().await.set_accepted(order.clone());
            Ok(Some(order))
        } else {
            if order.status.is_terminal() {
                state.store.clear_last_driver_order_id();
            }
            Ok(None)
        }
    }

    /// One-shot position read, used when the dashboard opens.
    pub async fn locate_once(&self) -> Result<LocationFix, GeolocationError> {
        let timeout = self.shared.state.config.geo_timeout;
        let fix = location::current_position(self.source.as_ref(), timeout).await?;
        self.shared.state.store.set_last_location(&fix);
        self.shared.presence_tx.send_modify(|presence| {
            presence.last_location = Some(fix);
            presence.last_location_at = Some(Utc::now());
        });
        Ok(fix)
    }

    pub async fn refresh_queue(&self) -> Result<Vec<OrderOffer>, TrackerError> {
        self.shared
            .refresh_queue()
            .await
            .map_err(|err| self.shared.state.check_auth(Role::Driver, err))
    }

    pub async fn refresh_stats(&self) -> Result<DriverStats, TrackerError> {
        self.shared
            .refresh_stats()
            .await
            .map_err(|err| self.shared.state.check_auth(Role::Driver, err))
    }

    /// Hides an offer on this device only; the backend is not told.
    pub async fn refuse(&self, order_id: &str) {
        self.shared.board.lock().await.refuse(order_id);
        self.shared.state.store.add_refused_order(order_id);
        debug!(order_id, "offer refused");
    }

    pub async fn accept(&self, order_id: &str) -> Result<Order, TrackerError> {
        let state = &self.shared.state;
        let token = state.require_token(Role::Driver)?;

        let order = state
            .api
            .accept_order(&token, order_id)
            .await
            .map_err(|err| self.surface(err))?;

        self.shared.board.lock().await.set_accepted(order.clone());
        state.store.set_last_driver_order_id(order_id);
        info!(order_id, "order accepted");

        self.shared.refresh_stats_quietly().await;
        Ok(order)
    }

    pub async fn start_ride(&self) -> Result<(), TrackerError> {
        let order_id = self.actionable_order_id().await?;
        let token = self.shared.state.require_token(Role::Driver)?;

        let update = self
            .shared
            .state
            .api
            .start_order(&token, &order_id)
            .await
            .map_err(|err| self.surface(err))?;

        self.shared.board.lock().await.apply_update(&update);
        info!(order_id = %order_id, "ride started");
        Ok(())
    }

    pub async fn complete_ride(&self) -> Result<(), TrackerError> {
        let order_id = self.actionable_order_id().await?;
        let state = &self.shared.state;
        let token = state.require_token(Role::Driver)?;

        let update = state
            .api
            .complete_order(&token, &order_id)
            .await
            .map_err(|err| self.surface(err))?;

        self.shared.board.lock().await.apply_update(&update);
        state.store.clear_last_driver_order_id();
        info!(order_id = %order_id, "ride completed");

        self.shared.refresh_stats_quietly().await;
        Ok(())
    }

    /// Best effort: local state is cleared whatever the backend answers.
    pub async fn cancel_ride(&self) -> Result<(), TrackerError> {
        let order_id = {
            let board = self.shared.board.lock().await;
            match board.accepted.as_ref() {
                Some(order) => order.id.clone(),
                None => return Err(TrackerError::Validation(NO_ACTIVE_ORDER.to_string())),
            }
        };
        let state = &self.shared.state;

        let result = match state.store.token(Role::Driver) {
            Some(token) => {
                state
                    .api
                    .cancel_order(&token, &order_id, DRIVER_CANCEL_REASON)
                    .await
            }
            None => Err(TrackerError::Auth),
        };

        self.shared.cancel_clear.lock().await.take();
        self.shared.board.lock().await.clear_accepted();
        state.store.clear_last_driver_order_id();
        state.notify(Notice::warning(DRIVER_CANCELLED_NOTICE));

        match result {
            Ok(()) => {
                info!(order_id = %order_id, "ride cancelled by driver");
                Ok(())
            }
            Err(err) if err.is_auth() => {
                state.expire_session(Role::Driver);
                Err(err)
            }
            Err(err) => {
                debug!(order_id = %order_id, error = %err, "driver cancellation not acknowledged");
                Ok(())
            }
        }
    }

    async fn actionable_order_id(&self) -> Result<String, TrackerError> {
        let board = self.shared.board.lock().await;
        match board.accepted.as_ref() {
            Some(order) if board.can_act() => Ok(order.id.clone()),
            _ => Err(TrackerError::Validation(NO_ACTIVE_ORDER.to_string())),
        }
    }

    /// Foreground failures: auth tears down, everything else is shown.
    fn surface(&self, err: TrackerError) -> TrackerError {
        let state = &self.shared.state;
        if err.is_auth() {
            state.expire_session(Role::Driver);
        } else {
            state.notify(Notice::error(err.to_string()));
        }
        err
    }

    fn spawn_online_tasks(&self, token: String) -> OnlineTasks {
        let shared = &self.shared;
        let state = &shared.state;
        let intervals = &state.config.intervals;
        let (heartbeat_every, queue_every, stats_every) =
            (intervals.heartbeat, intervals.queue_poll, intervals.stats_poll);

        let event_stream = {
            let shared = shared.clone();
            TaskHandle::spawn(
                "order-events",
                Some(state.metrics.active_event_streams.clone()),
                move |alive| consume_events(shared, token, alive),
            )
        };

        let heartbeat = {
            let shared = shared.clone();
            TaskHandle::spawn(
                "heartbeat",
                Some(state.metrics.active_heartbeats.clone()),
                move |alive| {
                    repeat(heartbeat_every, false, alive, move || {
                        let shared = shared.clone();
                        async move { shared.send_heartbeat().await }
                    })
                },
            )
        };

        let location = location::spawn_location_publisher(
            state.clone(),
            self.source.clone(),
            shared.presence_tx.clone(),
        );

        let queue_poll = {
            let shared = shared.clone();
            TaskHandle::spawn("queue-poll", None, move |alive| {
                repeat(queue_every, true, alive, move || {
                    let shared = shared.clone();
                    async move { shared.poll_queue().await }
                })
            })
        };

        let stats_poll = {
            let shared = shared.clone();
            TaskHandle::spawn("stats-poll", None, move |alive| {
                repeat(stats_every, true, alive, move || {
                    let shared = shared.clone();
                    async move { shared.poll_stats().await }
                })
            })
        };

        OnlineTasks {
            _event_stream: event_stream,
            _heartbeat: heartbeat,
            _location: location,
            _queue_poll: queue_poll,
            _stats_poll: stats_poll,
        }
    }
}

impl PresenceShared {
    fn mark_online(&self, online: bool) {
        self.presence_tx.send_modify(|presence| presence.online = online);
    }

    async fn refresh_queue(&self) -> Result<Vec<OrderOffer>, TrackerError> {
        let token = self.state.store.token(Role::Driver).ok_or(TrackerError::Auth)?;
        let offers = self.state.api.available_orders(&token).await?;
        let refused = self.state.store.refused_order_ids();

        let mut board = self.board.lock().await;
        board.replace_queue(offers, &refused);
        Ok(board.queue.clone())
    }

    async fn refresh_stats(&self) -> Result<DriverStats, TrackerError> {
        let token = self.state.store.token(Role::Driver).ok_or(TrackerError::Auth)?;
        let stats = self.state.api.driver_stats(&token).await?;

        let mut board = self.board.lock().await;
        board.merge_stats(stats);
        Ok(board.stats.clone())
    }

    async fn refresh_stats_quietly(&self) {
        if let Err(err) = self.refresh_stats().await {
            if err.is_auth() {
                self.state.expire_session(Role::Driver);
            } else {
                debug!(error = %err, "stats refresh failed");
            }
        }
    }

    async fn poll_queue(&self) -> ControlFlow<()> {
        let started = Instant::now();
        let result = self.refresh_queue().await;
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(_) => {
                self.state.metrics.record_poll("queue", "ok", elapsed);
                ControlFlow::Continue(())
            }
            Err(err) if err.is_auth() => {
                self.state.metrics.record_poll("queue", "unauthorized", elapsed);
                self.state.expire_session(Role::Driver);
                ControlFlow::Break(())
            }
            Err(err) => {
                self.state.metrics.record_poll("queue", "error", elapsed);
                debug!(error = %err, "queue poll failed");
                self.board.lock().await.queue_error = Some(err.to_string());
                ControlFlow::Continue(())
            }
        }
    }

    async fn poll_stats(&self) -> ControlFlow<()> {
        let started = Instant::now();
        let result = self.refresh_stats().await;
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(_) => {
                self.state.metrics.record_poll("stats", "ok", elapsed);
                ControlFlow::Continue(())
            }
            Err(err) if err.is_auth() => {
                self.state.metrics.record_poll("stats", "unauthorized", elapsed);
                self.state.expire_session(Role::Driver);
                ControlFlow::Break(())
            }
            Err(err) => {
                self.state.metrics.record_poll("stats", "error", elapsed);
                debug!(error = %err, "stats poll failed");
                ControlFlow::Continue(())
            }
        }
    }

    async fn send_heartbeat(&self) -> ControlFlow<()> {
        let Some(token) = self.state.store.token(Role::Driver) else {
            return ControlFlow::Break(());
        };
        let started = Instant::now();
        let result = self.state.api.heartbeat(&token).await;
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(()) => {
                self.state.metrics.record_poll("heartbeat", "ok", elapsed);
                self.presence_tx
                    .send_modify(|presence| presence.heartbeat_at = Some(Utc::now()));
                ControlFlow::Continue(())
            }
            Err(err) if err.is_auth() => {
                self.state
                    .metrics
                    .record_poll("heartbeat", "unauthorized", elapsed);
                self.state.expire_session(Role::Driver);
                ControlFlow::Break(())
            }
            Err(err) => {
                self.state.metrics.record_poll("heartbeat", "error", elapsed);
                debug!(error = %err, "heartbeat failed");
                ControlFlow::Continue(())
            }
        }
    }

    async fn handle_event(self: &Arc<Self>, event: OrderEvent, alive: &Liveness) {
        match event {
            OrderEvent::Assigned { order_id } => {
                debug!(order_id = %order_id, "order assigned elsewhere");
                self.board.lock().await.on_assigned(&order_id);
            }
            OrderEvent::Cancelled { order_id } => {
                let was_accepted = self.board.lock().await.on_cancelled(&order_id);
                if was_accepted {
                    warn!(order_id = %order_id, "accepted order cancelled by client");
                    self.state.notify(Notice::error(CLIENT_CANCELLED_NOTICE));
                    self.schedule_cancel_clear(order_id, alive).await;
                }
            }
        }
    }

    /// Replaces any pending timer: the newest cancellation wins. Nothing is
    /// scheduled once the event stream has been torn down.
    async fn schedule_cancel_clear(self: &Arc<Self>, order_id: String, stream: &Liveness) {
        let mut pending = self.cancel_clear.lock().await;
        if !stream.is_alive() {
            return;
        }
        let delay = self.state.config.intervals.cancel_clear;
        let shared = self.clone();
        let timer = TaskHandle::spawn("cancel-clear", None, move |alive| async move {
            tokio::time::sleep(delay).await;
            if !alive.is_alive() {
                return;
            }
            if shared.board.lock().await.clear_cancelled(&order_id) {
                shared.state.store.clear_last_driver_order_id();
                debug!(order_id = %order_id, "cancelled order cleared");
            }
        });
        *pending = Some(timer);
    }
}

async fn consume_events(shared: Arc<PresenceShared>, token: String, alive: Liveness) {
    let mut events = match OrderEventStream::connect(&shared.state.api, &token) {
        Ok(events) => events,
        Err(err) => {
            warn!(error = %err, "order event stream unavailable");
            return;
        }
    };

    while let Some(item) = events.next().await {
        if !alive.is_alive() {
            return;
        }
        match item {
            Ok(event) => shared.handle_event(event, &alive).await,
            Err(err) if err.is_auth() => {
                shared.state.expire_session(Role::Driver);
                return;
            }
            Err(err) => debug!(error = %err, "order event stream interrupted"),
        }
    }
}

/// Runs `tick` every `period` until it breaks or the owner goes away.
async fn repeat<F, Fut>(period: Duration, immediate: bool, alive: Liveness, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ControlFlow<()>>,
{
    let start = if immediate {
        tokio::time::Instant::now()
    } else {
        tokio::time::Instant::now() + period
    };
    let mut ticker = tokio::time::interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if !alive.is_alive() {
            return;
        }
        if tick().await.is_break() {
            return;
        }
    }
}
