//! Best effort "resume the active order" routing. Runs on mount, when the
//! app regains focus and when it becomes visible again.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::TrackerError;
use crate::models::order::OrderStatus;
use crate::models::screen::Screen;
use crate::models::session::Role;
use crate::state::TrackerState;
use crate::tracking::task::{Liveness, TaskHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardTrigger {
    Mount,
    Focus,
    VisibilityVisible,
}

/// Screen a client with an ongoing order must be on, if not already there.
/// A finished order drops the resume pointer.
pub async fn check_client(
    state: &TrackerState,
    current: &Screen,
) -> Result<Option<Screen>, TrackerError> {
    let (Some(token), Some(order_id)) = (state.store.token(Role::Client), state.store.last_order_id())
    else {
        return Ok(None);
    };

    let order = state.api.get_order(&token, &order_id).await?;
    if order.status.is_terminal() {
        state.store.clear_last_order_id();
        return Ok(None);
    }

    let target = match order.status {
        OrderStatus::InProgress => Screen::LiveTrip { order_id },
        OrderStatus::Searching | OrderStatus::Pending | OrderStatus::Assigned => {
            Screen::Waiting { order_id }
        }
        OrderStatus::Completed | OrderStatus::Cancelled => return Ok(None),
    };

    Ok((*current != target).then_some(target))
}

/// Sends a driver holding an order to the dashboard. Without a resume
/// pointer the backend is asked for the driver's active order.
pub async fn check_driver(
    state: &TrackerState,
    current: &Screen,
) -> Result<Option<Screen>, TrackerError> {
    let Some(token) = state.store.token(Role::Driver) else {
        return Ok(None);
    };
    let target = (*current != Screen::DriverDashboard).then_some(Screen::DriverDashboard);

    if let Some(order_id) = state.store.last_driver_order_id() {
        let order = state.api.get_order(&token, &order_id).await?;
        if order.status.is_terminal() {
            state.store.clear_last_driver_order_id();
            return Ok(None);
        }
        if order.status.is_driver_active() {
            return Ok(target);
        }
    }

    match state.api.driver_active_order(&token).await? {
        Some(order_id) => {
            debug!(order_id = %order_id, "adopting active order reported by backend");
            state.store.set_last_driver_order_id(&order_id);
            Ok(target)
        }
        None => Ok(None),
    }
}

/// One guard pass for `role`. Only an unauthorized response has an effect
/// beyond routing: it ends the session.
pub async fn check(state: &TrackerState, role: Role) -> Option<Screen> {
    let current = state.current_screen();
    let result = match role {
        Role::Client => check_client(state, &current).await,
        Role::Driver => check_driver(state, &current).await,
        Role::Admin => Ok(None),
    };

    match result {
        Ok(target) => target,
        Err(err) if err.is_auth() => {
            state.expire_session(role);
            None
        }
        Err(err) => {
            debug!(role = %role, error = %err, "guard check skipped");
            None
        }
    }
}

pub async fn run_guard(
    state: Arc<TrackerState>,
    role: Role,
    mut triggers: mpsc::Receiver<GuardTrigger>,
    alive: Liveness,
) {
    while let Some(trigger) = triggers.recv().await {
        if !alive.is_alive() {
            return;
        }
        debug!(?trigger, role = %role, "guard check");
        let target = check(&state, role).await;
        if !alive.is_alive() {
            return;
        }
        if let Some(screen) = target {
            state.navigate(screen);
        }
    }
}

/// Starts the guard for `role` and fires the mount check.
pub fn spawn_guard(state: Arc<TrackerState>, role: Role) -> (TaskHandle, mpsc::Sender<GuardTrigger>) {
    let (tx, rx) = mpsc::channel(8);
    let _ = tx.try_send(GuardTrigger::Mount);
    let handle = TaskHandle::spawn("session-guard", None, move |alive| {
        run_guard(state, role, rx, alive)
    });
    (handle, tx)
}
