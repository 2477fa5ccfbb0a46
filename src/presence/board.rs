use std::collections::BTreeSet;

use crate::backend::types::OrderUpdate;
use crate::models::driver::DriverStats;
use crate::models::order::{Order, OrderOffer, OrderStatus};

const MIN_ACCEPT_RATE: f64 = 50.0;

/// What the driver sees on the dashboard. Pure state, mutated by the
/// presence channel from polls, pushed events and driver actions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriverBoard {
    pub online: bool,
    pub queue: Vec<OrderOffer>,
    pub queue_error: Option<String>,
    pub accepted: Option<Order>,
    /// The accepted order was cancelled by the client; actions are disabled
    /// until it is cleared.
    pub accepted_cancelled: bool,
    pub stats: DriverStats,
}

impl DriverBoard {
    /// Replaces the queue with a fresh fetch, minus locally refused orders.
    pub fn replace_queue(&mut self, offers: Vec<OrderOffer>, refused: &BTreeSet<String>) {
        self.queue = offers
            .into_iter()
            .filter(|offer| !refused.contains(&offer.id))
            .collect();
        self.queue_error = None;
    }

    pub fn remove_from_queue(&mut self, order_id: &str) -> bool {
        let before = self.queue.len();
        self.queue.retain(|offer| offer.id != order_id);
        self.queue.len() != before
    }

    /// Someone took the order: it is no longer offerable.
    pub fn on_assigned(&mut self, order_id: &str) {
        self.remove_from_queue(order_id);
    }

    /// Returns whether the cancelled order is the one this driver accepted.
    pub fn on_cancelled(&mut self, order_id: &str) -> bool {
        self.remove_from_queue(order_id);
        match self.accepted.as_mut() {
            Some(order) if order.id == order_id => {
                order.status = OrderStatus::Cancelled;
                self.accepted_cancelled = true;
                true
            }
            _ => false,
        }
    }

    /// Local suppression of an offer; lowers the displayed accept rate.
    pub fn refuse(&mut self, order_id: &str) {
        self.remove_from_queue(order_id);
        let rate = self.stats.accept_rate.unwrap_or(0.0);
        self.stats.accept_rate = Some((rate - 1.0).round().max(MIN_ACCEPT_RATE));
    }

    pub fn set_accepted(&mut self, order: Order) {
        self.remove_from_queue(&order.id);
        self.accepted = Some(order);
        self.accepted_cancelled = false;
    }

    pub fn clear_accepted(&mut self) {
        self.accepted = None;
        self.accepted_cancelled = false;
    }

    /// Clears the accepted order only if it is still `order_id` and cancelled.
    pub fn clear_cancelled(&mut self, order_id: &str) -> bool {
        let matches = self.accepted_cancelled
            && self
                .accepted
                .as_ref()
                .is_some_and(|order| order.id == order_id);
        if matches {
            self.clear_accepted();
        }
        matches
    }

    pub fn apply_update(&mut self, update: &OrderUpdate) {
        let Some(order) = self.accepted.as_mut() else {
            return;
        };
        if let Some(status) = update.status {
            order.status = status;
        }
        if update.started_at.is_some() {
            order.started_at = update.started_at;
        }
        if update.completed_at.is_some() {
            order.completed_at = update.completed_at;
        }
    }

    /// Takes fresh counters but keeps the local accept rate when the backend
    /// does not report one.
    pub fn merge_stats(&mut self, stats: DriverStats) {
        let accept_rate = stats.accept_rate.or(self.stats.accept_rate);
        self.stats = DriverStats {
            accept_rate,
            ..stats
        };
    }

    /// Start/complete/cancel are only offered on a live accepted order.
    pub fn can_act(&self) -> bool {
        !self.accepted_cancelled
            && self
                .accepted
                .as_ref()
                .is_some_and(|order| order.status.is_driver_active())
    }

    pub fn go_offline(&mut self) {
        self.online = false;
        self.queue.clear();
    }
}
