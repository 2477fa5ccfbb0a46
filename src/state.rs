use tokio::sync::{broadcast, watch};
use tracing::warn;

use crate::backend::ApiClient;
use crate::config::Config;
use crate::error::TrackerError;
use crate::models::screen::{Notice, Screen, UiEvent};
use crate::models::session::Role;
use crate::observability::metrics::Metrics;
use crate::session::SessionStore;

/// Everything the background tasks and foreground flows share on a device.
pub struct TrackerState {
    pub config: Config,
    pub api: ApiClient,
    pub store: SessionStore,
    pub metrics: Metrics,
    pub ui_events_tx: broadcast::Sender<UiEvent>,
    screen_tx: watch::Sender<Screen>,
}

impl TrackerState {
    pub fn new(config: Config, store: SessionStore) -> Result<Self, TrackerError> {
        let api = ApiClient::new(config.api_base.clone(), config.request_timeout)?;
        let (ui_events_tx, _unused_rx) = broadcast::channel(config.event_buffer_size.max(1));
        let (screen_tx, _screen_rx) = watch::channel(Screen::Home);

        Ok(Self {
            config,
            api,
            store,
            metrics: Metrics::new(),
            ui_events_tx,
            screen_tx,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.ui_events_tx.subscribe()
    }

    /// Nobody listening is fine: events are fire and forget.
    pub fn emit(&self, event: UiEvent) {
        let _ = self.ui_events_tx.send(event);
    }

    pub fn navigate(&self, screen: Screen) {
        self.screen_tx.send_replace(screen.clone());
        self.emit(UiEvent::Navigate(screen));
    }

    /// Screen currently shown. Hosts report user driven navigation through
    /// [`TrackerState::set_current_screen`].
    pub fn current_screen(&self) -> Screen {
        self.screen_tx.borrow().clone()
    }

    pub fn set_current_screen(&self, screen: Screen) {
        self.screen_tx.send_replace(screen);
    }

    pub fn notify(&self, notice: Notice) {
        self.emit(UiEvent::Notify(notice));
    }

    /// Token of `role` for a user initiated action. Without one the user is
    /// sent to the login screen.
    pub fn require_token(&self, role: Role) -> Result<String, TrackerError> {
        match self.store.token(role) {
            Some(token) => Ok(token),
            None => {
                self.navigate(Screen::login_for(role));
                Err(TrackerError::Auth)
            }
        }
    }

    /// Clears the identity of `role` after an unauthorized response and
    /// redirects to its login screen. Concurrent callers race on the token
    /// removal; only the one that actually removed it navigates.
    pub fn expire_session(&self, role: Role) -> bool {
        if !self.store.clear_identity(role) {
            return false;
        }

        self.metrics
            .session_teardowns_total
            .with_label_values(&[role.as_str()])
            .inc();
        warn!(role = %role, "session rejected by backend, signing out");
        self.navigate(Screen::login_for(role));
        true
    }

    /// Routes an error of a foreground action: auth errors tear the session
    /// down, everything else is handed back to the caller unchanged.
    pub fn check_auth(&self, role: Role, err: TrackerError) -> TrackerError {
        if err.is_auth() {
            self.expire_session(role);
        }
        err
    }
}
