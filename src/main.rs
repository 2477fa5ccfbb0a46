use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::EnvFilter;

use tricycle_tracker::api;
use tricycle_tracker::config::Config;
use tricycle_tracker::controller::SessionController;
use tricycle_tracker::error::TrackerError;
use tricycle_tracker::models::screen::UiEvent;
use tricycle_tracker::session::{FileBackend, SessionStore};
use tricycle_tracker::state::TrackerState;
use tricycle_tracker::tracking::{FixedLocationSource, LocationSource};

#[tokio::main]
async fn main() -> Result<(), TrackerError> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false)
        .compact()
        .init();

    let store = match &config.session_file {
        Some(path) => SessionStore::new(Arc::new(FileBackend::open(path.clone())?)),
        None => SessionStore::in_memory(),
    };
    let role = config.role;
    let http_port = config.http_port;
    let source: Arc<dyn LocationSource> = Arc::new(FixedLocationSource::new(config.driver_fix));

    let state = Arc::new(TrackerState::new(config, store)?);
    let controller = Arc::new(SessionController::new(state.clone(), role, source));

    let ui_events = tokio::spawn(follow_ui_events(controller.clone(), controller.subscribe()));
    controller.start_guard();

    if let Some(presence) = controller.presence() {
        if let Err(err) = presence.resume().await {
            tracing::warn!(error = %err, "accepted order not restored");
        }
        match presence.load_online_status().await {
            Ok(online) => tracing::info!(online, "driver presence restored"),
            Err(err) => tracing::warn!(error = %err, "driver presence not restored"),
        }
    }

    let bind_addr = format!("0.0.0.0:{http_port}");
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| TrackerError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(http_port, role = %role, api_base = %state.config.api_base, "tracking agent started");

    axum::serve(listener, api::rest::router(controller.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| TrackerError::Internal(format!("server error: {err}")))?;

    controller.shutdown().await;
    ui_events.abort();
    Ok(())
}

/// Headless stand-in for the UI: logs notices and keeps the controller's
/// tasks in line with the screen the flows navigate to.
async fn follow_ui_events(
    controller: Arc<SessionController>,
    mut events: broadcast::Receiver<UiEvent>,
) {
    loop {
        match events.recv().await {
            Ok(UiEvent::Navigate(screen)) => {
                tracing::info!(screen = %screen.path(), "navigate");
                controller.on_screen(&screen);
            }
            Ok(UiEvent::Notify(notice)) => {
                tracing::info!(level = ?notice.level, message = %notice.message, "notice");
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "ui events lagged");
            }
            Err(RecvError::Closed) => return,
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
