use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use serde::Serialize;

use crate::controller::SessionController;

pub fn router(controller: Arc<SessionController>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(controller)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    role: &'static str,
    screen: String,
    signed_in: bool,
    tracked_order: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    online: Option<bool>,
}

async fn health(State(controller): State<Arc<SessionController>>) -> Json<HealthResponse> {
    let state = controller.state();
    let online = match controller.presence() {
        Some(presence) => Some(presence.is_online().await),
        None => None,
    };

    Json(HealthResponse {
        status: "ok",
        role: controller.role().as_str(),
        screen: state.current_screen().path(),
        signed_in: state.store.token(controller.role()).is_some(),
        tracked_order: controller.tracked_order(),
        online,
    })
}

async fn metrics(State(controller): State<Arc<SessionController>>) -> impl IntoResponse {
    match controller.state().metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err).into_response(),
    }
}
