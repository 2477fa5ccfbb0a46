use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tower::ServiceExt;

use tricycle_tracker::api::rest::router;
use tricycle_tracker::client_flow::{self, Checkout, OrderDraft};
use tricycle_tracker::config::{Config, Intervals};
use tricycle_tracker::controller::SessionController;
use tricycle_tracker::error::TrackerError;
use tricycle_tracker::guard;
use tricycle_tracker::models::driver::LocationFix;
use tricycle_tracker::models::order::GeoPoint;
use tricycle_tracker::models::screen::{Notice, NoticeLevel, Screen, UiEvent};
use tricycle_tracker::models::session::{Role, SessionUser};
use tricycle_tracker::presence::{DriverBoard, PresenceChannel};
use tricycle_tracker::session::SessionStore;
use tricycle_tracker::state::TrackerState;
use tricycle_tracker::tracking::poller::{RIDE_CANCELLED_NOTICE, RIDE_STARTING_NOTICE};
use tricycle_tracker::tracking::{FixedLocationSource, WatchScreen};

const CLIENT_TOKEN: &str = "client-token";
const DRIVER_TOKEN: &str = "driver-token";

// ---- mock backend -----------------------------------------------------------

struct Mock {
    orders: Mutex<HashMap<String, Value>>,
    tokens: Mutex<HashSet<String>>,
    calls: Mutex<Vec<(String, Value)>>,
    online: AtomicBool,
    cancel_error: Mutex<Option<String>>,
    active_driver_order: Mutex<Option<String>>,
    driver_locations: Mutex<HashMap<String, Value>>,
    available: Mutex<Vec<Value>>,
    /// Delays the reply to a driver going online.
    online_delay: Mutex<Option<Duration>>,
    events: broadcast::Sender<(String, String)>,
}

impl Mock {
    fn new() -> Self {
        let (events, _rx) = broadcast::channel(16);
        Self {
            orders: Mutex::new(HashMap::new()),
            tokens: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            online: AtomicBool::new(false),
            cancel_error: Mutex::new(None),
            active_driver_order: Mutex::new(None),
            driver_locations: Mutex::new(HashMap::new()),
            available: Mutex::new(Vec::new()),
            online_delay: Mutex::new(None),
            events,
        }
    }

    fn accept_token(&self, token: &str) {
        self.tokens.lock().unwrap().insert(token.to_string());
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .is_some_and(|token| self.tokens.lock().unwrap().contains(token))
    }

    fn record(&self, call: &str, body: Value) {
        self.calls.lock().unwrap().push((call.to_string(), body));
    }

    fn count(&self, call: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == call)
            .count()
    }

    fn last_body(&self, call: &str) -> Option<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(name, _)| name == call)
            .map(|(_, body)| body.clone())
    }

    fn insert_order(&self, order: Value) {
        let id = order["_id"].as_str().unwrap().to_string();
        self.orders.lock().unwrap().insert(id, order);
    }

    fn order(&self, id: &str) -> Value {
        self.orders.lock().unwrap()[id].clone()
    }

    fn set_field(&self, id: &str, field: &str, value: Value) {
        if let Some(order) = self.orders.lock().unwrap().get_mut(id) {
            order[field] = value;
        }
    }

    fn set_status(&self, id: &str, status: &str) {
        self.set_field(id, "status", json!(status));
    }

    fn push_event(&self, name: &str, data: Value) {
        let _ = self.events.send((name.to_string(), data.to_string()));
    }
}

type Shared = State<Arc<Mock>>;

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "Session expirée" })),
    )
        .into_response()
}

async fn get_order(State(mock): Shared, Path(id): Path<String>, headers: HeaderMap) -> Response {
    if !mock.authorized(&headers) {
        return unauthorized();
    }
    match mock.orders.lock().unwrap().get(&id) {
        Some(order) => Json(order.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn create_order(State(mock): Shared, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if !mock.authorized(&headers) {
        return unauthorized();
    }
    let id = format!("o-{}", uuid::Uuid::new_v4().simple());
    let mut order = body.clone();
    order["_id"] = json!(id);
    order["status"] = json!("searching");
    mock.insert_order(order);
    mock.record("create", body);
    Json(json!({ "_id": id })).into_response()
}

async fn cancel_order(
    State(mock): Shared,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !mock.authorized(&headers) {
        return unauthorized();
    }
    if let Some(message) = mock.cancel_error.lock().unwrap().clone() {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response();
    }
    mock.set_status(&id, "cancelled");
    mock.record("cancel", body);
    Json(json!({})).into_response()
}

async fn accept_order(State(mock): Shared, Path(id): Path<String>, headers: HeaderMap) -> Response {
    if !mock.authorized(&headers) {
        return unauthorized();
    }
    mock.set_status(&id, "assigned");
    mock.set_field(&id, "driver", json!({ "id": "d1", "name": "Kouassi" }));
    Json(mock.order(&id)).into_response()
}

async fn rate_order(
    State(mock): Shared,
    Path(_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !mock.authorized(&headers) {
        return unauthorized();
    }
    mock.record("rate", body);
    Json(json!({})).into_response()
}

async fn finalize_order(
    State(mock): Shared,
    Path(_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if !mock.authorized(&headers) {
        return unauthorized();
    }
    mock.record("finalize", body);
    Json(json!({})).into_response()
}

async fn receipt(State(mock): Shared, Path(_id): Path<String>, headers: HeaderMap) -> Response {
    if !mock.authorized(&headers) {
        return unauthorized();
    }
    (
        [("content-type", "application/pdf")],
        b"%PDF-1.4 receipt".to_vec(),
    )
        .into_response()
}

async fn resolve_share(Path(token): Path<String>) -> Response {
    match token.as_str() {
        "expired" => StatusCode::GONE.into_response(),
        "home" => Json(json!({})).into_response(),
        other => {
            let order_id = other.trim_end_matches("-share");
            Json(json!({ "redirectTo": format!("/trajet-en-cours?id={order_id}") })).into_response()
        }
    }
}

async fn available_orders(State(mock): Shared, headers: HeaderMap) -> Response {
    if !mock.authorized(&headers) {
        return unauthorized();
    }
    Json(json!({ "orders": mock.available.lock().unwrap().clone() })).into_response()
}

async fn driver_stats(State(mock): Shared, headers: HeaderMap) -> Response {
    if !mock.authorized(&headers) {
        return unauthorized();
    }
    Json(json!({ "dayTrips": 2, "monthTrips": 20, "dayRevenue": 1400, "monthRevenue": 14000 }))
        .into_response()
}

async fn driver_active(State(mock): Shared, headers: HeaderMap) -> Response {
    if !mock.authorized(&headers) {
        return unauthorized();
    }
    let order = mock
        .active_driver_order
        .lock()
        .unwrap()
        .clone()
        .map(|id| json!({ "_id": id }));
    Json(json!({ "order": order })).into_response()
}

async fn recent_orders(State(mock): Shared, headers: HeaderMap) -> Response {
    if !mock.authorized(&headers) {
        return unauthorized();
    }
    Json(json!({ "orders": [] })).into_response()
}

async fn get_status(State(mock): Shared, headers: HeaderMap) -> Response {
    if !mock.authorized(&headers) {
        return unauthorized();
    }
    Json(json!({ "online": mock.online.load(Ordering::SeqCst) })).into_response()
}

async fn set_status(State(mock): Shared, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if !mock.authorized(&headers) {
        return unauthorized();
    }
    let online = body["online"].as_bool().unwrap_or(false);
    let delay = *mock.online_delay.lock().unwrap();
    if let (true, Some(delay)) = (online, delay) {
        tokio::time::sleep(delay).await;
    }
    mock.online.store(online, Ordering::SeqCst);
    mock.record("status", body);
    Json(json!({})).into_response()
}

async fn heartbeat(State(mock): Shared, headers: HeaderMap) -> Response {
    if !mock.authorized(&headers) {
        return unauthorized();
    }
    mock.record("heartbeat", Value::Null);
    Json(json!({})).into_response()
}

async fn push_location(State(mock): Shared, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    if !mock.authorized(&headers) {
        return unauthorized();
    }
    mock.record("location", body);
    Json(json!({})).into_response()
}

async fn driver_location(
    State(mock): Shared,
    Path(driver_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !mock.authorized(&headers) {
        return unauthorized();
    }
    let location = mock.driver_locations.lock().unwrap().get(&driver_id).cloned();
    Json(json!({ "location": location })).into_response()
}

async fn login(State(mock): Shared, Json(body): Json<Value>) -> Response {
    let (token, role) = match body["identifier"].as_str() {
        Some("driver") => (DRIVER_TOKEN, "driver"),
        Some("client") => (CLIENT_TOKEN, "client"),
        _ => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "Identifiants invalides" })),
            )
                .into_response();
        }
    };
    mock.accept_token(token);
    Json(json!({ "token": token, "id": "u1", "name": "Awa", "role": role })).into_response()
}

async fn order_stream(State(mock): Shared, Query(query): Query<HashMap<String, String>>) -> Response {
    let allowed = query
        .get("token")
        .is_some_and(|token| mock.tokens.lock().unwrap().contains(token));
    if !allowed {
        return unauthorized();
    }

    let stream = BroadcastStream::new(mock.events.subscribe()).filter_map(|item| {
        item.ok()
            .map(|(name, data)| Ok::<_, Infallible>(Event::default().event(name).data(data)))
    });
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

async fn start_backend() -> (Arc<Mock>, String) {
    let mock = Arc::new(Mock::new());
    let app = Router::new()
        .route("/api/orders", post(create_order))
        .route("/api/orders/available", get(available_orders))
        .route("/api/orders/stream", get(order_stream))
        .route("/api/orders/driver/stats", get(driver_stats))
        .route("/api/orders/driver/active", get(driver_active))
        .route("/api/orders/client/recent", get(recent_orders))
        .route("/api/orders/:id", get(get_order))
        .route("/api/orders/:id/cancel", post(cancel_order))
        .route("/api/orders/:id/accept", post(accept_order))
        .route("/api/orders/:id/rate", post(rate_order))
        .route("/api/orders/:id/finalize", post(finalize_order))
        .route("/api/orders/:id/receipt.pdf", get(receipt))
        .route("/api/share/:token", get(resolve_share))
        .route("/api/drivers/me/status", get(get_status).post(set_status))
        .route("/api/drivers/me/heartbeat", post(heartbeat))
        .route("/api/drivers/me/location", post(push_location))
        .route("/api/drivers/:id/location", get(driver_location))
        .route("/api/auth/login", post(login))
        .with_state(mock.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (mock, format!("http://{addr}"))
}

// ---- helpers ----------------------------------------------------------------

fn fast_config(api_base: &str) -> Config {
    let ms = Duration::from_millis;
    Config {
        api_base: api_base.to_string(),
        request_timeout: ms(2_000),
        geo_timeout: ms(200),
        intervals: Intervals {
            waiting_poll: ms(20),
            live_trip_poll: ms(20),
            location_poll: ms(20),
            live_location_poll: ms(20),
            queue_poll: ms(30),
            stats_poll: ms(30),
            heartbeat: ms(30),
            cancel_clear: ms(80),
        },
        ..Config::default()
    }
}

fn tracker_state(config: Config) -> Arc<TrackerState> {
    Arc::new(TrackerState::new(config, SessionStore::in_memory()).unwrap())
}

fn sign_in(state: &TrackerState, role: Role, token: &str) {
    let user = SessionUser {
        id: Some("u1".to_string()),
        name: Some("Awa".to_string()),
        phone: None,
        role: Some(role.as_str().to_string()),
    };
    state.store.sign_in(role, token, &user);
}

fn controller(state: &Arc<TrackerState>, role: Role, fix: Option<LocationFix>) -> SessionController {
    SessionController::new(state.clone(), role, Arc::new(FixedLocationSource::new(fix)))
}

async fn wait_for(
    events: &mut broadcast::Receiver<UiEvent>,
    wanted: impl Fn(&UiEvent) -> bool,
) -> UiEvent {
    tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            let event = events.recv().await.unwrap();
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected ui event never arrived")
}

fn drain(events: &mut broadcast::Receiver<UiEvent>) -> Vec<UiEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

async fn board_until(presence: &PresenceChannel, check: impl Fn(&DriverBoard) -> bool) -> DriverBoard {
    for _ in 0..300 {
        let board = presence.snapshot().await;
        if check(&board) {
            return board;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("driver board never reached the expected state");
}

fn navigate(screen: Screen) -> UiEvent {
    UiEvent::Navigate(screen)
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

// ---- agent surface ----------------------------------------------------------

#[tokio::test]
async fn health_reports_session_shape() {
    let state = tracker_state(Config::default());
    let app = router(Arc::new(controller(&state, Role::Client, None)));

    let response = app.oneshot(get_request("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["role"], "client");
    assert_eq!(body["screen"], "/");
    assert_eq!(body["signed_in"], false);
    assert!(body["tracked_order"].is_null());
    assert!(body.get("online").is_none());
}

#[tokio::test]
async fn metrics_returns_prometheus_format() {
    let state = tracker_state(Config::default());
    let app = router(Arc::new(controller(&state, Role::Driver, None)));

    let response = app.oneshot(get_request("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.starts_with("text/plain"));

    let body = body_string(response).await;
    assert!(body.contains("active_order_pollers"));
    assert!(body.contains("active_heartbeats"));
}

// ---- ordering ---------------------------------------------------------------

fn draft() -> OrderDraft {
    OrderDraft {
        start: Some(GeoPoint::named("Marché", 6.2768, -7.0378)),
        destination: Some(GeoPoint::named("Gare", 6.2849, -7.0378)),
        passengers: 2,
        bag_offer: 300,
        ..OrderDraft::default()
    }
}

#[tokio::test]
async fn submitted_order_is_remembered_and_opens_waiting_screen() {
    let (mock, base) = start_backend().await;
    let state = tracker_state(fast_config(&base));
    let mut events = state.subscribe();

    client_flow::login_client(&state, "client", "secret")
        .await
        .unwrap();
    wait_for(&mut events, |e| *e == navigate(Screen::PreOrder)).await;

    let order_id = client_flow::submit_order(&state, &draft())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(state.store.last_order_id(), Some(order_id.clone()));
    wait_for(&mut events, |e| {
        *e == navigate(Screen::Waiting {
            order_id: order_id.clone(),
        })
    })
    .await;

    let stored = mock.order(&order_id);
    assert_eq!(stored["priceEstimate"], 700);
    assert_eq!(stored["passengers"], 2);
    assert_eq!(stored["bagOffer"], 300);
}

#[tokio::test]
async fn submitting_without_session_is_refused() {
    let state = tracker_state(Config::default());
    let err = client_flow::submit_order(&state, &draft()).await.unwrap_err();
    assert!(
        matches!(&err, TrackerError::Validation(message) if message == "Veuillez vous connecter pour commander.")
    );
    assert!(state.store.last_order_id().is_none());
}

// ---- order status poller ----------------------------------------------------

#[tokio::test]
async fn waiting_screen_announces_pickup_once_then_opens_summary() {
    let (mock, base) = start_backend().await;
    mock.accept_token(CLIENT_TOKEN);
    mock.insert_order(json!({ "_id": "o1", "status": "assigned", "driver": { "id": "d1" } }));

    let state = tracker_state(fast_config(&base));
    sign_in(&state, Role::Client, CLIENT_TOKEN);
    let controller = controller(&state, Role::Client, None);
    let mut events = state.subscribe();

    controller.track_order("o1", WatchScreen::Waiting);
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(drain(&mut events).is_empty());

    mock.set_status("o1", "in_progress");
    wait_for(&mut events, |e| {
        *e == UiEvent::Notify(Notice::info(RIDE_STARTING_NOTICE))
    })
    .await;
    wait_for(&mut events, |e| {
        *e == navigate(Screen::LiveTrip {
            order_id: "o1".to_string(),
        })
    })
    .await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(drain(&mut events).is_empty());

    mock.set_status("o1", "completed");
    wait_for(&mut events, |e| {
        *e == navigate(Screen::TripSummary {
            order_id: "o1".to_string(),
        })
    })
    .await;
}

#[tokio::test]
async fn driver_cancellation_returns_client_to_pre_order() {
    let (mock, base) = start_backend().await;
    mock.accept_token(CLIENT_TOKEN);
    mock.insert_order(json!({ "_id": "o2", "status": "pending" }));

    let state = tracker_state(fast_config(&base));
    sign_in(&state, Role::Client, CLIENT_TOKEN);
    state.store.set_last_order_id("o2");
    let controller = controller(&state, Role::Client, None);
    let mut events = state.subscribe();

    controller.track_order("o2", WatchScreen::Waiting);
    mock.set_status("o2", "canceled");

    wait_for(&mut events, |e| {
        *e == UiEvent::Notify(Notice::error(RIDE_CANCELLED_NOTICE))
    })
    .await;
    wait_for(&mut events, |e| *e == navigate(Screen::PreOrder)).await;
    assert!(state.store.last_order_id().is_none());
}

#[tokio::test]
async fn rejected_token_tears_session_down_exactly_once() {
    let (mock, base) = start_backend().await;
    mock.insert_order(json!({ "_id": "o3", "status": "assigned" }));

    let state = tracker_state(fast_config(&base));
    // the backend does not know this token
    sign_in(&state, Role::Client, CLIENT_TOKEN);
    state.store.set_last_order_id("o3");
    let controller = controller(&state, Role::Client, None);
    let mut events = state.subscribe();

    controller.track_order("o3", WatchScreen::Waiting);
    let (guard_target, recent) = tokio::join!(
        guard::check(&state, Role::Client),
        client_flow::recent_orders(&state, 3)
    );
    assert!(guard_target.is_none());
    assert!(recent.is_err() || recent.is_ok_and(|places| places.is_empty()));

    tokio::time::sleep(Duration::from_millis(150)).await;
    let logins = drain(&mut events)
        .into_iter()
        .filter(|e| *e == navigate(Screen::Login(Role::Client)))
        .count();
    assert_eq!(logins, 1);
    assert!(state.store.token(Role::Client).is_none());
    assert!(state.store.user(Role::Client).is_none());
    assert_eq!(
        state
            .metrics
            .session_teardowns_total
            .with_label_values(&["client"])
            .get(),
        1
    );
}

#[tokio::test]
async fn tracking_without_session_sends_client_to_login() {
    let (_mock, base) = start_backend().await;
    let state = tracker_state(fast_config(&base));
    let controller = controller(&state, Role::Client, None);
    let mut events = state.subscribe();

    controller.on_screen(&Screen::Waiting {
        order_id: "o1".to_string(),
    });
    wait_for(&mut events, |e| *e == navigate(Screen::Login(Role::Client))).await;
    eventually(|| state.metrics.active_order_pollers.get() == 0).await;
}

#[tokio::test]
async fn ride_start_is_not_announced_once_the_client_sees_the_live_trip() {
    let (mock, base) = start_backend().await;
    mock.accept_token(CLIENT_TOKEN);
    mock.insert_order(json!({ "_id": "o12", "status": "assigned" }));

    let state = tracker_state(fast_config(&base));
    sign_in(&state, Role::Client, CLIENT_TOKEN);
    let controller = controller(&state, Role::Client, None);
    let mut events = state.subscribe();

    controller.on_screen(&Screen::Waiting {
        order_id: "o12".to_string(),
    });
    tokio::time::sleep(Duration::from_millis(60)).await;

    // the guard moved the client to the live trip before the next poll
    mock.set_status("o12", "in_progress");
    controller.on_screen(&Screen::LiveTrip {
        order_id: "o12".to_string(),
    });
    tokio::time::sleep(Duration::from_millis(120)).await;

    let seen = drain(&mut events);
    assert!(
        !seen.contains(&UiEvent::Notify(Notice::info(RIDE_STARTING_NOTICE))),
        "unexpected events {seen:?}"
    );
    assert_eq!(controller.tracked_order().as_deref(), Some("o12"));
    assert_eq!(state.metrics.active_order_pollers.get(), 1);

    mock.set_status("o12", "completed");
    wait_for(&mut events, |e| {
        *e == navigate(Screen::TripSummary {
            order_id: "o12".to_string(),
        })
    })
    .await;
    eventually(|| state.metrics.active_order_pollers.get() == 0).await;
}

// ---- live location ----------------------------------------------------------

#[tokio::test]
async fn driver_position_follows_backend() {
    let (mock, base) = start_backend().await;
    mock.accept_token(CLIENT_TOKEN);
    mock.insert_order(json!({
        "_id": "o4",
        "status": "assigned",
        "driver": { "id": "d7" },
        "start": { "name": "Marché", "lat": 6.28, "lon": -7.03 },
        "destination": { "name": "Gare", "lat": 6.30, "lon": -7.03 }
    }));

    let state = tracker_state(fast_config(&base));
    sign_in(&state, Role::Client, CLIENT_TOKEN);
    let controller = controller(&state, Role::Client, None);

    let view = controller.track_order("o4", WatchScreen::Waiting);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(view.driver_position.borrow().is_none());

    mock.driver_locations
        .lock()
        .unwrap()
        .insert("d7".to_string(), json!({ "lat": 6.28, "lon": -7.03, "acc": 12.0 }));

    eventually(|| view.driver_position.borrow().is_some()).await;
    let fix = view.driver_position.borrow().unwrap();
    assert_eq!(fix.lat, 6.28);
    assert_eq!(fix.accuracy, Some(12.0));
    assert_eq!(view.order.borrow().as_ref().unwrap().id, "o4");

    // driver is at the pickup point
    let progress = view.progress(None).unwrap();
    assert!(progress.remaining_km < 0.01);
    assert_eq!(progress.eta_minutes, 0);
    assert_eq!(progress.progress_pct, 0);
}

// ---- resume guard -----------------------------------------------------------

#[tokio::test]
async fn guard_sends_client_back_to_running_order() {
    let (mock, base) = start_backend().await;
    mock.accept_token(CLIENT_TOKEN);
    mock.insert_order(json!({ "_id": "o5", "status": "in_progress" }));

    let state = tracker_state(fast_config(&base));
    sign_in(&state, Role::Client, CLIENT_TOKEN);
    state.store.set_last_order_id("o5");

    let live = Screen::LiveTrip {
        order_id: "o5".to_string(),
    };
    assert_eq!(guard::check(&state, Role::Client).await, Some(live.clone()));

    state.set_current_screen(live);
    assert_eq!(guard::check(&state, Role::Client).await, None);

    mock.set_status("o5", "completed");
    state.set_current_screen(Screen::Home);
    assert_eq!(guard::check(&state, Role::Client).await, None);
    assert!(state.store.last_order_id().is_none());
}

#[tokio::test]
async fn guard_adopts_driver_order_reported_by_backend() {
    let (mock, base) = start_backend().await;
    mock.accept_token(DRIVER_TOKEN);
    *mock.active_driver_order.lock().unwrap() = Some("o6".to_string());

    let state = tracker_state(fast_config(&base));
    sign_in(&state, Role::Driver, DRIVER_TOKEN);

    assert_eq!(
        guard::check(&state, Role::Driver).await,
        Some(Screen::DriverDashboard)
    );
    assert_eq!(state.store.last_driver_order_id().as_deref(), Some("o6"));

    state.set_current_screen(Screen::DriverDashboard);
    assert_eq!(guard::check(&state, Role::Driver).await, None);
}

#[tokio::test]
async fn guard_task_runs_on_mount() {
    let (mock, base) = start_backend().await;
    mock.accept_token(CLIENT_TOKEN);
    mock.insert_order(json!({ "_id": "o7", "status": "searching" }));

    let state = tracker_state(fast_config(&base));
    sign_in(&state, Role::Client, CLIENT_TOKEN);
    state.store.set_last_order_id("o7");
    let controller = controller(&state, Role::Client, None);
    let mut events = state.subscribe();

    controller.start_guard();
    wait_for(&mut events, |e| {
        *e == navigate(Screen::Waiting {
            order_id: "o7".to_string(),
        })
    })
    .await;
}

// ---- presence ---------------------------------------------------------------

#[tokio::test]
async fn going_online_twice_keeps_one_set_of_tasks() {
    let (mock, base) = start_backend().await;
    mock.accept_token(DRIVER_TOKEN);

    let state = tracker_state(fast_config(&base));
    sign_in(&state, Role::Driver, DRIVER_TOKEN);
    let controller = controller(&state, Role::Driver, Some(LocationFix::new(6.27, -7.03)));
    let presence = controller.presence().unwrap();
    let metrics = &state.metrics;

    presence.set_online(true).await.unwrap();
    presence.set_online(true).await.unwrap();
    assert!(presence.is_online().await);
    assert!(mock.online.load(Ordering::SeqCst));
    assert_eq!(metrics.active_heartbeats.get(), 1);
    assert_eq!(metrics.active_event_streams.get(), 1);
    assert_eq!(metrics.active_location_watches.get(), 1);

    eventually(|| mock.count("heartbeat") >= 1 && mock.count("location") >= 1).await;
    assert_eq!(
        mock.last_body("location").unwrap(),
        json!({ "lat": 6.27, "lon": -7.03, "acc": null })
    );
    assert_eq!(state.store.last_location(), Some(LocationFix::new(6.27, -7.03)));
    let presence_rx = presence.presence();
    eventually(|| presence_rx.borrow().heartbeat_at.is_some()).await;
    {
        let now = presence_rx.borrow();
        assert!(now.online);
        assert_eq!(now.last_location, Some(LocationFix::new(6.27, -7.03)));
        assert!(now.last_location_at.is_some());
    }

    presence.set_online(false).await.unwrap();
    presence.set_online(true).await.unwrap();
    assert_eq!(metrics.active_heartbeats.get(), 1);
    assert_eq!(metrics.active_location_watches.get(), 1);

    presence.set_online(false).await.unwrap();
    presence.set_online(false).await.unwrap();
    assert!(!presence.is_online().await);
    assert!(!mock.online.load(Ordering::SeqCst));
    assert_eq!(metrics.active_heartbeats.get(), 0);
    assert_eq!(metrics.active_event_streams.get(), 0);
    assert_eq!(metrics.active_location_watches.get(), 0);
    assert!(!presence_rx.borrow().online);
}

#[tokio::test]
async fn going_offline_during_a_pending_online_toggle_wins() {
    let (mock, base) = start_backend().await;
    mock.accept_token(DRIVER_TOKEN);
    *mock.online_delay.lock().unwrap() = Some(Duration::from_millis(300));

    let state = tracker_state(fast_config(&base));
    sign_in(&state, Role::Driver, DRIVER_TOKEN);
    let controller = controller(&state, Role::Driver, Some(LocationFix::new(6.27, -7.03)));
    let presence = controller.presence().unwrap();
    let metrics = &state.metrics;

    let (on, off) = tokio::join!(presence.set_online(true), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        presence.set_online(false).await
    });
    on.unwrap();
    off.unwrap();

    assert!(!presence.is_online().await);
    assert!(!mock.online.load(Ordering::SeqCst));
    assert_eq!(metrics.active_heartbeats.get(), 0);
    assert_eq!(metrics.active_location_watches.get(), 0);
    assert_eq!(metrics.active_event_streams.get(), 0);

    let heartbeats = mock.count("heartbeat");
    let locations = mock.count("location");
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(mock.count("heartbeat"), heartbeats);
    assert_eq!(mock.count("location"), locations);
}

/// Driver online with `o8` accepted and the event stream connected.
async fn driver_with_accepted_order(
    mock: &Mock,
    base: &str,
    cancel_clear: Duration,
) -> (Arc<TrackerState>, SessionController) {
    mock.accept_token(DRIVER_TOKEN);
    mock.insert_order(json!({ "_id": "o8", "status": "pending" }));

    let mut config = fast_config(base);
    config.intervals.queue_poll = Duration::from_secs(30);
    config.intervals.cancel_clear = cancel_clear;
    let state = tracker_state(config);
    sign_in(&state, Role::Driver, DRIVER_TOKEN);
    let controller = controller(&state, Role::Driver, Some(LocationFix::new(6.27, -7.03)));

    let presence = controller.presence().unwrap();
    presence.set_online(true).await.unwrap();
    presence.accept("o8").await.unwrap();
    eventually(|| mock.events.receiver_count() > 0).await;
    (state, controller)
}

#[tokio::test]
async fn repeated_cancellation_restarts_the_clear_delay() {
    let (mock, base) = start_backend().await;
    let (state, controller) =
        driver_with_accepted_order(&mock, &base, Duration::from_millis(200)).await;
    let presence = controller.presence().unwrap();

    mock.push_event("order_cancelled", json!({ "orderId": "o8" }));
    board_until(presence, |board| board.accepted_cancelled).await;
    tokio::time::sleep(Duration::from_millis(120)).await;

    mock.push_event("order_cancelled", json!({ "orderId": "o8" }));
    // past the first delay, inside the second one
    tokio::time::sleep(Duration::from_millis(120)).await;
    let board = presence.snapshot().await;
    assert!(board.accepted_cancelled);
    assert_eq!(board.accepted.as_ref().map(|o| o.id.as_str()), Some("o8"));
    assert_eq!(state.store.last_driver_order_id().as_deref(), Some("o8"));

    board_until(presence, |board| board.accepted.is_none()).await;
    assert!(state.store.last_driver_order_id().is_none());
    controller.shutdown().await;
}

#[tokio::test]
async fn going_offline_cancels_the_clear_delay() {
    let (mock, base) = start_backend().await;
    let (state, controller) =
        driver_with_accepted_order(&mock, &base, Duration::from_millis(100)).await;
    let presence = controller.presence().unwrap();

    mock.push_event("order_cancelled", json!({ "orderId": "o8" }));
    board_until(presence, |board| board.accepted_cancelled).await;
    presence.set_online(false).await.unwrap();

    tokio::time::sleep(Duration::from_millis(250)).await;
    let board = presence.snapshot().await;
    assert!(board.accepted_cancelled);
    assert_eq!(board.accepted.as_ref().map(|o| o.id.as_str()), Some("o8"));
    assert_eq!(state.store.last_driver_order_id().as_deref(), Some("o8"));
}

#[tokio::test]
async fn pushed_events_update_queue_and_accepted_order() {
    let (mock, base) = start_backend().await;
    mock.accept_token(DRIVER_TOKEN);
    mock.insert_order(json!({ "_id": "o8", "status": "pending" }));
    *mock.available.lock().unwrap() = vec![json!({ "_id": "o8" }), json!({ "_id": "o9" })];

    let mut config = fast_config(&base);
    config.intervals.queue_poll = Duration::from_secs(30);
    let state = tracker_state(config);
    sign_in(&state, Role::Driver, DRIVER_TOKEN);
    let controller = controller(&state, Role::Driver, Some(LocationFix::new(6.27, -7.03)));
    let presence = controller.presence().unwrap();
    let mut events = state.subscribe();

    presence.set_online(true).await.unwrap();
    board_until(presence, |board| board.queue.len() == 2).await;

    let accepted = presence.accept("o8").await.unwrap();
    assert_eq!(accepted.driver_id(), Some("d1"));
    assert_eq!(state.store.last_driver_order_id().as_deref(), Some("o8"));

    eventually(|| mock.events.receiver_count() > 0).await;

    mock.push_event("order_assigned", json!({ "orderId": "o9" }));
    board_until(presence, |board| board.queue.is_empty()).await;

    mock.push_event("order_cancelled", json!({ "orderId": "o8" }));
    let board = board_until(presence, |board| board.accepted_cancelled).await;
    assert!(!board.can_act());
    let notice = wait_for(&mut events, |e| matches!(e, UiEvent::Notify(_))).await;
    assert_eq!(
        notice,
        UiEvent::Notify(Notice::error("Commande annulée par le client."))
    );

    board_until(presence, |board| board.accepted.is_none()).await;
    assert!(state.store.last_driver_order_id().is_none());

    controller.shutdown().await;
    assert!(!mock.online.load(Ordering::SeqCst));
    assert_eq!(state.metrics.active_event_streams.get(), 0);
}

// ---- foreground client actions ---------------------------------------------

#[tokio::test]
async fn refused_cancellation_keeps_order_tracked() {
    let (mock, base) = start_backend().await;
    mock.accept_token(CLIENT_TOKEN);
    mock.insert_order(json!({ "_id": "o10", "status": "assigned" }));
    *mock.cancel_error.lock().unwrap() = Some("Course déjà commencée".to_string());

    let state = tracker_state(fast_config(&base));
    sign_in(&state, Role::Client, CLIENT_TOKEN);
    state.store.set_last_order_id("o10");
    let controller = controller(&state, Role::Client, None);
    controller.track_order("o10", WatchScreen::Waiting);

    let err = controller.cancel_order("o10").await.unwrap_err();
    assert!(matches!(&err, TrackerError::Validation(message) if message == "Course déjà commencée"));
    assert_eq!(state.store.last_order_id().as_deref(), Some("o10"));
    assert_eq!(controller.tracked_order().as_deref(), Some("o10"));

    *mock.cancel_error.lock().unwrap() = None;
    let mut events = state.subscribe();
    controller.cancel_order("o10").await.unwrap();

    assert!(state.store.last_order_id().is_none());
    assert!(controller.tracked_order().is_none());
    assert_eq!(
        mock.last_body("cancel").unwrap(),
        json!({ "reason": "Client cancellation from UI" })
    );
    let notice = wait_for(&mut events, |e| matches!(e, UiEvent::Notify(_))).await;
    match notice {
        UiEvent::Notify(notice) => assert_eq!(notice.level, NoticeLevel::Warning),
        other => panic!("unexpected event {other:?}"),
    }
    wait_for(&mut events, |e| *e == navigate(Screen::PreOrder)).await;
}

#[tokio::test]
async fn trip_is_rated_once_and_finalized() {
    let (mock, base) = start_backend().await;
    mock.accept_token(CLIENT_TOKEN);
    mock.insert_order(json!({
        "_id": "order-123456",
        "status": "completed",
        "start": { "name": "A", "lat": 6.27, "lon": -7.03 },
        "destination": { "name": "B", "lat": 6.29, "lon": -7.02 },
        "priceEstimate": 600
    }));

    let state = tracker_state(fast_config(&base));
    sign_in(&state, Role::Client, CLIENT_TOKEN);
    let mut events = state.subscribe();

    let mut summary = client_flow::load_trip_summary(&state, "order-123456")
        .await
        .unwrap();
    assert_eq!(summary.price, 600);
    assert_eq!(summary.total(150), 750);

    let checkout = Checkout {
        tip: 150,
        payment_method: "cash".to_string(),
        ..Checkout::default()
    };
    client_flow::finish_trip(&state, &mut summary, 5, "Très bien", &checkout)
        .await
        .unwrap();

    assert_eq!(mock.count("rate"), 1);
    assert_eq!(
        mock.last_body("rate").unwrap(),
        json!({ "rating": 5, "review": "Très bien" })
    );
    assert_eq!(
        mock.last_body("finalize").unwrap(),
        json!({ "tip": 150, "paymentMethod": "cash" })
    );
    wait_for(&mut events, |e| *e == navigate(Screen::Home)).await;

    assert!(!client_flow::rate_once(&state, &mut summary, 4, "").await.unwrap());
    assert_eq!(mock.count("rate"), 1);

    let receipt = client_flow::receipt_pdf(&state, "order-123456").await.unwrap();
    assert_eq!(receipt.file_name, "recu-tricycle-123456.pdf");
    assert!(receipt.bytes.starts_with(b"%PDF"));
}

#[tokio::test]
async fn share_links_resolve_or_expire() {
    let (_mock, base) = start_backend().await;
    let state = tracker_state(fast_config(&base));

    assert_eq!(
        client_flow::resolve_share(&state, "o11-share").await,
        Screen::LiveTrip {
            order_id: "o11".to_string()
        }
    );
    assert_eq!(client_flow::resolve_share(&state, "home").await, Screen::Home);
    assert_eq!(
        client_flow::resolve_share(&state, "expired").await,
        Screen::TrackingExpired
    );
    assert_eq!(state.current_screen(), Screen::TrackingExpired);
}

#[tokio::test]
async fn logins_are_checked_against_the_account_role() {
    let (_mock, base) = start_backend().await;
    let state = tracker_state(fast_config(&base));

    let err = client_flow::login_client(&state, "driver", "pw")
        .await
        .unwrap_err();
    assert!(matches!(&err, TrackerError::Validation(message) if message.contains("conducteur")));
    assert!(state.store.token(Role::Client).is_none());

    let err = client_flow::login_driver(&state, "client", "pw")
        .await
        .unwrap_err();
    assert!(
        matches!(&err, TrackerError::Validation(message) if message == "Ce compte n'est pas un conducteur")
    );

    let err = client_flow::login_client(&state, "nobody", "pw")
        .await
        .unwrap_err();
    assert!(matches!(err, TrackerError::Validation(_)));

    let user = client_flow::login_driver(&state, " driver ", "pw")
        .await
        .unwrap();
    assert_eq!(user.role.as_deref(), Some("driver"));
    assert_eq!(state.store.token(Role::Driver).as_deref(), Some(DRIVER_TOKEN));
    assert_eq!(state.current_screen(), Screen::DriverDashboard);
    assert_eq!(
        client_flow::signed_in_home(&state, Role::Driver),
        Some(Screen::DriverDashboard)
    );

    client_flow::logout(&state, Role::Driver);
    assert!(state.store.token(Role::Driver).is_none());
    assert_eq!(state.current_screen(), Screen::Login(Role::Driver));
}
