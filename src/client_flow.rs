//! Foreground actions of the client and of the login screens. Errors are
//! returned to the caller for display; unauthorized responses end the
//! session on the way out.

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::backend::types::{CreateOrderRequest, FinalizeRequest, RecentOrder};
use crate::error::TrackerError;
use crate::geo::{self, DEFAULT_SPEED_KMH};
use crate::models::order::{Amount, GeoPoint, Order};
use crate::models::screen::{Notice, Screen};
use crate::models::session::{
    AdminLoginRequest, AuthResponse, LoginRequest, RegisterRequest, Role, SessionUser,
};
use crate::state::TrackerState;

pub const CLIENT_CANCEL_REASON: &str = "Client cancellation from UI";
const CLIENT_CANCELLED_NOTICE: &str = "Course annulée. Des frais d'annulation peuvent s'appliquer.";
const LOGIN_REQUIRED: &str = "Veuillez vous connecter pour commander.";
const INVALID_ROUTE: &str = "Choisissez un départ et une destination différents.";
const DRIVER_ACCOUNT_ON_CLIENT_LOGIN: &str =
    "Ce compte est un conducteur. Veuillez utiliser la connexion conducteur.";
const NOT_A_DRIVER: &str = "Ce compte n'est pas un conducteur";
const LOGIN_FAILED: &str = "Connexion échouée";
const RATING_FAILED: &str = "Envoi de la note impossible. Veuillez réessayer.";
const THANKS_NOTICE: &str = "Merci pour votre course !";
const SHARE_TITLE: &str = "Suivez mon trajet Tricycle";
const ADMIN_HOME: &str = "/admin";
const MAX_BAGS: u8 = 3;
/// The recent places list assumes a slightly slower pace than the trip views.
const RECENT_SPEED_KMH: f64 = 20.0;

/// The order form before submission.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderDraft {
    pub start: Option<GeoPoint>,
    pub destination: Option<GeoPoint>,
    pub passengers: u8,
    pub bags: u8,
    pub bag_offer: Amount,
    pub bag_description: String,
    pub accessible: bool,
    pub promo_code: String,
}

impl OrderDraft {
    pub fn can_order(&self) -> bool {
        geo::can_order(self.start.as_ref(), self.destination.as_ref())
    }

    pub fn distance_km(&self) -> f64 {
        geo::distance_km(self.start.as_ref(), self.destination.as_ref())
    }

    pub fn duration_minutes(&self) -> u32 {
        geo::order_form_duration_minutes(self.distance_km())
    }

    /// Shown price; zero until both endpoints are chosen and distinct.
    pub fn price(&self) -> Amount {
        if self.can_order() {
            geo::order_form_price(self.passengers, self.bag_offer)
        } else {
            0
        }
    }

    pub fn to_request(&self) -> CreateOrderRequest {
        CreateOrderRequest {
            start: self.start.clone(),
            destination: self.destination.clone(),
            passengers: geo::clamp_passengers(self.passengers),
            bags: self.bags.min(MAX_BAGS),
            bag_offer: self.bag_offer.max(0),
            bag_description: self.bag_description.trim().to_string(),
            accessible: self.accessible,
            promo_code: self.promo_code.clone(),
            price_estimate: self.price(),
        }
    }
}

/// Places the order, remembers it for resumption and opens the waiting screen.
pub async fn submit_order(
    state: &TrackerState,
    draft: &OrderDraft,
) -> Result<Option<String>, TrackerError> {
    if !draft.can_order() {
        return Err(TrackerError::Validation(INVALID_ROUTE.to_string()));
    }
    let Some(token) = state.store.token(Role::Client) else {
        return Err(TrackerError::Validation(LOGIN_REQUIRED.to_string()));
    };

    let order_id = state
        .api
        .create_order(&token, &draft.to_request())
        .await
        .map_err(|err| state.check_auth(Role::Client, err))?;

    match &order_id {
        Some(order_id) => {
            info!(order_id = %order_id, "order submitted");
            state.store.set_last_order_id(order_id);
            state.navigate(Screen::Waiting {
                order_id: order_id.clone(),
            });
        }
        None => {
            debug!("order submitted without id in response");
            state.navigate(Screen::Route("/commande-acceptee".to_string()));
        }
    }
    Ok(order_id)
}

/// Client side cancellation. On failure nothing changes locally so the
/// client can retry.
pub async fn cancel_order(
    state: &TrackerState,
    order_id: &str,
    reason: &str,
) -> Result<(), TrackerError> {
    let token = state.require_token(Role::Client)?;

    state
        .api
        .cancel_order(&token, order_id, reason)
        .await
        .map_err(|err| state.check_auth(Role::Client, err))?;

    info!(order_id, "order cancelled by client");
    state.store.clear_last_order_id();
    state.notify(Notice::warning(CLIENT_CANCELLED_NOTICE));
    state.navigate(Screen::PreOrder);
    Ok(())
}

/// Figures shown at the end of a ride.
#[derive(Debug, Clone, PartialEq)]
pub struct TripSummary {
    pub order_id: String,
    pub distance_km: f64,
    /// Actual ride time when both timestamps are known, else an estimate.
    pub minutes: u32,
    pub price: Amount,
    pub rating: Option<u8>,
    pub review: Option<String>,
}

impl TripSummary {
    pub fn from_order(order: &Order) -> Self {
        let distance_km = geo::distance_km(order.start.as_ref(), order.destination.as_ref());
        let minutes = geo::ride_duration_minutes(order.started_at, order.completed_at)
            .unwrap_or_else(|| geo::eta_minutes(distance_km, DEFAULT_SPEED_KMH));
        let price = order
            .price_estimate
            .unwrap_or_else(|| geo::legacy_estimate_price(distance_km));
        let rating = order
            .is_rated()
            .then(|| order.rating.map(|r| r.round().clamp(1.0, 5.0) as u8))
            .flatten();

        Self {
            order_id: order.id.clone(),
            distance_km,
            minutes,
            price,
            rating,
            review: order.review.clone(),
        }
    }

    pub fn already_rated(&self) -> bool {
        self.rating.is_some()
    }

    pub fn total(&self, tip: Amount) -> Amount {
        self.price + tip.max(0)
    }
}

pub async fn load_trip_summary(
    state: &TrackerState,
    order_id: &str,
) -> Result<TripSummary, TrackerError> {
    let token = state.require_token(Role::Client)?;
    let order = state
        .api
        .get_order(&token, order_id)
        .await
        .map_err(|err| state.check_auth(Role::Client, err))?;
    Ok(TripSummary::from_order(&order))
}

/// Sends the rating unless the order already carries one. Returns whether
/// a rating was sent.
pub async fn rate_once(
    state: &TrackerState,
    summary: &mut TripSummary,
    rating: u8,
    review: &str,
) -> Result<bool, TrackerError> {
    if summary.already_rated() || !(1..=5).contains(&rating) {
        return Ok(false);
    }
    let token = state.require_token(Role::Client)?;

    state
        .api
        .rate_order(&token, &summary.order_id, rating, review)
        .await
        .map_err(|err| state.check_auth(Role::Client, err))?;

    summary.rating = Some(rating);
    summary.review = Some(review.to_string());
    Ok(true)
}

/// Tip, payment method and optional receipt preferences.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Checkout {
    pub tip: Amount,
    pub payment_method: String,
    pub receipt_requested: bool,
    pub receipt_email: Option<String>,
}

impl Checkout {
    pub fn to_request(&self) -> FinalizeRequest {
        FinalizeRequest {
            tip: self.tip.max(0),
            payment_method: self.payment_method.clone(),
            receipt_requested: self.receipt_requested.then_some(true),
            receipt_email: self.receipt_email.clone().filter(|email| !email.trim().is_empty()),
        }
    }
}

pub async fn finalize(
    state: &TrackerState,
    order_id: &str,
    checkout: &Checkout,
) -> Result<(), TrackerError> {
    let token = state.require_token(Role::Client)?;
    state
        .api
        .finalize_order(&token, order_id, &checkout.to_request())
        .await
        .map_err(|err| state.check_auth(Role::Client, err))
}

/// "Finish" on the summary screen: rating first, then the best effort
/// finalization, then home.
pub async fn finish_trip(
    state: &TrackerState,
    summary: &mut TripSummary,
    rating: u8,
    review: &str,
    checkout: &Checkout,
) -> Result<(), TrackerError> {
    if let Err(err) = rate_once(state, summary, rating, review).await {
        if !err.is_auth() {
            state.notify(Notice::error(RATING_FAILED));
        }
        return Err(err);
    }

    if let Err(err) = finalize(state, &summary.order_id, checkout).await {
        if err.is_auth() {
            return Err(err);
        }
        debug!(order_id = %summary.order_id, error = %err, "finalize failed");
    }

    state.notify(Notice::success(THANKS_NOTICE));
    state.navigate(Screen::Home);
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

pub async fn receipt_pdf(state: &TrackerState, order_id: &str) -> Result<Receipt, TrackerError> {
    let token = state.require_token(Role::Client)?;
    let bytes = state
        .api
        .receipt_pdf(&token, order_id)
        .await
        .map_err(|err| state.check_auth(Role::Client, err))?;

    Ok(Receipt {
        file_name: receipt_file_name(order_id),
        bytes,
    })
}

fn receipt_file_name(order_id: &str) -> String {
    let chars: Vec<char> = order_id.chars().collect();
    let suffix: String = chars[chars.len().saturating_sub(6)..].iter().collect();
    format!("recu-tricycle-{suffix}.pdf")
}

/// Content handed to the platform share sheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareMessage {
    pub title: String,
    pub text: String,
    pub url: String,
}

pub async fn share_ride(
    state: &TrackerState,
    order_id: &str,
    eta_minutes: u32,
) -> Result<ShareMessage, TrackerError> {
    let token = state.require_token(Role::Client)?;
    let url = state
        .api
        .share_order(&token, order_id)
        .await
        .map_err(|err| state.check_auth(Role::Client, err))?;

    Ok(ShareMessage {
        title: SHARE_TITLE.to_string(),
        text: format!("Mon ETA: ~{eta_minutes} min"),
        url,
    })
}

/// Opens a public tracking link. Any failure lands on the expired screen.
pub async fn resolve_share(state: &TrackerState, share_token: &str) -> Screen {
    let screen = match state.api.resolve_share(share_token).await {
        Ok(Some(target)) => Screen::from_path(&target),
        Ok(None) => Screen::Home,
        Err(err) => {
            debug!(error = %err, "share link not resolvable");
            Screen::TrackingExpired
        }
    };
    state.navigate(screen.clone());
    screen
}

/// A recent destination on the pre-order screen.
#[derive(Debug, Clone, PartialEq)]
pub struct RecentPlace {
    pub order_id: Option<String>,
    pub title: String,
    pub subtitle: String,
    pub eta_minutes: u32,
    pub at: Option<DateTime<Utc>>,
}

impl From<RecentOrder> for RecentPlace {
    fn from(order: RecentOrder) -> Self {
        let km = geo::distance_km(order.start.as_ref(), order.destination.as_ref());
        Self {
            order_id: order.id,
            title: order
                .destination
                .and_then(|d| d.name)
                .unwrap_or_else(|| "Destination récente".to_string()),
            subtitle: order.start.and_then(|s| s.name).unwrap_or_default(),
            eta_minutes: (km / RECENT_SPEED_KMH * 60.0).round() as u32,
            at: order.completed_at.or(order.created_at),
        }
    }
}

pub async fn recent_orders(
    state: &TrackerState,
    limit: usize,
) -> Result<Vec<RecentPlace>, TrackerError> {
    let Some(token) = state.store.token(Role::Client) else {
        return Ok(Vec::new());
    };
    let orders = state
        .api
        .recent_orders(&token, limit)
        .await
        .map_err(|err| state.check_auth(Role::Client, err))?;

    Ok(orders
        .into_iter()
        .take(limit)
        .map(RecentPlace::from)
        .collect())
}

// ---- authentication ---------------------------------------------------------

fn sign_in(state: &TrackerState, role: Role, auth: &AuthResponse) -> Result<SessionUser, TrackerError> {
    let token = auth
        .token
        .as_deref()
        .filter(|token| !token.is_empty())
        .ok_or_else(|| TrackerError::Validation(LOGIN_FAILED.to_string()))?;
    let user = auth.user();
    state.store.sign_in(role, token, &user);
    info!(role = %role, "signed in");
    Ok(user)
}

/// Client login; driver accounts are sent to their own login.
pub async fn login_client(
    state: &TrackerState,
    identifier: &str,
    password: &str,
) -> Result<SessionUser, TrackerError> {
    let auth = state
        .api
        .login(&LoginRequest {
            identifier: identifier.trim().to_string(),
            password: password.to_string(),
        })
        .await?;
    if auth.has_role(Role::Driver) {
        return Err(TrackerError::Validation(
            DRIVER_ACCOUNT_ON_CLIENT_LOGIN.to_string(),
        ));
    }

    let user = sign_in(state, Role::Client, &auth)?;
    state.navigate(Screen::PreOrder);
    Ok(user)
}

pub async fn login_driver(
    state: &TrackerState,
    identifier: &str,
    password: &str,
) -> Result<SessionUser, TrackerError> {
    let auth = state
        .api
        .login(&LoginRequest {
            identifier: identifier.trim().to_string(),
            password: password.to_string(),
        })
        .await?;
    if !auth.has_role(Role::Driver) {
        return Err(TrackerError::Validation(NOT_A_DRIVER.to_string()));
    }

    let user = sign_in(state, Role::Driver, &auth)?;
    state.navigate(Screen::DriverDashboard);
    Ok(user)
}

pub async fn login_admin(
    state: &TrackerState,
    username: &str,
    password: &str,
) -> Result<SessionUser, TrackerError> {
    let auth = state
        .api
        .admin_login(&AdminLoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        })
        .await?;

    let user = sign_in(state, Role::Admin, &auth)?;
    state.navigate(Screen::Route(ADMIN_HOME.to_string()));
    Ok(user)
}

/// Registration signs the new account in under the role the backend gave it.
pub async fn register(
    state: &TrackerState,
    request: &RegisterRequest,
) -> Result<(Role, SessionUser), TrackerError> {
    let auth = state.api.register(request).await?;
    let role = if auth.has_role(Role::Driver) {
        Role::Driver
    } else {
        Role::Client
    };

    let user = sign_in(state, role, &auth)?;
    state.navigate(match role {
        Role::Driver => Screen::Login(Role::Driver),
        _ => Screen::PreOrder,
    });
    Ok((role, user))
}

pub fn logout(state: &TrackerState, role: Role) {
    state.store.logout(role);
    info!(role = %role, "signed out");
    state.navigate(Screen::login_for(role));
}

/// Where a login screen sends a user who is already signed in.
pub fn signed_in_home(state: &TrackerState, role: Role) -> Option<Screen> {
    let user = state.store.user(role)?;
    if user.role.as_deref() != Some(role.as_str()) {
        return None;
    }
    match role {
        Role::Client => state.store.token(role).map(|_| Screen::PreOrder),
        Role::Driver => Some(Screen::DriverDashboard),
        Role::Admin => Some(Screen::Route(ADMIN_HOME.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn draft(pax: u8, bag_offer: Amount) -> OrderDraft {
        OrderDraft {
            start: Some(GeoPoint::named("Marché", 6.2768, -7.0378)),
            // about 0.9 km north
            destination: Some(GeoPoint::named("Gare", 6.2849, -7.0378)),
            passengers: pax,
            bag_offer,
            ..OrderDraft::default()
        }
    }

    #[test]
    fn commander_price_for_two_passengers_and_bags() {
        let draft = draft(2, 300);
        let km = draft.distance_km();
        assert!((km - 0.9).abs() < 0.05, "got {km}");
        assert_eq!(draft.price(), 700);
        assert_eq!(draft.to_request().price_estimate, 700);
    }

    #[test]
    fn draft_with_same_place_cannot_be_ordered() {
        let mut draft = draft(1, 0);
        draft.destination = draft.start.clone();
        assert!(!draft.can_order());
        assert_eq!(draft.price(), 0);
    }

    #[test]
    fn request_is_normalized() {
        let mut draft = draft(7, -20);
        draft.bags = 9;
        draft.bag_description = "  valise  ".to_string();
        let request = draft.to_request();
        assert_eq!(request.passengers, 3);
        assert_eq!(request.bags, 3);
        assert_eq!(request.bag_offer, 0);
        assert_eq!(request.bag_description, "valise");

        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["bagOffer"], json!(0));
        assert_eq!(body["priceEstimate"], json!(600));
        assert_eq!(body["promoCode"], json!(""));
    }

    #[test]
    fn summary_prefers_actual_ride_time_and_backend_price() {
        let order: Order = serde_json::from_value(json!({
            "id": "o1",
            "status": "completed",
            "start": { "name": "A", "lat": 6.27, "lon": -7.03 },
            "destination": { "name": "B", "lat": 6.29, "lon": -7.02 },
            "priceEstimate": 600,
            "startedAt": "2025-03-01T10:00:00Z",
            "completedAt": "2025-03-01T10:07:40Z"
        }))
        .unwrap();
        let summary = TripSummary::from_order(&order);
        assert_eq!(summary.minutes, 8);
        assert_eq!(summary.price, 600);
        assert_eq!(summary.total(100), 700);
        assert!(!summary.already_rated());
    }

    #[test]
    fn summary_falls_back_to_legacy_price_and_estimate() {
        let order: Order = serde_json::from_value(json!({
            "id": "o2",
            "status": "completed",
            "start": { "lat": 0.0, "lon": 0.0 },
            "destination": { "lat": 0.0, "lon": 0.1 },
            "rating": 4
        }))
        .unwrap();
        let summary = TripSummary::from_order(&order);
        // 11.1 km at 22 km/h
        assert_eq!(summary.minutes, 30);
        assert_eq!(summary.price, 2302);
        assert_eq!(summary.rating, Some(4));
    }

    #[test]
    fn checkout_omits_unset_receipt_fields() {
        let body = serde_json::to_value(
            Checkout {
                tip: 100,
                payment_method: "cash".to_string(),
                ..Checkout::default()
            }
            .to_request(),
        )
        .unwrap();
        assert_eq!(body, json!({ "tip": 100, "paymentMethod": "cash" }));
    }

    #[test]
    fn receipt_name_uses_id_suffix() {
        assert_eq!(receipt_file_name("66f0c0ffee1234"), "recu-tricycle-ee1234.pdf");
        assert_eq!(receipt_file_name("ab"), "recu-tricycle-ab.pdf");
    }

    #[test]
    fn recent_place_uses_destination_name() {
        let order = RecentOrder {
            id: Some("r1".to_string()),
            start: Some(GeoPoint::named("Marché", 0.0, 0.0)),
            destination: None,
            created_at: Some(Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()),
            completed_at: None,
        };
        let place = RecentPlace::from(order);
        assert_eq!(place.title, "Destination récente");
        assert_eq!(place.subtitle, "Marché");
        assert_eq!(place.eta_minutes, 0);
        assert!(place.at.is_some());
    }
}
