//! Stateless HTTP client for the ride backend. Every protected call takes
//! the bearer token of the acting role explicitly.

use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::backend::types::{
    ActiveOrderResponse, AvailableOrders, CancelRequest, CreateOrderRequest, CreatedOrder,
    DriverLocationResponse, FinalizeRequest, LocationPush, OrderUpdate, RateRequest, RecentOrder,
    RecentOrders, ShareResolution, ShareResponse,
};
use crate::error::TrackerError;
use crate::models::driver::{DriverStats, LocationFix, OnlineStatus};
use crate::models::order::{Order, OrderOffer};
use crate::models::session::{AdminLoginRequest, AuthResponse, LoginRequest, RegisterRequest};

#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, TrackerError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| TrackerError::Internal(format!("failed to build http client: {err}")))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn order_url(&self, order_id: &str, suffix: &str) -> String {
        self.url(&format!(
            "/api/orders/{}{}",
            urlencoding::encode(order_id),
            suffix
        ))
    }

    /// URL of the driver push stream; the token travels as a query parameter.
    pub fn events_url(&self, token: &str) -> String {
        format!(
            "{}?token={}",
            self.url("/api/orders/stream"),
            urlencoding::encode(token)
        )
    }

    // ---- orders -----------------------------------------------------------

    pub async fn get_order(&self, token: &str, order_id: &str) -> Result<Order, TrackerError> {
        let request = self.http.get(self.order_url(order_id, "")).bearer_auth(token);
        self.send_json(request, "Chargement impossible").await
    }

    /// Creates an order and returns its id.
    pub async fn create_order(
        &self,
        token: &str,
        order: &CreateOrderRequest,
    ) -> Result<Option<String>, TrackerError> {
        let request = self
            .http
            .post(self.url("/api/orders"))
            .bearer_auth(token)
            .json(order);
        let created: CreatedOrder = self
            .send_json(request, "Impossible d'enregistrer la commande")
            .await?;
        Ok(created.into_id())
    }

    pub async fn cancel_order(
        &self,
        token: &str,
        order_id: &str,
        reason: &str,
    ) -> Result<(), TrackerError> {
        let request = self
            .http
            .post(self.order_url(order_id, "/cancel"))
            .bearer_auth(token)
            .json(&CancelRequest { reason });
        self.send_empty(request, "Annulation impossible").await
    }

    pub async fn accept_order(&self, token: &str, order_id: &str) -> Result<Order, TrackerError> {
        let request = self
            .http
            .post(self.order_url(order_id, "/accept"))
            .bearer_auth(token);
        self.send_json(request, "Acceptation échouée").await
    }

    pub async fn start_order(
        &self,
        token: &str,
        order_id: &str,
    ) -> Result<OrderUpdate, TrackerError> {
        let request = self
            .http
            .post(self.order_url(order_id, "/start"))
            .bearer_auth(token);
        self.send_json(request, "Impossible de démarrer la course")
            .await
    }

    pub async fn complete_order(
        &self,
        token: &str,
        order_id: &str,
    ) -> Result<OrderUpdate, TrackerError> {
        let request = self
            .http
            .post(self.order_url(order_id, "/complete"))
            .bearer_auth(token);
        self.send_json(request, "Impossible de terminer la course")
            .await
    }

    pub async fn finalize_order(
        &self,
        token: &str,
        order_id: &str,
        body: &FinalizeRequest,
    ) -> Result<(), TrackerError> {
        let request = self
            .http
            .post(self.order_url(order_id, "/finalize"))
            .bearer_auth(token)
            .json(body);
        self.send_empty(request, "Finalisation impossible").await
    }

    pub async fn rate_order(
        &self,
        token: &str,
        order_id: &str,
        rating: u8,
        review: &str,
    ) -> Result<(), TrackerError> {
        let request = self
            .http
            .post(self.order_url(order_id, "/rate"))
            .bearer_auth(token)
            .json(&RateRequest { rating, review });
        self.send_empty(request, "Notation impossible").await
    }

    pub async fn receipt_pdf(&self, token: &str, order_id: &str) -> Result<Vec<u8>, TrackerError> {
        let request = self
            .http
            .get(self.order_url(order_id, "/receipt.pdf"))
            .bearer_auth(token);
        let response = self.checked(request, "Reçu indisponible").await?;
        Ok(response.bytes().await?.to_vec())
    }

    pub async fn available_orders(&self, token: &str) -> Result<Vec<OrderOffer>, TrackerError> {
        let request = self
            .http
            .get(self.url("/api/orders/available"))
            .bearer_auth(token);
        let body: AvailableOrders = self.send_json(request, "Erreur de chargement").await?;
        Ok(body.orders)
    }

    pub async fn driver_stats(&self, token: &str) -> Result<DriverStats, TrackerError> {
        let request = self
            .http
            .get(self.url("/api/orders/driver/stats"))
            .bearer_auth(token);
        self.send_json(request, "Statistiques indisponibles").await
    }

    /// Id of the order currently held by the signed-in driver, if any.
    pub async fn driver_active_order(&self, token: &str) -> Result<Option<String>, TrackerError> {
        let request = self
            .http
            .get(self.url("/api/orders/driver/active"))
            .bearer_auth(token);
        let body: ActiveOrderResponse = self.send_json(request, "Erreur de chargement").await?;
        Ok(body.order.and_then(CreatedOrder::into_id))
    }

    pub async fn recent_orders(
        &self,
        token: &str,
        limit: usize,
    ) -> Result<Vec<RecentOrder>, TrackerError> {
        let request = self
            .http
            .get(self.url("/api/orders/client/recent"))
            .query(&[("limit", limit)])
            .bearer_auth(token);
        let body: RecentOrders = self.send_json(request, "Erreur de chargement").await?;
        Ok(body.orders)
    }

    /// Creates a public tracking link for the order.
    pub async fn share_order(&self, token: &str, order_id: &str) -> Result<String, TrackerError> {
        let request = self
            .http
            .post(self.order_url(order_id, "/share"))
            .bearer_auth(token);
        let body: ShareResponse = self
            .send_json(request, "Création du lien impossible")
            .await?;
        body.url
            .filter(|url| !url.is_empty())
            .ok_or_else(|| TrackerError::Validation("Création du lien impossible".to_string()))
    }

    /// Resolves a share token without authentication.
    pub async fn resolve_share(&self, share_token: &str) -> Result<Option<String>, TrackerError> {
        let request = self.http.get(self.url(&format!(
            "/api/share/{}",
            urlencoding::encode(share_token)
        )));
        let body: ShareResolution = self.send_json(request, "Lien expiré").await?;
        Ok(body.redirect_to.filter(|to| !to.is_empty()))
    }

    // ---- drivers ----------------------------------------------------------

    pub async fn driver_status(&self, token: &str) -> Result<OnlineStatus, TrackerError> {
        let request = self
            .http
            .get(self.url("/api/drivers/me/status"))
            .bearer_auth(token);
        self.send_json(request, "Statut indisponible").await
    }

    pub async fn set_driver_status(&self, token: &str, online: bool) -> Result<(), TrackerError> {
        let request = self
            .http
            .post(self.url("/api/drivers/me/status"))
            .bearer_auth(token)
            .json(&OnlineStatus { online });
        self.send_empty(request, "Mise à jour du statut impossible")
            .await
    }

    pub async fn heartbeat(&self, token: &str) -> Result<(), TrackerError> {
        let request = self
            .http
            .post(self.url("/api/drivers/me/heartbeat"))
            .bearer_auth(token);
        self.send_empty(request, "Heartbeat refusé").await
    }

    pub async fn push_location(&self, token: &str, fix: &LocationFix) -> Result<(), TrackerError> {
        let request = self
            .http
            .post(self.url("/api/drivers/me/location"))
            .bearer_auth(token)
            .json(&LocationPush::from(fix));
        self.send_empty(request, "Position refusée").await
    }

    /// Last known position of a driver; `None` when the backend has none.
    pub async fn driver_location(
        &self,
        token: &str,
        driver_id: &str,
    ) -> Result<Option<LocationFix>, TrackerError> {
        let request = self
            .http
            .get(self.url(&format!(
                "/api/drivers/{}/location",
                urlencoding::encode(driver_id)
            )))
            .bearer_auth(token);
        let body: DriverLocationResponse = self.send_json(request, "Position indisponible").await?;
        Ok(body.location)
    }

    // ---- auth -------------------------------------------------------------

    pub async fn login(&self, body: &LoginRequest) -> Result<AuthResponse, TrackerError> {
        self.auth_call("/api/auth/login", body, "Connexion échouée")
            .await
    }

    pub async fn admin_login(&self, body: &AdminLoginRequest) -> Result<AuthResponse, TrackerError> {
        self.auth_call("/api/auth/admin/login", body, "Erreur serveur")
            .await
    }

    pub async fn register(&self, body: &RegisterRequest) -> Result<AuthResponse, TrackerError> {
        self.auth_call("/api/auth/register", body, "Inscription échouée")
            .await
    }

    /// Credential failures on the auth endpoints are user errors, not an
    /// expired session.
    async fn auth_call<B: Serialize>(
        &self,
        path: &str,
        body: &B,
        fallback: &str,
    ) -> Result<AuthResponse, TrackerError> {
        let request = self.http.post(self.url(path)).json(body);
        match self.send_json(request, fallback).await {
            Err(TrackerError::Auth) => Err(TrackerError::Validation(fallback.to_string())),
            other => other,
        }
    }

    // ---- plumbing ---------------------------------------------------------

    async fn checked(
        &self,
        request: RequestBuilder,
        fallback: &str,
    ) -> Result<Response, TrackerError> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        debug!(status = status.as_u16(), "backend call failed");
        Err(TrackerError::from_status(status, &body, fallback))
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        fallback: &str,
    ) -> Result<T, TrackerError> {
        let response = self.checked(request, fallback).await?;
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn send_empty(&self, request: RequestBuilder, fallback: &str) -> Result<(), TrackerError> {
        self.checked(request, fallback).await.map(|_| ())
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}
