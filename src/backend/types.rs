//! Request and response bodies of the backend contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::driver::LocationFix;
use crate::models::flexible_id;
use crate::models::order::{Amount, GeoPoint, OrderOffer, OrderStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub start: Option<GeoPoint>,
    pub destination: Option<GeoPoint>,
    pub passengers: u8,
    pub bags: u8,
    pub bag_offer: Amount,
    pub bag_description: String,
    pub accessible: bool,
    pub promo_code: String,
    pub price_estimate: Amount,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct CreatedOrder {
    #[serde(default, deserialize_with = "flexible_id")]
    pub id: Option<String>,
    #[serde(default, rename = "_id", deserialize_with = "flexible_id")]
    pub mongo_id: Option<String>,
}

impl CreatedOrder {
    pub fn into_id(self) -> Option<String> {
        self.id.or(self.mongo_id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct CancelRequest<'a> {
    pub reason: &'a str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    pub tip: Amount,
    pub payment_method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt_requested: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt_email: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct RateRequest<'a> {
    pub rating: u8,
    pub review: &'a str,
}

/// Partial order returned by start/complete actions.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderUpdate {
    #[serde(default)]
    pub status: Option<OrderStatus>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct AvailableOrders {
    #[serde(default)]
    pub orders: Vec<OrderOffer>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ActiveOrderResponse {
    #[serde(default)]
    pub order: Option<CreatedOrder>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentOrder {
    #[serde(default, alias = "_id", deserialize_with = "flexible_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub start: Option<GeoPoint>,
    #[serde(default)]
    pub destination: Option<GeoPoint>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RecentOrders {
    #[serde(default)]
    pub orders: Vec<RecentOrder>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct DriverLocationResponse {
    #[serde(default)]
    pub location: Option<LocationFix>,
}

/// Body of a driver location push.
#[derive(Debug, Clone, Copy, Serialize)]
pub(crate) struct LocationPush {
    pub lat: f64,
    pub lon: f64,
    pub acc: Option<f64>,
}

impl From<&LocationFix> for LocationPush {
    fn from(fix: &LocationFix) -> Self {
        Self {
            lat: fix.lat,
            lon: fix.lon,
            acc: fix.accuracy,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ShareResponse {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ShareResolution {
    #[serde(default)]
    pub redirect_to: Option<String>,
}
