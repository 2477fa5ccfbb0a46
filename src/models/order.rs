use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::flexible_id;

/// Plain integer amount in the local currency unit.
pub type Amount = i64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self {
            name: None,
            lat,
            lon,
        }
    }

    pub fn named(name: impl Into<String>, lat: f64, lon: f64) -> Self {
        Self {
            name: Some(name.into()),
            lat,
            lon,
        }
    }
}

/// Lifecycle of a ride. `canceled` is folded into `Cancelled` on ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Searching,
    Pending,
    Assigned,
    InProgress,
    Completed,
    #[serde(alias = "canceled")]
    Cancelled,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
    }

    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Statuses in which a driver holds the order.
    pub fn is_driver_active(self) -> bool {
        matches!(self, OrderStatus::Assigned | OrderStatus::InProgress)
    }

    pub fn rank(self) -> u8 {
        match self {
            OrderStatus::Searching | OrderStatus::Pending => 0,
            OrderStatus::Assigned => 1,
            OrderStatus::InProgress => 2,
            OrderStatus::Completed | OrderStatus::Cancelled => 3,
        }
    }

    /// Whether `next` is reachable from `self` along the lifecycle graph.
    /// Intermediate states may be skipped between two observations.
    pub fn can_advance_to(self, next: OrderStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            OrderStatus::Cancelled => true,
            OrderStatus::Searching | OrderStatus::Pending => false,
            OrderStatus::Assigned | OrderStatus::InProgress | OrderStatus::Completed => {
                next.rank() > self.rank()
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Searching => "searching",
            OrderStatus::Pending => "pending",
            OrderStatus::Assigned => "assigned",
            OrderStatus::InProgress => "in_progress",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Denormalized identity and contact of a client or driver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactSnapshot {
    #[serde(default, alias = "_id", deserialize_with = "flexible_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub plate: Option<String>,
    #[serde(default)]
    pub rating: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawOrder")]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub status: OrderStatus,
    pub start: Option<GeoPoint>,
    pub destination: Option<GeoPoint>,
    pub passengers: Option<u8>,
    pub bags: Option<u8>,
    pub bag_offer: Amount,
    pub bag_description: String,
    pub price_estimate: Option<Amount>,
    pub client: Option<ContactSnapshot>,
    pub driver: Option<ContactSnapshot>,
    pub created_at: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rating: Option<f64>,
    pub review: Option<String>,
    pub tip: Option<Amount>,
    pub payment_method: Option<String>,
}

impl Order {
    pub fn driver_id(&self) -> Option<&str> {
        self.driver.as_ref().and_then(|d| d.id.as_deref())
    }

    pub fn is_rated(&self) -> bool {
        self.rating.is_some_and(|r| r >= 1.0)
    }
}

/// Wire shape of an order: `id` or `_id`, every other field optional.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawOrder {
    #[serde(default, deserialize_with = "flexible_id")]
    id: Option<String>,
    #[serde(default, rename = "_id", deserialize_with = "flexible_id")]
    mongo_id: Option<String>,
    status: OrderStatus,
    #[serde(default)]
    start: Option<GeoPoint>,
    #[serde(default)]
    destination: Option<GeoPoint>,
    #[serde(default)]
    passengers: Option<u8>,
    #[serde(default)]
    bags: Option<u8>,
    #[serde(default)]
    bag_offer: Option<Amount>,
    #[serde(default)]
    bag_description: Option<String>,
    #[serde(default)]
    price_estimate: Option<Amount>,
    #[serde(default)]
    client: Option<ContactSnapshot>,
    #[serde(default)]
    driver: Option<ContactSnapshot>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    accepted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    rating: Option<f64>,
    #[serde(default)]
    review: Option<String>,
    #[serde(default)]
    tip: Option<Amount>,
    #[serde(default)]
    payment_method: Option<String>,
}

impl TryFrom<RawOrder> for Order {
    type Error = String;

    fn try_from(raw: RawOrder) -> Result<Self, Self::Error> {
        let id = raw
            .id
            .or(raw.mongo_id)
            .ok_or_else(|| "order without id".to_string())?;

        Ok(Self {
            id,
            status: raw.status,
            start: raw.start,
            destination: raw.destination,
            passengers: raw.passengers,
            bags: raw.bags,
            bag_offer: raw.bag_offer.unwrap_or(0).max(0),
            bag_description: raw.bag_description.unwrap_or_default(),
            price_estimate: raw.price_estimate,
            client: raw.client,
            driver: raw.driver,
            created_at: raw.created_at,
            accepted_at: raw.accepted_at,
            started_at: raw.started_at,
            completed_at: raw.completed_at,
            rating: raw.rating,
            review: raw.review,
            tip: raw.tip,
            payment_method: raw.payment_method,
        })
    }
}

/// An order offered to drivers in the pending queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderOffer {
    #[serde(alias = "_id", deserialize_with = "required_id")]
    pub id: String,
    #[serde(default)]
    pub start: Option<GeoPoint>,
    #[serde(default)]
    pub destination: Option<GeoPoint>,
    #[serde(default)]
    pub passengers: Option<u8>,
    #[serde(default)]
    pub bags: Option<u8>,
    #[serde(default)]
    pub bag_offer: Amount,
    #[serde(default)]
    pub bag_description: String,
    #[serde(default)]
    pub price_estimate: Option<Amount>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

fn required_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    flexible_id(deserializer)?.ok_or_else(|| serde::de::Error::custom("missing id"))
}
