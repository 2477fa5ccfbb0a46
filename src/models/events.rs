use serde::Deserialize;

use crate::models::flexible_id;

pub const ORDER_ASSIGNED_EVENT: &str = "order_assigned";
pub const ORDER_CANCELLED_EVENT: &str = "order_cancelled";

/// Named events pushed on the driver stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderEvent {
    Assigned { order_id: String },
    Cancelled { order_id: String },
}

impl OrderEvent {
    pub fn order_id(&self) -> &str {
        match self {
            OrderEvent::Assigned { order_id } | OrderEvent::Cancelled { order_id } => order_id,
        }
    }

    /// Decodes a named event; unknown names and payloads without an order id yield `None`.
    pub fn decode(name: &str, data: &str) -> Result<Option<Self>, serde_json::Error> {
        if name != ORDER_ASSIGNED_EVENT && name != ORDER_CANCELLED_EVENT {
            return Ok(None);
        }

        let payload: EventPayload = if data.trim().is_empty() {
            EventPayload::default()
        } else {
            serde_json::from_str(data)?
        };

        let Some(order_id) = payload.order_id else {
            return Ok(None);
        };

        Ok(Some(if name == ORDER_ASSIGNED_EVENT {
            OrderEvent::Assigned { order_id }
        } else {
            OrderEvent::Cancelled { order_id }
        }))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventPayload {
    #[serde(default, deserialize_with = "flexible_id")]
    order_id: Option<String>,
}
