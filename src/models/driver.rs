use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::order::{Amount, GeoPoint};

/// A single position fix from the device or the backend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    pub lat: f64,
    pub lon: f64,
    #[serde(default, alias = "acc", skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

impl LocationFix {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self {
            lat,
            lon,
            accuracy: None,
        }
    }

    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lon)
    }
}

/// Ephemeral availability of the signed-in driver as seen by this device.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriverPresence {
    pub online: bool,
    pub last_location: Option<LocationFix>,
    pub last_location_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OnlineStatus {
    #[serde(default)]
    pub online: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverStats {
    #[serde(default)]
    pub day_trips: u32,
    #[serde(default)]
    pub month_trips: u32,
    #[serde(default)]
    pub day_revenue: Amount,
    #[serde(default)]
    pub month_revenue: Amount,
    #[serde(default)]
    pub accept_rate: Option<f64>,
}

impl DriverStats {
    /// Average fare of the day, zero when no trip was made.
    pub fn day_average(&self) -> Amount {
        if self.day_trips == 0 {
            return 0;
        }
        (self.day_revenue as f64 / self.day_trips as f64).round() as Amount
    }
}
