use chrono::{DateTime, Utc};

use crate::models::driver::LocationFix;
use crate::models::order::{Amount, GeoPoint};

const EARTH_RADIUS_KM: f64 = 6_371.0;

/// Assumed average tricycle speed in town.
pub const DEFAULT_SPEED_KMH: f64 = 22.0;

const PRICE_PER_PASSENGER: Amount = 200;
const LEGACY_BASE_PRICE: f64 = 300.0;
const LEGACY_PRICE_PER_KM: f64 = 180.0;
const LEGACY_MIN_PRICE: Amount = 700;
const ORDER_FORM_MIN_MINUTES: u32 = 3;

pub fn haversine_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lon = (b.lon - a.lon).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lon = (delta_lon / 2.0).sin();

    let haversine = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lon * sin_lon;
    let central_angle = 2.0 * haversine.sqrt().min(1.0).asin();

    EARTH_RADIUS_KM * central_angle
}

/// Great-circle distance; zero when either endpoint is missing.
pub fn distance_km(a: Option<&GeoPoint>, b: Option<&GeoPoint>) -> f64 {
    match (a, b) {
        (Some(a), Some(b)) => haversine_km(a, b),
        _ => 0.0,
    }
}

fn minutes_at(distance_km: f64, speed_kmh: f64) -> f64 {
    (distance_km / speed_kmh * 60.0).round()
}

fn has_distance(distance_km: f64) -> bool {
    distance_km.is_finite() && distance_km > 0.0
}

/// Minutes to cover `distance_km`; at least one minute for any positive distance.
pub fn eta_minutes(distance_km: f64, speed_kmh: f64) -> u32 {
    if !has_distance(distance_km) || speed_kmh <= 0.0 {
        return 0;
    }
    (minutes_at(distance_km, speed_kmh) as u32).max(1)
}

/// Duration shown on the order form, floored at three minutes.
pub fn order_form_duration_minutes(distance_km: f64) -> u32 {
    if !has_distance(distance_km) {
        return 0;
    }
    (minutes_at(distance_km, DEFAULT_SPEED_KMH) as u32).max(ORDER_FORM_MIN_MINUTES)
}

/// Actual ride time between start and completion, at least one minute.
pub fn ride_duration_minutes(
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
) -> Option<u32> {
    let (started, completed) = (started_at?, completed_at?);
    if completed <= started {
        return None;
    }
    let millis = (completed - started).num_milliseconds() as f64;
    Some(((millis / 60_000.0).round() as u32).max(1))
}

/// Both endpoints chosen and distinct by name.
pub fn can_order(start: Option<&GeoPoint>, destination: Option<&GeoPoint>) -> bool {
    match (start, destination) {
        (Some(start), Some(destination)) => start.name != destination.name,
        _ => false,
    }
}

pub fn clamp_passengers(passengers: u8) -> u8 {
    passengers.clamp(1, 3)
}

/// Order form pricing: 200 per passenger plus the bag offer.
pub fn order_form_price(passengers: u8, bag_offer: Amount) -> Amount {
    PRICE_PER_PASSENGER * Amount::from(clamp_passengers(passengers)) + bag_offer.max(0)
}

/// Distance based estimate used by history and summary views.
pub fn legacy_estimate_price(distance_km: f64) -> Amount {
    let km = if distance_km.is_finite() {
        distance_km.max(0.0)
    } else {
        0.0
    };
    ((LEGACY_BASE_PRICE + km * LEGACY_PRICE_PER_KM).round() as Amount).max(LEGACY_MIN_PRICE)
}

/// Which leg of the ride the driver is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RidePhase {
    ToPickup,
    ToDestination,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouteProgress {
    pub total_km: f64,
    pub remaining_km: f64,
    pub eta_minutes: u32,
    pub progress_pct: u8,
}

impl RouteProgress {
    /// Remaining distance prefers the live driver position and falls back to
    /// the client position (to pickup) or the full trip (to destination).
    pub fn compute(
        phase: RidePhase,
        driver: Option<&LocationFix>,
        client: Option<&LocationFix>,
        pickup: Option<&GeoPoint>,
        destination: Option<&GeoPoint>,
    ) -> Self {
        let total_km = distance_km(pickup, destination);
        let target = match phase {
            RidePhase::ToPickup => pickup,
            RidePhase::ToDestination => destination,
        };

        let driver_point = driver.map(LocationFix::point);
        let client_point = client.map(LocationFix::point);

        let remaining_km = match (driver_point.as_ref(), target) {
            (Some(d), Some(t)) => haversine_km(d, t),
            _ => match phase {
                RidePhase::ToPickup => distance_km(client_point.as_ref(), pickup),
                RidePhase::ToDestination => total_km,
            },
        };

        let progress_pct = match phase {
            RidePhase::ToDestination if total_km > 0.0 => {
                let done = (total_km - remaining_km).max(0.0);
                (done / total_km * 100.0).round().clamp(0.0, 100.0) as u8
            }
            _ => 0,
        };

        Self {
            total_km,
            remaining_km,
            eta_minutes: eta_minutes(remaining_km, DEFAULT_SPEED_KMH),
            progress_pct,
        }
    }
}
