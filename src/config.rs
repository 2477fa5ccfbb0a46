use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::TrackerError;
use crate::models::driver::LocationFix;
use crate::models::session::Role;

/// Cadence of every background task the controller owns.
#[derive(Debug, Clone)]
pub struct Intervals {
    /// Order status poll while waiting for pickup.
    pub waiting_poll: Duration,
    /// Order status poll once the ride is running.
    pub live_trip_poll: Duration,
    /// Driver location poll from the waiting screen.
    pub location_poll: Duration,
    /// Driver location poll from the live trip screen.
    pub live_location_poll: Duration,
    pub queue_poll: Duration,
    pub stats_poll: Duration,
    pub heartbeat: Duration,
    /// Delay before a cancelled accepted order disappears from the board.
    pub cancel_clear: Duration,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            waiting_poll: Duration::from_millis(4_000),
            live_trip_poll: Duration::from_millis(6_000),
            location_poll: Duration::from_millis(4_000),
            live_location_poll: Duration::from_millis(3_000),
            queue_poll: Duration::from_millis(5_000),
            stats_poll: Duration::from_millis(10_000),
            heartbeat: Duration::from_millis(60_000),
            cancel_clear: Duration::from_millis(3_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_base: String,
    pub http_port: u16,
    pub log_level: String,
    pub role: Role,
    pub session_file: Option<PathBuf>,
    pub request_timeout: Duration,
    pub geo_timeout: Duration,
    pub intervals: Intervals,
    pub event_buffer_size: usize,
    pub driver_fix: Option<LocationFix>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:4000".to_string(),
            http_port: 3100,
            log_level: "info".to_string(),
            role: Role::Client,
            session_file: None,
            request_timeout: Duration::from_millis(10_000),
            geo_timeout: Duration::from_millis(10_000),
            intervals: Intervals::default(),
            event_buffer_size: 1024,
            driver_fix: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, TrackerError> {
        let _ = dotenvy::dotenv();
        let defaults = Intervals::default();

        let intervals = Intervals {
            waiting_poll: millis_or_default("WAITING_POLL_MS", defaults.waiting_poll)?,
            live_trip_poll: millis_or_default("LIVE_TRIP_POLL_MS", defaults.live_trip_poll)?,
            location_poll: millis_or_default("LOCATION_POLL_MS", defaults.location_poll)?,
            live_location_poll: millis_or_default(
                "LIVE_LOCATION_POLL_MS",
                defaults.live_location_poll,
            )?,
            queue_poll: millis_or_default("QUEUE_POLL_MS", defaults.queue_poll)?,
            stats_poll: millis_or_default("STATS_POLL_MS", defaults.stats_poll)?,
            heartbeat: millis_or_default("HEARTBEAT_MS", defaults.heartbeat)?,
            cancel_clear: millis_or_default("CANCEL_CLEAR_MS", defaults.cancel_clear)?,
        };

        let driver_fix = match (
            optional::<f64>("DRIVER_LAT")?,
            optional::<f64>("DRIVER_LON")?,
        ) {
            (Some(lat), Some(lon)) => Some(LocationFix {
                lat,
                lon,
                accuracy: optional::<f64>("DRIVER_ACCURACY")?,
            }),
            (None, None) => None,
            _ => {
                return Err(TrackerError::Config(
                    "DRIVER_LAT and DRIVER_LON must be set together".to_string(),
                ));
            }
        };

        Ok(Self {
            api_base: env::var("API_BASE")
                .map(|raw| raw.trim_end_matches('/').to_string())
                .unwrap_or_else(|_| "http://localhost:4000".to_string()),
            http_port: parse_or_default("HTTP_PORT", 3100)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            role: parse_or_default("AGENT_ROLE", Role::Client)?,
            session_file: env::var("SESSION_FILE").ok().map(PathBuf::from),
            request_timeout: millis_or_default(
                "REQUEST_TIMEOUT_MS",
                Duration::from_millis(10_000),
            )?,
            geo_timeout: millis_or_default("GEO_TIMEOUT_MS", Duration::from_millis(10_000))?,
            intervals,
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
            driver_fix,
        })
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, TrackerError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    Ok(optional(key)?.unwrap_or(default))
}

fn optional<T>(key: &str) -> Result<Option<T>, TrackerError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|err| TrackerError::Config(format!("invalid {key}: {err}"))),
        Err(_) => Ok(None),
    }
}

fn millis_or_default(key: &str, default: Duration) -> Result<Duration, TrackerError> {
    let millis: Option<u64> = optional(key)?;
    match millis {
        Some(0) => Err(TrackerError::Config(format!("{key} must be > 0"))),
        Some(ms) => Ok(Duration::from_millis(ms)),
        None => Ok(default),
    }
}
