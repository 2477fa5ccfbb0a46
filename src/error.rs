use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GeolocationError {
    #[error("location permission denied")]
    PermissionDenied,

    #[error("position unavailable: {0}")]
    Unavailable(String),

    #[error("position request timed out")]
    Timeout,
}

pub const LOCATION_HELP_URL: &str = "https://support.google.com/chrome/answer/142065?hl=fr";

impl GeolocationError {
    /// Guidance shown next to the error instead of blocking the flow.
    pub fn remediation(&self) -> String {
        match self {
            GeolocationError::PermissionDenied => format!(
                "allow location access for this app in the device settings ({LOCATION_HELP_URL})"
            ),
            GeolocationError::Unavailable(_) => {
                "enable location services and move to an open area, then retry".to_string()
            }
            GeolocationError::Timeout => {
                "no fix yet; retry once the device has a GPS signal".to_string()
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("session invalid")]
    Auth,

    #[error("resource not found or expired")]
    NotFoundOrGone,

    #[error("{0}")]
    Validation(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("http {status}: {message}")]
    Http { status: u16, message: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("geolocation error: {0}")]
    Geolocation(#[from] GeolocationError),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TrackerError {
    pub fn is_auth(&self) -> bool {
        matches!(self, TrackerError::Auth)
    }

    /// Transient failures are retried by the next scheduled poll.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TrackerError::Network(_) | TrackerError::Http { .. } | TrackerError::Parse(_)
        )
    }

    /// Maps a non-success HTTP response onto the error taxonomy.
    pub fn from_status(status: StatusCode, body: &str, fallback: &str) -> Self {
        let message = serde_json::from_str::<ErrorBody>(body)
            .ok()
            .and_then(|b| b.error)
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| fallback.to_string());

        match status {
            StatusCode::UNAUTHORIZED => TrackerError::Auth,
            StatusCode::NOT_FOUND | StatusCode::GONE => TrackerError::NotFoundOrGone,
            s if s.is_client_error() => TrackerError::Validation(message),
            s => TrackerError::Http {
                status: s.as_u16(),
                message,
            },
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

impl From<reqwest::Error> for TrackerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            TrackerError::Parse(err.to_string())
        } else {
            TrackerError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for TrackerError {
    fn from(err: serde_json::Error) -> Self {
        TrackerError::Parse(err.to_string())
    }
}
