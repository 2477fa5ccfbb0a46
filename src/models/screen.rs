use crate::models::session::Role;

/// Navigation targets of the app. Order-scoped screens carry the order id
/// that appears as `?id=` in their route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Screen {
    Home,
    Login(Role),
    PreOrder,
    OrderForm,
    Waiting { order_id: String },
    LiveTrip { order_id: String },
    TripSummary { order_id: String },
    DriverDashboard,
    TrackingExpired,
    Route(String),
}

impl Screen {
    pub fn login_for(role: Role) -> Self {
        Screen::Login(role)
    }

    pub fn path(&self) -> String {
        match self {
            Screen::Home => "/".to_string(),
            Screen::Login(Role::Client) => "/login".to_string(),
            Screen::Login(Role::Driver) => "/login-conducteur".to_string(),
            Screen::Login(Role::Admin) => "/admin-login".to_string(),
            Screen::PreOrder => "/pre-commande".to_string(),
            Screen::OrderForm => "/commander".to_string(),
            Screen::Waiting { order_id } => with_id("/commande-acceptee", order_id),
            Screen::LiveTrip { order_id } => with_id("/trajet-en-cours", order_id),
            Screen::TripSummary { order_id } => with_id("/fin-trajet", order_id),
            Screen::DriverDashboard => "/dashboard-conducteur".to_string(),
            Screen::TrackingExpired => "/suivi-expire".to_string(),
            Screen::Route(route) => route.clone(),
        }
    }

    /// Parses a route back into a screen; unknown routes are kept verbatim.
    pub fn from_path(path: &str) -> Self {
        let (route, query) = path.split_once('?').unwrap_or((path, ""));
        let order_id = query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == "id")
            .and_then(|(_, value)| urlencoding::decode(value).ok())
            .map(|value| value.into_owned())
            .filter(|value| !value.is_empty());

        match (route, order_id) {
            ("/", _) | ("", _) => Screen::Home,
            ("/login", _) => Screen::Login(Role::Client),
            ("/login-conducteur", _) => Screen::Login(Role::Driver),
            ("/admin-login", _) => Screen::Login(Role::Admin),
            ("/pre-commande", _) => Screen::PreOrder,
            ("/commander", _) => Screen::OrderForm,
            ("/commande-acceptee", Some(order_id)) => Screen::Waiting { order_id },
            ("/trajet-en-cours", Some(order_id)) => Screen::LiveTrip { order_id },
            ("/fin-trajet", Some(order_id)) => Screen::TripSummary { order_id },
            ("/dashboard-conducteur", _) => Screen::DriverDashboard,
            ("/suivi-expire", _) => Screen::TrackingExpired,
            _ => Screen::Route(path.to_string()),
        }
    }

    pub fn order_id(&self) -> Option<&str> {
        match self {
            Screen::Waiting { order_id }
            | Screen::LiveTrip { order_id }
            | Screen::TripSummary { order_id } => Some(order_id),
            _ => None,
        }
    }
}

impl std::fmt::Display for Screen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.path())
    }
}

fn with_id(route: &str, order_id: &str) -> String {
    format!("{route}?id={}", urlencoding::encode(order_id))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            message: message.into(),
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Success,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }
}

/// Side effects emitted towards whatever renders the app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    Navigate(Screen),
    Notify(Notice),
}
