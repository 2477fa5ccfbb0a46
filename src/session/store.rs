use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::TrackerError;
use crate::models::driver::LocationFix;
use crate::models::session::{Role, SessionUser};
use crate::session::backend::{MemoryBackend, StorageBackend};

const LAST_ORDER_KEY: &str = "tri_last_order_id";
const LAST_DRIVER_ORDER_KEY: &str = "tri_last_driver_order_id";
const REFUSED_ORDERS_KEY: &str = "tri_refused_order_ids";
const LAST_LOCATION_KEY: &str = "tri_last_location";

fn token_key(role: Role) -> String {
    format!("tri_token_{}", role.as_str())
}

fn user_key(role: Role) -> String {
    format!("tri_user_{}", role.as_str())
}

/// Typed access to the per-device session storage.
///
/// Reads treat missing, unreadable or corrupt entries as absent. Writes are
/// best effort: a failing backend is logged and never aborts a flow.
#[derive(Clone)]
pub struct SessionStore {
    backend: Arc<dyn StorageBackend>,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub fn token(&self, role: Role) -> Option<String> {
        self.read_raw(&token_key(role))
            .filter(|token| !token.trim().is_empty())
    }

    pub fn user(&self, role: Role) -> Option<SessionUser> {
        self.read_json(&user_key(role))
    }

    pub fn sign_in(&self, role: Role, token: &str, user: &SessionUser) {
        self.write_raw(&token_key(role), token.to_string());
        self.write_json(&user_key(role), user);
    }

    /// Drops token and identity of `role`. Returns whether a token was
    /// present, so concurrent callers agree on a single winner.
    pub fn clear_identity(&self, role: Role) -> bool {
        let had_token = self.remove(&token_key(role));
        self.remove(&user_key(role));
        had_token
    }

    pub fn logout(&self, role: Role) {
        self.clear_identity(role);
        if role == Role::Driver {
            self.clear_last_driver_order_id();
        }
    }

    pub fn last_order_id(&self) -> Option<String> {
        self.read_raw(LAST_ORDER_KEY)
    }

    pub fn set_last_order_id(&self, order_id: &str) {
        self.write_raw(LAST_ORDER_KEY, order_id.to_string());
    }

    pub fn clear_last_order_id(&self) -> bool {
        self.remove(LAST_ORDER_KEY)
    }

    pub fn last_driver_order_id(&self) -> Option<String> {
        self.read_raw(LAST_DRIVER_ORDER_KEY)
    }

    pub fn set_last_driver_order_id(&self, order_id: &str) {
        self.write_raw(LAST_DRIVER_ORDER_KEY, order_id.to_string());
    }

    pub fn clear_last_driver_order_id(&self) -> bool {
        self.remove(LAST_DRIVER_ORDER_KEY)
    }

    pub fn refused_order_ids(&self) -> BTreeSet<String> {
        self.read_json::<Vec<serde_json::Value>>(REFUSED_ORDERS_KEY)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|value| match value {
                serde_json::Value::String(s) => Some(s),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect()
    }

    pub fn add_refused_order(&self, order_id: &str) -> BTreeSet<String> {
        let mut refused = self.refused_order_ids();
        refused.insert(order_id.to_string());
        self.write_json(REFUSED_ORDERS_KEY, &refused);
        refused
    }

    pub fn last_location(&self) -> Option<LocationFix> {
        self.read_json(LAST_LOCATION_KEY)
    }

    pub fn set_last_location(&self, fix: &LocationFix) {
        self.write_json(LAST_LOCATION_KEY, fix);
    }

    fn read_raw(&self, key: &str) -> Option<String> {
        match self.backend.get(key) {
            Ok(value) => value.map(unquote).filter(|v| !v.is_empty()),
            Err(err) => {
                warn!(key, error = %err, "session read failed");
                None
            }
        }
    }

    fn read_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.backend.get(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                warn!(key, error = %err, "session read failed");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                debug!(key, error = %err, "ignoring corrupt session entry");
                None
            }
        }
    }

    fn write_raw(&self, key: &str, value: String) {
        if let Err(err) = self.backend.set(key, value) {
            warn!(key, error = %err, "session write failed");
        }
    }

    fn write_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) {
        let encoded = match serde_json::to_string(value) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(key, error = %TrackerError::from(err), "session encode failed");
                return;
            }
        };
        self.write_raw(key, encoded);
    }

    fn remove(&self, key: &str) -> bool {
        match self.backend.remove(key) {
            Ok(previous) => previous.is_some(),
            Err(err) => {
                warn!(key, error = %err, "session remove failed");
                false
            }
        }
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore").finish_non_exhaustive()
    }
}

/// Ids written by older clients may be JSON encoded strings.
fn unquote(raw: String) -> String {
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        serde_json::from_str::<String>(&raw).unwrap_or(raw)
    } else {
        raw
    }
}
