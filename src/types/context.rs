//! Request context propagated end-to-end through message headers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// User id assigned to contexts synthesized without a caller.
pub const ANONYMOUS_USER_ID: &str = "0";

/// Tracing and authorization context carried by every message.
///
/// `request_id` and `user_id` are always present; anything else the calling
/// layer attaches travels as a passthrough field and comes back out of the
/// headers on the consuming side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub request_id: String,

    #[serde(default = "anonymous_user")]
    pub user_id: String,

    /// Passthrough fields, flattened next to the two well-known ones
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn anonymous_user() -> String {
    ANONYMOUS_USER_ID.to_string()
}

impl Context {
    /// Create a context for a known request and user.
    pub fn new(request_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            user_id: user_id.into(),
            extra: BTreeMap::new(),
        }
    }

    /// Synthesize a fresh context: new request id, anonymous user.
    pub fn generate() -> Self {
        Self::new(new_request_id(), ANONYMOUS_USER_ID)
    }

    /// Attach a passthrough field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Look up a passthrough field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    pub fn is_anonymous(&self) -> bool {
        self.user_id == ANONYMOUS_USER_ID
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::generate()
    }
}

/// Generate a new request id.
pub fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}
