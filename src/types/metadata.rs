//! Delivery metadata derived from message headers.

use serde::{Deserialize, Serialize};

/// Header names written and read by the bus.
pub mod headers {
    pub const REQUEST_ID: &str = "request_id";
    pub const USER_ID: &str = "user_id";
    pub const ORIGIN: &str = "origin";
    pub const RETRY_ID: &str = "retry_id";
    pub const RETRY_ATTEMPT: &str = "retry_attempt";
    pub const RETRY_DESTINATION: &str = "retry_destination";

    /// Headers owned by the bus; never treated as context passthrough.
    pub const METADATA_KEYS: [&str; 4] = [ORIGIN, RETRY_ID, RETRY_ATTEMPT, RETRY_DESTINATION];
}

/// Origin reported when a message carries no `origin` header.
pub const UNKNOWN_ORIGIN: &str = "unknown";

/// Where a message came from and whether it is a retry.
///
/// Application code never builds this directly; it is extracted from the
/// headers of every consumed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Identity of the publishing service
    pub origin: String,

    /// Set when the message is a replay scheduled by the retry protocol
    pub retry_id: Option<String>,

    /// Replay counter, 0 for first deliveries
    pub retry_attempt: u32,

    /// Service the replay is addressed to
    pub retry_destination: Option<String>,
}

impl EventMetadata {
    /// Whether this delivery is a replay from the retry protocol.
    pub fn is_retry(&self) -> bool {
        self.retry_id.as_deref().is_some_and(|id| !id.is_empty())
    }

    /// Whether this delivery is a replay addressed to some other service.
    pub fn is_foreign(&self, service: &str) -> bool {
        match self.retry_destination.as_deref() {
            Some(destination) if !destination.is_empty() => destination != service,
            _ => false,
        }
    }
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self {
            origin: UNKNOWN_ORIGIN.to_string(),
            retry_id: None,
            retry_attempt: 0,
            retry_destination: None,
        }
    }
}
