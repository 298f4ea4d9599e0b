//! Payload and header codec.
//!
//! Headers are string-valued on the wire. Outbound, a [`Context`] plus the
//! bus-owned metadata is flattened into one header map with a fixed
//! precedence:
//!
//! 1. passthrough context fields (lowest)
//! 2. `request_id` / `user_id`
//! 3. `origin` / `retry_destination` written by the bus (highest)
//!
//! Context values are coerced with [`header_value`]: strings verbatim,
//! numbers and booleans via their JSON text, arrays and objects as compact
//! JSON, null and empty strings omitted.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::error::Result;
use crate::types::{
    headers, new_request_id, Context, EventMetadata, ANONYMOUS_USER_ID, UNKNOWN_ORIGIN,
};

/// String-valued message headers.
pub type Headers = BTreeMap<String, String>;

/// Serialize a payload to UTF-8 JSON bytes.
pub fn encode_payload(payload: &Value) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(payload)?)
}

/// Decode a payload. Never fails: absent or corrupt payloads become `{}`.
pub fn decode_payload(bytes: Option<&[u8]>) -> Value {
    bytes
        .and_then(|b| serde_json::from_slice::<Value>(b).ok())
        .unwrap_or_else(empty_object)
}

/// The value a corrupt payload decodes to.
pub fn empty_object() -> Value {
    Value::Object(Map::new())
}

/// Coerce one context value to its header form.
pub fn header_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

/// Build the outbound header set for one publish.
///
/// The result always holds `request_id` and `origin`.
pub fn build_headers(context: &Context, origin: &str, destination: Option<&str>) -> Headers {
    let mut out: Headers = context
        .extra
        .iter()
        .filter_map(|(key, value)| header_value(value).map(|v| (key.clone(), v)))
        .collect();

    let request_id = if context.request_id.is_empty() {
        new_request_id()
    } else {
        context.request_id.clone()
    };
    out.insert(headers::REQUEST_ID.to_string(), request_id);
    if !context.user_id.is_empty() {
        out.insert(headers::USER_ID.to_string(), context.user_id.clone());
    }

    out.insert(headers::ORIGIN.to_string(), origin.to_string());
    if let Some(destination) = destination.filter(|d| !d.is_empty()) {
        out.insert(headers::RETRY_DESTINATION.to_string(), destination.to_string());
    }

    out
}

/// Extract delivery metadata from consumed headers.
pub fn metadata_from_headers(headers: &Headers) -> EventMetadata {
    let non_empty = |key: &str| headers.get(key).filter(|v| !v.is_empty()).cloned();

    EventMetadata {
        origin: non_empty(headers::ORIGIN).unwrap_or_else(|| UNKNOWN_ORIGIN.to_string()),
        retry_id: non_empty(headers::RETRY_ID),
        retry_attempt: headers
            .get(headers::RETRY_ATTEMPT)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0),
        retry_destination: non_empty(headers::RETRY_DESTINATION),
    }
}

/// Rebuild the publisher's context from consumed headers.
///
/// Every header that is not bus metadata comes back as a passthrough field.
pub fn context_from_headers(headers: &Headers) -> Context {
    let request_id = headers
        .get(headers::REQUEST_ID)
        .filter(|v| !v.is_empty())
        .cloned()
        .unwrap_or_else(new_request_id);
    let user_id = headers
        .get(headers::USER_ID)
        .filter(|v| !v.is_empty())
        .cloned()
        .unwrap_or_else(|| ANONYMOUS_USER_ID.to_string());

    let mut context = Context::new(request_id, user_id);
    for (key, value) in headers {
        let key = key.as_str();
        if key == headers::REQUEST_ID
            || key == headers::USER_ID
            || headers::METADATA_KEYS.contains(&key)
        {
            continue;
        }
        context
            .extra
            .insert(key.to_string(), Value::String(value.clone()));
    }
    context
}
