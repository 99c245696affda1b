//! Structural validation for paths, values, and message payloads.
//!
//! Room state is addressed by string paths and carries arbitrary JSON, both
//! of which originate from untrusted peers. Every path segment and every
//! object key is screened against a blocked-key set before it can reach a
//! CRDT or a wire message, and values are bounded in nesting depth and
//! serialized size.

use serde_json::Value;
use thiserror::Error;

/// Keys that could corrupt host-language object prototypes or impersonate
/// reserved attributes. Rejected in paths, object keys, and snapshot keys.
pub const BLOCKED_KEYS: &[&str] = &["__proto__", "constructor", "prototype", "__class__"];

/// Maximum JSON nesting depth for any value carried by the protocol.
pub const MAX_VALUE_DEPTH: usize = 5;

/// Maximum serialized size of an individual value (100 KiB).
pub const MAX_VALUE_SIZE: usize = 100 * 1024;

/// Maximum serialized size of a whole wire message (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Maximum serialized size of a presence payload (10 KiB).
pub const MAX_PRESENCE_SIZE: usize = 10 * 1024;

/// Validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidateError {
    #[error("dangerous key '{0}' is not allowed")]
    DangerousKey(String),
    #[error("nesting depth exceeds {0}")]
    TooDeep(usize),
    #[error("value of {size} bytes exceeds limit of {limit}")]
    ValueTooLarge { size: usize, limit: usize },
}

/// Whether `key` is in the blocked-key set.
pub fn is_blocked_key(key: &str) -> bool {
    BLOCKED_KEYS.contains(&key)
}

/// Reject any path containing a blocked segment.
pub fn check_path(segments: &[String]) -> Result<(), ValidateError> {
    for segment in segments {
        if is_blocked_key(segment) {
            return Err(ValidateError::DangerousKey(segment.clone()));
        }
    }
    Ok(())
}

/// Allocation-free form of [`check_path`], used during materialization.
pub fn path_is_safe(path: &[String]) -> bool {
    path.iter().all(|segment| !is_blocked_key(segment))
}

/// Validate a value against the default 100 KiB size limit.
pub fn check_value(value: &Value) -> Result<(), ValidateError> {
    check_value_sized(value, MAX_VALUE_SIZE)
}

/// Validate a value against an explicit size limit.
///
/// Recurses into object keys and array elements, rejecting blocked keys and
/// nesting deeper than [`MAX_VALUE_DEPTH`].
pub fn check_value_sized(value: &Value, limit: usize) -> Result<(), ValidateError> {
    let size = serialized_size(value);
    if size > limit {
        return Err(ValidateError::ValueTooLarge { size, limit });
    }
    check_depth(value, 0)
}

fn check_depth(value: &Value, depth: usize) -> Result<(), ValidateError> {
    if depth > MAX_VALUE_DEPTH {
        return Err(ValidateError::TooDeep(MAX_VALUE_DEPTH));
    }
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if is_blocked_key(key) {
                    return Err(ValidateError::DangerousKey(key.clone()));
                }
                check_depth(child, depth + 1)?;
            }
        }
        Value::Array(items) => {
            for item in items {
                check_depth(item, depth + 1)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Serialized-size estimate; unserializable values count as zero.
pub fn serialized_size(value: &Value) -> usize {
    serde_json::to_string(value).map(|s| s.len()).unwrap_or(0)
}
