//! Error kinds exposed at the configuration boundary.
//!
//! Every failed operation carries one of these kinds plus a human
//! message; responses serialize as `{"ret": <KIND>, "data": <message>}`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for datastore operations.
pub type DatastoreResult<T> = Result<T, DatastoreError>;

/// The boundary error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Success; only appears in responses.
    Ok,
    /// Unknown option, malformed value, missing required option.
    InvalidArgs,
    /// Numeric value outside accepted bounds.
    OutOfRange,
    /// String or collection too long.
    TooLong,
    /// String or collection too short.
    TooShort,
    /// Referenced object does not exist.
    NotFound,
    /// Name collision.
    AlreadyExists,
    /// Object in use or disabled; the transition is illegal.
    NotOperational,
    /// Operation on an object marked for deferred destroy.
    InvalidObject,
    /// Allocation failure.
    NoMemory,
    /// OS call failure; the message carries errno context.
    PosixApiError,
    /// A sub-command rejected the request.
    DatastoreInterpError,
}

/// A datastore operation failure.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DatastoreError {
    /// The boundary kind.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl DatastoreError {
    /// Builds an error of `kind` with the given message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// `NOT_FOUND` for a missing object.
    pub fn not_found(kind_name: &str, name: &str) -> Self {
        Self::new(ErrorKind::NotFound, format!("{kind_name} {name} not found."))
    }

    /// `ALREADY_EXISTS` for a name collision.
    pub fn already_exists(name: &str) -> Self {
        Self::new(
            ErrorKind::AlreadyExists,
            format!("name = :{name}: already exists."),
        )
    }

    /// `NOT_OPERATIONAL` for a destroy attempt on a used object.
    pub fn in_use(name: &str) -> Self {
        Self::new(
            ErrorKind::NotOperational,
            format!("name = :{name}: is used."),
        )
    }

    /// `OUT_OF_RANGE` for a numeric bound violation.
    pub fn out_of_range(field: &str, value: impl std::fmt::Display) -> Self {
        Self::new(
            ErrorKind::OutOfRange,
            format!("{field} = {value} is out of range."),
        )
    }

    /// `INVALID_ARGS` for a malformed or unknown option.
    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgs, message)
    }
}

/// The uniform command response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// The result kind.
    pub ret: ErrorKind,
    /// Payload on success, message on failure.
    pub data: serde_json::Value,
}

impl Response {
    /// Success with a payload.
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            ret: ErrorKind::Ok,
            data,
        }
    }

    /// Failure from an error.
    pub fn err(e: &DatastoreError) -> Self {
        Self {
            ret: e.kind,
            data: serde_json::Value::String(e.message.clone()),
        }
    }
}

/// Folds a result into the response envelope.
pub fn to_response(result: DatastoreResult<serde_json::Value>) -> Response {
    match result {
        Ok(v) => Response::ok(v),
        Err(e) => Response::err(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_serializes_screaming() {
        let j = serde_json::to_string(&ErrorKind::NotOperational).unwrap();
        assert_eq!(j, "\"NOT_OPERATIONAL\"");
        let j = serde_json::to_string(&ErrorKind::PosixApiError).unwrap();
        assert_eq!(j, "\"POSIX_API_ERROR\"");
    }

    #[test]
    fn test_in_use_message_shape() {
        let e = DatastoreError::in_use("p1");
        assert_eq!(e.message, "name = :p1: is used.");
        assert_eq!(e.kind, ErrorKind::NotOperational);
    }

    #[test]
    fn test_response_envelope() {
        let r = to_response(Err(DatastoreError::not_found("port", "p9")));
        let j = serde_json::to_value(&r).unwrap();
        assert_eq!(j["ret"], "NOT_FOUND");
        assert!(j["data"].as_str().unwrap().contains("p9"));
    }
}
