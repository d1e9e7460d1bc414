//! Log records for observed calls.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which half of a call a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    /// The request message, recorded before the handler runs.
    Request,
    /// The response message or failure, recorded after the handler returns.
    Response,
}

impl RecordKind {
    /// The name used for this kind in the `type` field of an entry.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Request => "request",
            RecordKind::Response => "response",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced while encoding a record.
#[derive(Debug, Error)]
pub enum RecordError {
    /// The message could not be described by its serializer.
    #[error("message for {method} could not be encoded: {source}")]
    TypeMismatch {
        /// Method the record belonged to
        method: String,
        /// Underlying encoder error
        #[source]
        source: serde_json::Error,
    },
}

/// One observed event: a call's request or its response.
///
/// The message is borrowed from the caller, so a record is cheap to build
/// and is dropped as soon as it has been encoded. Encoding produces
/// `{"method":...,"type":...,"message":...}` in that field order, with the
/// message rendered through its own `Serialize` implementation.
#[derive(Serialize)]
#[serde(bound = "M: Serialize")]
pub struct LogRecord<'a, M: ?Sized> {
    method: &'a str,
    #[serde(rename = "type")]
    kind: RecordKind,
    message: &'a M,
    #[serde(skip_serializing_if = "Option::is_none")]
    call_id: Option<u64>,
}

impl<'a, M: Serialize + ?Sized> LogRecord<'a, M> {
    /// Create a record of the given kind.
    pub fn new(kind: RecordKind, method: &'a str, message: &'a M) -> Self {
        Self {
            method,
            kind,
            message,
            call_id: None,
        }
    }

    /// Create a request record.
    pub fn request(method: &'a str, message: &'a M) -> Self {
        Self::new(RecordKind::Request, method, message)
    }

    /// Create a response record.
    pub fn response(method: &'a str, message: &'a M) -> Self {
        Self::new(RecordKind::Response, method, message)
    }

    /// Tag the record with a per-call correlation id.
    ///
    /// The id is emitted as a trailing `call_id` field; records without one
    /// keep the three-field layout.
    pub fn with_call_id(mut self, call_id: u64) -> Self {
        self.call_id = Some(call_id);
        self
    }

    /// The method this record belongs to.
    pub fn method(&self) -> &str {
        self.method
    }

    /// Whether this is a request or a response record.
    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    /// Encode the record as a single compact JSON object, without a
    /// trailing separator.
    pub fn encode(&self) -> Result<Vec<u8>, RecordError> {
        serde_json::to_vec(self).map_err(|source| RecordError::TypeMismatch {
            method: self.method.to_owned(),
            source,
        })
    }
}

impl<M: ?Sized> fmt::Debug for LogRecord<'_, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogRecord")
            .field("method", &self.method)
            .field("kind", &self.kind)
            .field("call_id", &self.call_id)
            .finish_non_exhaustive()
    }
}

/// The message recorded as the response of a call whose handler failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Status code name, e.g. `NotFound`
    pub code: String,
    /// Human readable error message
    pub message: String,
}

impl FailureRecord {
    /// Create a failure record.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::collections::HashMap;

    use super::*;

    #[derive(Serialize)]
    struct StatRequest {
        key: String,
    }

    #[derive(Serialize)]
    struct StatResponse {
        size: u64,
    }

    #[test]
    fn stat_call_renders_exact_lines() {
        let req = StatRequest {
            key: "abc".to_string(),
        };
        let resp = StatResponse { size: 42 };

        let req_line = LogRecord::request("Stat", &req).encode().unwrap();
        let resp_line = LogRecord::response("Stat", &resp).encode().unwrap();

        assert_eq!(
            String::from_utf8(req_line).unwrap(),
            r#"{"method":"Stat","type":"request","message":{"key":"abc"}}"#
        );
        assert_eq!(
            String::from_utf8(resp_line).unwrap(),
            r#"{"method":"Stat","type":"response","message":{"size":42}}"#
        );
    }

    #[test]
    fn call_id_is_appended_after_message() {
        let req = StatRequest {
            key: "abc".to_string(),
        };
        let line = LogRecord::request("Stat", &req)
            .with_call_id(7)
            .encode()
            .unwrap();

        assert_eq!(
            String::from_utf8(line).unwrap(),
            r#"{"method":"Stat","type":"request","message":{"key":"abc"},"call_id":7}"#
        );
    }

    #[test]
    fn unencodable_message_is_a_type_mismatch() {
        // JSON object keys must be strings.
        let mut bad: HashMap<Vec<u8>, u32> = HashMap::new();
        bad.insert(vec![1, 2, 3], 1);

        let err = LogRecord::request("/svc/Bad", &bad).encode().unwrap_err();
        match err {
            RecordError::TypeMismatch { method, .. } => assert_eq!(method, "/svc/Bad"),
        }
    }

    #[test]
    fn failure_record_round_trips() {
        let failure = FailureRecord::new("NotFound", "snapshot abc does not exist");
        let line = LogRecord::response("/svc/Stat", &failure).encode().unwrap();

        let value: serde_json::Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(value["type"], "response");
        let back: FailureRecord = serde_json::from_value(value["message"].clone()).unwrap();
        assert_eq!(back, failure);
    }

    #[test]
    fn kind_names() {
        assert_eq!(RecordKind::Request.to_string(), "request");
        assert_eq!(RecordKind::Response.as_str(), "response");
    }
}
