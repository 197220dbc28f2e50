//! The three message envelopes exchanged over every wire protocol.
//!
//! Requests expect a response when they carry a correlation id; notifications
//! are fire-and-forget. The JSON field names below are the wire format and
//! are identical across HTTP, SSE, WebSocket and MQTT.

use crate::{timestamp_now, Operation, Status, TransportError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A request for an operation on a thing, sent by consumers to the hub and by
/// the hub to agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMessage {
    /// The operation to perform
    pub operation: Operation,
    /// The thing this request addresses; empty means "all" for the
    /// subscription family of operations
    #[serde(rename = "thingId", default)]
    pub thing_id: String,
    /// Affordance name (action, property or event); empty means "all" for
    /// the subscription family of operations
    #[serde(default)]
    pub name: String,
    /// Operation input as described by the affordance schema
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    /// Pairs this request with its response; empty for fire-and-forget
    #[serde(rename = "correlationId", default)]
    pub correlation_id: String,
    /// Authenticated sender, set by the server on forwarded requests
    #[serde(rename = "senderId", default)]
    pub sender_id: String,
    /// Creation time, RFC3339 with milliseconds
    #[serde(default)]
    pub timestamp: String,
}

impl RequestMessage {
    /// Create a request envelope. An empty `correlation_id` makes this
    /// fire-and-forget.
    pub fn new(
        operation: Operation,
        thing_id: impl Into<String>,
        name: impl Into<String>,
        input: Option<Value>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            thing_id: thing_id.into(),
            name: name.into(),
            input,
            correlation_id: correlation_id.into(),
            sender_id: String::new(),
            timestamp: timestamp_now(),
        }
    }

    /// Build the response to this request, inheriting operation, thing id,
    /// name and correlation id. Status is completed when `err` is `None`,
    /// failed otherwise.
    pub fn create_response(&self, output: Option<Value>, err: Option<TransportError>) -> ResponseMessage {
        let (status, error) = match err {
            None => (Status::Completed, String::new()),
            Some(e) => (Status::Failed, e.to_string()),
        };
        ResponseMessage {
            operation: self.operation,
            thing_id: self.thing_id.clone(),
            name: self.name.clone(),
            output,
            error,
            status,
            correlation_id: self.correlation_id.clone(),
            received: self.timestamp.clone(),
            updated: timestamp_now(),
        }
    }
}

/// The answer to a request, correlated through `correlation_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    /// The operation of the request this answers
    pub operation: Operation,
    /// Thing id copied from the request
    #[serde(rename = "thingId", default)]
    pub thing_id: String,
    /// Affordance name copied from the request
    #[serde(default)]
    pub name: String,
    /// Result value as described by the affordance schema
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Failure description; empty unless status is failed
    #[serde(default)]
    pub error: String,
    /// Progress of the request; only completed/failed end the exchange
    #[serde(default)]
    pub status: Status,
    /// Correlation id copied from the request
    #[serde(rename = "correlationId", default)]
    pub correlation_id: String,
    /// Time the request was received
    #[serde(default)]
    pub received: String,
    /// Time this status was produced
    #[serde(default)]
    pub updated: String,
}

impl ResponseMessage {
    /// Convert a failed response into the error it carries, or `Ok` with the
    /// output for a completed one.
    pub fn into_result(self) -> Result<Option<Value>, TransportError> {
        if self.status == Status::Failed {
            Err(TransportError::request_failed(self.error))
        } else {
            Ok(self.output)
        }
    }
}

/// A fire-and-forget message: event, property update, TD update or ping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationMessage {
    /// The operation that produced this notification
    pub operation: Operation,
    /// Source thing
    #[serde(rename = "thingId", default)]
    pub thing_id: String,
    /// Affordance name
    #[serde(default)]
    pub name: String,
    /// Payload as described by the affordance schema
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Creation time, RFC3339 with milliseconds
    #[serde(default)]
    pub timestamp: String,
}

impl NotificationMessage {
    /// Create a notification envelope.
    pub fn new(
        operation: Operation,
        thing_id: impl Into<String>,
        name: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            operation,
            thing_id: thing_id.into(),
            name: name.into(),
            data,
            timestamp: timestamp_now(),
        }
    }
}

/// Envelope kind labels used on return channels that need out-of-band
/// demultiplexing (the SSE `event:` field and the MQTT topic prefix).
pub mod kind {
    /// A request envelope directed at an agent
    pub const REQUEST: &str = "request";
    /// A response envelope
    pub const RESPONSE: &str = "response";
    /// A notification envelope
    pub const NOTIFICATION: &str = "notification";
    /// Server keep-alive / connection-up signal
    pub const PING: &str = "ping";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_wire_names() {
        let req = RequestMessage::new(
            Operation::InvokeAction,
            "thing1",
            "action1",
            Some(json!("hello")),
            "c-1",
        );
        let v: Value = serde_json::to_value(&req).unwrap();
        assert_eq!(v["operation"], "invokeaction");
        assert_eq!(v["thingId"], "thing1");
        assert_eq!(v["correlationId"], "c-1");
        assert_eq!(v["input"], "hello");
    }

    #[test]
    fn create_response_inherits_correlation() {
        let req = RequestMessage::new(Operation::InvokeAction, "t1", "a1", None, "c-42");
        let resp = req.create_response(Some(json!(5)), None);
        assert_eq!(resp.correlation_id, "c-42");
        assert_eq!(resp.status, Status::Completed);
        assert!(resp.error.is_empty());

        let failed = req.create_response(None, Some(TransportError::request_failed("boom")));
        assert_eq!(failed.status, Status::Failed);
        assert!(!failed.error.is_empty());
    }

    #[test]
    fn failed_response_becomes_error() {
        let req = RequestMessage::new(Operation::WriteProperty, "t1", "p1", None, "c-1");
        let resp = req.create_response(None, Some(TransportError::not_found("no such thing")));
        assert!(resp.into_result().is_err());
    }
}
