//! Messaging core for the WotHub transport layer.
//!
//! This crate defines the protocol-independent pieces shared by every wire
//! protocol: the three message envelopes (request, response, notification),
//! the closed set of operations, the request/response rendezvous channel used
//! for correlation tracking, and the per-connection subscription bookkeeping.
//!
//! Protocol adapters in `wothub-transport` map these envelopes onto their
//! wire format; nothing in this crate touches the network.

pub mod envelope;
pub mod error;
pub mod forms;
pub mod operation;
pub mod rnr;
pub mod status;
pub mod subscriptions;

pub use envelope::{kind, NotificationMessage, RequestMessage, ResponseMessage};
pub use error::{TransportError, TransportResult};
pub use forms::{Form, GetFormHandler};
pub use operation::Operation;
pub use rnr::RnrChannel;
pub use status::Status;
pub use subscriptions::SubscriptionSet;

use chrono::{SecondsFormat, Utc};

/// Format the current time as an RFC3339 timestamp with millisecond precision.
///
/// All envelope timestamps use this format on the wire.
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Milliseconds since the Unix epoch, used by the provisioning records.
pub fn unix_milli_now() -> i64 {
    Utc::now().timestamp_millis()
}
