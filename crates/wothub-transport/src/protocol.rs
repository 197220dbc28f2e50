//! Protocol selection and the fixed endpoint surface.

use std::fmt;
use url::Url;
use wothub_messaging::{TransportError, TransportResult};

/// Well-known paths and header names shared by clients and servers.
pub mod paths {
    /// Password login, no bearer token required
    pub const LOGIN: &str = "/authn/login";
    /// Session invalidation
    pub const LOGOUT: &str = "/authn/logout";
    /// Token refresh, authenticated with the old token
    pub const REFRESH: &str = "/authn/refresh";
    /// Request envelope pass-through
    pub const REQUEST: &str = "/wothub/request";
    /// Response envelope pass-through (agents answering server requests)
    pub const RESPONSE: &str = "/wothub/response";
    /// Notification envelope pass-through (agents publishing)
    pub const NOTIFICATION: &str = "/wothub/notification";
    /// SSE return channel
    pub const SSE: &str = "/wothub/sse";
    /// WoT flavoured SSE path, served by the same handler
    pub const WOT_SSE: &str = "/wot/sse";
    /// WebSocket endpoint path
    pub const WSS: &str = "/wothub/wss";

    /// Header carrying the client's connection id
    pub const CONNECTION_ID_HEADER: &str = "connection-id";
    /// Header carrying the request correlation id
    pub const CORRELATION_ID_HEADER: &str = "correlation-id";

    /// MQTT topic prefix for request publishes
    pub const MQTT_REQUEST_PREFIX: &str = "wothub/request";
    /// MQTT topic prefix for notification publishes
    pub const MQTT_NOTIFICATION_PREFIX: &str = "wothub/notification";
    /// MQTT topic agents publish responses to
    pub const MQTT_RESPONSE_TOPIC: &str = "wothub/response";
    /// MQTT inbox topic prefix, suffixed with the connection id
    pub const MQTT_INBOX_PREFIX: &str = "INBOX";
}

/// The wire protocol of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolType {
    /// HTTPS requests with an SSE return channel
    HttpSse,
    /// Single bidirectional WebSocket connection
    Wss,
    /// MQTT via a broker
    Mqtt,
}

impl ProtocolType {
    /// Short protocol label used in logs and connection info.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolType::HttpSse => "https-sse",
            ProtocolType::Wss => "wss",
            ProtocolType::Mqtt => "mqtt",
        }
    }

    /// Derive the protocol from a connect URL.
    ///
    /// `https` (any path) selects HTTP+SSE; `wss` or an `https` URL ending in
    /// a websocket path selects WebSocket; `mqtts` selects MQTT. The
    /// non-TLS schemes `http`, `ws` and `mqtt` map the same way.
    pub fn from_url(connect_url: &str) -> TransportResult<Self> {
        let parsed = Url::parse(connect_url)
            .map_err(|e| TransportError::internal(format!("invalid connect URL '{connect_url}': {e}")))?;
        let path = parsed.path();
        match parsed.scheme() {
            "wss" | "ws" => Ok(ProtocolType::Wss),
            "mqtts" | "mqtt" => Ok(ProtocolType::Mqtt),
            "https" | "http" => {
                if path.ends_with("/wss") {
                    Ok(ProtocolType::Wss)
                } else {
                    Ok(ProtocolType::HttpSse)
                }
            }
            other => Err(TransportError::internal(format!(
                "unsupported connect URL scheme '{other}'"
            ))),
        }
    }
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derive the MQTT publish topic for a request.
pub fn mqtt_request_topic(operation: &str, thing_id: &str, name: &str) -> String {
    let tid = if thing_id.is_empty() { "+" } else { thing_id };
    let n = if name.is_empty() { "+" } else { name };
    format!("{}/{}/{}/{}", paths::MQTT_REQUEST_PREFIX, operation, tid, n)
}

/// Derive the MQTT publish topic for a notification.
pub fn mqtt_notification_topic(operation: &str, thing_id: &str, name: &str) -> String {
    let tid = if thing_id.is_empty() { "+" } else { thing_id };
    let n = if name.is_empty() { "+" } else { name };
    format!("{}/{}/{}/{}", paths::MQTT_NOTIFICATION_PREFIX, operation, tid, n)
}

/// Derive the per-connection inbox topic carrying responses and
/// agent-directed requests.
pub fn mqtt_inbox_topic(connection_id: &str) -> String {
    format!("{}/{}", paths::MQTT_INBOX_PREFIX, connection_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_selection() {
        assert_eq!(ProtocolType::from_url("https://hub.local:8444/").unwrap(), ProtocolType::HttpSse);
        assert_eq!(
            ProtocolType::from_url("https://hub.local:8444/wothub/sse").unwrap(),
            ProtocolType::HttpSse
        );
        assert_eq!(
            ProtocolType::from_url("wss://hub.local:8445/wothub/wss").unwrap(),
            ProtocolType::Wss
        );
        assert_eq!(
            ProtocolType::from_url("https://hub.local:8444/wot/wss").unwrap(),
            ProtocolType::Wss
        );
        assert_eq!(ProtocolType::from_url("mqtts://hub.local:8883").unwrap(), ProtocolType::Mqtt);
        assert!(ProtocolType::from_url("gopher://hub.local").is_err());
    }

    #[test]
    fn topic_derivation_is_deterministic() {
        assert_eq!(
            mqtt_request_topic("invokeaction", "thing1", "action1"),
            "wothub/request/invokeaction/thing1/action1"
        );
        assert_eq!(
            mqtt_notification_topic("publishevent", "thing1", ""),
            "wothub/notification/publishevent/thing1/+"
        );
        assert_eq!(mqtt_inbox_topic("c1.abc"), "INBOX/c1.abc");
    }
}
