//! The per-client server-side connection contract and its shared state.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tracing::{debug, warn};
use wothub_messaging::{
    unix_milli_now, NotificationMessage, Operation, RequestMessage, ResponseMessage,
    SubscriptionSet, TransportResult,
};

use crate::protocol::ProtocolType;

/// Identity of one server-side connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Authenticated account id of the remote client
    pub client_id: String,
    /// `<clientID>.<nonce>`, unique per connection
    pub connection_id: String,
    /// Remote peer address, for logging
    pub remote_addr: String,
    /// Wire protocol of this connection
    pub protocol_type: ProtocolType,
}

/// One client connection as seen by the server.
///
/// Implementations write frames for their wire protocol; subscription gating
/// and close bookkeeping live in [`ServerConnectionState`].
#[async_trait]
pub trait ServerConnection: Send + Sync {
    /// Identity of this connection.
    fn connection_info(&self) -> ConnectionInfo;

    /// Shared per-connection state: subscription sets, liveness, closed flag.
    fn state(&self) -> &ServerConnectionState;

    /// Deliver a notification if this connection subscribed to or observes
    /// its `(thing_id, name)`.
    async fn send_notification(&self, notif: &NotificationMessage);

    /// Dispatch a request to the remote client (agent case).
    async fn send_request(&self, req: &RequestMessage) -> TransportResult<()>;

    /// Write a response for an in-flight request back to the client.
    async fn send_response(&self, resp: &ResponseMessage) -> TransportResult<()>;

    /// Close the connection. Calling this twice is not an error.
    async fn disconnect(&self);
}

/// State shared by every server connection implementation: identity, the
/// two subscription sets, activity tracking and the closed flag.
#[derive(Debug)]
pub struct ServerConnectionState {
    /// Connection identity
    pub info: ConnectionInfo,
    /// Event subscriptions of this connection
    pub subscriptions: SubscriptionSet,
    /// Property observations of this connection
    pub observations: SubscriptionSet,
    last_activity: AtomicI64,
    closed: AtomicBool,
}

impl ServerConnectionState {
    /// Create state for a freshly accepted connection.
    pub fn new(info: ConnectionInfo) -> Self {
        Self {
            info,
            subscriptions: SubscriptionSet::new(),
            observations: SubscriptionSet::new(),
            last_activity: AtomicI64::new(unix_milli_now()),
            closed: AtomicBool::new(false),
        }
    }

    /// Record inbound traffic.
    pub fn touch(&self) {
        self.last_activity.store(unix_milli_now(), Ordering::Relaxed);
    }

    /// Milliseconds-since-epoch of the last inbound message.
    pub fn last_activity(&self) -> i64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Mark the connection closed. Returns false when it already was, so
    /// disconnect stays idempotent.
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    /// Whether the connection was closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Apply a subscription-family operation to this connection's sets and
    /// acknowledge it. Returns `None` for non-subscription operations.
    ///
    /// Mutations are applied before the acknowledgement is produced, so a
    /// notification processed after the ack observes the new state.
    pub fn apply_subscription_op(&self, req: &RequestMessage) -> Option<ResponseMessage> {
        let applied = match req.operation {
            Operation::SubscribeEvent | Operation::SubscribeAllEvents => {
                self.subscriptions.subscribe(&req.thing_id, &req.name);
                true
            }
            Operation::UnsubscribeEvent | Operation::UnsubscribeAllEvents => {
                self.subscriptions.unsubscribe(&req.thing_id, &req.name);
                true
            }
            Operation::ObserveProperty | Operation::ObserveAllProperties => {
                self.observations.subscribe(&req.thing_id, &req.name);
                true
            }
            Operation::UnobserveProperty | Operation::UnobserveAllProperties => {
                self.observations.unsubscribe(&req.thing_id, &req.name);
                true
            }
            _ => false,
        };
        if !applied {
            return None;
        }
        debug!(
            client_id = %self.info.client_id,
            connection_id = %self.info.connection_id,
            operation = %req.operation,
            thing_id = %req.thing_id,
            name = %req.name,
            "subscription updated"
        );
        Some(req.create_response(None, None))
    }

    /// Whether a notification passes this connection's subscription or
    /// observation predicate.
    pub fn should_deliver(&self, notif: &NotificationMessage) -> bool {
        match notif.operation {
            Operation::PublishEvent => self.subscriptions.is_subscribed(&notif.thing_id, &notif.name),
            Operation::UpdateProperty | Operation::UpdateMultipleProperties => {
                self.observations.is_subscribed(&notif.thing_id, &notif.name)
            }
            Operation::UpdateTd => {
                self.subscriptions.is_subscribed(&notif.thing_id, "+")
                    || self.observations.is_subscribed(&notif.thing_id, "+")
            }
            // pings and pongs are connection-level, always delivered
            Operation::Ping | Operation::Pong => true,
            _ => false,
        }
    }

    /// Log and swallow a write attempted after close. Returns true when the
    /// write must be dropped.
    pub fn reject_write_when_closed(&self, what: &str) -> bool {
        if self.is_closed() {
            warn!(
                connection_id = %self.info.connection_id,
                what = what,
                "write on closed connection dropped"
            );
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state() -> ServerConnectionState {
        ServerConnectionState::new(ConnectionInfo {
            client_id: "client1".to_string(),
            connection_id: "client1.abc".to_string(),
            remote_addr: "127.0.0.1:1".to_string(),
            protocol_type: ProtocolType::Wss,
        })
    }

    #[test]
    fn subscription_op_mutates_and_acks() {
        let st = state();
        let req = RequestMessage::new(Operation::SubscribeAllEvents, "thing1", "", None, "c-1");
        let resp = st.apply_subscription_op(&req).unwrap();
        assert_eq!(resp.correlation_id, "c-1");
        let notif = NotificationMessage::new(Operation::PublishEvent, "thing1", "event11", Some(json!("x")));
        assert!(st.should_deliver(&notif));
    }

    #[test]
    fn events_do_not_leak_into_observations() {
        let st = state();
        let req = RequestMessage::new(Operation::SubscribeAllEvents, "thing1", "", None, "");
        st.apply_subscription_op(&req);
        let prop = NotificationMessage::new(Operation::UpdateProperty, "thing1", "p1", Some(json!(1)));
        assert!(!st.should_deliver(&prop));
    }

    #[test]
    fn non_subscription_op_is_ignored() {
        let st = state();
        let req = RequestMessage::new(Operation::InvokeAction, "thing1", "a1", None, "c-1");
        assert!(st.apply_subscription_op(&req).is_none());
    }

    #[test]
    fn close_is_idempotent() {
        let st = state();
        assert!(st.mark_closed());
        assert!(!st.mark_closed());
        assert!(st.reject_write_when_closed("response"));
    }
}
