//! Registry of all live server connections, indexed two ways.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use wothub_messaging::NotificationMessage;

use super::connection::ServerConnection;

/// Owns every [`ServerConnection`] while it is registered and fans
/// notifications out to them.
///
/// Lookups work by connection id and by client id; a client may hold several
/// connections. No lock is held while connection methods run: iteration
/// snapshots the set first.
#[derive(Default)]
pub struct ConnectionManager {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    by_connection_id: HashMap<String, Arc<dyn ServerConnection>>,
    by_client_id: HashMap<String, Vec<String>>,
}

impl ConnectionManager {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. A connection with the same id is evicted and
    /// closed first.
    pub async fn add_connection(&self, c: Arc<dyn ServerConnection>) {
        let info = c.connection_info();
        let evicted = {
            let mut inner = self.inner.write();
            let evicted = inner.by_connection_id.insert(info.connection_id.clone(), c);
            let list = inner.by_client_id.entry(info.client_id.clone()).or_default();
            if !list.contains(&info.connection_id) {
                list.push(info.connection_id.clone());
            }
            evicted
        };
        if let Some(old) = evicted {
            warn!(
                connection_id = %info.connection_id,
                client_id = %info.client_id,
                "duplicate connection id, closing previous connection"
            );
            old.disconnect().await;
        }
    }

    /// Remove a connection from both indexes. Removing an unknown id is a
    /// no-op.
    pub fn remove_connection(&self, connection_id: &str) {
        let mut inner = self.inner.write();
        if let Some(c) = inner.by_connection_id.remove(connection_id) {
            let client_id = c.connection_info().client_id;
            if let Some(list) = inner.by_client_id.get_mut(&client_id) {
                list.retain(|cid| cid != connection_id);
                if list.is_empty() {
                    inner.by_client_id.remove(&client_id);
                }
            }
        }
    }

    /// Look up a connection by its connection id.
    pub fn get_by_connection_id(&self, connection_id: &str) -> Option<Arc<dyn ServerConnection>> {
        self.inner.read().by_connection_id.get(connection_id).cloned()
    }

    /// All connections of one client. Agents typically have exactly one.
    pub fn get_by_client_id(&self, client_id: &str) -> Vec<Arc<dyn ServerConnection>> {
        let inner = self.inner.read();
        inner
            .by_client_id
            .get(client_id)
            .map(|cids| {
                cids.iter()
                    .filter_map(|cid| inner.by_connection_id.get(cid).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Connection and unique-client counts.
    pub fn counts(&self) -> (usize, usize) {
        let inner = self.inner.read();
        (inner.by_connection_id.len(), inner.by_client_id.len())
    }

    /// Offer a notification to every connection; each connection applies its
    /// own subscription filtering. No cross-connection ordering guarantee.
    pub async fn publish_notification(&self, notif: &NotificationMessage) {
        let snapshot: Vec<Arc<dyn ServerConnection>> =
            self.inner.read().by_connection_id.values().cloned().collect();
        for c in snapshot {
            c.send_notification(notif).await;
        }
    }

    /// Disconnect and deregister every connection.
    pub async fn close_all(&self) {
        let snapshot: Vec<Arc<dyn ServerConnection>> = {
            let mut inner = self.inner.write();
            let list = inner.by_connection_id.values().cloned().collect();
            inner.by_connection_id.clear();
            inner.by_client_id.clear();
            list
        };
        info!(count = snapshot.len(), "closing all server connections");
        for c in snapshot {
            c.disconnect().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProtocolType;
    use crate::server::connection::{ConnectionInfo, ServerConnectionState};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wothub_messaging::{Operation, RequestMessage, ResponseMessage, TransportResult};

    struct FakeConnection {
        state: ServerConnectionState,
        delivered: AtomicUsize,
    }

    impl FakeConnection {
        fn new(client_id: &str, connection_id: &str) -> Arc<Self> {
            Arc::new(Self {
                state: ServerConnectionState::new(ConnectionInfo {
                    client_id: client_id.to_string(),
                    connection_id: connection_id.to_string(),
                    remote_addr: String::new(),
                    protocol_type: ProtocolType::Wss,
                }),
                delivered: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ServerConnection for FakeConnection {
        fn connection_info(&self) -> ConnectionInfo {
            self.state.info.clone()
        }
        fn state(&self) -> &ServerConnectionState {
            &self.state
        }
        async fn send_notification(&self, notif: &NotificationMessage) {
            if self.state.should_deliver(notif) {
                self.delivered.fetch_add(1, Ordering::SeqCst);
            }
        }
        async fn send_request(&self, _req: &RequestMessage) -> TransportResult<()> {
            Ok(())
        }
        async fn send_response(&self, _resp: &ResponseMessage) -> TransportResult<()> {
            Ok(())
        }
        async fn disconnect(&self) {
            self.state.mark_closed();
        }
    }

    #[tokio::test]
    async fn indexes_by_both_keys() {
        let cm = ConnectionManager::new();
        let c1 = FakeConnection::new("client1", "client1.a");
        let c2 = FakeConnection::new("client1", "client1.b");
        cm.add_connection(c1).await;
        cm.add_connection(c2).await;

        assert!(cm.get_by_connection_id("client1.a").is_some());
        assert_eq!(cm.get_by_client_id("client1").len(), 2);
        assert_eq!(cm.counts(), (2, 1));

        cm.remove_connection("client1.a");
        cm.remove_connection("client1.a"); // idempotent
        assert_eq!(cm.get_by_client_id("client1").len(), 1);
    }

    #[tokio::test]
    async fn duplicate_connection_id_evicts_previous() {
        let cm = ConnectionManager::new();
        let old = FakeConnection::new("client1", "client1.a");
        let new = FakeConnection::new("client1", "client1.a");
        cm.add_connection(old.clone()).await;
        cm.add_connection(new).await;
        assert!(old.state.is_closed());
        assert_eq!(cm.counts(), (1, 1));
    }

    #[tokio::test]
    async fn notification_fanout_respects_subscriptions() {
        let cm = ConnectionManager::new();
        let subscribed = FakeConnection::new("c1", "c1.a");
        let other = FakeConnection::new("c2", "c2.a");
        subscribed.state.apply_subscription_op(&RequestMessage::new(
            Operation::SubscribeAllEvents,
            "thing1",
            "",
            None,
            "",
        ));
        cm.add_connection(subscribed.clone()).await;
        cm.add_connection(other.clone()).await;

        let notif = NotificationMessage::new(Operation::PublishEvent, "thing1", "event11", None);
        cm.publish_notification(&notif).await;
        assert_eq!(subscribed.delivered.load(Ordering::SeqCst), 1);
        assert_eq!(other.delivered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn close_all_empties_registry() {
        let cm = ConnectionManager::new();
        let c = FakeConnection::new("c1", "c1.a");
        cm.add_connection(c.clone()).await;
        cm.close_all().await;
        assert!(c.state.is_closed());
        assert_eq!(cm.counts(), (0, 0));
    }
}
