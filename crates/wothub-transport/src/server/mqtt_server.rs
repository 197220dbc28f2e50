//! MQTT transport server: a bridge riding on an external broker.
//!
//! The hub does not embed a broker. Instead it connects to one as a
//! privileged client, subscribes to the shared request/response/notification
//! topics and materializes a [`ServerConnection`] per remote connection id.
//! Outbound traffic to a client goes to its `INBOX/<connectionID>` topics.
//! Publishes are authenticated by the token user property; validated tokens
//! are cached per connection id.

use parking_lot::Mutex;
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet, Publish};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, MqttOptions};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wothub_messaging::{
    NotificationMessage, RequestMessage, ResponseMessage, TransportError, TransportResult,
};

use super::authenticator::Authenticator;
use super::connection::{ConnectionInfo, ServerConnection, ServerConnectionState};
use super::connection_manager::ConnectionManager;
use super::demux_request;
use crate::protocol::{self, paths, ProtocolType};
use crate::routing::RequestRouter;

/// Settings of the MQTT bridge.
#[derive(Debug, Clone)]
pub struct MqttServerConfig {
    /// Broker host
    pub broker_host: String,
    /// Broker port
    pub broker_port: u16,
    /// Client id of the bridge session on the broker
    pub bridge_id: String,
    /// Broker credentials of the bridge, if the broker requires them
    pub credentials: Option<(String, String)>,
}

impl Default for MqttServerConfig {
    fn default() -> Self {
        Self {
            broker_host: "127.0.0.1".to_string(),
            broker_port: 1883,
            bridge_id: "wothub-bridge".to_string(),
            credentials: None,
        }
    }
}

/// The MQTT transport bridge.
pub struct MqttTransportServer {
    config: MqttServerConfig,
    auth: Arc<dyn Authenticator>,
    router: Arc<dyn RequestRouter>,
    connections: Arc<ConnectionManager>,
}

/// Running bridge: shutdown control.
pub struct MqttServerHandle {
    running: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl MqttServerHandle {
    /// Stop the bridge session.
    pub async fn stop(self) {
        self.running.store(false, Ordering::SeqCst);
        self.task.abort();
        let _ = self.task.await;
    }
}

impl MqttTransportServer {
    /// Create the bridge over the shared authenticator, router and
    /// connection registry.
    pub fn new(
        config: MqttServerConfig,
        auth: Arc<dyn Authenticator>,
        router: Arc<dyn RequestRouter>,
        connections: Arc<ConnectionManager>,
    ) -> Self {
        Self { config, auth, router, connections }
    }

    /// Connect to the broker and bridge until stopped.
    pub async fn start(&self) -> TransportResult<MqttServerHandle> {
        let mut options = MqttOptions::new(
            &self.config.bridge_id,
            &self.config.broker_host,
            self.config.broker_port,
        );
        if let Some((user, pass)) = &self.config.credentials {
            options.set_credentials(user, pass);
        }
        options.set_keep_alive(Duration::from_secs(20));
        let (client, event_loop) = AsyncClient::new(options, 256);
        info!(
            host = %self.config.broker_host,
            port = self.config.broker_port,
            "mqtt bridge connecting to broker"
        );

        let running = Arc::new(AtomicBool::new(true));
        let bridge = Bridge {
            auth: self.auth.clone(),
            router: self.router.clone(),
            connections: self.connections.clone(),
            client,
            sessions: Mutex::new(HashMap::new()),
        };
        let task = tokio::spawn(bridge.run(event_loop, running.clone()));
        Ok(MqttServerHandle { running, task })
    }
}

struct Bridge {
    auth: Arc<dyn Authenticator>,
    router: Arc<dyn RequestRouter>,
    connections: Arc<ConnectionManager>,
    client: AsyncClient,
    /// connection id -> (validated token, client id)
    sessions: Mutex<HashMap<String, (String, String)>>,
}

impl Bridge {
    async fn run(self, mut event_loop: rumqttc::v5::EventLoop, running: Arc<AtomicBool>) {
        while running.load(Ordering::SeqCst) {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        warn!(code = ?ack.code, "broker refused the bridge session");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                    let filters = [
                        format!("{}/#", paths::MQTT_REQUEST_PREFIX),
                        format!("{}/#", paths::MQTT_NOTIFICATION_PREFIX),
                        paths::MQTT_RESPONSE_TOPIC.to_string(),
                    ];
                    for f in filters {
                        if let Err(e) = self.client.subscribe(&f, QoS::AtLeastOnce).await {
                            warn!(filter = %f, error = %e, "bridge subscribe failed");
                        }
                    }
                    info!("mqtt bridge session established");
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.dispatch(&publish).await;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "mqtt bridge event loop error, reconnecting");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Authenticate a publish by its user properties. Validated tokens are
    /// cached per connection id; a changed token is re-validated.
    async fn authenticate(&self, publish: &Publish) -> Option<(String, String)> {
        let mut client_id = String::new();
        let mut connection_id = String::new();
        let mut token = String::new();
        if let Some(props) = &publish.properties {
            for (k, v) in &props.user_properties {
                match k.as_str() {
                    "clientId" => client_id = v.clone(),
                    "connectionId" => connection_id = v.clone(),
                    "token" => token = v.clone(),
                    _ => {}
                }
            }
        }
        if connection_id.is_empty() || token.is_empty() {
            debug!("publish without identity properties dropped");
            return None;
        }
        if let Some((cached_token, cached_client)) = self.sessions.lock().get(&connection_id) {
            if *cached_token == token {
                return Some((cached_client.clone(), connection_id));
            }
        }
        match self.auth.validate(&token).await {
            Ok(validated) if validated == client_id => {
                self.sessions
                    .lock()
                    .insert(connection_id.clone(), (token, client_id.clone()));
                Some((client_id, connection_id))
            }
            _ => {
                debug!(client_id = %client_id, "publish with invalid token dropped");
                None
            }
        }
    }

    /// Get or create the server connection for a remote connection id.
    async fn connection_for(
        &self,
        client_id: &str,
        connection_id: &str,
    ) -> Arc<dyn ServerConnection> {
        if let Some(conn) = self.connections.get_by_connection_id(connection_id) {
            return conn;
        }
        let conn: Arc<dyn ServerConnection> = Arc::new(MqttServerConnection {
            state: ServerConnectionState::new(ConnectionInfo {
                client_id: client_id.to_string(),
                connection_id: connection_id.to_string(),
                remote_addr: String::new(),
                protocol_type: ProtocolType::Mqtt,
            }),
            client: self.client.clone(),
        });
        self.connections.add_connection(conn.clone()).await;
        info!(client_id = %client_id, connection_id = %connection_id, "mqtt connection materialized");
        conn
    }

    async fn dispatch(&self, publish: &Publish) {
        let topic = String::from_utf8_lossy(&publish.topic).to_string();
        let Some((client_id, connection_id)) = self.authenticate(publish).await else {
            return;
        };
        if topic.starts_with(paths::MQTT_REQUEST_PREFIX) {
            let req: RequestMessage = match serde_json::from_slice(&publish.payload) {
                Ok(r) => r,
                Err(e) => {
                    warn!(topic = %topic, error = %e, "malformed request publish");
                    return;
                }
            };
            let conn = self.connection_for(&client_id, &connection_id).await;
            let resp = demux_request(&self.auth, &self.router, conn.state(), req).await;
            if let Err(e) = conn.send_response(&resp).await {
                warn!(connection_id = %connection_id, error = %e, "failed to publish response");
            }
        } else if topic == paths::MQTT_RESPONSE_TOPIC {
            match serde_json::from_slice::<ResponseMessage>(&publish.payload) {
                Ok(resp) => self.router.handle_response(&client_id, resp).await,
                Err(e) => warn!(topic = %topic, error = %e, "malformed response publish"),
            }
        } else if topic.starts_with(paths::MQTT_NOTIFICATION_PREFIX) {
            match serde_json::from_slice::<NotificationMessage>(&publish.payload) {
                Ok(notif) => {
                    // make sure the agent has a connection for reverse requests
                    self.connection_for(&client_id, &connection_id).await;
                    self.router.handle_notification(&client_id, notif).await;
                }
                Err(e) => warn!(topic = %topic, error = %e, "malformed notification publish"),
            }
        } else {
            debug!(topic = %topic, "publish on unexpected topic ignored");
        }
    }
}

/// One remote client connection seen through the broker.
struct MqttServerConnection {
    state: ServerConnectionState,
    client: AsyncClient,
}

impl MqttServerConnection {
    async fn publish_inbox<T: serde::Serialize>(
        &self,
        kind_suffix: &str,
        envelope: &T,
    ) -> TransportResult<()> {
        let topic = format!(
            "{}/{}",
            protocol::mqtt_inbox_topic(&self.state.info.connection_id),
            kind_suffix
        );
        let payload = serde_json::to_vec(envelope)?;
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::internal(format!("bridge publish: {e}")))
    }
}

#[async_trait::async_trait]
impl ServerConnection for MqttServerConnection {
    fn connection_info(&self) -> ConnectionInfo {
        self.state.info.clone()
    }

    fn state(&self) -> &ServerConnectionState {
        &self.state
    }

    async fn send_notification(&self, notif: &NotificationMessage) {
        if self.state.is_closed() || !self.state.should_deliver(notif) {
            return;
        }
        if let Err(e) = self.publish_inbox("notification", notif).await {
            warn!(connection_id = %self.state.info.connection_id, error = %e, "notification dropped");
        }
    }

    async fn send_request(&self, req: &RequestMessage) -> TransportResult<()> {
        if self.state.reject_write_when_closed("request") {
            return Err(TransportError::ConnectionLost);
        }
        self.publish_inbox("request", req).await
    }

    async fn send_response(&self, resp: &ResponseMessage) -> TransportResult<()> {
        if self.state.reject_write_when_closed("response") {
            return Err(TransportError::ConnectionLost);
        }
        self.publish_inbox("response", resp).await
    }

    async fn disconnect(&self) {
        // the broker owns the socket; closing here only stops deliveries
        self.state.mark_closed();
    }
}
