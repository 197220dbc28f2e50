//! MQTT protocol adapter over a broker, using the v5 packet format.
//!
//! Outbound envelopes go to topics derived from (operation, thingId, name);
//! inbound traffic arrives on the per-connection inbox topic
//! `INBOX/<connectionID>/{request|response|notification}`. The bearer token
//! rides as the MQTT password; correlation data and a response topic ride as
//! v5 publish properties.

use parking_lot::Mutex;
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet, PublishProperties};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, MqttOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;
use wothub_messaging::{
    NotificationMessage, RequestMessage, ResponseMessage, TransportError, TransportResult,
};

use super::base::BaseClient;
use super::ProtocolClient;
use crate::protocol::{self, paths, ProtocolType};

/// MQTT protocol adapter.
pub struct MqttClient {
    base: Arc<BaseClient>,
    ca_pem: Option<String>,
    client: Mutex<Option<AsyncClient>>,
    running: Arc<AtomicBool>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttClient {
    /// Create the adapter. `ca_pem` configures broker verification for
    /// `mqtts` URLs.
    pub fn new(base: Arc<BaseClient>, ca_pem: Option<String>) -> Self {
        Self {
            base,
            ca_pem,
            client: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            event_task: Mutex::new(None),
        }
    }

    async fn publish<T: serde::Serialize>(
        &self,
        topic: String,
        envelope: &T,
        correlation_id: &str,
    ) -> TransportResult<()> {
        let client = self
            .client
            .lock()
            .clone()
            .ok_or(TransportError::ConnectionLost)?;
        let payload = serde_json::to_vec(envelope)?;
        client
            .publish_with_properties(
                topic,
                QoS::AtLeastOnce,
                false,
                payload,
                publish_properties(&self.base, correlation_id),
            )
            .await
            .map_err(|e| TransportError::internal(format!("mqtt publish: {e}")))
    }
}

#[async_trait::async_trait]
impl ProtocolClient for MqttClient {
    fn protocol_type(&self) -> ProtocolType {
        ProtocolType::Mqtt
    }

    async fn connect(&self, token: &str) -> TransportResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let (host, port, tls) = broker_address(self.base.server_url())?;
        let mut options = MqttOptions::new(self.base.connection_id(), host, port);
        options.set_credentials(self.base.client_id(), token);
        options.set_keep_alive(Duration::from_secs(20));
        if tls {
            let ca = self
                .ca_pem
                .as_ref()
                .map(|pem| pem.as_bytes().to_vec())
                .ok_or_else(|| {
                    TransportError::internal("mqtts requires a CA certificate for the broker")
                })?;
            options.set_transport(rumqttc::Transport::tls(ca, None, None));
        }
        let (client, event_loop) = AsyncClient::new(options, 64);
        *self.client.lock() = Some(client.clone());
        let task = tokio::spawn(event_loop_task(
            self.base.clone(),
            client,
            event_loop,
            self.running.clone(),
        ));
        *self.event_task.lock() = Some(task);

        // wait for the broker to acknowledge the session
        let deadline = tokio::time::Instant::now() + self.base.timeout();
        loop {
            if self.base.is_connected() {
                return Ok(());
            }
            if self.base.state() == super::base::ConnectionState::Unauthorized {
                return Err(self
                    .base
                    .last_error()
                    .unwrap_or_else(|| TransportError::unauthorized("broker rejected the session")));
            }
            if tokio::time::Instant::now() >= deadline {
                self.disconnect().await;
                return Err(TransportError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    async fn disconnect(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        // take the client out before awaiting so the guard is not held
        let client = self.client.lock().take();
        if let Some(client) = client {
            let _ = client.disconnect().await;
        }
        if let Some(task) = self.event_task.lock().take() {
            task.abort();
        }
        self.base.set_connected(false, None);
    }

    async fn publish_request(&self, req: &RequestMessage) -> TransportResult<()> {
        let topic =
            protocol::mqtt_request_topic(req.operation.as_str(), &req.thing_id, &req.name);
        self.publish(topic, req, &req.correlation_id).await
    }

    async fn publish_response(&self, resp: &ResponseMessage) -> TransportResult<()> {
        self.publish(paths::MQTT_RESPONSE_TOPIC.to_string(), resp, &resp.correlation_id).await
    }

    async fn publish_notification(&self, notif: &NotificationMessage) -> TransportResult<()> {
        let topic =
            protocol::mqtt_notification_topic(notif.operation.as_str(), &notif.thing_id, &notif.name);
        self.publish(topic, notif, "").await
    }
}

/// Publish properties every outbound envelope carries. The broker bridge
/// authenticates publishes by the identity user properties.
fn publish_properties(base: &Arc<BaseClient>, correlation_id: &str) -> PublishProperties {
    let mut props = PublishProperties::default();
    props.content_type = Some("application/json".to_string());
    props.response_topic =
        Some(format!("{}/response", protocol::mqtt_inbox_topic(base.connection_id())));
    if !correlation_id.is_empty() {
        props.correlation_data = Some(correlation_id.as_bytes().to_vec().into());
    }
    props.user_properties = vec![
        ("clientId".to_string(), base.client_id().to_string()),
        ("connectionId".to_string(), base.connection_id().to_string()),
        ("token".to_string(), base.bearer_token()),
    ];
    props
}

/// Split the connect URL into broker host, port and TLS flag.
fn broker_address(server_url: &str) -> TransportResult<(String, u16, bool)> {
    let parsed = Url::parse(server_url)
        .map_err(|e| TransportError::internal(format!("invalid broker URL: {e}")))?;
    let tls = match parsed.scheme() {
        "mqtts" => true,
        "mqtt" => false,
        other => {
            return Err(TransportError::internal(format!(
                "scheme '{other}' is not an mqtt broker URL"
            )))
        }
    };
    let host = parsed
        .host_str()
        .ok_or_else(|| TransportError::internal("broker URL has no host"))?
        .to_string();
    let port = parsed.port().unwrap_or(if tls { 8883 } else { 1883 });
    Ok((host, port, tls))
}

/// Drive the rumqttc event loop: session setup, inbox dispatch, reconnects.
async fn event_loop_task(
    base: Arc<BaseClient>,
    client: AsyncClient,
    mut event_loop: rumqttc::v5::EventLoop,
    running: Arc<AtomicBool>,
) {
    let inbox_filter = format!("{}/#", protocol::mqtt_inbox_topic(base.connection_id()));
    while running.load(Ordering::SeqCst) {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => match ack.code {
                ConnectReturnCode::Success => {
                    if let Err(e) = client.subscribe(&inbox_filter, QoS::AtLeastOnce).await {
                        warn!(error = %e, "inbox subscribe failed");
                        continue;
                    }
                    base.set_connected(true, None);
                }
                ConnectReturnCode::NotAuthorized | ConnectReturnCode::BadUserNamePassword => {
                    base.set_unauthorized(TransportError::unauthorized(format!(
                        "broker refused session: {:?}",
                        ack.code
                    )));
                    return;
                }
                code => {
                    warn!(code = ?code, "broker refused session, retrying");
                    base.set_connected(false, Some(TransportError::ConnectionLost));
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            },
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let topic = String::from_utf8_lossy(&publish.topic).to_string();
                dispatch_inbox(&base, &client, &topic, &publish.payload).await;
            }
            Ok(Event::Incoming(Packet::Disconnect(_))) => {
                base.set_connected(false, Some(TransportError::ConnectionLost));
            }
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "mqtt event loop error, reconnecting");
                base.set_connected(false, Some(TransportError::ConnectionLost));
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Dispatch an inbox publish by its trailing topic segment.
async fn dispatch_inbox(base: &Arc<BaseClient>, client: &AsyncClient, topic: &str, payload: &[u8]) {
    let kind = topic.rsplit('/').next().unwrap_or_default();
    match kind {
        "response" => match serde_json::from_slice::<ResponseMessage>(payload) {
            Ok(resp) => base.on_response(resp).await,
            Err(e) => warn!(topic = %topic, error = %e, "malformed response on inbox"),
        },
        "notification" => match serde_json::from_slice::<NotificationMessage>(payload) {
            Ok(notif) => base.on_notification(notif),
            Err(e) => warn!(topic = %topic, error = %e, "malformed notification on inbox"),
        },
        "request" => match serde_json::from_slice::<RequestMessage>(payload) {
            Ok(req) => {
                let resp = base.on_request(req);
                match serde_json::to_vec(&resp) {
                    Ok(body) => {
                        if let Err(e) = client
                            .publish_with_properties(
                                paths::MQTT_RESPONSE_TOPIC,
                                QoS::AtLeastOnce,
                                false,
                                body,
                                publish_properties(base, &resp.correlation_id),
                            )
                            .await
                        {
                            warn!(error = %e, "failed to return response to broker");
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to serialize response"),
                }
            }
            Err(e) => warn!(topic = %topic, error = %e, "malformed request on inbox"),
        },
        other => debug!(topic = %topic, kind = %other, "ignoring unexpected inbox message"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adapter_futures_are_send() {
        fn assert_send<T: Send>(_: T) {}
        let base = Arc::new(BaseClient::new(
            "client1",
            "mqtt://127.0.0.1:1883",
            ProtocolType::Mqtt,
            Duration::from_secs(1),
        ));
        let adapter = MqttClient::new(base, None);
        assert_send(adapter.disconnect());
        assert_send(adapter.connect("token"));
    }

    #[test]
    fn broker_address_parsing() {
        assert_eq!(
            broker_address("mqtts://hub.local:8883").unwrap(),
            ("hub.local".to_string(), 8883, true)
        );
        assert_eq!(
            broker_address("mqtt://127.0.0.1").unwrap(),
            ("127.0.0.1".to_string(), 1883, false)
        );
        assert!(broker_address("https://hub.local").is_err());
    }
}
