//! High-level hub connection: one facade over the protocol adapters.

use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;
use wothub_messaging::{
    NotificationMessage, Operation, RequestMessage, ResponseMessage, TransportError,
    TransportResult,
};

use super::base::BaseClient;
use super::connect::http_login;
use super::http_sse::HttpSseClient;
use super::mqtt::MqttClient;
use super::wss::WssClient;
use super::{
    ConnectHandler, NotificationHandler, ProtocolClient, RequestHandler, ResponseHandler,
};
use crate::protocol::ProtocolType;

/// A client connection to the hub over whichever protocol the connect URL
/// selects.
///
/// Consumers use the request wrappers and subscription calls; agents register
/// a request handler and publish notifications. All correlation and waiting
/// is handled by the shared [`BaseClient`].
pub struct HubClient {
    base: Arc<BaseClient>,
    adapter: Arc<dyn ProtocolClient>,
    ca_pem: Option<String>,
    auth_url: RwLock<Option<String>>,
}

impl HubClient {
    /// Create a client for `server_url`, selecting the protocol adapter from
    /// the URL scheme and path. `ca_pem` is the server CA in PEM form; when
    /// absent TLS verification is disabled with a warning.
    pub fn new(
        client_id: &str,
        server_url: &str,
        ca_pem: Option<String>,
        timeout: Duration,
    ) -> TransportResult<Self> {
        let protocol = ProtocolType::from_url(server_url)?;
        let base = Arc::new(BaseClient::new(client_id, server_url, protocol, timeout));
        let adapter: Arc<dyn ProtocolClient> = match protocol {
            ProtocolType::HttpSse => Arc::new(HttpSseClient::new(base.clone(), ca_pem.clone())?),
            ProtocolType::Wss => Arc::new(WssClient::new(base.clone(), ca_pem.clone())),
            ProtocolType::Mqtt => Arc::new(MqttClient::new(base.clone(), ca_pem.clone())),
        };
        let auth_url = derive_auth_url(server_url);
        info!(
            client_id = %client_id,
            server_url = %server_url,
            protocol = %protocol,
            "created hub client"
        );
        Ok(Self { base, adapter, ca_pem, auth_url: RwLock::new(auth_url) })
    }

    /// The account id of this client.
    pub fn client_id(&self) -> &str {
        self.base.client_id()
    }

    /// The unique id of this connection.
    pub fn connection_id(&self) -> &str {
        self.base.connection_id()
    }

    /// Wire protocol of this connection.
    pub fn protocol_type(&self) -> ProtocolType {
        self.base.protocol_type()
    }

    /// Whether the return channel is live.
    pub fn is_connected(&self) -> bool {
        self.base.is_connected()
    }

    /// The current bearer token.
    pub fn token(&self) -> String {
        self.base.bearer_token()
    }

    /// Override the HTTP authentication endpoint. Needed for MQTT connect
    /// URLs, which carry no usable login endpoint of their own.
    pub fn set_auth_url(&self, url: &str) {
        *self.auth_url.write() = Some(url.to_string());
    }

    /// Authenticate with a password over HTTP, then connect with the issued
    /// token. Returns the token in use after connecting.
    pub async fn connect_with_password(&self, password: &str) -> TransportResult<String> {
        let auth_url = self.auth_url.read().clone().ok_or_else(|| {
            TransportError::internal("no authentication URL for this connect URL; call set_auth_url")
        })?;
        let token =
            http_login(&auth_url, self.base.client_id(), password, self.ca_pem.as_deref()).await?;
        self.connect_with_token(&token).await
    }

    /// Connect using an existing bearer token. The connect performs a token
    /// refresh round-trip, so the returned token replaces the one passed in.
    pub async fn connect_with_token(&self, token: &str) -> TransportResult<String> {
        self.base.set_bearer_token(token);
        self.base.set_connecting();
        self.adapter.connect(token).await?;
        // the refresh both proves the token and rotates it
        match self.refresh_token().await {
            Ok(fresh) => Ok(fresh),
            Err(e) => {
                warn!(
                    client_id = %self.base.client_id(),
                    error = %e,
                    "token refresh after connect failed"
                );
                self.adapter.disconnect().await;
                if matches!(e, TransportError::Unauthorized { .. }) {
                    self.base.set_unauthorized(e.clone());
                } else {
                    self.base.set_connected(false, Some(e.clone()));
                }
                Err(e)
            }
        }
    }

    /// Tear the connection down. Idempotent; any blocked request waiters are
    /// released with a connection-lost error.
    pub async fn disconnect(&self) {
        self.adapter.disconnect().await;
        self.base.set_connected(false, None);
    }

    /// Invalidate the session server-side, then disconnect.
    pub async fn logout(&self) {
        let req = RequestMessage::new(Operation::Logout, "", "", None, "");
        if let Err(e) = self.base.send_request(self.adapter.as_ref(), req, false).await {
            warn!(client_id = %self.base.client_id(), error = %e, "logout request failed");
        }
        self.disconnect().await;
    }

    /// Send a request envelope. With `wait_for_completion` the call blocks
    /// until a terminal response, a timeout, or connection loss.
    pub async fn send_request(
        &self,
        req: RequestMessage,
        wait_for_completion: bool,
    ) -> TransportResult<ResponseMessage> {
        self.base.send_request(self.adapter.as_ref(), req, wait_for_completion).await
    }

    /// Request-response convenience: send, await completion, unwrap output.
    pub async fn rpc(
        &self,
        operation: Operation,
        thing_id: &str,
        name: &str,
        input: Option<Value>,
    ) -> TransportResult<Option<Value>> {
        let req = RequestMessage::new(operation, thing_id, name, input, "");
        let resp = self.send_request(req, true).await?;
        resp.into_result()
    }

    /// Invoke an action and await its result.
    pub async fn invoke_action(
        &self,
        thing_id: &str,
        name: &str,
        input: Option<Value>,
    ) -> TransportResult<Option<Value>> {
        self.rpc(Operation::InvokeAction, thing_id, name, input).await
    }

    /// Read a property value.
    pub async fn read_property(&self, thing_id: &str, name: &str) -> TransportResult<Option<Value>> {
        self.rpc(Operation::ReadProperty, thing_id, name, None).await
    }

    /// Write a property value and await the acknowledgement.
    pub async fn write_property(
        &self,
        thing_id: &str,
        name: &str,
        value: Value,
    ) -> TransportResult<()> {
        self.rpc(Operation::WriteProperty, thing_id, name, Some(value)).await.map(|_| ())
    }

    /// Round-trip liveness probe.
    pub async fn ping(&self) -> TransportResult<()> {
        self.rpc(Operation::Ping, "", "", None).await.map(|_| ())
    }

    /// Exchange the current token for a fresh one and store it.
    pub async fn refresh_token(&self) -> TransportResult<String> {
        let old = self.base.bearer_token();
        let output = self
            .rpc(Operation::RefreshToken, "", "", Some(Value::String(old)))
            .await?;
        let token = output
            .as_ref()
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| TransportError::protocol_mismatch("token refresh returned no token"))?;
        self.base.set_bearer_token(&token);
        Ok(token)
    }

    /// Subscribe to an event, or to all events of the thing when `name` is
    /// empty. An empty `thing_id` subscribes to events of all things.
    pub async fn subscribe(&self, thing_id: &str, name: &str) -> TransportResult<()> {
        let op = if name.is_empty() {
            Operation::SubscribeAllEvents
        } else {
            Operation::SubscribeEvent
        };
        self.rpc(op, thing_id, name, None).await.map(|_| ())
    }

    /// Remove an event subscription; removing an unknown one succeeds.
    pub async fn unsubscribe(&self, thing_id: &str, name: &str) -> TransportResult<()> {
        let op = if name.is_empty() {
            Operation::UnsubscribeAllEvents
        } else {
            Operation::UnsubscribeEvent
        };
        self.rpc(op, thing_id, name, None).await.map(|_| ())
    }

    /// Observe a property, or all properties of the thing when `name` is
    /// empty.
    pub async fn observe_property(&self, thing_id: &str, name: &str) -> TransportResult<()> {
        let op = if name.is_empty() {
            Operation::ObserveAllProperties
        } else {
            Operation::ObserveProperty
        };
        self.rpc(op, thing_id, name, None).await.map(|_| ())
    }

    /// Stop observing a property or all properties of the thing.
    pub async fn unobserve_property(&self, thing_id: &str, name: &str) -> TransportResult<()> {
        let op = if name.is_empty() {
            Operation::UnobserveAllProperties
        } else {
            Operation::UnobserveProperty
        };
        self.rpc(op, thing_id, name, None).await.map(|_| ())
    }

    /// Agent: publish an event to subscribers.
    pub async fn publish_event(
        &self,
        thing_id: &str,
        name: &str,
        data: Option<Value>,
    ) -> TransportResult<()> {
        let notif = NotificationMessage::new(Operation::PublishEvent, thing_id, name, data);
        self.adapter.publish_notification(&notif).await
    }

    /// Agent: publish a property value update to observers.
    pub async fn update_property(
        &self,
        thing_id: &str,
        name: &str,
        value: Value,
    ) -> TransportResult<()> {
        let notif =
            NotificationMessage::new(Operation::UpdateProperty, thing_id, name, Some(value));
        self.adapter.publish_notification(&notif).await
    }

    /// Agent: send a response to an earlier server-initiated request.
    pub async fn send_response(&self, resp: &ResponseMessage) -> TransportResult<()> {
        self.adapter.publish_response(resp).await
    }

    /// Register the connection status callback.
    pub fn set_connect_handler(&self, cb: Option<ConnectHandler>) {
        self.base.set_connect_handler(cb);
    }

    /// Register the notification callback.
    pub fn set_notification_handler(&self, cb: Option<NotificationHandler>) {
        self.base.set_notification_handler(cb);
    }

    /// Register the asynchronous response callback.
    pub fn set_response_handler(&self, cb: Option<ResponseHandler>) {
        self.base.set_response_handler(cb);
    }

    /// Agent: register the callback answering server-initiated requests.
    pub fn set_request_handler(&self, cb: Option<RequestHandler>) {
        self.base.set_request_handler(cb);
    }

    /// Register the form lookup used to address operations with a TD form.
    pub fn set_get_form(&self, cb: Option<wothub_messaging::GetFormHandler>) {
        self.base.set_get_form(cb);
    }
}

/// Derive the HTTP base URL used for password login from the connect URL.
/// MQTT URLs have no HTTP counterpart; login needs `set_auth_url` there.
fn derive_auth_url(server_url: &str) -> Option<String> {
    let mut parsed = Url::parse(server_url).ok()?;
    let scheme = match parsed.scheme() {
        "https" | "wss" => "https",
        "http" | "ws" => "http",
        _ => return None,
    };
    // scheme swap keeps host and port
    let _ = parsed.set_scheme(scheme);
    parsed.set_path("");
    Some(parsed.to_string().trim_end_matches('/').to_string())
}
