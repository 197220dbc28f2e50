//! Protocol-independent client connection state and dispatch.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wothub_messaging::{
    GetFormHandler, NotificationMessage, Operation, RequestMessage, ResponseMessage, RnrChannel,
    TransportError, TransportResult,
};

use super::{ConnectHandler, NotificationHandler, ProtocolClient, RequestHandler, ResponseHandler};
use crate::protocol::ProtocolType;

/// Default deadline for a request awaiting its response.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(3);

/// Lifecycle of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, never connected
    New,
    /// Transport setup in progress
    Connecting,
    /// Return channel is live
    Connected,
    /// Connection dropped; may re-enter Connecting when retry is enabled
    Disconnected,
    /// Credentials rejected; terminal until explicit re-auth
    Unauthorized,
}

#[derive(Default)]
struct Handlers {
    connect: RwLock<Option<ConnectHandler>>,
    notification: RwLock<Option<NotificationHandler>>,
    response: RwLock<Option<ResponseHandler>>,
    request: RwLock<Option<RequestHandler>>,
}

/// State and behavior shared by every protocol adapter: identity, the
/// rendezvous channel, application handlers and the send/wait logic.
///
/// Adapters hold this by `Arc` and call the `on_*` dispatch methods from
/// their receive loops.
pub struct BaseClient {
    client_id: String,
    connection_id: String,
    server_url: String,
    protocol_type: ProtocolType,
    timeout: Duration,
    connected: AtomicBool,
    state: RwLock<ConnectionState>,
    last_error: RwLock<Option<TransportError>>,
    bearer_token: RwLock<String>,
    get_form: RwLock<Option<GetFormHandler>>,
    handlers: Handlers,
    rnr: RnrChannel,
}

impl BaseClient {
    /// Create the shared state for a new client connection.
    pub fn new(
        client_id: impl Into<String>,
        server_url: impl Into<String>,
        protocol_type: ProtocolType,
        timeout: Duration,
    ) -> Self {
        let client_id = client_id.into();
        let connection_id = format!("{}.{}", client_id, Uuid::new_v4().simple());
        Self {
            client_id,
            connection_id,
            server_url: server_url.into(),
            protocol_type,
            timeout: if timeout.is_zero() { DEFAULT_RPC_TIMEOUT } else { timeout },
            connected: AtomicBool::new(false),
            state: RwLock::new(ConnectionState::New),
            last_error: RwLock::new(None),
            bearer_token: RwLock::new(String::new()),
            get_form: RwLock::new(None),
            handlers: Handlers::default(),
            rnr: RnrChannel::new(),
        }
    }

    /// The account id this client authenticates as.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The `<clientID>.<nonce>` id transmitted with every message so the
    /// server can tell this connection apart from the client's others.
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// The connect URL of the server.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Wire protocol of this connection.
    pub fn protocol_type(&self) -> ProtocolType {
        self.protocol_type
    }

    /// Configured request deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether the return channel is live.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Last transport error observed, if any.
    pub fn last_error(&self) -> Option<TransportError> {
        self.last_error.read().clone()
    }

    /// The bearer token adapters attach to outbound messages.
    pub fn bearer_token(&self) -> String {
        self.bearer_token.read().clone()
    }

    /// Store a fresh bearer token.
    pub fn set_bearer_token(&self, token: &str) {
        *self.bearer_token.write() = token.to_string();
    }

    /// Mark the connection as being set up.
    pub fn set_connecting(&self) {
        *self.state.write() = ConnectionState::Connecting;
    }

    /// Mark the credentials as rejected; the connection stays down until an
    /// explicit re-auth.
    pub fn set_unauthorized(&self, err: TransportError) {
        self.connected.store(false, Ordering::SeqCst);
        *self.state.write() = ConnectionState::Unauthorized;
        *self.last_error.write() = Some(err.clone());
        self.notify_connect(false, Some(err));
    }

    /// Flip the connected flag and fire the connect handler on changes.
    /// Dropping the connection releases every blocked waiter.
    pub fn set_connected(&self, connected: bool, err: Option<TransportError>) {
        let was = self.connected.swap(connected, Ordering::SeqCst);
        {
            let mut state = self.state.write();
            // unauthorized is sticky until an explicit re-auth resets it
            if *state != ConnectionState::Unauthorized || connected {
                *state = if connected {
                    ConnectionState::Connected
                } else {
                    ConnectionState::Disconnected
                };
            }
        }
        if let Some(e) = &err {
            *self.last_error.write() = Some(e.clone());
        }
        if !connected {
            self.rnr.close_all();
        }
        if was != connected {
            info!(
                client_id = %self.client_id,
                connection_id = %self.connection_id,
                connected = connected,
                "connection status changed"
            );
            self.notify_connect(connected, err);
        }
    }

    fn notify_connect(&self, connected: bool, err: Option<TransportError>) {
        let handler = self.handlers.connect.read().clone();
        if let Some(h) = handler {
            h(connected, err);
        }
    }

    /// Register the connection status callback.
    pub fn set_connect_handler(&self, cb: Option<ConnectHandler>) {
        *self.handlers.connect.write() = cb;
    }

    /// Register the notification callback.
    pub fn set_notification_handler(&self, cb: Option<NotificationHandler>) {
        *self.handlers.notification.write() = cb;
    }

    /// Register the asynchronous response callback.
    pub fn set_response_handler(&self, cb: Option<ResponseHandler>) {
        *self.handlers.response.write() = cb;
    }

    /// Register the request callback used by agents to answer
    /// server-initiated requests.
    pub fn set_request_handler(&self, cb: Option<RequestHandler>) {
        *self.handlers.request.write() = cb;
    }

    /// Register the form lookup used to address operations with a TD form.
    pub fn set_get_form(&self, cb: Option<GetFormHandler>) {
        *self.get_form.write() = cb;
    }

    /// Look up the form for an operation, if a form handler was set.
    pub fn lookup_form(&self, op: Operation, thing_id: &str, name: &str) -> Option<wothub_messaging::Form> {
        let handler = self.get_form.read().clone();
        handler.and_then(|h| h(op, thing_id, name))
    }

    /// Dispatch an inbound notification to the application handler.
    pub fn on_notification(&self, notif: NotificationMessage) {
        let handler = self.handlers.notification.read().clone();
        match handler {
            Some(h) => h(notif),
            None => warn!(
                client_id = %self.client_id,
                operation = %notif.operation,
                thing_id = %notif.thing_id,
                name = %notif.name,
                "notification received but no handler registered"
            ),
        }
    }

    /// Dispatch an inbound response: the rendezvous channel first, then the
    /// async response handler, then re-classified as a notification.
    pub async fn on_response(&self, resp: ResponseMessage) {
        if self.rnr.handle_response(resp.clone()).await {
            return;
        }
        let handler = self.handlers.response.read().clone();
        if let Some(h) = handler {
            h(resp);
            return;
        }
        let notif_handler = self.handlers.notification.read().clone();
        if let Some(h) = notif_handler {
            let notif = NotificationMessage::new(resp.operation, resp.thing_id, resp.name, resp.output);
            h(notif);
            return;
        }
        warn!(
            client_id = %self.client_id,
            operation = %resp.operation,
            correlation_id = %resp.correlation_id,
            "response received but no handler registered"
        );
    }

    /// Dispatch a server-initiated request to the agent's request handler.
    /// Without a handler a failed response is returned.
    pub fn on_request(&self, req: RequestMessage) -> ResponseMessage {
        let handler = self.handlers.request.read().clone();
        match handler {
            Some(h) => h(req),
            None => {
                warn!(
                    client_id = %self.client_id,
                    operation = %req.operation,
                    "request received but no handler registered"
                );
                req.create_response(None, Some(TransportError::request_failed("no handler for request")))
            }
        }
    }

    /// Send a request through the adapter and optionally await its terminal
    /// response.
    ///
    /// With `wait_for_completion` false this returns immediately with a
    /// pending response. Otherwise a correlation id is generated when
    /// missing, the rendezvous slot is opened before publishing, and the
    /// call blocks until a completed or failed response, a timeout, or
    /// connection loss.
    pub async fn send_request(
        &self,
        adapter: &dyn ProtocolClient,
        mut req: RequestMessage,
        wait_for_completion: bool,
    ) -> TransportResult<ResponseMessage> {
        debug!(
            client_id = %self.client_id,
            operation = %req.operation,
            thing_id = %req.thing_id,
            name = %req.name,
            correlation_id = %req.correlation_id,
            "sending request"
        );
        if !wait_for_completion {
            adapter.publish_request(&req).await?;
            let mut pending = req.create_response(None, None);
            pending.status = wothub_messaging::Status::Pending;
            return Ok(pending);
        }

        if req.correlation_id.is_empty() {
            req.correlation_id = Uuid::new_v4().simple().to_string();
        }
        let rx = self.rnr.open(&req.correlation_id)?;

        if let Err(e) = adapter.publish_request(&req).await {
            warn!(
                client_id = %self.client_id,
                operation = %req.operation,
                correlation_id = %req.correlation_id,
                error = %e,
                "failed to publish request"
            );
            self.rnr.close(&req.correlation_id);
            return Err(e);
        }
        self.wait_for_completion(rx, req.operation, &req.correlation_id).await
    }

    /// Wait for a terminal response on the rendezvous channel.
    ///
    /// Ticks at one second granularity, checking connection liveness (except
    /// for the login and refresh operations that run during connect) against
    /// a fixed deadline. Pending and delivered statuses keep the wait going
    /// but do not extend the deadline.
    pub async fn wait_for_completion(
        &self,
        mut rx: tokio::sync::mpsc::Receiver<ResponseMessage>,
        operation: Operation,
        correlation_id: &str,
    ) -> TransportResult<ResponseMessage> {
        let tick = Duration::from_secs(1);
        let ignore_disconnect = operation.runs_during_connect();
        let deadline = tokio::time::Instant::now() + self.timeout;
        let result = loop {
            if !self.is_connected() && !ignore_disconnect {
                break Err(TransportError::ConnectionLost);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break Err(TransportError::Timeout);
            }
            let wait = tick.min(deadline - now);
            let (received, resp) = RnrChannel::wait_for_response(&mut rx, wait).await;
            if received {
                match resp {
                    // channel closed under us: the connection went away
                    None => break Err(TransportError::ConnectionLost),
                    Some(r) if r.status.is_terminal() => break Ok(r),
                    Some(_) => continue,
                }
            }
        };
        self.rnr.close(correlation_id);
        match &result {
            Err(e) => warn!(
                client_id = %self.client_id,
                operation = %operation,
                correlation_id = %correlation_id,
                error = %e,
                "request did not complete"
            ),
            Ok(r) => debug!(
                client_id = %self.client_id,
                operation = %operation,
                correlation_id = %correlation_id,
                status = %r.status,
                "request completed"
            ),
        }
        result
    }
}
