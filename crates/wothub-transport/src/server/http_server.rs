//! HTTP transport server: envelope endpoints plus the SSE return channel.
//!
//! All envelope endpoints answer 200 with a response envelope; transport
//! failures map to HTTP status codes (401 for auth, 404 for unknown paths).
//! The SSE stream carries `event:` = envelope kind and `data:` = JSON, with
//! periodic pings that double as the client's connected signal.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::Stream;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wothub_messaging::{
    kind, NotificationMessage, Operation, RequestMessage, ResponseMessage, TransportError,
    TransportResult,
};

use super::authenticator::Authenticator;
use super::connection::{ConnectionInfo, ServerConnection, ServerConnectionState};
use super::connection_manager::ConnectionManager;
use crate::protocol::{paths, ProtocolType};
use crate::routing::RequestRouter;

/// Settings of the HTTP transport server.
#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    /// Bind address; port 0 picks a free port
    pub listen_addr: String,
    /// Interval of SSE keep-alive pings
    pub ping_interval: Duration,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8444".to_string(),
            ping_interval: Duration::from_secs(30),
        }
    }
}

/// The HTTP+SSE transport server.
pub struct HttpTransportServer {
    config: HttpServerConfig,
    state: AppState,
}

#[derive(Clone)]
struct AppState {
    auth: Arc<dyn Authenticator>,
    router: Arc<dyn RequestRouter>,
    connections: Arc<ConnectionManager>,
    ping_interval: Duration,
}

/// Running server: bound address and shutdown control.
pub struct HttpServerHandle {
    /// The address the server actually bound to.
    pub local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl HttpServerHandle {
    /// Stop accepting and finish in-flight requests.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

impl HttpTransportServer {
    /// Create the server over the shared authenticator, router and
    /// connection registry.
    pub fn new(
        config: HttpServerConfig,
        auth: Arc<dyn Authenticator>,
        router: Arc<dyn RequestRouter>,
        connections: Arc<ConnectionManager>,
    ) -> Self {
        let ping_interval = config.ping_interval;
        Self {
            config,
            state: AppState { auth, router, connections, ping_interval },
        }
    }

    /// Bind and serve until the handle is stopped.
    pub async fn start(&self) -> TransportResult<HttpServerHandle> {
        let app = Router::new()
            .route(paths::LOGIN, post(login))
            .route(paths::LOGOUT, post(logout))
            .route(paths::REFRESH, post(refresh))
            .route(paths::REQUEST, post(post_request))
            .route(paths::RESPONSE, post(post_response))
            .route(paths::NOTIFICATION, post(post_notification))
            .route(paths::SSE, get(sse_stream))
            .route(paths::WOT_SSE, get(sse_stream))
            .route("/wothub/:operation/:thing_id/:name", post(post_fallback))
            .with_state(self.state.clone());

        let listener = tokio::net::TcpListener::bind(&self.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "http transport server listening");

        let (shutdown, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = rx.await;
            });
            if let Err(e) = serve.await {
                warn!(error = %e, "http transport server stopped with error");
            }
        });
        Ok(HttpServerHandle { local_addr, shutdown, task })
    }
}

#[derive(Deserialize)]
struct LoginBody {
    login: String,
    password: String,
}

async fn login(State(st): State<AppState>, Json(body): Json<LoginBody>) -> Response {
    match st.auth.login(&body.login, &body.password).await {
        Ok(token) => Json(json!({ "token": token })).into_response(),
        Err(e) => {
            debug!(client_id = %body.login, error = %e, "login rejected");
            StatusCode::UNAUTHORIZED.into_response()
        }
    }
}

async fn logout(State(st): State<AppState>, headers: HeaderMap) -> Response {
    match authenticate(&st, &headers).await {
        Ok((client_id, _)) => {
            st.auth.logout(&client_id).await;
            StatusCode::OK.into_response()
        }
        Err(resp) => resp,
    }
}

async fn refresh(State(st): State<AppState>, headers: HeaderMap) -> Response {
    let Some(old_token) = bearer_token(&headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    let client_id = match st.auth.validate(&old_token).await {
        Ok(cid) => cid,
        Err(_) => return StatusCode::UNAUTHORIZED.into_response(),
    };
    match st.auth.refresh(&client_id, &old_token).await {
        Ok(token) => Json(json!({ "token": token })).into_response(),
        Err(_) => StatusCode::UNAUTHORIZED.into_response(),
    }
}

async fn post_request(
    State(st): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RequestMessage>,
) -> Response {
    let (client_id, connection_id) = match authenticate(&st, &headers).await {
        Ok(ids) => ids,
        Err(resp) => return resp,
    };
    let resp = handle_request_envelope(&st, &client_id, &connection_id, req).await;
    Json(resp).into_response()
}

async fn post_fallback(
    State(st): State<AppState>,
    Path((operation, thing_id, name)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: Option<Json<serde_json::Value>>,
) -> Response {
    let (client_id, connection_id) = match authenticate(&st, &headers).await {
        Ok(ids) => ids,
        Err(resp) => return resp,
    };
    let operation: Operation = match operation.parse() {
        Ok(op) => op,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };
    // "+" substitutes for empty URI variables
    let thing_id = if thing_id == "+" { String::new() } else { thing_id };
    let name = if name == "+" { String::new() } else { name };
    let correlation_id = headers
        .get(paths::CORRELATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let req = RequestMessage::new(operation, thing_id, name, body.map(|Json(v)| v), correlation_id);
    let resp = handle_request_envelope(&st, &client_id, &connection_id, req).await;
    Json(resp).into_response()
}

async fn post_response(
    State(st): State<AppState>,
    headers: HeaderMap,
    Json(resp): Json<ResponseMessage>,
) -> Response {
    let (client_id, _) = match authenticate(&st, &headers).await {
        Ok(ids) => ids,
        Err(r) => return r,
    };
    st.router.handle_response(&client_id, resp).await;
    StatusCode::OK.into_response()
}

async fn post_notification(
    State(st): State<AppState>,
    headers: HeaderMap,
    Json(notif): Json<NotificationMessage>,
) -> Response {
    let (client_id, _) = match authenticate(&st, &headers).await {
        Ok(ids) => ids,
        Err(r) => return r,
    };
    st.router.handle_notification(&client_id, notif).await;
    StatusCode::OK.into_response()
}

/// Demultiplex a request envelope: liveness and auth operations answered in
/// place, subscription operations applied to the connection, everything else
/// routed.
async fn handle_request_envelope(
    st: &AppState,
    client_id: &str,
    connection_id: &str,
    req: RequestMessage,
) -> ResponseMessage {
    match req.operation {
        Operation::Ping => req.create_response(Some(json!("pong")), None),
        Operation::RefreshToken => {
            let old = req.input.as_ref().and_then(|v| v.as_str()).unwrap_or_default();
            match st.auth.refresh(client_id, old).await {
                Ok(token) => req.create_response(Some(json!(token)), None),
                Err(e) => req.create_response(None, Some(e)),
            }
        }
        Operation::Logout => {
            st.auth.logout(client_id).await;
            req.create_response(None, None)
        }
        op if op.is_subscription_op() || op.is_observation_op() => {
            match st.connections.get_by_connection_id(connection_id) {
                Some(conn) => conn
                    .state()
                    .apply_subscription_op(&req)
                    .unwrap_or_else(|| req.create_response(None, None)),
                None => req.create_response(
                    None,
                    Some(TransportError::not_found(
                        "no return channel for this connection; open the event stream first",
                    )),
                ),
            }
        }
        _ => st.router.handle_request(client_id, connection_id, req).await,
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// Resolve the caller's client id and connection id from the headers.
async fn authenticate(st: &AppState, headers: &HeaderMap) -> Result<(String, String), Response> {
    let Some(token) = bearer_token(headers) else {
        return Err(StatusCode::UNAUTHORIZED.into_response());
    };
    let client_id = st
        .auth
        .validate(&token)
        .await
        .map_err(|_| StatusCode::UNAUTHORIZED.into_response())?;
    let connection_id = headers
        .get(paths::CONNECTION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| client_id.clone());
    Ok((client_id, connection_id))
}

type SseItem = Result<Event, Infallible>;

/// Server-side connection for an SSE stream: frames are queued on a channel
/// the response stream drains.
struct HttpSseConnection {
    state: ServerConnectionState,
    tx: mpsc::Sender<SseItem>,
}

impl HttpSseConnection {
    fn queue_json<T: serde::Serialize>(&self, event_kind: &str, envelope: &T) -> TransportResult<()> {
        let data = serde_json::to_string(envelope)?;
        let event = Event::default().event(event_kind).data(data);
        self.tx
            .try_send(Ok(event))
            .map_err(|_| TransportError::internal("sse send queue full or closed"))
    }
}

#[async_trait::async_trait]
impl ServerConnection for HttpSseConnection {
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
        if let Err(e) = self.queue_json(kind::NOTIFICATION, notif) {
            warn!(connection_id = %self.state.info.connection_id, error = %e, "notification dropped");
        }
    }

    async fn send_request(&self, req: &RequestMessage) -> TransportResult<()> {
        if self.state.reject_write_when_closed("request") {
            return Err(TransportError::ConnectionLost);
        }
        self.queue_json(kind::REQUEST, req)
    }

    async fn send_response(&self, resp: &ResponseMessage) -> TransportResult<()> {
        if self.state.reject_write_when_closed("response") {
            return Err(TransportError::ConnectionLost);
        }
        self.queue_json(kind::RESPONSE, resp)
    }

    async fn disconnect(&self) {
        if self.state.mark_closed() {
            debug!(connection_id = %self.state.info.connection_id, "sse connection closed");
        }
    }
}

/// Deregisters the connection when the response stream is dropped.
struct ConnectionGuard {
    connections: Arc<ConnectionManager>,
    connection_id: String,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.connections.remove_connection(&self.connection_id);
    }
}

struct GuardedStream {
    inner: ReceiverStream<SseItem>,
    _guard: ConnectionGuard,
}

impl Stream for GuardedStream {
    type Item = SseItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

async fn sse_stream(State(st): State<AppState>, headers: HeaderMap) -> Response {
    let (client_id, mut connection_id) = match authenticate(&st, &headers).await {
        Ok(ids) => ids,
        Err(resp) => return resp,
    };
    // a connection id must be unique; synthesize one when the header is absent
    if connection_id == client_id {
        connection_id = format!("{}.{}", client_id, Uuid::new_v4().simple());
    }

    let (tx, rx) = mpsc::channel::<SseItem>(64);
    let conn = Arc::new(HttpSseConnection {
        state: ServerConnectionState::new(ConnectionInfo {
            client_id: client_id.clone(),
            connection_id: connection_id.clone(),
            remote_addr: String::new(),
            protocol_type: ProtocolType::HttpSse,
        }),
        tx: tx.clone(),
    });
    st.connections.add_connection(conn.clone()).await;
    info!(client_id = %client_id, connection_id = %connection_id, "sse stream opened");

    // the first ping tells the client the return channel is live
    let ping_interval = st.ping_interval;
    tokio::spawn(async move {
        loop {
            if conn.state.is_closed() {
                return;
            }
            let ping = Event::default().event(kind::PING).data("");
            if tx.send(Ok(ping)).await.is_err() {
                return;
            }
            tokio::time::sleep(ping_interval).await;
        }
    });

    let guard = ConnectionGuard { connections: st.connections.clone(), connection_id };
    Sse::new(GuardedStream { inner: ReceiverStream::new(rx), _guard: guard }).into_response()
}
