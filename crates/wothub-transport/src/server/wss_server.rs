//! WebSocket transport server.
//!
//! One accept loop, one reader task per connection. Authentication happens
//! during the upgrade via the Authorization header; unauthenticated sockets
//! are closed before any frame is processed. Writes on a connection are
//! serialized through a mutex on the sink half.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as HsRequest, Response as HsResponse,
};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;
use wothub_messaging::{
    NotificationMessage, Operation, RequestMessage, ResponseMessage, TransportError,
    TransportResult,
};

use super::authenticator::Authenticator;
use super::connection::{ConnectionInfo, ServerConnection, ServerConnectionState};
use super::connection_manager::ConnectionManager;
use super::demux_request;
use crate::protocol::{paths, ProtocolType};
use crate::routing::RequestRouter;
use crate::wss_message::{self, WssInbound};

/// Settings of the WebSocket transport server.
#[derive(Debug, Clone)]
pub struct WssServerConfig {
    /// Bind address; port 0 picks a free port
    pub listen_addr: String,
    /// Interval of protocol-level keep-alive pings
    pub ping_interval: Duration,
}

impl Default for WssServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8445".to_string(),
            ping_interval: Duration::from_secs(30),
        }
    }
}

/// The WebSocket transport server.
pub struct WssTransportServer {
    config: WssServerConfig,
    auth: Arc<dyn Authenticator>,
    router: Arc<dyn RequestRouter>,
    connections: Arc<ConnectionManager>,
}

/// Running server: bound address and shutdown control.
pub struct WssServerHandle {
    /// The address the server actually bound to.
    pub local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl WssServerHandle {
    /// Stop accepting new connections.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

impl WssTransportServer {
    /// Create the server over the shared authenticator, router and
    /// connection registry.
    pub fn new(
        config: WssServerConfig,
        auth: Arc<dyn Authenticator>,
        router: Arc<dyn RequestRouter>,
        connections: Arc<ConnectionManager>,
    ) -> Self {
        Self { config, auth, router, connections }
    }

    /// Bind and accept until the handle is stopped.
    pub async fn start(&self) -> TransportResult<WssServerHandle> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "websocket transport server listening");

        let auth = self.auth.clone();
        let router = self.router.clone();
        let connections = self.connections.clone();
        let ping_interval = self.config.ping_interval;
        let (shutdown, mut rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    accepted = listener.accept() => {
                        let (socket, peer) = match accepted {
                            Ok(a) => a,
                            Err(e) => {
                                warn!(error = %e, "accept failed");
                                continue;
                            }
                        };
                        tokio::spawn(serve_socket(
                            socket,
                            peer,
                            auth.clone(),
                            router.clone(),
                            connections.clone(),
                            ping_interval,
                        ));
                    }
                }
            }
        });
        Ok(WssServerHandle { local_addr, shutdown, task })
    }
}

/// Upgrade, authenticate and run one client connection to completion.
async fn serve_socket(
    socket: TcpStream,
    peer: SocketAddr,
    auth: Arc<dyn Authenticator>,
    router: Arc<dyn RequestRouter>,
    connections: Arc<ConnectionManager>,
    ping_interval: Duration,
) {
    // capture auth headers during the upgrade handshake
    let captured: Arc<Mutex<Option<(String, String)>>> = Arc::new(Mutex::new(None));
    let cb = {
        let captured = captured.clone();
        move |req: &HsRequest, resp: HsResponse| -> Result<HsResponse, ErrorResponse> {
            let token = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .unwrap_or_default()
                .to_string();
            let connection_id = req
                .headers()
                .get(paths::CONNECTION_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            *captured.lock() = Some((token, connection_id));
            Ok(resp)
        }
    };
    let ws = match accept_hdr_async(socket, cb).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(peer = %peer, error = %e, "websocket upgrade failed");
            return;
        }
    };
    let (token, mut connection_id) = captured.lock().take().unwrap_or_default();
    let (mut sink, mut stream) = ws.split();

    let client_id = match auth.validate(&token).await {
        Ok(cid) => cid,
        Err(e) => {
            debug!(peer = %peer, error = %e, "websocket auth rejected");
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    };
    if connection_id.is_empty() {
        connection_id = format!("{}.{}", client_id, Uuid::new_v4().simple());
    }

    let conn = Arc::new(WssServerConnection {
        state: ServerConnectionState::new(ConnectionInfo {
            client_id: client_id.clone(),
            connection_id: connection_id.clone(),
            remote_addr: peer.to_string(),
            protocol_type: ProtocolType::Wss,
        }),
        writer: tokio::sync::Mutex::new(sink),
    });
    connections.add_connection(conn.clone()).await;
    info!(client_id = %client_id, connection_id = %connection_id, peer = %peer, "websocket connection opened");

    let ping_conn = conn.clone();
    let ping_task = tokio::spawn(async move {
        loop {
            tokio::time::sleep(ping_interval).await;
            if ping_conn.state.is_closed() {
                return;
            }
            let mut w = ping_conn.writer.lock().await;
            if w.send(Message::Ping(Vec::new())).await.is_err() {
                return;
            }
        }
    });

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                handle_frame(&auth, &router, &conn, &text).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(connection_id = %connection_id, error = %e, "websocket read error");
                break;
            }
        }
        if conn.state.is_closed() {
            break;
        }
    }

    ping_task.abort();
    conn.disconnect().await;
    connections.remove_connection(&connection_id);
    info!(client_id = %client_id, connection_id = %connection_id, "websocket connection closed");
}

async fn handle_frame(
    auth: &Arc<dyn Authenticator>,
    router: &Arc<dyn RequestRouter>,
    conn: &Arc<WssServerConnection>,
    text: &str,
) {
    match wss_message::decode(text) {
        Ok(WssInbound::Request(req)) => {
            let resp = demux_request(auth, router, &conn.state, req).await;
            if let Err(e) = conn.send_response(&resp).await {
                warn!(connection_id = %conn.state.info.connection_id, error = %e, "failed to write response");
            }
        }
        Ok(WssInbound::Response(resp)) => {
            conn.state.touch();
            router.handle_response(&conn.state.info.client_id, resp).await;
        }
        Ok(WssInbound::Notification(notif)) => {
            conn.state.touch();
            match notif.operation {
                Operation::Ping => {
                    let pong = NotificationMessage::new(Operation::Pong, "", "", None);
                    let _ = conn.send_frame_notification(&pong).await;
                }
                Operation::Pong => {}
                _ => router.handle_notification(&conn.state.info.client_id, notif).await,
            }
        }
        Err(e) => {
            warn!(connection_id = %conn.state.info.connection_id, error = %e, "undecodable frame");
        }
    }
}

/// One server-side WebSocket connection.
struct WssServerConnection {
    state: ServerConnectionState,
    writer: tokio::sync::Mutex<WsSink>,
}

impl WssServerConnection {
    async fn send_text(&self, frame: String) -> TransportResult<()> {
        let mut w = self.writer.lock().await;
        w.send(Message::Text(frame))
            .await
            .map_err(|e| TransportError::internal(format!("websocket send: {e}")))
    }

    async fn send_frame_notification(&self, notif: &NotificationMessage) -> TransportResult<()> {
        self.send_text(wss_message::encode_notification(notif)?).await
    }
}

#[async_trait::async_trait]
impl ServerConnection for WssServerConnection {
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
        if let Err(e) = self.send_frame_notification(notif).await {
            warn!(connection_id = %self.state.info.connection_id, error = %e, "notification dropped");
        }
    }

    async fn send_request(&self, req: &RequestMessage) -> TransportResult<()> {
        if self.state.reject_write_when_closed("request") {
            return Err(TransportError::ConnectionLost);
        }
        self.send_text(wss_message::encode_request(req)?).await
    }

    async fn send_response(&self, resp: &ResponseMessage) -> TransportResult<()> {
        if self.state.reject_write_when_closed("response") {
            return Err(TransportError::ConnectionLost);
        }
        self.send_text(wss_message::encode_response(resp)?).await
    }

    async fn disconnect(&self) {
        if self.state.mark_closed() {
            let mut w = self.writer.lock().await;
            let _ = w.send(Message::Close(None)).await;
        }
    }
}
