//! WebSocket protocol adapter: one bidirectional connection per client.
//!
//! Frames are envelope JSON with a `messageType` discriminator. Writes are
//! serialized through a mutex on the sink half; a single reader task decodes
//! inbound frames and reconnects with backoff when the connection drops.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;
use wothub_messaging::{
    NotificationMessage, Operation, RequestMessage, ResponseMessage, TransportError,
    TransportResult,
};

use super::base::BaseClient;
use super::ProtocolClient;
use crate::protocol::{paths, ProtocolType};
use crate::wss_message::{self, WssInbound};

const BACKOFF_MIN: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;
type WriterSlot = Arc<tokio::sync::Mutex<Option<WsSink>>>;

/// WebSocket protocol adapter.
pub struct WssClient {
    base: Arc<BaseClient>,
    ca_pem: Option<String>,
    writer: WriterSlot,
    running: Arc<AtomicBool>,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl WssClient {
    /// Create the adapter. `ca_pem` configures server verification.
    pub fn new(base: Arc<BaseClient>, ca_pem: Option<String>) -> Self {
        Self {
            base,
            ca_pem,
            writer: Arc::new(tokio::sync::Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            reader: parking_lot::Mutex::new(None),
        }
    }

    async fn send_frame(&self, frame: String) -> TransportResult<()> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(sink) => sink
                .send(Message::Text(frame))
                .await
                .map_err(|e| TransportError::internal(format!("websocket send: {e}"))),
            None => Err(TransportError::ConnectionLost),
        }
    }
}

#[async_trait::async_trait]
impl ProtocolClient for WssClient {
    fn protocol_type(&self) -> ProtocolType {
        ProtocolType::Wss
    }

    async fn connect(&self, token: &str) -> TransportResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let url = websocket_url(self.base.server_url())?;
        let result = establish(&url, token, self.base.connection_id(), self.ca_pem.as_deref()).await;
        let (sink, stream) = match result {
            Ok(halves) => halves,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        *self.writer.lock().await = Some(sink);
        self.base.set_connected(true, None);
        let task = tokio::spawn(read_loop(
            self.base.clone(),
            self.writer.clone(),
            url,
            self.ca_pem.clone(),
            self.running.clone(),
            stream,
        ));
        *self.reader.lock() = Some(task);
        Ok(())
    }

    async fn disconnect(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.reader.lock().take() {
            task.abort();
        }
        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
        }
        self.base.set_connected(false, None);
    }

    async fn publish_request(&self, req: &RequestMessage) -> TransportResult<()> {
        self.send_frame(wss_message::encode_request(req)?).await
    }

    async fn publish_response(&self, resp: &ResponseMessage) -> TransportResult<()> {
        self.send_frame(wss_message::encode_response(resp)?).await
    }

    async fn publish_notification(&self, notif: &NotificationMessage) -> TransportResult<()> {
        self.send_frame(wss_message::encode_notification(notif)?).await
    }
}

/// Normalize the connect URL to a websocket URL with the hub endpoint path.
fn websocket_url(server_url: &str) -> TransportResult<String> {
    let mut parsed = Url::parse(server_url)
        .map_err(|e| TransportError::internal(format!("invalid server URL: {e}")))?;
    let scheme = match parsed.scheme() {
        "https" => "wss",
        "http" => "ws",
        s @ ("ws" | "wss") => s,
        other => {
            return Err(TransportError::internal(format!(
                "scheme '{other}' cannot carry a websocket"
            )))
        }
    };
    let scheme = scheme.to_string();
    let _ = parsed.set_scheme(&scheme);
    if matches!(parsed.path(), "" | "/") {
        parsed.set_path(paths::WSS);
    }
    Ok(parsed.to_string())
}

/// Open the websocket with authorization and connection-id headers.
async fn establish(
    url: &str,
    token: &str,
    connection_id: &str,
    ca_pem: Option<&str>,
) -> TransportResult<(WsSink, WsStream)> {
    let mut request = url
        .into_client_request()
        .map_err(|e| TransportError::internal(format!("building websocket request: {e}")))?;
    let auth = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|e| TransportError::internal(format!("invalid token header: {e}")))?;
    request.headers_mut().insert("authorization", auth);
    let cid = HeaderValue::from_str(connection_id)
        .map_err(|e| TransportError::internal(format!("invalid connection id header: {e}")))?;
    request.headers_mut().insert(paths::CONNECTION_ID_HEADER, cid);

    let connector = tls_connector(ca_pem)?;
    let (ws, _) = connect_async_tls_with_config(request, None, false, connector)
        .await
        .map_err(map_connect_error)?;
    Ok(ws.split())
}

fn map_connect_error(e: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error;
    match &e {
        Error::Http(resp) if resp.status() == 401 => {
            TransportError::unauthorized("websocket upgrade rejected")
        }
        _ => TransportError::internal(format!("websocket connect: {e}")),
    }
}

/// Build the TLS connector verifying against the configured CA. Without a CA
/// the public webpki roots apply, which only works for publicly issued hub
/// certificates.
fn tls_connector(ca_pem: Option<&str>) -> TransportResult<Option<Connector>> {
    let Some(pem) = ca_pem else {
        warn!("no CA certificate for websocket, falling back to public roots");
        return Ok(None);
    };
    let mut roots = rustls::RootCertStore::empty();
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .map_err(|e| TransportError::internal(format!("parsing CA certificate: {e}")))?;
    for der in certs {
        roots
            .add(&rustls::Certificate(der))
            .map_err(|e| TransportError::internal(format!("adding CA certificate: {e}")))?;
    }
    let config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Some(Connector::Rustls(Arc::new(config))))
}

/// Read frames until the connection drops, then reconnect with backoff.
async fn read_loop(
    base: Arc<BaseClient>,
    writer: WriterSlot,
    url: String,
    ca_pem: Option<String>,
    running: Arc<AtomicBool>,
    mut stream: WsStream,
) {
    let mut backoff = BACKOFF_MIN;
    'outer: loop {
        while let Some(msg) = stream.next().await {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            match msg {
                Ok(Message::Text(text)) => dispatch_frame(&base, &writer, &text).await,
                Ok(Message::Close(_)) => break,
                Ok(Message::Ping(_) | Message::Pong(_)) => {}
                Ok(_) => debug!("ignoring non-text websocket frame"),
                Err(e) => {
                    debug!(error = %e, "websocket read error");
                    break;
                }
            }
        }
        writer.lock().await.take();
        base.set_connected(false, Some(TransportError::ConnectionLost));

        // reconnect with the current token until stopped or rejected
        loop {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(BACKOFF_MAX);
            let token = base.bearer_token();
            match establish(&url, &token, base.connection_id(), ca_pem.as_deref()).await {
                Ok((sink, new_stream)) => {
                    *writer.lock().await = Some(sink);
                    stream = new_stream;
                    base.set_connected(true, None);
                    backoff = BACKOFF_MIN;
                    continue 'outer;
                }
                Err(e) if e.is_terminal() => {
                    warn!(error = %e, "websocket reconnect rejected, giving up");
                    base.set_unauthorized(e);
                    return;
                }
                Err(e) => debug!(error = %e, "websocket reconnect failed, retrying"),
            }
        }
    }
}

async fn dispatch_frame(base: &Arc<BaseClient>, writer: &WriterSlot, text: &str) {
    match wss_message::decode(text) {
        Ok(WssInbound::Request(req)) => {
            let resp = base.on_request(req);
            match wss_message::encode_response(&resp) {
                Ok(frame) => {
                    let mut w = writer.lock().await;
                    if let Some(sink) = w.as_mut() {
                        if let Err(e) = sink.send(Message::Text(frame)).await {
                            warn!(error = %e, "failed to return response frame");
                        }
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode response frame"),
            }
        }
        Ok(WssInbound::Response(resp)) => base.on_response(resp).await,
        Ok(WssInbound::Notification(notif)) => match notif.operation {
            Operation::Ping => {
                let pong = NotificationMessage::new(Operation::Pong, "", "", None);
                if let Ok(frame) = wss_message::encode_notification(&pong) {
                    let mut w = writer.lock().await;
                    if let Some(sink) = w.as_mut() {
                        let _ = sink.send(Message::Text(frame)).await;
                    }
                }
            }
            Operation::Pong => {}
            _ => base.on_notification(notif),
        },
        Err(e) => warn!(error = %e, "undecodable websocket frame"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_normalization() {
        assert_eq!(websocket_url("https://hub.local:8445").unwrap(), "wss://hub.local:8445/wothub/wss");
        assert_eq!(
            websocket_url("wss://hub.local:8445/wot/wss").unwrap(),
            "wss://hub.local:8445/wot/wss"
        );
        assert_eq!(websocket_url("ws://127.0.0.1:9000").unwrap(), "ws://127.0.0.1:9000/wothub/wss");
        assert!(websocket_url("mqtts://hub.local").is_err());
    }
}
