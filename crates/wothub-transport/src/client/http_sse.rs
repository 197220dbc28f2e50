//! HTTP client adapter with an SSE return channel.
//!
//! Outbound envelopes are HTTP POSTs; inbound traffic arrives on a
//! long-lived `/wothub/sse` stream. The stream reconnects with backoff and
//! the server's first ping after each (re)connect flips the connected flag.

use futures_util::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;
use wothub_messaging::{
    kind, NotificationMessage, Operation, RequestMessage, ResponseMessage, TransportError,
    TransportResult,
};

use super::base::BaseClient;
use super::connect::build_http_client;
use super::sse::SseParser;
use super::ProtocolClient;
use crate::protocol::{paths, ProtocolType};

/// Delay before retrying the SSE stream after a 401.
const UNAUTHORIZED_RETRY_DELAY: Duration = Duration::from_secs(10);
/// Reconnect backoff bounds for the SSE stream.
const BACKOFF_MIN: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// HTTP+SSE protocol adapter.
pub struct HttpSseClient {
    base: Arc<BaseClient>,
    http: reqwest::Client,
    base_url: String,
    sse_url: String,
    running: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl HttpSseClient {
    /// Create the adapter. `ca_pem` configures server verification.
    pub fn new(base: Arc<BaseClient>, ca_pem: Option<String>) -> TransportResult<Self> {
        let http = build_http_client(ca_pem.as_deref(), None)?;
        let (base_url, sse_url) = derive_urls(base.server_url())?;
        Ok(Self {
            base,
            http,
            base_url,
            sse_url,
            running: Arc::new(AtomicBool::new(false)),
            reader: Mutex::new(None),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// POST an envelope to `path` and map the HTTP status to a transport
    /// error. Returns the response body.
    async fn post_envelope<T: serde::Serialize>(
        &self,
        path: &str,
        envelope: &T,
        correlation_id: &str,
    ) -> TransportResult<Vec<u8>> {
        let mut req = self
            .http
            .post(self.endpoint(path))
            .bearer_auth(self.base.bearer_token())
            .header(paths::CONNECTION_ID_HEADER, self.base.connection_id())
            .json(envelope);
        if !correlation_id.is_empty() {
            req = req.header(paths::CORRELATION_ID_HEADER, correlation_id);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| TransportError::internal(format!("posting to {path}: {e}")))?;
        if let Some(e) = status_to_error(resp.status()) {
            return Err(e);
        }
        resp.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| TransportError::internal(format!("reading response body: {e}")))
    }
}

#[async_trait::async_trait]
impl ProtocolClient for HttpSseClient {
    fn protocol_type(&self) -> ProtocolType {
        ProtocolType::HttpSse
    }

    async fn connect(&self, _token: &str) -> TransportResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let task = tokio::spawn(sse_read_loop(
            self.base.clone(),
            self.http.clone(),
            self.sse_url.clone(),
            self.base_url.clone(),
            self.running.clone(),
        ));
        *self.reader.lock() = Some(task);

        // wait for the first server ping to flip the connected flag
        let deadline = tokio::time::Instant::now() + self.base.timeout();
        loop {
            if self.base.is_connected() {
                return Ok(());
            }
            if self.base.state() == super::base::ConnectionState::Unauthorized {
                return Err(self
                    .base
                    .last_error()
                    .unwrap_or_else(|| TransportError::unauthorized("connection rejected")));
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
        if let Some(task) = self.reader.lock().take() {
            task.abort();
        }
        self.base.set_connected(false, None);
    }

    async fn publish_request(&self, req: &RequestMessage) -> TransportResult<()> {
        let (path, method) = request_target(&self.base, req);
        if method != "POST" {
            // forms may specify other verbs; the envelope endpoints are POST
            debug!(method = %method, path = %path, "form method ignored, envelopes POST");
        }
        let body = self.post_envelope(&path, req, &req.correlation_id).await?;
        // a response arriving inline on the POST is dispatched like any other
        if !body.is_empty() {
            if let Ok(resp) = serde_json::from_slice::<ResponseMessage>(&body) {
                let base = self.base.clone();
                tokio::spawn(async move { base.on_response(resp).await });
            }
        }
        Ok(())
    }

    async fn publish_response(&self, resp: &ResponseMessage) -> TransportResult<()> {
        self.post_envelope(paths::RESPONSE, resp, &resp.correlation_id).await.map(|_| ())
    }

    async fn publish_notification(&self, notif: &NotificationMessage) -> TransportResult<()> {
        self.post_envelope(paths::NOTIFICATION, notif, "").await.map(|_| ())
    }
}

/// Resolve the target path and method for a request: a form href with its
/// URI template variables substituted, or the fixed envelope endpoint.
fn request_target(base: &BaseClient, req: &RequestMessage) -> (String, String) {
    match base.lookup_form(req.operation, &req.thing_id, &req.name) {
        Some(form) => {
            let path = wothub_messaging::forms::substitute_uri_variables(
                &form.href,
                req.operation.as_str(),
                &req.thing_id,
                &req.name,
            );
            (path, form.method_or_default().to_string())
        }
        None => (paths::REQUEST.to_string(), "POST".to_string()),
    }
}

/// Map an HTTP status to the transport error taxonomy; `None` for success.
fn status_to_error(status: reqwest::StatusCode) -> Option<TransportError> {
    use reqwest::StatusCode;
    match status {
        s if s.is_success() => None,
        StatusCode::UNAUTHORIZED => Some(TransportError::unauthorized("request rejected")),
        StatusCode::FORBIDDEN => Some(TransportError::policy_denied("request denied")),
        StatusCode::NOT_FOUND => Some(TransportError::not_found("endpoint or thing not found")),
        s => Some(TransportError::request_failed(format!("request failed with status {s}"))),
    }
}

/// Split the connect URL into the HTTP base and the SSE endpoint.
fn derive_urls(server_url: &str) -> TransportResult<(String, String)> {
    let parsed = Url::parse(server_url)
        .map_err(|e| TransportError::internal(format!("invalid server URL: {e}")))?;
    let sse_path = match parsed.path() {
        "" | "/" => paths::SSE,
        p if p.ends_with("/sse") => p,
        _ => paths::SSE,
    };
    let sse_path = sse_path.to_string();
    let mut base = parsed;
    base.set_path("");
    let base_url = base.to_string().trim_end_matches('/').to_string();
    let sse_url = format!("{base_url}{sse_path}");
    Ok((base_url, sse_url))
}

/// The long-lived SSE reader: connects, parses events, dispatches them, and
/// reconnects with backoff until stopped.
async fn sse_read_loop(
    base: Arc<BaseClient>,
    http: reqwest::Client,
    sse_url: String,
    base_url: String,
    running: Arc<AtomicBool>,
) {
    let mut backoff = BACKOFF_MIN;
    while running.load(Ordering::SeqCst) {
        let resp = http
            .get(&sse_url)
            .bearer_auth(base.bearer_token())
            .header(paths::CONNECTION_ID_HEADER, base.connection_id())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await;
        let resp = match resp {
            Ok(r) => r,
            Err(e) => {
                debug!(url = %sse_url, error = %e, "sse connect failed, retrying");
                base.set_connected(false, Some(TransportError::ConnectionLost));
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BACKOFF_MAX);
                continue;
            }
        };
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            warn!(url = %sse_url, "sse stream rejected, token no longer valid");
            base.set_unauthorized(TransportError::unauthorized("sse stream rejected"));
            base.on_notification(NotificationMessage::new(Operation::Logout, "", "", None));
            tokio::time::sleep(UNAUTHORIZED_RETRY_DELAY).await;
            continue;
        }
        if let Some(e) = status_to_error(resp.status()) {
            base.set_connected(false, Some(e));
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(BACKOFF_MAX);
            continue;
        }

        backoff = BACKOFF_MIN;
        let mut parser = SseParser::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    debug!(error = %e, "sse stream error");
                    break;
                }
            };
            for event in parser.feed(&chunk) {
                dispatch_sse_event(&base, &http, &base_url, &event.event, &event.data).await;
            }
        }
        base.set_connected(false, Some(TransportError::ConnectionLost));
    }
}

async fn dispatch_sse_event(
    base: &Arc<BaseClient>,
    http: &reqwest::Client,
    base_url: &str,
    event: &str,
    data: &str,
) {
    match event {
        kind::PING => {
            // first ping after (re)connect signals the channel is live
            base.set_connected(true, None);
        }
        kind::RESPONSE => match serde_json::from_str::<ResponseMessage>(data) {
            Ok(resp) => base.on_response(resp).await,
            Err(e) => warn!(error = %e, "malformed response on sse stream"),
        },
        kind::NOTIFICATION => match serde_json::from_str::<NotificationMessage>(data) {
            Ok(notif) => base.on_notification(notif),
            Err(e) => warn!(error = %e, "malformed notification on sse stream"),
        },
        kind::REQUEST => match serde_json::from_str::<RequestMessage>(data) {
            Ok(req) => {
                let resp = base.on_request(req);
                let url = format!("{base_url}{}", paths::RESPONSE);
                let post = http
                    .post(&url)
                    .bearer_auth(base.bearer_token())
                    .header(paths::CONNECTION_ID_HEADER, base.connection_id())
                    .json(&resp);
                tokio::spawn(async move {
                    if let Err(e) = post.send().await {
                        warn!(error = %e, "failed to return response to server");
                    }
                });
            }
            Err(e) => warn!(error = %e, "malformed request on sse stream"),
        },
        other => debug!(event = %other, "ignoring unknown sse event type"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_derivation() {
        let (base, sse) = derive_urls("https://hub.local:8444").unwrap();
        assert_eq!(base, "https://hub.local:8444");
        assert_eq!(sse, "https://hub.local:8444/wothub/sse");

        let (_, wot_sse) = derive_urls("https://hub.local:8444/wot/sse").unwrap();
        assert_eq!(wot_sse, "https://hub.local:8444/wot/sse");
    }

    #[test]
    fn form_href_overrides_the_envelope_endpoint() {
        let base = BaseClient::new(
            "client1",
            "https://hub.local:8444",
            ProtocolType::HttpSse,
            Duration::from_secs(1),
        );
        let req = RequestMessage::new(Operation::InvokeAction, "thing1", "action1", None, "c-1");

        let (path, method) = request_target(&base, &req);
        assert_eq!(path, paths::REQUEST);
        assert_eq!(method, "POST");

        base.set_get_form(Some(Arc::new(|_op, _tid, _name| {
            Some(wothub_messaging::Form::new("/things/{thingID}/actions/{name}"))
        })));
        let (path, method) = request_target(&base, &req);
        assert_eq!(path, "/things/thing1/actions/action1");
        assert_eq!(method, "POST");
    }

    #[test]
    fn status_mapping() {
        assert!(status_to_error(reqwest::StatusCode::OK).is_none());
        assert!(matches!(
            status_to_error(reqwest::StatusCode::UNAUTHORIZED),
            Some(TransportError::Unauthorized { .. })
        ));
        assert!(matches!(
            status_to_error(reqwest::StatusCode::NOT_FOUND),
            Some(TransportError::NotFound { .. })
        ));
    }
}
