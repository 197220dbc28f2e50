//! Shared setup for the transport integration tests.

use std::sync::Arc;
use std::time::Duration;
use wothub_transport::{
    Authenticator, ConnectionManager, HttpServerConfig, HttpServerHandle, HttpTransportServer,
    HubClient, HubRouter, InMemoryAuthenticator, WssServerConfig, WssServerHandle,
    WssTransportServer,
};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestHub {
    pub auth: Arc<InMemoryAuthenticator>,
    pub router: Arc<HubRouter>,
    pub connections: Arc<ConnectionManager>,
}

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .try_init();
}

pub fn hub_parts() -> TestHub {
    let auth = Arc::new(InMemoryAuthenticator::new());
    let connections = Arc::new(ConnectionManager::new());
    let router = Arc::new(HubRouter::new(connections.clone()));
    TestHub { auth, router, connections }
}

pub async fn start_http(hub: &TestHub) -> (HttpServerHandle, String) {
    let config = HttpServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        ping_interval: Duration::from_millis(200),
    };
    let server = HttpTransportServer::new(
        config,
        hub.auth.clone(),
        hub.router.clone(),
        hub.connections.clone(),
    );
    let handle = server.start().await.unwrap();
    let url = format!("http://{}", handle.local_addr);
    (handle, url)
}

pub async fn start_wss(hub: &TestHub) -> (WssServerHandle, String) {
    let config = WssServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        ping_interval: Duration::from_secs(10),
    };
    let server = WssTransportServer::new(
        config,
        hub.auth.clone(),
        hub.router.clone(),
        hub.connections.clone(),
    );
    let handle = server.start().await.unwrap();
    let url = format!("ws://{}/wothub/wss", handle.local_addr);
    (handle, url)
}

/// Connect a client with a token issued directly by the authenticator.
pub async fn connect_client(hub: &TestHub, client_id: &str, url: &str) -> HubClient {
    let token = hub.auth.issue_token(client_id).await.unwrap();
    let client = HubClient::new(client_id, url, None, TEST_TIMEOUT).unwrap();
    client.connect_with_token(&token).await.unwrap();
    client
}
