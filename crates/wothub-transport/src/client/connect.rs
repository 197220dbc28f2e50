//! Connect conveniences: password login, token files and hub discovery.

use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};
use wothub_messaging::{TransportError, TransportResult};

use super::hub_client::HubClient;
use crate::protocol::paths;

/// File name of the hub CA certificate inside a credentials directory.
pub const CA_CERT_FILE: &str = "caCert.pem";
/// Suffix of per-client token files inside a credentials directory.
pub const TOKEN_FILE_SUFFIX: &str = ".token";

/// Build an HTTP client verifying the server against `ca_pem`. Without a CA
/// certificate verification is disabled, which is only acceptable on closed
/// test networks.
pub(crate) fn build_http_client(
    ca_pem: Option<&str>,
    timeout: Option<Duration>,
) -> TransportResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder();
    if let Some(t) = timeout {
        builder = builder.timeout(t);
    }
    match ca_pem {
        Some(pem) => {
            let cert = reqwest::Certificate::from_pem(pem.as_bytes())
                .map_err(|e| TransportError::internal(format!("invalid CA certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        None => {
            warn!("no CA certificate provided, server verification is disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }
    }
    builder
        .build()
        .map_err(|e| TransportError::internal(format!("building http client: {e}")))
}

/// Authenticate with a password against the hub's login endpoint and return
/// the issued bearer token.
pub(crate) async fn http_login(
    auth_base_url: &str,
    client_id: &str,
    password: &str,
    ca_pem: Option<&str>,
) -> TransportResult<String> {
    let http = build_http_client(ca_pem, Some(Duration::from_secs(10)))?;
    let url = format!("{}{}", auth_base_url, paths::LOGIN);
    let resp = http
        .post(&url)
        .json(&json!({ "login": client_id, "password": password }))
        .send()
        .await
        .map_err(|e| TransportError::internal(format!("login request to {url}: {e}")))?;
    if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
        return Err(TransportError::unauthorized("invalid login"));
    }
    if !resp.status().is_success() {
        return Err(TransportError::request_failed(format!(
            "login failed with status {}",
            resp.status()
        )));
    }
    let body: serde_json::Value = resp
        .json()
        .await
        .map_err(|e| TransportError::protocol_mismatch(format!("malformed login response: {e}")))?;
    body.get("token")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| TransportError::protocol_mismatch("login response carries no token"))
}

/// Read the saved bearer token of a client from the credentials directory.
pub fn load_token(cred_dir: &Path, client_id: &str) -> TransportResult<String> {
    let path = cred_dir.join(format!("{client_id}{TOKEN_FILE_SUFFIX}"));
    let token = std::fs::read_to_string(&path)?;
    Ok(token.trim().to_string())
}

/// Save a bearer token to the credentials directory, replacing any previous
/// one.
pub fn save_token(cred_dir: &Path, client_id: &str, token: &str) -> TransportResult<()> {
    let path = cred_dir.join(format!("{client_id}{TOKEN_FILE_SUFFIX}"));
    std::fs::write(&path, token)?;
    Ok(())
}

/// Read the hub CA certificate from the credentials directory, if present.
pub fn load_ca_pem(cred_dir: &Path) -> TransportResult<Option<String>> {
    let path = cred_dir.join(CA_CERT_FILE);
    match std::fs::read_to_string(&path) {
        Ok(pem) => Ok(Some(pem)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Connect to the hub using the token and CA certificate stored in the
/// credentials directory. The token rotated during connect is written back.
pub async fn connect_with_token_file(
    client_id: &str,
    server_url: &str,
    cred_dir: &Path,
    timeout: Duration,
) -> TransportResult<HubClient> {
    let ca_pem = load_ca_pem(cred_dir)?;
    let token = load_token(cred_dir, client_id)?;
    let client = HubClient::new(client_id, server_url, ca_pem, timeout)?;
    let fresh = client.connect_with_token(&token).await?;
    if let Err(e) = save_token(cred_dir, client_id, &fresh) {
        warn!(client_id = %client_id, error = %e, "could not persist rotated token");
    }
    Ok(client)
}

/// Locate the hub on the local network via DNS-SD and connect with the
/// stored token.
pub async fn connect_with_discovery(
    client_id: &str,
    cred_dir: &Path,
    timeout: Duration,
) -> TransportResult<HubClient> {
    let url = wothub_discovery::locate_hub(Duration::from_secs(3), true)
        .await
        .map_err(|e| TransportError::internal(format!("hub discovery: {e}")))?;
    info!(client_id = %client_id, url = %url, "discovered hub");
    connect_with_token_file(client_id, &url, cred_dir, timeout).await
}
