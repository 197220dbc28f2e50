//! DNS-SD advertisement and discovery of the hub on the local network.
//!
//! The hub advertises itself under `_wothub._tcp`; clients browse for it and
//! derive the connect URL from the TXT record: the `rawurl` key wins, else
//! the URL is assembled from the `scheme` and `path` keys and the resolved
//! address. IPv4 addresses are preferred over IPv6, hostnames are the last
//! resort.

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default service name the hub advertises under.
pub const HUB_SERVICE_NAME: &str = "wothub";

/// TXT record key carrying the full connect URL.
pub const TXT_RAW_URL: &str = "rawurl";
/// TXT record key carrying the URL scheme when `rawurl` is absent.
pub const TXT_SCHEME: &str = "scheme";
/// TXT record key carrying the URL path when `rawurl` is absent.
pub const TXT_PATH: &str = "path";
/// TXT record key carrying the authentication endpoint URL.
pub const TXT_AUTH_URL: &str = "authURL";
/// TXT record key carrying the thing description path of the hub itself.
pub const TXT_TD: &str = "td";

/// Errors from advertising or browsing.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// A parameter failed validation before touching the network
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The mDNS daemon failed
    #[error("mdns: {0}")]
    Daemon(String),

    /// Browsing ended without a usable result
    #[error("service not found")]
    NotFound,
}

impl From<mdns_sd::Error> for DiscoveryError {
    fn from(e: mdns_sd::Error) -> Self {
        DiscoveryError::Daemon(e.to_string())
    }
}

/// A resolved DNS-SD service instance.
#[derive(Debug, Clone)]
pub struct DiscoveredService {
    /// Instance name within the service type
    pub instance_name: String,
    /// Preferred address: IPv4 over IPv6 over the hostname
    pub address: String,
    /// Service port
    pub port: u16,
    /// TXT record key/value pairs
    pub properties: HashMap<String, String>,
}

/// A published advertisement. Dropping the handle stops it.
pub struct ServiceHandle {
    daemon: ServiceDaemon,
    fullname: String,
}

impl ServiceHandle {
    /// Withdraw the advertisement and shut the daemon down.
    pub fn shutdown(self) {
        if let Err(e) = self.daemon.unregister(&self.fullname) {
            debug!(fullname = %self.fullname, error = %e, "unregister failed");
        }
        let _ = self.daemon.shutdown();
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        let _ = self.daemon.shutdown();
    }
}

fn service_type(service_name: &str) -> String {
    format!("_{service_name}._tcp.local.")
}

/// Advertise a service instance on the local network.
///
/// Fails on an empty service name, port 0, or an address that does not parse
/// as an IP address.
pub fn serve_discovery(
    instance_id: &str,
    service_name: &str,
    address: &str,
    port: u16,
    params: HashMap<String, String>,
) -> Result<ServiceHandle, DiscoveryError> {
    if service_name.is_empty() {
        return Err(DiscoveryError::InvalidParameter("empty service name".to_string()));
    }
    if port == 0 {
        return Err(DiscoveryError::InvalidParameter("port 0".to_string()));
    }
    let ip: IpAddr = address
        .parse()
        .map_err(|_| DiscoveryError::InvalidParameter(format!("unresolvable address '{address}'")))?;

    let ty = service_type(service_name);
    let host = format!("{instance_id}.local.");
    let info = ServiceInfo::new(&ty, instance_id, &host, ip, port, params)?;
    let fullname = info.get_fullname().to_string();

    let daemon = ServiceDaemon::new()?;
    daemon.register(info)?;
    info!(fullname = %fullname, address = %address, port = port, "service advertised");
    Ok(ServiceHandle { daemon, fullname })
}

/// Browse for service instances of `service_name`.
///
/// Waits up to `wait_time`; with `first_result` the browse returns as soon
/// as one instance resolved.
pub async fn discover_service(
    service_name: &str,
    wait_time: Duration,
    first_result: bool,
) -> Result<Vec<DiscoveredService>, DiscoveryError> {
    if service_name.is_empty() {
        return Err(DiscoveryError::InvalidParameter("empty service name".to_string()));
    }
    let ty = service_type(service_name);
    let daemon = ServiceDaemon::new()?;
    let receiver = daemon.browse(&ty)?;

    let deadline = Instant::now() + wait_time;
    let mut found: Vec<DiscoveredService> = Vec::new();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let event = tokio::time::timeout(remaining, receiver.recv_async()).await;
        match event {
            Ok(Ok(ServiceEvent::ServiceResolved(info))) => {
                found.push(to_discovered(&info));
                if first_result {
                    break;
                }
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "browse channel closed");
                break;
            }
            Err(_) => break,
        }
    }
    let _ = daemon.stop_browse(&ty);
    let _ = daemon.shutdown();
    if found.is_empty() {
        return Err(DiscoveryError::NotFound);
    }
    Ok(found)
}

fn to_discovered(info: &ServiceInfo) -> DiscoveredService {
    let addresses = info.get_addresses();
    let address = addresses
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addresses.iter().next())
        .map(|a| a.to_string())
        .unwrap_or_else(|| info.get_hostname().trim_end_matches('.').to_string());
    let properties = info
        .get_properties()
        .iter()
        .map(|p| (p.key().to_string(), p.val_str().to_string()))
        .collect();
    DiscoveredService {
        instance_name: info.get_fullname().to_string(),
        address,
        port: info.get_port(),
        properties,
    }
}

/// Browse for the hub and return its connect URL.
pub async fn locate_hub(wait_time: Duration, first_result: bool) -> Result<String, DiscoveryError> {
    let services = discover_service(HUB_SERVICE_NAME, wait_time, first_result).await?;
    let service = services.first().ok_or(DiscoveryError::NotFound)?;
    let url = connect_url(service);
    debug!(url = %url, instance = %service.instance_name, "hub located");
    Ok(url)
}

/// Derive the connect URL from a resolved instance: the `rawurl` TXT key
/// wins, else scheme + address + path.
pub fn connect_url(service: &DiscoveredService) -> String {
    if let Some(raw) = service.properties.get(TXT_RAW_URL) {
        if !raw.is_empty() {
            return raw.clone();
        }
    }
    let scheme = service
        .properties
        .get(TXT_SCHEME)
        .filter(|s| !s.is_empty())
        .map(String::as_str)
        .unwrap_or("https");
    let path = service
        .properties
        .get(TXT_PATH)
        .filter(|p| !p.is_empty())
        .map(String::as_str)
        .unwrap_or("");
    let host = if service.address.contains(':') {
        // bracket IPv6 literals
        format!("[{}]", service.address)
    } else {
        service.address.clone()
    };
    format!("{scheme}://{host}:{}{path}", service.port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advertise_rejects_bad_parameters() {
        assert!(matches!(
            serve_discovery("hub1", "", "127.0.0.1", 8444, HashMap::new()),
            Err(DiscoveryError::InvalidParameter(_))
        ));
        assert!(matches!(
            serve_discovery("hub1", "wothub", "127.0.0.1", 0, HashMap::new()),
            Err(DiscoveryError::InvalidParameter(_))
        ));
        assert!(matches!(
            serve_discovery("hub1", "wothub", "not-an-ip", 8444, HashMap::new()),
            Err(DiscoveryError::InvalidParameter(_))
        ));
    }

    fn service(props: &[(&str, &str)], address: &str) -> DiscoveredService {
        DiscoveredService {
            instance_name: "hub1._wothub._tcp.local.".to_string(),
            address: address.to_string(),
            port: 8444,
            properties: props.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    #[test]
    fn raw_url_wins() {
        let s = service(&[(TXT_RAW_URL, "wss://hub.local:8445/wothub/wss")], "192.168.1.10");
        assert_eq!(connect_url(&s), "wss://hub.local:8445/wothub/wss");
    }

    #[test]
    fn url_assembled_from_parts() {
        let s = service(&[(TXT_SCHEME, "https"), (TXT_PATH, "/wothub/sse")], "192.168.1.10");
        assert_eq!(connect_url(&s), "https://192.168.1.10:8444/wothub/sse");
    }

    #[test]
    fn defaults_apply_without_txt_keys() {
        let s = service(&[], "192.168.1.10");
        assert_eq!(connect_url(&s), "https://192.168.1.10:8444");
    }

    #[test]
    fn ipv6_addresses_are_bracketed() {
        let s = service(&[], "fe80::1");
        assert_eq!(connect_url(&s), "https://[fe80::1]:8444");
    }
}
