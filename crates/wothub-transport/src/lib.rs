//! Pluggable transports for the WotHub message envelopes.
//!
//! Three wire protocols carry the same request/response/notification
//! envelopes: HTTP with an SSE return channel, WebSocket, and MQTT. Each
//! protocol provides a client adapter built around a shared [`BaseClient`]
//! and a server transport producing [`ServerConnection`]s owned by the
//! [`ConnectionManager`]. Routing between connections goes through the
//! [`RequestRouter`] seam; authentication goes through the [`Authenticator`]
//! seam.

pub mod client;
pub mod protocol;
pub mod routing;
pub mod server;
pub mod wss_message;

pub use client::base::BaseClient;
pub use client::connect::{
    connect_with_discovery, connect_with_token_file, load_ca_pem, load_token, save_token,
};
pub use client::hub_client::HubClient;
pub use client::ProtocolClient;
pub use protocol::{paths, ProtocolType};
pub use routing::{HubRouter, RequestRouter};
pub use server::authenticator::{Authenticator, InMemoryAuthenticator};
pub use server::connection::{ConnectionInfo, ServerConnection, ServerConnectionState};
pub use server::connection_manager::ConnectionManager;
pub use server::http_server::{HttpServerConfig, HttpServerHandle, HttpTransportServer};
pub use server::mqtt_server::{MqttServerConfig, MqttServerHandle, MqttTransportServer};
pub use server::wss_server::{WssServerConfig, WssServerHandle, WssTransportServer};
