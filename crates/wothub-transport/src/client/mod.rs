//! Client-side connections: shared base plus one adapter per wire protocol.

pub mod base;
pub mod connect;
pub mod http_sse;
pub mod hub_client;
pub mod mqtt;
pub mod sse;
pub mod wss;

use async_trait::async_trait;
use std::sync::Arc;
use wothub_messaging::{
    NotificationMessage, RequestMessage, ResponseMessage, TransportError, TransportResult,
};

use crate::protocol::ProtocolType;

/// Application callback fired on connection status changes.
pub type ConnectHandler = Arc<dyn Fn(bool, Option<TransportError>) + Send + Sync>;
/// Application callback receiving server-pushed notifications.
pub type NotificationHandler = Arc<dyn Fn(NotificationMessage) + Send + Sync>;
/// Application callback receiving asynchronous responses.
pub type ResponseHandler = Arc<dyn Fn(ResponseMessage) + Send + Sync>;
/// Application callback answering server-initiated requests (agents).
pub type RequestHandler = Arc<dyn Fn(RequestMessage) -> ResponseMessage + Send + Sync>;

/// The adapter-specific half of a client connection.
///
/// Each adapter holds the shared [`base::BaseClient`] and implements only
/// connection setup, teardown and the raw publish primitives; everything
/// else (correlation, waiting, dispatch) is delegated to the base.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// The wire protocol this adapter speaks.
    fn protocol_type(&self) -> ProtocolType;

    /// Establish the transport using the given bearer token.
    async fn connect(&self, token: &str) -> TransportResult<()>;

    /// Tear the transport down. Must be idempotent.
    async fn disconnect(&self);

    /// Serialize and send a request envelope.
    async fn publish_request(&self, req: &RequestMessage) -> TransportResult<()>;

    /// Serialize and send a response envelope (agents answering requests).
    async fn publish_response(&self, resp: &ResponseMessage) -> TransportResult<()>;

    /// Serialize and send a notification envelope (agents publishing).
    async fn publish_notification(&self, notif: &NotificationMessage) -> TransportResult<()>;
}
