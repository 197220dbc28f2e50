//! Server-side transports and the connection registry.

pub mod authenticator;
pub mod connection;
pub mod connection_manager;
pub mod http_server;
pub mod mqtt_server;
pub mod wss_server;

use serde_json::json;
use std::sync::Arc;
use wothub_messaging::{Operation, RequestMessage, ResponseMessage};

use authenticator::Authenticator;
use connection::ServerConnectionState;
use crate::routing::RequestRouter;

/// Demultiplex a request arriving on a live connection: liveness and auth
/// operations are answered in place, subscription operations mutate the
/// connection state before the ack, everything else goes to the router.
pub(crate) async fn demux_request(
    auth: &Arc<dyn Authenticator>,
    router: &Arc<dyn RequestRouter>,
    state: &ServerConnectionState,
    req: RequestMessage,
) -> ResponseMessage {
    state.touch();
    match req.operation {
        Operation::Ping => req.create_response(Some(json!("pong")), None),
        Operation::RefreshToken => {
            let old = req.input.as_ref().and_then(|v| v.as_str()).unwrap_or_default();
            match auth.refresh(&state.info.client_id, old).await {
                Ok(token) => req.create_response(Some(json!(token)), None),
                Err(e) => req.create_response(None, Some(e)),
            }
        }
        Operation::Logout => {
            auth.logout(&state.info.client_id).await;
            req.create_response(None, None)
        }
        op if op.is_subscription_op() || op.is_observation_op() => state
            .apply_subscription_op(&req)
            .unwrap_or_else(|| req.create_response(None, None)),
        _ => {
            router
                .handle_request(&state.info.client_id, &state.info.connection_id, req)
                .await
        }
    }
}
