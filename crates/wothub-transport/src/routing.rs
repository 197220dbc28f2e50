//! Request routing seam between server transports and hub logic.
//!
//! Every server transport demultiplexes inbound envelopes the same way:
//! subscription operations mutate the connection, pings are answered in
//! place, and everything else goes to the [`RequestRouter`]. The
//! [`HubRouter`] implementation forwards requests to the agent serving the
//! thing and carries the response back on the originating connection.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use wothub_messaging::{
    NotificationMessage, RequestMessage, ResponseMessage, Status, TransportError,
};

use crate::server::connection_manager::ConnectionManager;

/// Handler for messages a server transport cannot resolve on its own.
#[async_trait]
pub trait RequestRouter: Send + Sync {
    /// Handle a request from `sender_id` received on `connection_id` and
    /// produce the response written back on that connection.
    async fn handle_request(
        &self,
        sender_id: &str,
        connection_id: &str,
        req: RequestMessage,
    ) -> ResponseMessage;

    /// Handle a response an agent produced for an earlier server-initiated
    /// request.
    async fn handle_response(&self, sender_id: &str, resp: ResponseMessage);

    /// Handle a notification published by an agent.
    async fn handle_notification(&self, sender_id: &str, notif: NotificationMessage);
}

/// Routes requests to the agent connection serving the addressed thing and
/// fans agent notifications out through the connection manager.
pub struct HubRouter {
    connections: Arc<ConnectionManager>,
    /// thing id -> agent client id
    agents: RwLock<HashMap<String, String>>,
    /// correlation id -> originating connection id
    inflight: Mutex<HashMap<String, String>>,
}

impl HubRouter {
    /// Create a router over the given connection registry.
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self {
            connections,
            agents: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Declare which agent serves a thing.
    pub fn register_agent(&self, thing_id: &str, agent_id: &str) {
        self.agents.write().insert(thing_id.to_string(), agent_id.to_string());
    }

    fn agent_for(&self, thing_id: &str) -> Option<String> {
        self.agents.read().get(thing_id).cloned()
    }
}

#[async_trait]
impl RequestRouter for HubRouter {
    async fn handle_request(
        &self,
        sender_id: &str,
        connection_id: &str,
        mut req: RequestMessage,
    ) -> ResponseMessage {
        let Some(agent_id) = self.agent_for(&req.thing_id) else {
            return req.create_response(
                None,
                Some(TransportError::not_found(format!(
                    "no agent for thing '{}'",
                    req.thing_id
                ))),
            );
        };
        let agent_conns = self.connections.get_by_client_id(&agent_id);
        let Some(agent_conn) = agent_conns.first() else {
            return req.create_response(
                None,
                Some(TransportError::not_found(format!("agent '{agent_id}' is not connected"))),
            );
        };

        req.sender_id = sender_id.to_string();
        if !req.correlation_id.is_empty() {
            self.inflight
                .lock()
                .insert(req.correlation_id.clone(), connection_id.to_string());
        }
        if let Err(e) = agent_conn.send_request(&req).await {
            self.inflight.lock().remove(&req.correlation_id);
            return req.create_response(None, Some(e));
        }
        debug!(
            sender_id = %sender_id,
            agent_id = %agent_id,
            thing_id = %req.thing_id,
            correlation_id = %req.correlation_id,
            "request forwarded to agent"
        );
        let mut pending = req.create_response(None, None);
        pending.status = Status::Pending;
        pending
    }

    async fn handle_response(&self, sender_id: &str, resp: ResponseMessage) {
        let origin = {
            let mut inflight = self.inflight.lock();
            if resp.status.is_terminal() {
                inflight.remove(&resp.correlation_id)
            } else {
                inflight.get(&resp.correlation_id).cloned()
            }
        };
        let Some(origin) = origin else {
            warn!(
                sender_id = %sender_id,
                correlation_id = %resp.correlation_id,
                "response without a matching in-flight request, dropped"
            );
            return;
        };
        match self.connections.get_by_connection_id(&origin) {
            Some(c) => {
                if let Err(e) = c.send_response(&resp).await {
                    warn!(connection_id = %origin, error = %e, "failed to deliver response");
                }
            }
            None => warn!(connection_id = %origin, "originating connection is gone, response dropped"),
        }
    }

    async fn handle_notification(&self, sender_id: &str, notif: NotificationMessage) {
        debug!(
            sender_id = %sender_id,
            operation = %notif.operation,
            thing_id = %notif.thing_id,
            name = %notif.name,
            "publishing notification"
        );
        self.connections.publish_notification(&notif).await;
    }
}
