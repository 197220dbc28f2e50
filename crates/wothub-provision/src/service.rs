//! The provisioning state machine and its request-handler glue.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use wothub_messaging::{
    unix_milli_now, RequestMessage, ResponseMessage, TransportError, TransportResult,
};
use wothub_transport::client::RequestHandler;

use crate::api::{
    ClientIdArgs, GetRequestsArgs, PreApproveArgs, PreApprovedClient, ProvisionStatus, SubmitArgs,
    SubmitResponse, ACTION_APPROVE, ACTION_GET_REQUESTS, ACTION_PRE_APPROVE, ACTION_REJECT,
    ACTION_SUBMIT, CLIENT_TYPE_DEVICE, CLIENT_TYPE_SERVICE, RETRY_SEC_INCREMENT, RETRY_SEC_MAX,
    RETRY_SEC_NEW, RETRY_SEC_REJECTED,
};

/// Issues a bearer token for an approved account, given its client id and
/// client type (device or service).
pub type TokenIssuer = Arc<dyn Fn(&str, &str) -> String + Send + Sync>;

/// In-memory provisioning service.
///
/// One lock guards the request table; every operation is a short critical
/// section. A rejected request stays rejected until an administrator
/// approves it, no matter how often the device re-submits.
pub struct ProvisionService {
    issuer: TokenIssuer,
    /// Management operations are restricted to these senders; empty allows
    /// everyone (tests)
    admins: Vec<String>,
    requests: RwLock<HashMap<String, ProvisionStatus>>,
}

impl ProvisionService {
    /// Create the service over a token issuer.
    pub fn new(issuer: TokenIssuer) -> Self {
        Self { issuer, admins: Vec::new(), requests: RwLock::new(HashMap::new()) }
    }

    /// Restrict management operations to the given sender ids.
    pub fn with_admins(mut self, admins: Vec<String>) -> Self {
        self.admins = admins;
        self
    }

    /// Submit or re-submit a device provisioning request.
    pub fn submit(
        &self,
        client_id: &str,
        client_type: &str,
        pub_key: &str,
        mac: &str,
    ) -> TransportResult<SubmitResponse> {
        validate_submit(client_id, pub_key)?;
        let mut requests = self.requests.write();
        let now = unix_milli_now();

        let Some(entry) = requests.get_mut(client_id) else {
            let status = ProvisionStatus {
                client_id: client_id.to_string(),
                client_type: normalize_client_type(client_type),
                pub_key: pub_key.to_string(),
                mac: mac.to_string(),
                pending: true,
                received_mse: now,
                approved_mse: 0,
                rejected_mse: 0,
                retry_sec: RETRY_SEC_NEW,
            };
            requests.insert(client_id.to_string(), status.clone());
            info!(client_id = %client_id, "provisioning request received, awaiting approval");
            return Ok(SubmitResponse { status, token: String::new() });
        };

        if entry.is_rejected() {
            entry.retry_sec = RETRY_SEC_REJECTED;
            entry.received_mse = now;
            warn!(client_id = %client_id, "re-submit of a rejected request");
            return Ok(SubmitResponse { status: entry.clone(), token: String::new() });
        }

        if entry.approved_mse != 0 {
            // pre-approved entries carry the expected key and/or MAC; each
            // one that is set must match on its own
            if !entry.pub_key.is_empty() && entry.pub_key != pub_key {
                return Err(TransportError::policy_denied(format!(
                    "public key of '{client_id}' does not match the approved key"
                )));
            }
            if !entry.mac.is_empty() && entry.mac != mac {
                return Err(TransportError::policy_denied(format!(
                    "hardware address of '{client_id}' does not match the approved address"
                )));
            }
            if entry.pub_key.is_empty() {
                entry.pub_key = pub_key.to_string();
            }
            if entry.mac.is_empty() && !mac.is_empty() {
                entry.mac = mac.to_string();
            }
            entry.received_mse = now;
            entry.pending = false;
            entry.retry_sec = 0;
            let token = (self.issuer)(client_id, &entry.client_type);
            info!(client_id = %client_id, client_type = %entry.client_type, "provisioning approved, token issued");
            return Ok(SubmitResponse { status: entry.clone(), token });
        }

        // repeated pending submit: the key must not change mid-flight
        if entry.pub_key != pub_key {
            return Err(TransportError::policy_denied(format!(
                "public key of pending request '{client_id}' changed"
            )));
        }
        entry.received_mse = now;
        entry.retry_sec = (entry.retry_sec + RETRY_SEC_INCREMENT).min(RETRY_SEC_MAX);
        Ok(SubmitResponse { status: entry.clone(), token: String::new() })
    }

    /// Approve a request. Clears a rejection.
    pub fn approve(&self, client_id: &str) -> TransportResult<()> {
        let mut requests = self.requests.write();
        let entry = requests
            .get_mut(client_id)
            .ok_or_else(|| TransportError::not_found(format!("no request from '{client_id}'")))?;
        entry.pending = false;
        entry.approved_mse = unix_milli_now();
        entry.rejected_mse = 0;
        entry.retry_sec = 0;
        info!(client_id = %client_id, "provisioning request approved");
        Ok(())
    }

    /// Reject a request. The device stays rejected until approved.
    pub fn reject(&self, client_id: &str) -> TransportResult<()> {
        let mut requests = self.requests.write();
        let entry = requests
            .get_mut(client_id)
            .ok_or_else(|| TransportError::not_found(format!("no request from '{client_id}'")))?;
        entry.pending = false;
        entry.approved_mse = 0;
        entry.rejected_mse = unix_milli_now();
        entry.retry_sec = RETRY_SEC_REJECTED;
        info!(client_id = %client_id, "provisioning request rejected");
        Ok(())
    }

    /// Register clients approved ahead of first contact. Entries without a
    /// client id are skipped, the rest of the batch is applied.
    pub fn pre_approve(&self, clients: Vec<PreApprovedClient>) -> TransportResult<()> {
        let now = unix_milli_now();
        let mut requests = self.requests.write();
        for c in clients {
            if c.client_id.is_empty() {
                warn!("skipping pre-approval without a client id");
                continue;
            }
            info!(client_id = %c.client_id, client_type = %c.client_type, "client pre-approved");
            requests.insert(
                c.client_id.clone(),
                ProvisionStatus {
                    client_id: c.client_id,
                    client_type: normalize_client_type(&c.client_type),
                    pub_key: c.pub_key,
                    mac: c.mac,
                    pending: false,
                    received_mse: 0,
                    approved_mse: now,
                    rejected_mse: 0,
                    retry_sec: 0,
                },
            );
        }
        Ok(())
    }

    /// List requests matching any of the set state filters.
    pub fn get_requests(&self, args: &GetRequestsArgs) -> Vec<ProvisionStatus> {
        let requests = self.requests.read();
        let mut list: Vec<ProvisionStatus> = requests
            .values()
            .filter(|r| {
                (args.pending && r.pending)
                    || (args.approved && r.approved_mse != 0)
                    || (args.rejected && r.rejected_mse != 0)
            })
            .cloned()
            .collect();
        list.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        list
    }

    fn is_admin(&self, sender_id: &str) -> bool {
        self.admins.is_empty() || self.admins.iter().any(|a| a == sender_id)
    }

    /// Answer one request envelope addressed to the provisioning thing.
    pub fn handle_request(&self, req: RequestMessage) -> ResponseMessage {
        let result = self.dispatch(&req);
        match result {
            Ok(output) => req.create_response(output, None),
            Err(e) => req.create_response(None, Some(e)),
        }
    }

    fn dispatch(&self, req: &RequestMessage) -> TransportResult<Option<serde_json::Value>> {
        let input = req.input.clone().unwrap_or(serde_json::Value::Null);
        match req.name.as_str() {
            ACTION_SUBMIT => {
                let args: SubmitArgs = serde_json::from_value(input)
                    .map_err(|e| TransportError::request_failed(format!("invalid submit arguments: {e}")))?;
                let resp = self.submit(&args.client_id, &args.client_type, &args.pub_key, &args.mac)?;
                Ok(Some(serde_json::to_value(resp)?))
            }
            ACTION_APPROVE | ACTION_REJECT | ACTION_PRE_APPROVE | ACTION_GET_REQUESTS
                if !self.is_admin(&req.sender_id) =>
            {
                Err(TransportError::unauthorized(format!(
                    "'{}' may not manage provisioning",
                    req.sender_id
                )))
            }
            ACTION_APPROVE => {
                let args: ClientIdArgs = serde_json::from_value(input)
                    .map_err(|e| TransportError::request_failed(format!("invalid arguments: {e}")))?;
                self.approve(&args.client_id)?;
                Ok(None)
            }
            ACTION_REJECT => {
                let args: ClientIdArgs = serde_json::from_value(input)
                    .map_err(|e| TransportError::request_failed(format!("invalid arguments: {e}")))?;
                self.reject(&args.client_id)?;
                Ok(None)
            }
            ACTION_PRE_APPROVE => {
                let args: PreApproveArgs = serde_json::from_value(input)
                    .map_err(|e| TransportError::request_failed(format!("invalid arguments: {e}")))?;
                self.pre_approve(args.clients)?;
                Ok(None)
            }
            ACTION_GET_REQUESTS => {
                let args: GetRequestsArgs = if input.is_null() {
                    GetRequestsArgs::all()
                } else {
                    serde_json::from_value(input)
                        .map_err(|e| TransportError::request_failed(format!("invalid arguments: {e}")))?
                };
                Ok(Some(serde_json::to_value(self.get_requests(&args))?))
            }
            other => Err(TransportError::not_found(format!("unknown provisioning action '{other}'"))),
        }
    }

    /// The request handler to register on the agent connection serving the
    /// provisioning thing.
    pub fn request_handler(self: &Arc<Self>) -> RequestHandler {
        let service = self.clone();
        Arc::new(move |req| service.handle_request(req))
    }
}

/// Unknown or empty client types become devices; only "service" is special.
fn normalize_client_type(client_type: &str) -> String {
    if client_type == CLIENT_TYPE_SERVICE {
        CLIENT_TYPE_SERVICE.to_string()
    } else {
        CLIENT_TYPE_DEVICE.to_string()
    }
}

/// Empty ids and keys are rejected before touching the table; a key must be
/// PEM or base64 to be considered well-formed.
fn validate_submit(client_id: &str, pub_key: &str) -> TransportResult<()> {
    if client_id.is_empty() {
        return Err(TransportError::request_failed("submit with empty client id"));
    }
    if pub_key.is_empty() {
        return Err(TransportError::request_failed("submit with empty public key"));
    }
    let looks_pem = pub_key.contains("-----BEGIN");
    let looks_b64 = BASE64.decode(pub_key.trim()).map(|d| d.len() >= 32).unwrap_or(false);
    if !looks_pem && !looks_b64 {
        return Err(TransportError::request_failed("submit with malformed public key"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wothub_messaging::{Operation, Status};

    const KEY1: &str = "-----BEGIN PUBLIC KEY-----\nabc\n-----END PUBLIC KEY-----";
    const KEY2: &str = "-----BEGIN PUBLIC KEY-----\nxyz\n-----END PUBLIC KEY-----";

    fn service() -> Arc<ProvisionService> {
        Arc::new(ProvisionService::new(Arc::new(|cid: &str, _ct: &str| format!("token-{cid}"))))
    }

    fn pre_approved(client_id: &str, pub_key: &str, mac: &str) -> PreApprovedClient {
        PreApprovedClient {
            client_id: client_id.to_string(),
            client_type: CLIENT_TYPE_DEVICE.to_string(),
            pub_key: pub_key.to_string(),
            mac: mac.to_string(),
        }
    }

    #[test]
    fn pre_approved_device_gets_token_on_first_submit() {
        let svc = service();
        svc.pre_approve(vec![pre_approved("device1", KEY1, "")]).unwrap();

        let resp = svc.submit("device1", CLIENT_TYPE_DEVICE, KEY1, "").unwrap();
        assert!(resp.status.is_approved());
        assert_eq!(resp.token, "token-device1");
        assert_eq!(resp.status.retry_sec, 0);
    }

    #[test]
    fn pre_approval_by_mac_alone() {
        let svc = service();
        svc.pre_approve(vec![pre_approved("device1", "", "aa:bb:cc")]).unwrap();
        let resp = svc.submit("device1", CLIENT_TYPE_DEVICE, KEY1, "aa:bb:cc").unwrap();
        assert!(resp.status.is_approved());
        assert!(!resp.token.is_empty());
        // a MAC-only pre-approval adopts the submitted key
        assert_eq!(resp.status.pub_key, KEY1);
    }

    #[test]
    fn pre_approved_key_mismatch_is_denied() {
        let svc = service();
        svc.pre_approve(vec![pre_approved("device1", KEY1, "aa:bb:cc")]).unwrap();
        // wrong key and wrong mac
        let err = svc.submit("device1", CLIENT_TYPE_DEVICE, KEY2, "dd:ee:ff").unwrap_err();
        assert!(matches!(err, TransportError::PolicyDenied { .. }));
    }

    #[test]
    fn mismatched_key_is_denied_even_when_the_mac_matches() {
        let svc = service();
        svc.pre_approve(vec![pre_approved("device1", KEY1, "aa:bb:cc")]).unwrap();

        let err = svc.submit("device1", CLIENT_TYPE_DEVICE, KEY2, "aa:bb:cc").unwrap_err();
        assert!(matches!(err, TransportError::PolicyDenied { .. }));
        // the stored key is untouched by the denied submit
        let list = svc.get_requests(&GetRequestsArgs::all());
        assert_eq!(list[0].pub_key, KEY1);
    }

    #[test]
    fn mismatched_mac_is_denied_even_when_the_key_matches() {
        let svc = service();
        svc.pre_approve(vec![pre_approved("device1", KEY1, "aa:bb:cc")]).unwrap();
        let err = svc.submit("device1", CLIENT_TYPE_DEVICE, KEY1, "dd:ee:ff").unwrap_err();
        assert!(matches!(err, TransportError::PolicyDenied { .. }));
    }

    #[test]
    fn manual_approval_flow_with_backoff() {
        let svc = service();
        let resp = svc.submit("device1", CLIENT_TYPE_DEVICE, KEY1, "").unwrap();
        assert!(resp.status.pending);
        assert_eq!(resp.status.retry_sec, RETRY_SEC_NEW);
        assert!(resp.token.is_empty());

        // repeated submits back off until the cap
        let resp = svc.submit("device1", CLIENT_TYPE_DEVICE, KEY1, "").unwrap();
        assert_eq!(resp.status.retry_sec, RETRY_SEC_NEW + RETRY_SEC_INCREMENT);
        for _ in 0..30 {
            svc.submit("device1", CLIENT_TYPE_DEVICE, KEY1, "").unwrap();
        }
        let resp = svc.submit("device1", CLIENT_TYPE_DEVICE, KEY1, "").unwrap();
        assert_eq!(resp.status.retry_sec, RETRY_SEC_MAX);

        svc.approve("device1").unwrap();
        let resp = svc.submit("device1", CLIENT_TYPE_DEVICE, KEY1, "").unwrap();
        assert!(resp.status.is_approved());
        assert_eq!(resp.token, "token-device1");
    }

    #[test]
    fn rejected_stays_rejected_until_approved() {
        let svc = service();
        svc.submit("device1", CLIENT_TYPE_DEVICE, KEY1, "").unwrap();
        svc.reject("device1").unwrap();

        let resp = svc.submit("device1", CLIENT_TYPE_DEVICE, KEY1, "").unwrap();
        assert!(resp.status.is_rejected());
        assert_eq!(resp.status.retry_sec, RETRY_SEC_REJECTED);
        assert!(resp.token.is_empty());

        // only a manual approval clears the rejection
        svc.approve("device1").unwrap();
        let resp = svc.submit("device1", CLIENT_TYPE_DEVICE, KEY1, "").unwrap();
        assert!(resp.status.is_approved());
        assert!(!resp.token.is_empty());
    }

    #[test]
    fn pending_key_change_is_denied() {
        let svc = service();
        svc.submit("device1", CLIENT_TYPE_DEVICE, KEY1, "").unwrap();
        let err = svc.submit("device1", CLIENT_TYPE_DEVICE, KEY2, "").unwrap_err();
        assert!(matches!(err, TransportError::PolicyDenied { .. }));
    }

    #[test]
    fn repeated_submit_refreshes_the_received_timestamp() {
        let svc = service();
        let first = svc.submit("device1", CLIENT_TYPE_DEVICE, KEY1, "").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = svc.submit("device1", CLIENT_TYPE_DEVICE, KEY1, "").unwrap();
        assert!(second.status.received_mse > first.status.received_mse);
    }

    #[test]
    fn service_type_reaches_the_token_issuer() {
        let svc = Arc::new(ProvisionService::new(Arc::new(|cid: &str, ct: &str| {
            format!("{ct}-token-{cid}")
        })));
        svc.pre_approve(vec![PreApprovedClient {
            client_id: "svc1".to_string(),
            client_type: CLIENT_TYPE_SERVICE.to_string(),
            pub_key: KEY1.to_string(),
            mac: String::new(),
        }])
        .unwrap();

        let resp = svc.submit("svc1", "", KEY1, "").unwrap();
        assert_eq!(resp.status.client_type, CLIENT_TYPE_SERVICE);
        assert_eq!(resp.token, "service-token-svc1");
    }

    #[test]
    fn bad_inputs_fail_fast() {
        let svc = service();
        assert!(svc.submit("", CLIENT_TYPE_DEVICE, KEY1, "").is_err());
        assert!(svc.submit("device1", CLIENT_TYPE_DEVICE, "", "").is_err());
        assert!(svc.submit("device1", CLIENT_TYPE_DEVICE, "not a key", "").is_err());
        assert!(matches!(
            svc.approve("ghost").unwrap_err(),
            TransportError::NotFound { .. }
        ));
        assert!(matches!(
            svc.reject("ghost").unwrap_err(),
            TransportError::NotFound { .. }
        ));
    }

    #[test]
    fn pre_approval_skips_entries_without_an_id() {
        let svc = service();
        svc.pre_approve(vec![
            pre_approved("device1", KEY1, ""),
            pre_approved("", KEY2, ""),
            pre_approved("device2", KEY2, ""),
        ])
        .unwrap();

        let list = svc.get_requests(&GetRequestsArgs::all());
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].client_id, "device1");
        assert_eq!(list[1].client_id, "device2");
    }

    #[test]
    fn listing_filters_by_state() {
        let svc = service();
        svc.submit("device1", CLIENT_TYPE_DEVICE, KEY1, "").unwrap();
        svc.submit("device2", CLIENT_TYPE_DEVICE, KEY2, "").unwrap();
        svc.approve("device2").unwrap();
        svc.submit("device3", CLIENT_TYPE_DEVICE, KEY1, "").unwrap();
        svc.reject("device3").unwrap();

        assert_eq!(svc.get_requests(&GetRequestsArgs::all()).len(), 3);

        let pending = svc.get_requests(&GetRequestsArgs::pending_only());
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].client_id, "device1");

        let approved = svc.get_requests(&GetRequestsArgs {
            approved: true,
            ..GetRequestsArgs::default()
        });
        assert_eq!(approved.len(), 1);
        assert_eq!(approved[0].client_id, "device2");

        let rejected = svc.get_requests(&GetRequestsArgs {
            rejected: true,
            ..GetRequestsArgs::default()
        });
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].client_id, "device3");
    }

    #[test]
    fn envelope_glue_enforces_admins() {
        let svc = Arc::new(
            ProvisionService::new(Arc::new(|cid: &str, _ct: &str| format!("token-{cid}")))
                .with_admins(vec!["admin1".to_string()]),
        );
        let handler = svc.request_handler();

        let mut req = RequestMessage::new(
            Operation::InvokeAction,
            crate::PROVISION_THING_ID,
            ACTION_GET_REQUESTS,
            None,
            "c-1",
        );
        req.sender_id = "device1".to_string();
        let resp = handler(req.clone());
        assert_eq!(resp.status, Status::Failed);

        req.sender_id = "admin1".to_string();
        let resp = handler(req);
        assert_eq!(resp.status, Status::Completed);

        // submit is open to devices
        let mut submit = RequestMessage::new(
            Operation::InvokeAction,
            crate::PROVISION_THING_ID,
            ACTION_SUBMIT,
            Some(serde_json::json!({ "clientId": "device1", "pubKey": KEY1 })),
            "c-2",
        );
        submit.sender_id = "device1".to_string();
        let resp = handler(submit);
        assert_eq!(resp.status, Status::Completed);
    }
}
