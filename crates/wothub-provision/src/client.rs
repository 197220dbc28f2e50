//! Device and management clients riding the hub transport.

use wothub_messaging::{TransportError, TransportResult};
use wothub_transport::HubClient;

use crate::api::{
    ClientIdArgs, GetRequestsArgs, PreApproveArgs, PreApprovedClient, ProvisionStatus, SubmitArgs,
    SubmitResponse, ACTION_APPROVE, ACTION_GET_REQUESTS, ACTION_PRE_APPROVE, ACTION_REJECT,
    ACTION_SUBMIT, PROVISION_THING_ID,
};

/// Device-side client: submits provisioning requests.
pub struct ProvisionDeviceClient<'a> {
    hub: &'a HubClient,
}

impl<'a> ProvisionDeviceClient<'a> {
    /// Wrap an established hub connection.
    pub fn new(hub: &'a HubClient) -> Self {
        Self { hub }
    }

    /// Submit or re-submit a provisioning request. The `retry_sec` in the
    /// answer is the advisory for the next attempt while pending.
    pub async fn submit(
        &self,
        client_id: &str,
        client_type: &str,
        pub_key: &str,
        mac: &str,
    ) -> TransportResult<SubmitResponse> {
        let args = SubmitArgs {
            client_id: client_id.to_string(),
            client_type: client_type.to_string(),
            pub_key: pub_key.to_string(),
            mac: mac.to_string(),
        };
        let output = self
            .hub
            .invoke_action(PROVISION_THING_ID, ACTION_SUBMIT, Some(serde_json::to_value(args)?))
            .await?;
        let output = output
            .ok_or_else(|| TransportError::protocol_mismatch("submit returned no status"))?;
        Ok(serde_json::from_value(output)?)
    }
}

/// Management client: approval decisions and request listing.
pub struct ProvisionManageClient<'a> {
    hub: &'a HubClient,
}

impl<'a> ProvisionManageClient<'a> {
    /// Wrap an established hub connection.
    pub fn new(hub: &'a HubClient) -> Self {
        Self { hub }
    }

    /// Approve a pending or rejected request.
    pub async fn approve(&self, client_id: &str) -> TransportResult<()> {
        let args = ClientIdArgs { client_id: client_id.to_string() };
        self.hub
            .invoke_action(PROVISION_THING_ID, ACTION_APPROVE, Some(serde_json::to_value(args)?))
            .await
            .map(|_| ())
    }

    /// Reject a request.
    pub async fn reject(&self, client_id: &str) -> TransportResult<()> {
        let args = ClientIdArgs { client_id: client_id.to_string() };
        self.hub
            .invoke_action(PROVISION_THING_ID, ACTION_REJECT, Some(serde_json::to_value(args)?))
            .await
            .map(|_| ())
    }

    /// Register clients approved ahead of first contact.
    pub async fn pre_approve(&self, clients: Vec<PreApprovedClient>) -> TransportResult<()> {
        let args = PreApproveArgs { clients };
        self.hub
            .invoke_action(PROVISION_THING_ID, ACTION_PRE_APPROVE, Some(serde_json::to_value(args)?))
            .await
            .map(|_| ())
    }

    /// List requests matching any of the set state filters.
    pub async fn get_requests(&self, args: GetRequestsArgs) -> TransportResult<Vec<ProvisionStatus>> {
        let output = self
            .hub
            .invoke_action(PROVISION_THING_ID, ACTION_GET_REQUESTS, Some(serde_json::to_value(args)?))
            .await?;
        let output =
            output.ok_or_else(|| TransportError::protocol_mismatch("listing returned no data"))?;
        Ok(serde_json::from_value(output)?)
    }
}
