//! Wire types and action names of the provisioning service.

use serde::{Deserialize, Serialize};

/// Thing id the provisioning service answers under.
pub const PROVISION_THING_ID: &str = "idprov";

/// Device action: submit or re-submit a provisioning request.
pub const ACTION_SUBMIT: &str = "submitRequest";
/// Management action: approve a pending or rejected request.
pub const ACTION_APPROVE: &str = "approveRequest";
/// Management action: reject a request.
pub const ACTION_REJECT: &str = "rejectRequest";
/// Management action: register clients approved ahead of first contact.
pub const ACTION_PRE_APPROVE: &str = "preApproveClients";
/// Management action: list requests.
pub const ACTION_GET_REQUESTS: &str = "getRequests";

/// Client type of a provisioned device account.
pub const CLIENT_TYPE_DEVICE: &str = "device";
/// Client type of a provisioned service account.
pub const CLIENT_TYPE_SERVICE: &str = "service";

/// Retry advisory for a brand-new pending request, in seconds.
pub const RETRY_SEC_NEW: u32 = 60;
/// Added to the advisory on every repeated pending submit.
pub const RETRY_SEC_INCREMENT: u32 = 30;
/// Ceiling of the pending retry advisory.
pub const RETRY_SEC_MAX: u32 = 600;
/// Retry advisory after rejection.
pub const RETRY_SEC_REJECTED: u32 = 3600;

/// The lifecycle record of one provisioning request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionStatus {
    /// Device account id being provisioned
    pub client_id: String,
    /// Account type created on approval, device or service
    #[serde(default = "default_client_type")]
    pub client_type: String,
    /// Public key the device authenticates with, PEM or base64
    pub pub_key: String,
    /// Optional hardware address used for pre-approval matching
    #[serde(default)]
    pub mac: String,
    /// True while awaiting an administrator decision
    pub pending: bool,
    /// Milliseconds-since-epoch of the first submit; 0 for pre-approvals
    #[serde(default)]
    pub received_mse: i64,
    /// Milliseconds-since-epoch of approval, 0 when not approved
    #[serde(default)]
    pub approved_mse: i64,
    /// Milliseconds-since-epoch of rejection, 0 when not rejected
    #[serde(default)]
    pub rejected_mse: i64,
    /// Advisory for the device: seconds to wait before re-submitting
    #[serde(default)]
    pub retry_sec: u32,
}

impl ProvisionStatus {
    /// Whether the request was approved.
    pub fn is_approved(&self) -> bool {
        self.approved_mse != 0 && !self.pending
    }

    /// Whether the request was rejected and not re-approved.
    pub fn is_rejected(&self) -> bool {
        self.rejected_mse != 0 && self.approved_mse == 0
    }
}

/// A client approved before its first contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreApprovedClient {
    /// Device account id
    pub client_id: String,
    /// Account type created on approval, device or service
    #[serde(default = "default_client_type")]
    pub client_type: String,
    /// Expected public key; empty to match by MAC alone
    #[serde(default)]
    pub pub_key: String,
    /// Expected hardware address; empty to match by public key alone
    #[serde(default)]
    pub mac: String,
}

/// Answer to a submit: the current status plus a token when approved.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    /// Current request status
    pub status: ProvisionStatus,
    /// Bearer token; empty unless the request is approved
    #[serde(default)]
    pub token: String,
}

/// Arguments of [`ACTION_SUBMIT`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitArgs {
    /// Device account id
    pub client_id: String,
    /// Account type to create on approval
    #[serde(default = "default_client_type")]
    pub client_type: String,
    /// Device public key
    pub pub_key: String,
    /// Optional hardware address
    #[serde(default)]
    pub mac: String,
}

fn default_client_type() -> String {
    CLIENT_TYPE_DEVICE.to_string()
}

/// Arguments of [`ACTION_APPROVE`] and [`ACTION_REJECT`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientIdArgs {
    /// Device account id the decision applies to
    pub client_id: String,
}

/// Arguments of [`ACTION_PRE_APPROVE`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreApproveArgs {
    /// The clients to approve ahead of first contact
    pub clients: Vec<PreApprovedClient>,
}

/// Arguments of [`ACTION_GET_REQUESTS`]: a request is listed when any set
/// filter matches it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetRequestsArgs {
    /// Include pending requests
    #[serde(default)]
    pub pending: bool,
    /// Include approved requests
    #[serde(default)]
    pub approved: bool,
    /// Include rejected requests
    #[serde(default)]
    pub rejected: bool,
}

impl GetRequestsArgs {
    /// Include every request regardless of state.
    pub fn all() -> Self {
        Self { pending: true, approved: true, rejected: true }
    }

    /// Include only pending requests.
    pub fn pending_only() -> Self {
        Self { pending: true, approved: false, rejected: false }
    }
}
