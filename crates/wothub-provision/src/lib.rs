//! Identity provisioning: devices request an account, administrators
//! approve or reject, tokens are issued on approval.
//!
//! The service runs as a regular hub agent answering requests addressed to
//! the provisioning thing; the device and management clients in [`client`]
//! ride the same transport envelopes as every other consumer.

pub mod api;
pub mod client;
pub mod service;

pub use api::{
    GetRequestsArgs, PreApprovedClient, ProvisionStatus, SubmitResponse, ACTION_APPROVE,
    ACTION_GET_REQUESTS, ACTION_PRE_APPROVE, ACTION_REJECT, ACTION_SUBMIT, CLIENT_TYPE_DEVICE,
    CLIENT_TYPE_SERVICE, PROVISION_THING_ID,
};
pub use client::{ProvisionDeviceClient, ProvisionManageClient};
pub use service::{ProvisionService, TokenIssuer};
