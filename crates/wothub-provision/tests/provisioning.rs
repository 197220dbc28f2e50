//! Provisioning end-to-end over the HTTP transport.

use std::sync::Arc;
use std::time::Duration;
use wothub_provision::{
    GetRequestsArgs, PreApprovedClient, ProvisionDeviceClient, ProvisionManageClient,
    ProvisionService, CLIENT_TYPE_DEVICE, PROVISION_THING_ID,
};
use wothub_transport::{
    Authenticator, ConnectionManager, HttpServerConfig, HttpTransportServer, HubClient, HubRouter,
    InMemoryAuthenticator,
};

const TIMEOUT: Duration = Duration::from_secs(5);
const KEY: &str = "-----BEGIN PUBLIC KEY-----\nabc\n-----END PUBLIC KEY-----";

struct Hub {
    auth: Arc<InMemoryAuthenticator>,
    server: wothub_transport::HttpServerHandle,
    url: String,
    // the provisioning agent connection must outlive the test body
    _agent: HubClient,
}

async fn start_hub(admins: Vec<String>) -> Hub {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
    let auth = Arc::new(InMemoryAuthenticator::new());
    let connections = Arc::new(ConnectionManager::new());
    let router = Arc::new(HubRouter::new(connections.clone()));

    let config = HttpServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        ping_interval: Duration::from_millis(200),
    };
    let server = HttpTransportServer::new(config, auth.clone(), router.clone(), connections);
    let handle = server.start().await.unwrap();
    let url = format!("http://{}", handle.local_addr);

    // the provisioning service runs as an ordinary agent
    let issuer_auth = auth.clone();
    let service = Arc::new(
        ProvisionService::new(Arc::new(move |cid: &str, _ct: &str| issuer_auth.issue(cid)))
            .with_admins(admins),
    );
    let agent_token = auth.issue_token("idprov-agent").await.unwrap();
    let agent = HubClient::new("idprov-agent", &url, None, TIMEOUT).unwrap();
    agent.connect_with_token(&agent_token).await.unwrap();
    agent.set_request_handler(Some(service.request_handler()));
    router.register_agent(PROVISION_THING_ID, "idprov-agent");

    Hub { auth, server: handle, url, _agent: agent }
}

async fn connect(hub: &Hub, client_id: &str) -> HubClient {
    let token = hub.auth.issue_token(client_id).await.unwrap();
    let client = HubClient::new(client_id, &hub.url, None, TIMEOUT).unwrap();
    client.connect_with_token(&token).await.unwrap();
    client
}

#[tokio::test]
async fn manual_approval_over_the_wire() {
    let hub = start_hub(vec!["admin1".to_string()]).await;

    let device = connect(&hub, "device1").await;
    let device_client = ProvisionDeviceClient::new(&device);
    let resp = device_client.submit("device1", CLIENT_TYPE_DEVICE, KEY, "").await.unwrap();
    assert!(resp.status.pending);
    assert!(resp.token.is_empty());

    let admin = connect(&hub, "admin1").await;
    let manage = ProvisionManageClient::new(&admin);
    let pending = manage.get_requests(GetRequestsArgs::pending_only()).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].client_id, "device1");

    manage.approve("device1").await.unwrap();
    let resp = device_client.submit("device1", CLIENT_TYPE_DEVICE, KEY, "").await.unwrap();
    assert!(resp.status.is_approved());
    // the issued token is a live session
    assert_eq!(hub.auth.validate(&resp.token).await.unwrap(), "device1");

    device.disconnect().await;
    admin.disconnect().await;
    hub.server.stop().await;
}

#[tokio::test]
async fn pre_approval_over_the_wire() {
    let hub = start_hub(vec!["admin1".to_string()]).await;

    let admin = connect(&hub, "admin1").await;
    let manage = ProvisionManageClient::new(&admin);
    manage
        .pre_approve(vec![PreApprovedClient {
            client_id: "device2".to_string(),
            client_type: CLIENT_TYPE_DEVICE.to_string(),
            pub_key: KEY.to_string(),
            mac: String::new(),
        }])
        .await
        .unwrap();

    let device = connect(&hub, "device2").await;
    let resp = ProvisionDeviceClient::new(&device)
        .submit("device2", CLIENT_TYPE_DEVICE, KEY, "")
        .await
        .unwrap();
    assert!(resp.status.is_approved());
    assert!(!resp.token.is_empty());

    device.disconnect().await;
    admin.disconnect().await;
    hub.server.stop().await;
}

#[tokio::test]
async fn management_requires_an_admin_sender() {
    let hub = start_hub(vec!["admin1".to_string()]).await;

    let intruder = connect(&hub, "device3").await;
    let manage = ProvisionManageClient::new(&intruder);
    assert!(manage.get_requests(GetRequestsArgs::all()).await.is_err());

    intruder.disconnect().await;
    hub.server.stop().await;
}
