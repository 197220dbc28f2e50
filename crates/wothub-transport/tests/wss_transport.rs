//! End-to-end tests over the WebSocket transport.

mod common;

use common::{connect_client, hub_parts, init_logging, start_wss};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use wothub_messaging::{NotificationMessage, Operation, RequestMessage, Status};
use wothub_transport::HubClient;

#[tokio::test]
async fn invoke_action_round_trip() {
    init_logging();
    let hub = hub_parts();
    let (server, url) = start_wss(&hub).await;

    let agent = connect_client(&hub, "agent1", &url).await;
    agent.set_request_handler(Some(Arc::new(|req| {
        let output = req.input.clone();
        req.create_response(output, None)
    })));
    hub.router.register_agent("thing1", "agent1");

    let consumer = connect_client(&hub, "consumer1", &url).await;
    let output = consumer.invoke_action("thing1", "echo", Some(json!(42))).await.unwrap();
    assert_eq!(output.unwrap(), json!(42));

    consumer.disconnect().await;
    agent.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn correlation_survives_the_agent_hop() {
    init_logging();
    let hub = hub_parts();
    let (server, url) = start_wss(&hub).await;

    let agent = connect_client(&hub, "agent1", &url).await;
    agent.set_request_handler(Some(Arc::new(|req| {
        // the forwarded request must carry the consumer's correlation id
        // and the authenticated sender
        assert_eq!(req.correlation_id, "c-77");
        assert_eq!(req.sender_id, "consumer1");
        req.create_response(Some(json!("done")), None)
    })));
    hub.router.register_agent("thing1", "agent1");

    let consumer = connect_client(&hub, "consumer1", &url).await;
    let req = RequestMessage::new(Operation::InvokeAction, "thing1", "run", None, "c-77");
    let resp = consumer.send_request(req, true).await.unwrap();
    assert_eq!(resp.correlation_id, "c-77");
    assert_eq!(resp.status, Status::Completed);
    assert_eq!(resp.output.unwrap(), json!("done"));

    consumer.disconnect().await;
    agent.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn subscription_gating_over_websocket() {
    init_logging();
    let hub = hub_parts();
    let (server, url) = start_wss(&hub).await;

    let agent = connect_client(&hub, "agent1", &url).await;

    let (tx, mut rx) = mpsc::unbounded_channel::<NotificationMessage>();
    let consumer = connect_client(&hub, "consumer1", &url).await;
    consumer.set_notification_handler(Some(Arc::new(move |n| {
        let _ = tx.send(n);
    })));

    // before subscribing nothing is delivered
    agent.publish_event("thing1", "e1", Some(json!(1))).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err());

    consumer.subscribe("thing1", "e1").await.unwrap();
    agent.publish_event("thing1", "e1", Some(json!(2))).await.unwrap();
    let notif = tokio::time::timeout(common::TEST_TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(notif.data.unwrap(), json!(2));

    // an unrelated event name stays filtered
    agent.publish_event("thing1", "other", Some(json!(3))).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err());

    consumer.disconnect().await;
    agent.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn token_refresh_over_websocket() {
    init_logging();
    let hub = hub_parts();
    let (server, url) = start_wss(&hub).await;

    let client = connect_client(&hub, "consumer1", &url).await;
    let before = client.token();
    let after = client.refresh_token().await.unwrap();
    assert_ne!(before, after);
    client.ping().await.unwrap();

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn invalid_token_is_rejected() {
    init_logging();
    let hub = hub_parts();
    let (server, url) = start_wss(&hub).await;

    let client = HubClient::new("consumer1", &url, None, common::TEST_TIMEOUT).unwrap();
    assert!(client.connect_with_token("bogus").await.is_err());
    assert!(!client.is_connected());

    server.stop().await;
}
