//! End-to-end tests over the HTTP+SSE transport.

mod common;

use common::{connect_client, hub_parts, init_logging, start_http};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use wothub_messaging::{NotificationMessage, TransportError};
use wothub_transport::{Authenticator, HubClient};

fn notification_sink(
) -> (Arc<dyn Fn(NotificationMessage) + Send + Sync>, mpsc::UnboundedReceiver<NotificationMessage>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = Arc::new(move |n: NotificationMessage| {
        let _ = tx.send(n);
    });
    (handler, rx)
}

async fn connect_echo_agent(hub: &common::TestHub, url: &str, thing_id: &str) -> HubClient {
    let agent = connect_client(hub, "agent1", url).await;
    agent.set_request_handler(Some(Arc::new(|req| {
        let output = req.input.clone();
        req.create_response(output, None)
    })));
    hub.router.register_agent(thing_id, "agent1");
    agent
}

#[tokio::test]
async fn invoke_action_round_trip() {
    init_logging();
    let hub = hub_parts();
    let (server, url) = start_http(&hub).await;

    let agent = connect_echo_agent(&hub, &url, "thing1").await;
    let consumer = connect_client(&hub, "consumer1", &url).await;

    let output = consumer
        .invoke_action("thing1", "echo", Some(json!("hello")))
        .await
        .unwrap();
    assert_eq!(output.unwrap(), json!("hello"));

    consumer.disconnect().await;
    agent.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn unknown_thing_fails_with_not_found() {
    init_logging();
    let hub = hub_parts();
    let (server, url) = start_http(&hub).await;

    let consumer = connect_client(&hub, "consumer1", &url).await;
    let err = consumer.invoke_action("no-such-thing", "echo", None).await.unwrap_err();
    assert!(matches!(err, TransportError::RequestFailed { .. }));
    assert!(err.to_string().contains("no agent"));

    consumer.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn event_fanout_respects_subscriptions() {
    init_logging();
    let hub = hub_parts();
    let (server, url) = start_http(&hub).await;

    let agent = connect_client(&hub, "agent1", &url).await;

    let subscriber = connect_client(&hub, "consumer1", &url).await;
    let (handler, mut sub_rx) = notification_sink();
    subscriber.set_notification_handler(Some(handler));
    subscriber.subscribe("thing1", "").await.unwrap();

    let bystander = connect_client(&hub, "consumer2", &url).await;
    let (handler2, mut other_rx) = notification_sink();
    bystander.set_notification_handler(Some(handler2));

    agent.publish_event("thing1", "temperature", Some(json!(21.5))).await.unwrap();

    let notif = tokio::time::timeout(common::TEST_TIMEOUT, sub_rx.recv())
        .await
        .expect("subscriber should receive the event")
        .unwrap();
    assert_eq!(notif.thing_id, "thing1");
    assert_eq!(notif.name, "temperature");
    assert_eq!(notif.data.unwrap(), json!(21.5));

    // the unsubscribed client gets nothing
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(other_rx.try_recv().is_err());

    subscriber.disconnect().await;
    bystander.disconnect().await;
    agent.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn events_and_property_updates_are_separate_channels() {
    init_logging();
    let hub = hub_parts();
    let (server, url) = start_http(&hub).await;

    let agent = connect_client(&hub, "agent1", &url).await;
    let consumer = connect_client(&hub, "consumer1", &url).await;
    let (handler, mut rx) = notification_sink();
    consumer.set_notification_handler(Some(handler));

    // event subscription must not deliver property updates
    consumer.subscribe("thing1", "").await.unwrap();
    agent.update_property("thing1", "level", json!(5)).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err());

    consumer.observe_property("thing1", "level").await.unwrap();
    agent.update_property("thing1", "level", json!(6)).await.unwrap();
    let notif = tokio::time::timeout(common::TEST_TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(notif.data.unwrap(), json!(6));

    consumer.unobserve_property("thing1", "level").await.unwrap();
    agent.update_property("thing1", "level", json!(7)).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(rx.try_recv().is_err());

    consumer.disconnect().await;
    agent.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn password_login_and_token_rotation() {
    init_logging();
    let hub = hub_parts();
    let (server, url) = start_http(&hub).await;
    hub.auth.add_client("consumer1", "secret");

    let client = HubClient::new("consumer1", &url, None, common::TEST_TIMEOUT).unwrap();
    assert!(client.connect_with_password("wrong").await.is_err());

    let token = client.connect_with_password("secret").await.unwrap();
    assert!(client.is_connected());

    let rotated = client.refresh_token().await.unwrap();
    assert_ne!(token, rotated);
    // the old token died with the rotation
    assert!(hub.auth.validate(&token).await.is_err());

    client.ping().await.unwrap();
    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn disconnect_and_unsubscribe_are_idempotent() {
    init_logging();
    let hub = hub_parts();
    let (server, url) = start_http(&hub).await;

    let consumer = connect_client(&hub, "consumer1", &url).await;
    // unsubscribing something never subscribed succeeds
    consumer.unsubscribe("thing1", "nope").await.unwrap();

    consumer.disconnect().await;
    consumer.disconnect().await;
    assert!(!consumer.is_connected());

    // requests after disconnect fail with connection lost
    let err = consumer.ping().await.unwrap_err();
    assert!(matches!(err, TransportError::ConnectionLost | TransportError::Internal { .. }));

    server.stop().await;
}

#[tokio::test]
async fn ordering_is_preserved_per_connection() {
    init_logging();
    let hub = hub_parts();
    let (server, url) = start_http(&hub).await;

    let agent = connect_client(&hub, "agent1", &url).await;
    let consumer = connect_client(&hub, "consumer1", &url).await;
    let (handler, mut rx) = notification_sink();
    consumer.set_notification_handler(Some(handler));
    consumer.subscribe("thing1", "counter").await.unwrap();

    for i in 0..5 {
        agent.publish_event("thing1", "counter", Some(json!(i))).await.unwrap();
    }
    for i in 0..5 {
        let notif = tokio::time::timeout(common::TEST_TIMEOUT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(notif.data.unwrap(), json!(i));
    }

    consumer.disconnect().await;
    agent.disconnect().await;
    server.stop().await;
}
