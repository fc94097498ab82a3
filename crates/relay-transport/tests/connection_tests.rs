//! Connection lifecycle against the in-process broker.
//!
//! Timings are shortened so reconnection and heart-beat loss are observable
//! within a test run.

use std::sync::Arc;
use std::time::Duration;

use relay_core::config::TransportConfig;
use relay_core::types::ConnectionState;
use relay_transport::{Connection, MemoryBroker, TransportError};

// =============================================================================
// Helpers
// =============================================================================

fn fast_config() -> TransportConfig {
    TransportConfig {
        heartbeat_ms: 20,
        heartbeat_grace: 2.0,
        reconnect_delay_ms: 30,
        connect_timeout_ms: 500,
        ..TransportConfig::default()
    }
}

fn connection(broker: &MemoryBroker) -> Connection {
    Connection::new(fast_config(), Arc::new(broker.clone()))
}

/// Poll `condition` until it holds or two seconds pass.
async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

// =============================================================================
// Connect
// =============================================================================

#[tokio::test]
async fn test_connect_reaches_connected() {
    let broker = MemoryBroker::new();
    let connection = connection(&broker);
    let mut changes = connection.state_changes();

    connection.connect().await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Connected);
    assert!(connection.is_connected());
    assert_eq!(broker.connection_count(), 1);
    assert!(changes.has_changed().unwrap());
    assert_eq!(*changes.borrow_and_update(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_concurrent_connects_share_one_link() {
    let broker = MemoryBroker::new();
    let connection = connection(&broker);

    let (a, b, c) = tokio::join!(
        connection.connect(),
        connection.connect(),
        connection.connect()
    );
    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert_eq!(broker.connect_attempts(), 1);

    // Already connected: resolves without touching the broker.
    connection.connect().await.unwrap();
    assert_eq!(broker.connect_attempts(), 1);
    assert_eq!(broker.connection_count(), 1);
}

#[tokio::test]
async fn test_rejected_handshake_is_not_connected() {
    let broker = MemoryBroker::new();
    broker.reject_handshakes(Some("unauthorized".to_string()));
    let connection = connection(&broker);

    let err = connection.connect().await.unwrap_err();
    match err {
        TransportError::NotConnected(reason) => assert!(reason.contains("unauthorized")),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(connection.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_failed_initial_connect_does_not_retry() {
    let broker = MemoryBroker::new();
    broker.refuse_connections(true);
    let connection = connection(&broker);

    assert!(connection.connect().await.is_err());
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(broker.connect_attempts(), 1);
    assert_eq!(connection.state(), ConnectionState::Disconnected);

    // A later explicit connect works once the broker is back.
    broker.refuse_connections(false);
    connection.connect().await.unwrap();
    assert!(connection.is_connected());
}

#[tokio::test]
async fn test_publish_and_subscribe_require_connection() {
    let broker = MemoryBroker::new();
    let connection = connection(&broker);

    assert!(matches!(
        connection.publish("/app/chat.join", "\"1\""),
        Err(TransportError::NotConnected(_))
    ));
    assert!(matches!(
        connection.subscribe("/topic/chat/1"),
        Err(TransportError::NotConnected(_))
    ));
    assert!(broker.published().is_empty());
}

// =============================================================================
// Publish / subscribe
// =============================================================================

#[tokio::test]
async fn test_subscription_receives_in_order() {
    let broker = MemoryBroker::new();
    let connection = connection(&broker);
    connection.connect().await.unwrap();

    let mut subscription = connection.subscribe("/topic/chat/7").unwrap();
    assert_eq!(subscription.destination(), "/topic/chat/7");
    assert!(eventually(|| broker.subscriber_count("/topic/chat/7") == 1).await);

    for n in 0..5 {
        broker.broadcast("/topic/chat/7", &format!("{{\"n\":{n}}}"));
    }
    for n in 0..5 {
        assert_eq!(subscription.next().await, Some(format!("{{\"n\":{n}}}")));
    }
}

#[tokio::test]
async fn test_publish_reaches_broker() {
    let broker = MemoryBroker::new();
    let connection = connection(&broker);
    connection.connect().await.unwrap();

    connection
        .publish("/app/chat.sendMessage", "{\"content\":\"hi\"}")
        .unwrap();
    assert!(eventually(|| broker.published_to("/app/chat.sendMessage").len() == 1).await);
}

#[tokio::test]
async fn test_unsubscribe_is_idempotent_and_runs_on_drop() {
    let broker = MemoryBroker::new();
    let connection = connection(&broker);
    connection.connect().await.unwrap();

    let (_deliveries, mut unsubscriber) = connection.subscribe("/topic/chat/1").unwrap().into_parts();
    assert!(eventually(|| broker.subscriber_count("/topic/chat/1") == 1).await);
    unsubscriber.unsubscribe();
    unsubscriber.unsubscribe();
    assert!(!unsubscriber.is_active());
    assert!(eventually(|| broker.subscriber_count("/topic/chat/1") == 0).await);
    assert_eq!(connection.subscription_count(), 0);

    let subscription = connection.subscribe("/topic/chat/2").unwrap();
    assert!(eventually(|| broker.subscriber_count("/topic/chat/2") == 1).await);
    drop(subscription);
    assert!(eventually(|| broker.subscriber_count("/topic/chat/2") == 0).await);
}

// =============================================================================
// Disconnect and recovery
// =============================================================================

#[tokio::test]
async fn test_disconnect_clears_subscriptions() {
    let broker = MemoryBroker::new();
    let connection = connection(&broker);
    connection.connect().await.unwrap();

    let mut subscription = connection.subscribe("/topic/chat/1").unwrap();
    assert_eq!(connection.subscription_count(), 1);

    connection.disconnect();
    connection.disconnect();
    assert_eq!(connection.state(), ConnectionState::Disconnected);
    assert_eq!(connection.subscription_count(), 0);
    assert_eq!(subscription.next().await, None);
    assert!(eventually(|| broker.connection_count() == 0).await);

    // No reconnection after an explicit disconnect.
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(broker.connect_attempts(), 1);
}

#[tokio::test]
async fn test_broker_drop_triggers_reconnect() {
    let broker = MemoryBroker::new();
    let connection = connection(&broker);
    connection.connect().await.unwrap();
    let mut subscription = connection.subscribe("/topic/chat/1").unwrap();

    broker.drop_connections();
    assert!(eventually(|| connection.state() != ConnectionState::Connected).await);
    // Subscriptions of the dead link are gone.
    assert_eq!(subscription.next().await, None);

    assert!(eventually(|| connection.is_connected()).await);
    assert_eq!(broker.connect_attempts(), 2);
    assert_eq!(broker.connection_count(), 1);
}

#[tokio::test]
async fn test_reconnect_keeps_trying_until_broker_returns() {
    let broker = MemoryBroker::new();
    let connection = connection(&broker);
    connection.connect().await.unwrap();

    broker.refuse_connections(true);
    broker.drop_connections();
    assert!(eventually(|| broker.connect_attempts() >= 3).await);
    assert!(!connection.is_connected());

    broker.refuse_connections(false);
    assert!(eventually(|| connection.is_connected()).await);
}

#[tokio::test]
async fn test_heartbeat_silence_forces_reconnect() {
    let broker = MemoryBroker::new();
    broker.set_heartbeat(Some(Duration::from_millis(10)));
    let connection = connection(&broker);
    connection.connect().await.unwrap();

    // Heart-beats keep an idle link alive.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(connection.is_connected());
    assert_eq!(broker.connect_attempts(), 1);

    let mut changes = connection.state_changes();
    broker.set_silent(true);
    assert!(eventually(|| broker.connect_attempts() >= 2).await);
    assert!(changes.has_changed().unwrap());
}

#[tokio::test]
async fn test_slower_broker_heartbeat_keeps_link() {
    let broker = MemoryBroker::new();
    // Beats every 60ms against a 20ms client interval and 2.0 grace.
    broker.set_heartbeat(Some(Duration::from_millis(60)));
    let connection = connection(&broker);
    connection.connect().await.unwrap();

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(connection.is_connected());
    assert_eq!(broker.connect_attempts(), 1);
}

#[tokio::test]
async fn test_broker_without_heartbeats_is_not_timed_out() {
    let broker = MemoryBroker::new();
    broker.set_heartbeat(None);
    let connection = connection(&broker);
    connection.connect().await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(connection.is_connected());
    assert_eq!(broker.connect_attempts(), 1);
}

#[tokio::test]
async fn test_server_error_frame_drops_link() {
    let broker = MemoryBroker::new();
    let connection = connection(&broker);
    connection.connect().await.unwrap();
    let mut subscription = connection.subscribe("/topic/chat/1").unwrap();

    assert_eq!(broker.send_error("internal failure"), 1);

    assert_eq!(subscription.next().await, None);
    assert!(eventually(|| connection.is_connected() && broker.connect_attempts() == 2).await);
}
