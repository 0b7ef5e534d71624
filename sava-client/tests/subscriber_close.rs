//! Shutdown protocol tests: both close behaviors, the zero-timeout
//! short-circuit, idempotency, and handling of deliveries racing the close.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{settle_tasks, MockTransport};
use sava_client::{CloseBehavior, Message, Subscriber, SubscriberBuilder, SubscriberOptions};
use sava_core::transport::PullTransport;
use tokio::sync::mpsc;
use tokio::time::Instant;

async fn open_subscriber(
    transport: &Arc<MockTransport>,
) -> (Subscriber, mpsc::Receiver<Message>) {
    let mut subscriber = SubscriberBuilder::new()
        .with_transport(Arc::clone(transport) as Arc<dyn PullTransport>)
        .with_options(SubscriberOptions::default())
        .build()
        .expect("valid subscriber config");
    let rx = subscriber.open().await.expect("open subscriber");
    (subscriber, rx)
}

#[tokio::test(start_paused = true)]
async fn test_close_waits_for_in_flight_processing() {
    let transport = Arc::new(MockTransport::new());
    let (mut subscriber, mut rx) = open_subscriber(&transport).await;

    transport.deliver("a", b"x").await;
    let message = rx.recv().await.expect("message dispatched");

    // consumer finishes one second into the close window
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        message.ack().await;
    });

    let started = Instant::now();
    subscriber
        .close(CloseBehavior::WaitForProcessing, Duration::from_secs(5))
        .await
        .expect("close");

    assert!(
        started.elapsed() < Duration::from_secs(4),
        "close should resolve on the ack, not the timeout"
    );
    assert_eq!(transport.acked_ids(), vec!["a".to_string()]);
    assert!(transport.modacked_ids(0).is_empty());
    assert_eq!(transport.destroys(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_close_nack_immediately_releases_everything() {
    let transport = Arc::new(MockTransport::new());
    let (mut subscriber, mut rx) = open_subscriber(&transport).await;

    for id in ["a", "b", "c"] {
        transport.deliver(id, b"x").await;
    }
    for _ in 0..3 {
        rx.recv().await.expect("message dispatched");
    }

    subscriber
        .close(CloseBehavior::NackImmediately, Duration::from_secs(1))
        .await
        .expect("close");

    let mut nacked = transport.modacked_ids(0);
    nacked.sort();
    assert_eq!(nacked, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    assert!(transport.acked_ids().is_empty());
    assert_eq!(transport.destroys(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_close_zero_timeout_short_circuits() {
    let transport = Arc::new(MockTransport::new());
    let (mut subscriber, mut rx) = open_subscriber(&transport).await;

    transport.deliver("a", b"x").await;
    rx.recv().await.expect("message dispatched");

    let started = Instant::now();
    subscriber
        .close(CloseBehavior::WaitForProcessing, Duration::ZERO)
        .await
        .expect("close");
    assert!(started.elapsed() < Duration::from_millis(50));
    assert_eq!(subscriber.inventory_size().await, 0);

    // the nack still goes out best-effort
    settle_tasks().await;
    assert_eq!(transport.modacked_ids(0), vec!["a".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_close_is_idempotent() {
    let transport = Arc::new(MockTransport::new());
    let (mut subscriber, _rx) = open_subscriber(&transport).await;

    subscriber
        .close(CloseBehavior::NackImmediately, Duration::from_secs(1))
        .await
        .expect("first close");
    subscriber
        .close(CloseBehavior::NackImmediately, Duration::from_secs(1))
        .await
        .expect("second close");
    assert_eq!(transport.destroys(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_delivery_during_close_is_nacked_without_dispatch() {
    let transport = Arc::new(MockTransport::new());
    let (mut subscriber, mut rx) = open_subscriber(&transport).await;

    transport.deliver("a", b"x").await;
    let message = rx.recv().await.expect("message dispatched");

    let closing = tokio::spawn(async move {
        subscriber
            .close(CloseBehavior::WaitForProcessing, Duration::from_secs(5))
            .await
            .expect("close");
    });

    // a delivery racing the close window is released, never dispatched
    tokio::time::sleep(Duration::from_millis(100)).await;
    transport.deliver("late", b"y").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    message.ack().await;
    closing.await.expect("close task");
    settle_tasks().await;

    assert!(transport
        .modacked_ids(0)
        .contains(&"late".to_string()));
    assert_eq!(transport.acked_ids(), vec!["a".to_string()]);
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_closed_watch_and_reopen_rejection() {
    let transport = Arc::new(MockTransport::new());
    let (mut subscriber, _rx) = open_subscriber(&transport).await;

    let closed = subscriber.closed();
    assert!(!*closed.borrow());
    subscriber
        .close(CloseBehavior::NackImmediately, Duration::from_secs(1))
        .await
        .expect("close");
    assert!(*closed.borrow());
    assert!(subscriber.open().await.is_err());
}
