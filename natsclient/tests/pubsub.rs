mod support;

use bytes::Bytes;
use natsclient::{ConnectOptions, Connection, PublishEntry};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[compio::test]
async fn publish_is_delivered_to_subscriber() {
    let server = support::spawn().await;
    let conn = Connection::new(ConnectOptions::new().with_seed_urls(vec![server.url.clone()]));
    conn.connect().await.expect("connect");

    let received = Arc::new(Mutex::new(Vec::new()));
    let received2 = received.clone();
    let _sub = conn.subscribe(
        "greetings",
        None,
        Arc::new(move |msg| received2.lock().push(msg.payload)),
    );

    // Give the SUB a moment to reach the server before publishing.
    compio::time::sleep(Duration::from_millis(50)).await;

    conn.publish_confirmed("greetings", Bytes::from_static(b"hello"))
        .await
        .expect("publish");

    compio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(received.lock().as_slice(), [Bytes::from_static(b"hello")]);
    conn.dispose().await;
}

#[compio::test]
async fn publish_batch_delivers_every_entry() {
    let server = support::spawn().await;
    let conn = Connection::new(ConnectOptions::new().with_seed_urls(vec![server.url.clone()]));
    conn.connect().await.expect("connect");

    let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let count2 = count.clone();
    let _sub = conn.subscribe(
        "orders.*",
        None,
        Arc::new(move |_msg| {
            count2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }),
    );

    compio::time::sleep(Duration::from_millis(50)).await;

    let entries = vec![
        PublishEntry {
            subject: "orders.1".into(),
            reply_to: None,
            headers: None,
            payload: Bytes::from_static(b"a"),
        },
        PublishEntry {
            subject: "orders.2".into(),
            reply_to: None,
            headers: None,
            payload: Bytes::from_static(b"b"),
        },
    ];
    conn.publish_batch_confirmed(entries).await.expect("batch");

    compio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 2);
    conn.dispose().await;
}

#[compio::test]
async fn unsubscribe_stops_delivery() {
    let server = support::spawn().await;
    let conn = Connection::new(ConnectOptions::new().with_seed_urls(vec![server.url.clone()]));
    conn.connect().await.expect("connect");

    let received = Arc::new(Mutex::new(Vec::new()));
    let received2 = received.clone();
    let sub = conn.subscribe(
        "news",
        None,
        Arc::new(move |msg| received2.lock().push(msg.payload)),
    );

    compio::time::sleep(Duration::from_millis(50)).await;
    drop(sub);
    compio::time::sleep(Duration::from_millis(50)).await;

    conn.publish_confirmed("news", Bytes::from_static(b"ignored"))
        .await
        .expect("publish");
    compio::time::sleep(Duration::from_millis(50)).await;

    assert!(received.lock().is_empty());
    conn.dispose().await;
}
