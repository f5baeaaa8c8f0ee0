//! Publishes a handful of messages to a subject and prints whatever a
//! subscriber on the same connection receives back.
//!
//! Requires a NATS server reachable at `127.0.0.1:4222` (the default seed
//! URL). Run with:
//!
//! ```text
//! cargo run --example pubsub
//! ```

use bytes::Bytes;
use natsclient::{ConnectOptions, Connection};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::FmtSubscriber;

#[compio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(tracing::Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let conn = Connection::new(ConnectOptions::new());
    conn.connect().await?;
    tracing::info!("connected");

    let _sub = conn.subscribe(
        "demo.greetings",
        None,
        Arc::new(|msg| {
            tracing::info!(subject = ?msg.subject, "received {} bytes", msg.payload.len());
            println!("< {}", String::from_utf8_lossy(&msg.payload));
        }),
    );

    // Give the SUB frame time to reach the server before we publish.
    compio::time::sleep(Duration::from_millis(100)).await;

    for i in 0..5 {
        let payload = Bytes::from(format!("hello #{i}"));
        conn.publish_confirmed("demo.greetings", payload).await?;
        println!("> hello #{i}");
    }

    compio::time::sleep(Duration::from_millis(200)).await;
    conn.dispose().await;
    Ok(())
}
