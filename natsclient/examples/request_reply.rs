//! Registers a request handler and then calls it, printing the round trip.
//!
//! Requires a NATS server reachable at `127.0.0.1:4222`. Run with:
//!
//! ```text
//! cargo run --example request_reply
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

    let _responder = conn.subscribe_request(
        "demo.echo",
        Arc::new(|msg| {
            tracing::info!("echoing {} bytes", msg.payload.len());
            Some(msg.payload)
        }),
    );

    compio::time::sleep(Duration::from_millis(100)).await;

    let response = conn
        .request("demo.echo", Bytes::from_static(b"ping"))
        .await?;
    println!("reply: {}", String::from_utf8_lossy(&response.payload));

    let rtt = conn.ping().await?;
    println!("server round trip: {rtt:?}");

    conn.dispose().await;
    Ok(())
}
