//! Throughput benchmarks: messages per second.
//!
//! Measures publish + subscriber-delivery round trips against an in-process
//! fake NATS server (the same wire-level stand-in used by the integration
//! tests), since no real `nats-server` binary is assumed to be available in
//! the benchmarking environment.

use bytes::{Bytes, BytesMut};
use compio::buf::BufResult;
use compio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use compio::net::{TcpListener, TcpStream};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use flume::Sender;
use nats_core::socket::split_plain;
use natsclient::{ConnectOptions, Connection};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const MESSAGE_SIZES: &[usize] = &[64, 256, 1024, 4096, 16384];
const MESSAGE_COUNT: usize = 2_000;

/// A single-subject echo server: every `PUB`/`HPUB` it parses is re-emitted
/// to whichever `sid` last subscribed, ignoring subject matching entirely.
/// Good enough for throughput measurement, not for correctness tests (see
/// `tests/support/mod.rs` for the subject-aware version used there).
async fn spawn_echo_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    compio::runtime::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        handle(stream).await;
    })
    .detach();

    format!("nats://{addr}")
}

async fn handle(stream: TcpStream) {
    let (mut read_half, mut write_half) = split_plain(stream).unwrap();
    let (out_tx, out_rx) = flume::unbounded::<Bytes>();
    let sid = Arc::new(Mutex::new(None::<u64>));

    let writer = compio::runtime::spawn(async move {
        while let Ok(bytes) = out_rx.recv_async().await {
            let BufResult(result, _) = write_half.write_all(bytes).await;
            if result.is_err() {
                break;
            }
        }
    });

    let _ = out_tx.send(Bytes::from_static(
        b"INFO {\"server_id\":\"bench\",\"version\":\"2.10.0\",\"proto\":1,\
          \"host\":\"0.0.0.0\",\"port\":4222,\"headers\":true,\"max_payload\":1048576,\
          \"client_id\":1,\"connect_urls\":[]}\r\n",
    ));

    let mut buf = BytesMut::new();
    loop {
        let chunk = vec![0u8; 65536];
        let BufResult(result, chunk) = read_half.read(chunk).await;
        let Ok(n) = result else { break };
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        while consume_one(&mut buf, &sid, &out_tx) {}
    }

    drop(out_tx);
    let _ = writer.await;
}

fn consume_one(buf: &mut BytesMut, sid: &Arc<Mutex<Option<u64>>>, out_tx: &Sender<Bytes>) -> bool {
    let Some(line_end) = buf.windows(2).position(|w| w == b"\r\n") else {
        return false;
    };
    let line = buf.split_to(line_end).freeze();
    let _ = buf.split_to(2);

    let text = String::from_utf8_lossy(&line).into_owned();
    let mut parts = text.splitn(2, char::is_whitespace);
    let verb = parts.next().unwrap_or_default().to_ascii_uppercase();
    let rest = parts.next().unwrap_or_default().trim();
    let tokens: Vec<&str> = rest.split_whitespace().collect();

    match verb.as_str() {
        "SUB" => {
            if let Some(Ok(value)) = tokens.get(tokens.len().saturating_sub(1)).map(|s| s.parse()) {
                *sid.lock() = Some(value);
            }
        }
        "PUB" => {
            let Some(&size_tok) = tokens.last() else { return true };
            let Ok(size) = size_tok.parse::<usize>() else { return true };
            if buf.len() < size + 2 {
                let mut rebuilt = BytesMut::with_capacity(line.len() + 2 + buf.len());
                rebuilt.extend_from_slice(&line);
                rebuilt.extend_from_slice(b"\r\n");
                rebuilt.extend_from_slice(buf);
                *buf = rebuilt;
                return false;
            }
            let payload = buf.split_to(size).freeze();
            let _ = buf.split_to(2);
            if let Some(sid) = *sid.lock() {
                let mut frame = BytesMut::new();
                frame.extend_from_slice(format!("MSG bench.echo {sid} {size}\r\n").as_bytes());
                frame.extend_from_slice(&payload);
                frame.extend_from_slice(b"\r\n");
                let _ = out_tx.send(frame.freeze());
            }
        }
        _ => {}
    }
    true
}

fn publish_subscribe_throughput(c: &mut Criterion) {
    natsclient::dev_tracing::init_tracing();
    let mut group = c.benchmark_group("throughput/natsclient/pub_sub");
    group.measurement_time(Duration::from_secs(15));
    group.sample_size(10);

    // Creating/dropping many io_uring runtimes in a tight loop can exhaust
    // kernel resources. Reuse a single runtime for all iterations.
    let rt = compio::runtime::Runtime::new().unwrap();

    for &size in MESSAGE_SIZES {
        group.throughput(Throughput::Bytes((size * MESSAGE_COUNT) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let payload = Bytes::from(vec![0u8; size]);

            b.iter(|| {
                rt.block_on(async {
                    let url = spawn_echo_server().await;
                    let conn = Connection::new(ConnectOptions::new().with_seed_urls(vec![url]));
                    conn.connect().await.unwrap();

                    let received = Arc::new(AtomicUsize::new(0));
                    let received2 = received.clone();
                    let _sub = conn.subscribe(
                        "bench.echo",
                        None,
                        Arc::new(move |_msg| {
                            received2.fetch_add(1, Ordering::Relaxed);
                        }),
                    );
                    compio::time::sleep(Duration::from_millis(20)).await;

                    for _ in 0..MESSAGE_COUNT {
                        conn.publish("bench.echo", black_box(payload.clone())).unwrap();
                    }

                    while received.load(Ordering::Relaxed) < MESSAGE_COUNT {
                        compio::time::sleep(Duration::from_millis(1)).await;
                    }

                    conn.dispose().await;
                });
            });
        });
    }
    group.finish();
}

criterion_group!(
    name = benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(30))
        .warm_up_time(Duration::from_secs(2))
        .sample_size(10);
    targets = publish_subscribe_throughput
);
criterion_main!(benches);
