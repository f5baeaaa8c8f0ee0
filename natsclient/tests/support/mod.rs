//! A minimal in-process NATS server used to exercise the client's wire-level
//! behavior in integration tests, without depending on a real `nats-server`
//! binary. Subject matching is exact-or-trailing-wildcard (`foo.*`), which is
//! all these tests need.

use bytes::{Bytes, BytesMut};
use compio::buf::BufResult;
use compio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use compio::net::{TcpListener, TcpStream};
use nats_core::socket::split_plain;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct Sub {
    conn: u64,
    sid: u64,
    subject: String,
    out: flume::Sender<Bytes>,
}

#[derive(Default)]
struct Registry {
    subs: Vec<Sub>,
}

fn subject_matches(pattern: &str, subject: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => subject.starts_with(prefix),
        None => pattern == subject,
    }
}

/// Handle to a running fake server. Tests are short-lived processes, so the
/// background accept loop simply ends with them; there is no explicit
/// shutdown.
pub struct FakeServer {
    pub url: String,
}

/// Binds on an ephemeral port and starts accepting connections in the
/// background.
pub async fn spawn() -> FakeServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let registry = Arc::new(Mutex::new(Registry::default()));
    let next_conn = Arc::new(AtomicU64::new(1));

    compio::runtime::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let registry = registry.clone();
            let conn_id = next_conn.fetch_add(1, Ordering::SeqCst);
            compio::runtime::spawn(handle_connection(stream, registry, conn_id)).detach();
        }
    })
    .detach();

    FakeServer {
        url: format!("nats://{addr}"),
    }
}

async fn handle_connection(stream: TcpStream, registry: Arc<Mutex<Registry>>, conn_id: u64) {
    let Ok((mut read_half, mut write_half)) = split_plain(stream) else {
        return;
    };

    let (out_tx, out_rx) = flume::unbounded::<Bytes>();

    let writer = compio::runtime::spawn(async move {
        while let Ok(bytes) = out_rx.recv_async().await {
            let BufResult(result, _) = write_half.write_all(bytes).await;
            if result.is_err() {
                break;
            }
        }
    });

    let info = format!(
        "INFO {{\"server_id\":\"fake{conn_id}\",\"version\":\"2.10.0\",\"proto\":1,\
         \"host\":\"0.0.0.0\",\"port\":4222,\"headers\":true,\"max_payload\":1048576,\
         \"client_id\":{conn_id},\"connect_urls\":[]}}\r\n"
    );
    if out_tx.send(Bytes::from(info)).is_err() {
        return;
    }

    let mut buf = BytesMut::new();
    loop {
        let chunk = vec![0u8; 4096];
        let BufResult(result, chunk) = read_half.read(chunk).await;
        let Ok(n) = result else {
            break;
        };
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);

        while process_one(&mut buf, &registry, conn_id, &out_tx) {}
    }

    registry.lock().subs.retain(|s| s.conn != conn_id);
    drop(out_tx);
    let _ = writer.await;
}

/// Tries to consume exactly one client frame from the front of `buf`. Returns
/// `true` if it made progress (the caller should try again immediately),
/// `false` if more bytes are needed before it can continue.
fn process_one(
    buf: &mut BytesMut,
    registry: &Arc<Mutex<Registry>>,
    conn_id: u64,
    out_tx: &flume::Sender<Bytes>,
) -> bool {
    let Some(line_end) = find_crlf(buf) else {
        return false;
    };
    let line = buf.split_to(line_end).freeze();
    consume_trailing_crlf(buf);

    let text = String::from_utf8_lossy(&line).into_owned();
    let mut parts = text.splitn(2, char::is_whitespace);
    let verb = parts.next().unwrap_or_default().to_ascii_uppercase();
    let rest = parts.next().unwrap_or_default().trim();
    let tokens: Vec<&str> = rest.split_whitespace().collect();

    match verb.as_str() {
        "CONNECT" | "PONG" | "+OK" => {}
        "PING" => {
            let _ = out_tx.send(Bytes::from_static(b"PONG\r\n"));
        }
        "SUB" => handle_sub(&tokens, registry, conn_id, out_tx),
        "UNSUB" => {
            if let Some(Ok(sid)) = tokens.first().map(|s| s.parse()) {
                registry.lock().subs.retain(|s| !(s.conn == conn_id && s.sid == sid));
            }
        }
        "PUB" => {
            let (subject, reply_to, size) = match tokens.as_slice() {
                [subject, size] => (*subject, None, size.parse().ok()),
                [subject, reply_to, size] => (*subject, Some(*reply_to), size.parse().ok()),
                _ => return true,
            };
            let Some(size) = size else { return true };
            if buf.len() < size + 2 {
                restore_frame(buf, &line);
                return false;
            }
            let payload = buf.split_to(size).freeze();
            consume_trailing_crlf(buf);
            publish(subject, reply_to, None, payload, registry);
        }
        "HPUB" => {
            let (subject, reply_to, hdr_len, total_len) = match tokens.as_slice() {
                [subject, hdr_len, total_len] => (*subject, None, hdr_len.parse().ok(), total_len.parse().ok()),
                [subject, reply_to, hdr_len, total_len] => {
                    (*subject, Some(*reply_to), hdr_len.parse().ok(), total_len.parse().ok())
                }
                _ => return true,
            };
            let (Some(hdr_len), Some(total_len)) = (hdr_len, total_len) else {
                return true;
            };
            if buf.len() < total_len + 2 {
                restore_frame(buf, &line);
                return false;
            }
            let headers = buf.split_to(hdr_len).freeze();
            let payload = buf.split_to(total_len - hdr_len).freeze();
            consume_trailing_crlf(buf);
            publish(subject, reply_to, Some(headers), payload, registry);
        }
        _ => {}
    }
    true
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn consume_trailing_crlf(buf: &mut BytesMut) {
    if buf.len() >= 2 {
        let _ = buf.split_to(2);
    }
}

/// Puts a control line (without its own payload) back at the front of `buf`
/// because its binary body hasn't fully arrived yet.
fn restore_frame(buf: &mut BytesMut, line: &Bytes) {
    let mut rebuilt = BytesMut::with_capacity(line.len() + 2 + buf.len());
    rebuilt.extend_from_slice(line);
    rebuilt.extend_from_slice(b"\r\n");
    rebuilt.extend_from_slice(buf);
    *buf = rebuilt;
}

fn handle_sub(tokens: &[&str], registry: &Arc<Mutex<Registry>>, conn_id: u64, out_tx: &flume::Sender<Bytes>) {
    let (subject, sid) = match tokens {
        [subject, sid] => (*subject, *sid),
        [subject, _group, sid] => (*subject, *sid),
        _ => return,
    };
    let Ok(sid) = sid.parse() else { return };
    registry.lock().subs.push(Sub {
        conn: conn_id,
        sid,
        subject: subject.to_string(),
        out: out_tx.clone(),
    });
}

fn publish(
    subject: &str,
    reply_to: Option<&str>,
    headers: Option<Bytes>,
    payload: Bytes,
    registry: &Arc<Mutex<Registry>>,
) {
    let matching: Vec<(u64, flume::Sender<Bytes>)> = registry
        .lock()
        .subs
        .iter()
        .filter(|s| subject_matches(&s.subject, subject))
        .map(|s| (s.sid, s.out.clone()))
        .collect();

    for (sid, out) in matching {
        let mut frame = BytesMut::new();
        if let Some(headers) = &headers {
            let total_len = headers.len() + payload.len();
            match reply_to {
                Some(r) => frame.extend_from_slice(
                    format!("HMSG {subject} {sid} {r} {} {total_len}\r\n", headers.len()).as_bytes(),
                ),
                None => frame.extend_from_slice(
                    format!("HMSG {subject} {sid} {} {total_len}\r\n", headers.len()).as_bytes(),
                ),
            }
            frame.extend_from_slice(headers);
        } else {
            match reply_to {
                Some(r) => frame
                    .extend_from_slice(format!("MSG {subject} {sid} {r} {}\r\n", payload.len()).as_bytes()),
                None => frame.extend_from_slice(format!("MSG {subject} {sid} {}\r\n", payload.len()).as_bytes()),
            }
        }
        frame.extend_from_slice(&payload);
        frame.extend_from_slice(b"\r\n");
        let _ = out.send(frame.freeze());
    }
}
