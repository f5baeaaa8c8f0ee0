//! Streaming NATS protocol decoder.
//!
//! The wire protocol is line-based control plane with CRLF terminators, plus
//! a binary payload body for `MSG`/`HMSG`. This plays the same role as this
//! codebase's `ZmtpDecoder` (stateful, partial-read tolerant, fast-path
//! zero-copy via `SegmentedBuffer`) but the framing itself is textual instead
//! of length-prefixed-binary, so the decoder hunts for `\r\n` instead of
//! reading a fixed-size header.

use bytes::Bytes;
use nats_core::buffer::SegmentedBuffer;
use nats_core::error::NatsError;

/// A decoded server operation.
#[derive(Debug, Clone)]
pub enum ServerOp {
    /// `INFO <json>` — the JSON payload, unparsed.
    Info(Bytes),
    Ping,
    Pong,
    Ok,
    /// `-ERR <message>` with surrounding quotes stripped.
    Err(String),
    Msg {
        subject: Bytes,
        sid: u64,
        reply_to: Option<Bytes>,
        payload: Bytes,
    },
    Hmsg {
        subject: Bytes,
        sid: u64,
        reply_to: Option<Bytes>,
        headers: Bytes,
        payload: Bytes,
    },
}

#[derive(Debug)]
enum Pending {
    Msg {
        subject: Bytes,
        sid: u64,
        reply_to: Option<Bytes>,
        needed: usize,
    },
    Hmsg {
        subject: Bytes,
        sid: u64,
        reply_to: Option<Bytes>,
        hdr_len: usize,
        total_len: usize,
    },
}

/// Stateful NATS control-plane decoder.
#[derive(Debug, Default)]
pub struct NatsDecoder {
    pending: Option<Pending>,
}

impl NatsDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self { pending: None }
    }

    /// Decode a single server operation from `src`.
    ///
    /// Returns `Ok(Some(op))` when a complete operation was available,
    /// `Ok(None)` when more bytes are needed, and `Err` on malformed input.
    /// Callers should loop on this until `Ok(None)` to drain everything the
    /// buffer currently holds.
    pub fn decode(&mut self, src: &mut SegmentedBuffer) -> Result<Option<ServerOp>, NatsError> {
        if let Some(pending) = self.pending.take() {
            return self.resume_payload(pending, src);
        }

        let Some(line_end) = src.find(b"\r\n") else {
            return Ok(None);
        };
        let line = src
            .take_bytes(line_end)
            .expect("find() guarantees the prefix is buffered");
        src.advance(2);

        self.parse_line(&line)
    }

    fn resume_payload(
        &mut self,
        pending: Pending,
        src: &mut SegmentedBuffer,
    ) -> Result<Option<ServerOp>, NatsError> {
        match pending {
            Pending::Msg {
                subject,
                sid,
                reply_to,
                needed,
            } => {
                if src.len() < needed + 2 {
                    self.pending = Some(Pending::Msg {
                        subject,
                        sid,
                        reply_to,
                        needed,
                    });
                    return Ok(None);
                }
                let payload = src.take_bytes(needed).expect("length checked above");
                src.advance(2);
                Ok(Some(ServerOp::Msg {
                    subject,
                    sid,
                    reply_to,
                    payload,
                }))
            }
            Pending::Hmsg {
                subject,
                sid,
                reply_to,
                hdr_len,
                total_len,
            } => {
                if total_len < hdr_len {
                    return Err(NatsError::protocol("HMSG total_len smaller than hdr_len"));
                }
                if src.len() < total_len + 2 {
                    self.pending = Some(Pending::Hmsg {
                        subject,
                        sid,
                        reply_to,
                        hdr_len,
                        total_len,
                    });
                    return Ok(None);
                }
                let headers = src.take_bytes(hdr_len).expect("length checked above");
                let payload = src
                    .take_bytes(total_len - hdr_len)
                    .expect("length checked above");
                src.advance(2);
                validate_headers(&headers)?;
                Ok(Some(ServerOp::Hmsg {
                    subject,
                    sid,
                    reply_to,
                    headers,
                    payload,
                }))
            }
        }
    }

    fn parse_line(&mut self, line: &Bytes) -> Result<Option<ServerOp>, NatsError> {
        let text = std::str::from_utf8(line)
            .map_err(|_| NatsError::protocol("non-utf8 control line"))?;

        let (verb, rest) = match text.find(|c: char| c.is_ascii_whitespace()) {
            Some(idx) => (&text[..idx], text[idx..].trim_start()),
            None => (text, ""),
        };

        match verb.to_ascii_uppercase().as_str() {
            "INFO" => Ok(Some(ServerOp::Info(Bytes::copy_from_slice(
                rest.as_bytes(),
            )))),
            "PING" => Ok(Some(ServerOp::Ping)),
            "PONG" => Ok(Some(ServerOp::Pong)),
            "+OK" => Ok(Some(ServerOp::Ok)),
            "-ERR" => Ok(Some(ServerOp::Err(
                rest.trim_matches('\'').trim().to_string(),
            ))),
            "MSG" => self.parse_msg(rest),
            "HMSG" => self.parse_hmsg(rest),
            other => Err(NatsError::protocol(format!("unknown verb: {other}"))),
        }
    }

    fn parse_msg(&mut self, args: &str) -> Result<Option<ServerOp>, NatsError> {
        let tokens: Vec<&str> = args.split_ascii_whitespace().collect();
        let (subject, sid, reply_to, size) = match tokens.as_slice() {
            [subject, sid, size] => (*subject, *sid, None, *size),
            [subject, sid, reply_to, size] => (*subject, *sid, Some(*reply_to), *size),
            _ => return Err(NatsError::protocol("malformed MSG arguments")),
        };

        let sid: u64 = sid
            .parse()
            .map_err(|_| NatsError::protocol("malformed MSG sid"))?;
        let needed: usize = size
            .parse()
            .map_err(|_| NatsError::protocol("malformed MSG size"))?;

        self.pending = Some(Pending::Msg {
            subject: Bytes::copy_from_slice(subject.as_bytes()),
            sid,
            reply_to: reply_to.map(|r| Bytes::copy_from_slice(r.as_bytes())),
            needed,
        });
        Ok(None)
    }

    fn parse_hmsg(&mut self, args: &str) -> Result<Option<ServerOp>, NatsError> {
        let tokens: Vec<&str> = args.split_ascii_whitespace().collect();
        let (subject, sid, reply_to, hdr_len, total_len) = match tokens.as_slice() {
            [subject, sid, hdr_len, total_len] => (*subject, *sid, None, *hdr_len, *total_len),
            [subject, sid, reply_to, hdr_len, total_len] => {
                (*subject, *sid, Some(*reply_to), *hdr_len, *total_len)
            }
            _ => return Err(NatsError::protocol("malformed HMSG arguments")),
        };

        let sid: u64 = sid
            .parse()
            .map_err(|_| NatsError::protocol("malformed HMSG sid"))?;
        let hdr_len: usize = hdr_len
            .parse()
            .map_err(|_| NatsError::protocol("malformed HMSG header size"))?;
        let total_len: usize = total_len
            .parse()
            .map_err(|_| NatsError::protocol("malformed HMSG total size"))?;

        self.pending = Some(Pending::Hmsg {
            subject: Bytes::copy_from_slice(subject.as_bytes()),
            sid,
            reply_to: reply_to.map(|r| Bytes::copy_from_slice(r.as_bytes())),
            hdr_len,
            total_len,
        });
        Ok(None)
    }
}

/// Validates the HMSG header block grammar conservatively: a `NATS/1.0`
/// status line followed by zero or more `Key: Value` lines, CRLF-terminated
/// throughout and closed by the blank-line CRLF the header-length field
/// already accounts for. Unknown or malformed forms are a `ProtocolError`
/// rather than a silent pass-through.
fn validate_headers(headers: &Bytes) -> Result<(), NatsError> {
    if headers.len() < 4 || !headers.ends_with(b"\r\n\r\n") {
        return Err(NatsError::protocol(
            "HMSG header block missing terminating CRLFCRLF",
        ));
    }
    let text = std::str::from_utf8(headers)
        .map_err(|_| NatsError::protocol("HMSG header block is not valid UTF-8"))?;

    let mut lines = text.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    if status_line != "NATS/1.0" && !status_line.starts_with("NATS/1.0 ") {
        return Err(NatsError::protocol(format!(
            "unsupported HMSG header version line: {status_line:?}"
        )));
    }

    for line in lines {
        if line.is_empty() {
            continue;
        }
        if line.find(':').is_none() {
            return Err(NatsError::protocol(format!(
                "malformed HMSG header line: {line:?}"
            )));
        }
    }
    Ok(())
}
