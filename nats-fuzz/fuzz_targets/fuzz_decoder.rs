#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use nats_core::buffer::SegmentedBuffer;
use nats_proto::codec::NatsDecoder;

/// Feeds the fuzz input to the streaming decoder both as a single chunk and
/// split in half, checking the decoder never panics on arbitrary bytes (§8
/// "parser round-trip": a valid frame sequence split at any boundary must
/// decode to the same events as the unsplit input).
fuzz_target!(|data: &[u8]| {
    let whole = decode_all(&[data]);

    if data.len() > 1 {
        let mid = data.len() / 2;
        let split = decode_all(&[&data[..mid], &data[mid..]]);
        assert_eq!(whole, split);
    }
});

fn decode_all(chunks: &[&[u8]]) -> Vec<String> {
    let mut buffer = SegmentedBuffer::new();
    let mut decoder = NatsDecoder::new();
    let mut ops = Vec::new();

    for chunk in chunks {
        buffer.push(Bytes::copy_from_slice(chunk));
        loop {
            match decoder.decode(&mut buffer) {
                Ok(Some(op)) => ops.push(format!("{op:?}")),
                Ok(None) => break,
                Err(_) => return ops,
            }
        }
    }

    ops
}
