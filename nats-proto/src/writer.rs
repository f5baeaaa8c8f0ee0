//! Pipelined writer loop (§4.2).
//!
//! Single consumer of the priority list and the persistent command queue.
//! Commands are serialized into one shared buffer and flushed to the socket
//! as a batch; a command's completion fires only once the bytes containing
//! it are known to have reached the socket (invariant 4). A failing flush
//! fails every command in that batch with `WriteFailed` and the loop exits —
//! the caller observes this as the signal to tear the socket down and start
//! reconnecting (invariant 5).
//!
//! Unlike this codebase's actor-style loops, there is no `try_recv` +
//! `sleep` busy-poll here: the writer has exactly one thing to wait on (its
//! own queue), so `recv_async` suffices.

use bytes::BytesMut;
use compio::buf::BufResult;
use compio::io::{AsyncWrite, AsyncWriteExt};
use nats_core::alloc::IoBytes;
use nats_core::error::NatsError;
use nats_core::pool::Rented;
use nats_core::poison::PoisonGuard;
use tracing::warn;

use crate::command::{CommandCompletion, CommandQueueReceiver, CommandSlot};

pub struct WriterConfig {
    pub write_high_water_mark: usize,
}

/// Runs until the queue's senders are all dropped (clean shutdown, `Ok`) or a
/// socket write fails (`Err`, triggers reconnect).
pub async fn run_writer_loop<S>(
    mut socket: S,
    priority: Vec<Rented<CommandSlot>>,
    queue: CommandQueueReceiver,
    config: WriterConfig,
) -> Result<(), NatsError>
where
    S: AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::with_capacity(config.write_high_water_mark.max(4096));
    let mut completions: Vec<CommandCompletion> = Vec::new();
    let mut poisoned = false;

    for slot in priority {
        serialize_into(slot, &mut buffer, &mut completions);
    }
    flush(&mut socket, &mut buffer, &mut completions, &mut poisoned).await?;

    loop {
        let Ok(slot) = queue.recv_async().await else {
            return Ok(());
        };
        serialize_into(slot, &mut buffer, &mut completions);

        while buffer.len() < config.write_high_water_mark {
            match queue.try_recv() {
                Ok(slot) => serialize_into(slot, &mut buffer, &mut completions),
                Err(_) => break,
            }
        }

        flush(&mut socket, &mut buffer, &mut completions, &mut poisoned).await?;
    }
}

fn serialize_into(
    mut slot: Rented<CommandSlot>,
    buffer: &mut BytesMut,
    completions: &mut Vec<CommandCompletion>,
) {
    match slot.command.serialize(buffer) {
        Ok(()) => {
            if let Some(completion) = slot.completion.take() {
                completions.push(completion);
            }
        }
        Err(err) => {
            warn!(error = %err, "command serialization failed, skipping");
            if let Some(completion) = slot.completion.take() {
                let _ = completion.send(Err(NatsError::protocol(err.to_string())));
            }
        }
    }
}

async fn flush<S>(
    socket: &mut S,
    buffer: &mut BytesMut,
    completions: &mut Vec<CommandCompletion>,
    poisoned: &mut bool,
) -> Result<(), NatsError>
where
    S: AsyncWrite + Unpin,
{
    if buffer.is_empty() {
        return Ok(());
    }

    let guard = PoisonGuard::new(poisoned);
    let bytes = buffer.split().freeze();
    let BufResult(result, _) = socket.write_all(IoBytes::new(bytes)).await;

    match result {
        Ok(()) => {
            guard.disarm();
            for completion in completions.drain(..) {
                let _ = completion.send(Ok(()));
            }
            Ok(())
        }
        Err(io_err) => {
            let failure = NatsError::WriteFailed(io_err.to_string());
            for completion in completions.drain(..) {
                let _ = completion.send(Err(NatsError::WriteFailed(io_err.to_string())));
            }
            Err(failure)
        }
    }
}
