//! Decode dispatch.
//!
//! Decoding runs off the caller's stack on a named worker thread; the result
//! comes back over a bounded channel and is observed on the group's next
//! poll. `DecodeMode::Inline` decodes on the caller's stack instead but still
//! delivers through the channel, which keeps load completion on a later
//! scheduling turn and makes tests deterministic.

use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver};
use polyvox_core::{DecodedBuffer, Decoder, Result};
use tracing::warn;

/// Where decode work runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeMode {
    /// A short-lived worker thread per decode.
    #[default]
    Threaded,
    /// Decode synchronously on the caller's stack.
    Inline,
}

/// Kick off a decode and return the channel the result arrives on.
pub(crate) fn dispatch(
    mode: DecodeMode,
    decoder: Arc<dyn Decoder>,
    data: Bytes,
) -> Receiver<Result<DecodedBuffer>> {
    let (tx, rx) = bounded(1);
    match mode {
        DecodeMode::Inline => {
            let _ = tx.send(decoder.decode(&data));
        }
        DecodeMode::Threaded => {
            let worker_decoder = decoder.clone();
            let worker_data = data.clone();
            let spawn = thread::Builder::new()
                .name("polyvox-decode".into())
                .spawn(move || {
                    let _ = tx.send(worker_decoder.decode(&worker_data));
                });
            if let Err(err) = spawn {
                warn!(%err, "decode thread unavailable, decoding inline");
                // The sender moved into the failed closure is gone; redo the
                // whole dispatch inline.
                return dispatch(DecodeMode::Inline, decoder, data);
            }
        }
    }
    rx
}
