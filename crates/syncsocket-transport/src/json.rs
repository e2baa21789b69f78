//! JSON text frames
//!
//! Socket adapters that exchange envelopes as JSON text plug in here: frames
//! out through a [`JsonSink`], frames in through [`start_decode_loop`].

use tokio::sync::mpsc;

use syncsocket_core::{SyncSocketError, SyncSocketResult};
use syncsocket_wire::Envelope;

use crate::EnvelopeSink;

/// Inbound text frames
pub type FrameReceiver = mpsc::Receiver<String>;

/// Decoded inbound envelopes
pub type InboundReceiver = mpsc::Receiver<Envelope>;

/// Sink encoding envelopes as JSON text frames
#[derive(Clone, Debug)]
pub struct JsonSink {
    tx: mpsc::UnboundedSender<String>,
}

impl JsonSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (JsonSink { tx }, rx)
    }
}

impl EnvelopeSink for JsonSink {
    fn send(&self, envelope: Envelope) -> SyncSocketResult<()> {
        let frame = envelope.to_json()?;
        self.tx
            .send(frame)
            .map_err(|_| SyncSocketError::TransportError("frame receiver dropped".into()))
    }
}

/// Start a background loop decoding text frames into envelopes.
///
/// Malformed frames are logged and skipped. The loop ends when either side
/// is dropped.
pub fn start_decode_loop(mut frames: FrameReceiver, buffer_size: usize) -> InboundReceiver {
    let (tx, rx) = mpsc::channel(buffer_size);

    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            match Envelope::from_json(&frame) {
                Ok(envelope) => {
                    if tx.send(envelope).await.is_err() {
                        break; // Receiver dropped
                    }
                }
                Err(e) => {
                    tracing::warn!("dropping inbound frame: {}", e);
                }
            }
        }
    });

    rx
}
