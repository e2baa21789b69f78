//! Outbound envelope sinks

use std::sync::Arc;

use tokio::sync::mpsc;

use syncsocket_core::{SyncSocketError, SyncSocketResult};
use syncsocket_wire::Envelope;

/// Fire-and-forget outbound path.
///
/// One sink is shared by all channels of a connection, so implementations
/// must tolerate concurrent `send` calls.
pub trait EnvelopeSink: Send + Sync {
    fn send(&self, envelope: Envelope) -> SyncSocketResult<()>;
}

impl<T: EnvelopeSink + ?Sized> EnvelopeSink for Arc<T> {
    fn send(&self, envelope: Envelope) -> SyncSocketResult<()> {
        (**self).send(envelope)
    }
}

/// Receiving half of an [`MpscSink`]
pub type EnvelopeReceiver = mpsc::UnboundedReceiver<Envelope>;

/// Sink forwarding envelopes into an unbounded tokio channel
#[derive(Clone, Debug)]
pub struct MpscSink {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl MpscSink {
    pub fn new() -> (Self, EnvelopeReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (MpscSink { tx }, rx)
    }
}

impl EnvelopeSink for MpscSink {
    fn send(&self, envelope: Envelope) -> SyncSocketResult<()> {
        self.tx
            .send(envelope)
            .map_err(|_| SyncSocketError::TransportError("outbound receiver dropped".into()))
    }
}
