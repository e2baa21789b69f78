//! Connection facade
//!
//! Owns the outbound sink shared by every channel, the registry of open
//! channels keyed by id, and inbound dispatch. Joining a channel on the
//! server (the RPC) happens elsewhere; [`Connection::open_channel`] is the
//! local half once the server has answered with the channel's privileges.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use syncsocket_core::{ChannelId, SyncSocketError, SyncSocketResult};
use syncsocket_time::{ClockBinder, SystemClock, WallClock};
use syncsocket_transport::EnvelopeSink;
use syncsocket_wire::Envelope;

use crate::{Channel, ChannelSpec, ConnectionConfig};

/// Topic on the `_SYSTEM` channel that ends the connection
pub const DISCONNECT_TOPIC: &str = "disconnect";

/// Client connection
pub struct Connection {
    config: ConnectionConfig,
    sink: Arc<dyn EnvelopeSink>,
    binder: Arc<dyn ClockBinder>,
    clock: Arc<dyn WallClock>,
    channels: RwLock<HashMap<ChannelId, Channel>>,
    closed: AtomicBool,
}

impl Connection {
    pub fn new(
        config: ConnectionConfig,
        sink: Arc<dyn EnvelopeSink>,
        binder: Arc<dyn ClockBinder>,
    ) -> Self {
        Self::with_clock(config, sink, binder, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: ConnectionConfig,
        sink: Arc<dyn EnvelopeSink>,
        binder: Arc<dyn ClockBinder>,
        clock: Arc<dyn WallClock>,
    ) -> Self {
        Connection {
            config,
            sink,
            binder,
            clock,
            channels: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Start a channel, or return the one already open under the same id
    pub fn open_channel(&self, spec: ChannelSpec) -> SyncSocketResult<Channel> {
        if self.is_closed() {
            return Err(SyncSocketError::ConnectionClosed);
        }

        let mut channels = self.channels.write();
        if let Some(existing) = channels.get(&spec.channel_id) {
            return Ok(existing.clone());
        }

        let id = spec.channel_id.clone();
        let channel = Channel::spawn(
            spec,
            self.config.channel.clone(),
            Arc::clone(&self.clock),
            Arc::clone(&self.binder),
            Arc::clone(&self.sink),
        );
        tracing::debug!(channel = %id, "channel opened");
        channels.insert(id, channel.clone());
        Ok(channel)
    }

    pub fn channel(&self, id: &ChannelId) -> Option<Channel> {
        self.channels.read().get(id).cloned()
    }

    pub fn channel_ids(&self) -> Vec<ChannelId> {
        let mut ids: Vec<_> = self.channels.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Close a channel and forget it
    pub fn leave(&self, id: &ChannelId) -> SyncSocketResult<()> {
        let channel = self
            .channels
            .write()
            .remove(id)
            .ok_or_else(|| SyncSocketError::UnknownChannel(id.clone()))?;
        channel.close();
        tracing::debug!(channel = %id, "channel left");
        Ok(())
    }

    /// Route an inbound envelope to its channel.
    ///
    /// `_SYSTEM` envelopes are handled here. Envelopes for channels that are
    /// not open are dropped and reported as `UnknownChannel`.
    pub fn dispatch(&self, envelope: Envelope) -> SyncSocketResult<()> {
        if self.is_closed() {
            return Err(SyncSocketError::ConnectionClosed);
        }

        if envelope.channel_id.is_system() {
            if envelope.topic == DISCONNECT_TOPIC {
                tracing::debug!("server requested disconnect");
                self.close();
            } else {
                tracing::debug!(topic = %envelope.topic, "ignoring system message");
            }
            return Ok(());
        }

        match self.channel(&envelope.channel_id) {
            Some(channel) => channel.inject_message(envelope),
            None => {
                tracing::debug!(channel = %envelope.channel_id, topic = %envelope.topic, "no such channel");
                Err(SyncSocketError::UnknownChannel(envelope.channel_id))
            }
        }
    }

    /// Dispatch inbound envelopes until the stream ends or the connection
    /// closes
    pub async fn run_inbound(&self, mut inbound: mpsc::Receiver<Envelope>) {
        while let Some(envelope) = inbound.recv().await {
            match self.dispatch(envelope) {
                Ok(()) => {}
                Err(SyncSocketError::ConnectionClosed) => break,
                Err(e) => tracing::warn!("inbound envelope dropped: {}", e),
            }
            if self.is_closed() {
                break;
            }
        }
    }

    /// Close every channel; further opens and dispatches fail
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for (_, channel) in self.channels.write().drain() {
            channel.close();
        }
        tracing::debug!(instance = %self.config.instance_id, "connection closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use syncsocket_core::{ChannelState, SyncResult, TimeserverId};
    use syncsocket_time::{ClockOffsetProvider, SyncFuture};
    use syncsocket_transport::{EnvelopeReceiver, MpscSink};

    struct Zero;

    impl ClockOffsetProvider for Zero {
        fn sync(&self) -> SyncFuture<'_> {
            Box::pin(async { SyncResult::success(0.0, 1.0) })
        }
    }

    fn connection() -> (Connection, EnvelopeReceiver) {
        let (sink, outbound) = MpscSink::new();
        let binder = |_: &TimeserverId| -> Arc<dyn ClockOffsetProvider> { Arc::new(Zero) };
        let connection = Connection::new(ConnectionConfig::default(), Arc::new(sink), Arc::new(binder));
        (connection, outbound)
    }

    #[tokio::test]
    async fn test_open_channel_is_idempotent() {
        let (connection, _outbound) = connection();

        let a = connection.open_channel(ChannelSpec::publisher("a")).unwrap();
        let again = connection.open_channel(ChannelSpec::subscriber("a")).unwrap();
        connection.open_channel(ChannelSpec::publisher("b")).unwrap();

        assert!(again.can_publish());
        assert_eq!(a.id(), again.id());
        assert_eq!(
            connection.channel_ids(),
            vec![ChannelId::new("a"), ChannelId::new("b")]
        );
        assert_eq!(connection.instance_id(), "syncsocket-instance");
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_channel() {
        let (connection, _outbound) = connection();
        let a = connection.open_channel(ChannelSpec::publisher("a")).unwrap();
        let b = connection.open_channel(ChannelSpec::publisher("b")).unwrap();

        connection
            .dispatch(Envelope::new(
                ChannelId::new("a"),
                "service.initialize",
                json!({"timeserver": "ts"}),
            ))
            .unwrap();
        a.barrier().await.unwrap();
        b.barrier().await.unwrap();

        assert!(a.timeserver().is_some());
        assert_eq!(b.current_state(), ChannelState::Uninitialized);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_channel() {
        let (connection, _outbound) = connection();

        let result = connection.dispatch(Envelope::new(
            ChannelId::new("nope"),
            "service.synchronize",
            Value::Null,
        ));
        assert_eq!(result, Err(SyncSocketError::UnknownChannel(ChannelId::new("nope"))));
    }

    #[tokio::test]
    async fn test_leave() {
        let (connection, _outbound) = connection();
        let a = connection.open_channel(ChannelSpec::publisher("a")).unwrap();

        connection.leave(&ChannelId::new("a")).unwrap();
        assert!(a.barrier().await.is_err());
        assert!(connection.channel(&ChannelId::new("a")).is_none());
        assert_eq!(
            connection.leave(&ChannelId::new("a")),
            Err(SyncSocketError::UnknownChannel(ChannelId::new("a")))
        );
    }

    #[tokio::test]
    async fn test_system_disconnect_closes_everything() {
        let (connection, _outbound) = connection();
        let a = connection.open_channel(ChannelSpec::publisher("a")).unwrap();

        connection
            .dispatch(Envelope::new(ChannelId::new("_SYSTEM"), "disconnect", Value::Null))
            .unwrap();

        assert!(connection.is_closed());
        assert!(a.barrier().await.is_err());
        assert!(connection.channel_ids().is_empty());
        assert_eq!(
            connection.open_channel(ChannelSpec::publisher("c")).err(),
            Some(SyncSocketError::ConnectionClosed)
        );
    }

    #[tokio::test]
    async fn test_run_inbound_until_disconnect() {
        let (connection, mut outbound) = connection();
        let a = connection.open_channel(ChannelSpec::publisher("a")).unwrap();
        let (tx, rx) = mpsc::channel(8);

        tx.send(Envelope::new(ChannelId::new("ghost"), "user.x.prepare", Value::Null))
            .await
            .unwrap();
        tx.send(Envelope::new(ChannelId::new("a"), "service.initialize", json!({"timeserver": "ts"})))
            .await
            .unwrap();
        tx.send(Envelope::new(ChannelId::new("_SYSTEM"), "disconnect", Value::Null))
            .await
            .unwrap();

        connection.run_inbound(rx).await;
        assert!(connection.is_closed());

        // Initialize reached the channel before the disconnect
        let mut states = Vec::new();
        while let Some(envelope) = outbound.recv().await {
            if let Some(state) = envelope.reported_state() {
                states.push(state);
            }
            if states.contains(&ChannelState::Unsynchronized) {
                break;
            }
        }
        assert_eq!(states, vec![ChannelState::Uninitialized, ChannelState::Unsynchronized]);
        drop(a);
    }
}
