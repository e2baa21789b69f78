//! End-to-end Integration Test Suite
//!
//! Drives real channels through the connection facade under paused tokio
//! time:
//! - Transition ordering and state reports
//! - Prepare/schedule/fire timing against the clock offset
//! - Subscription dispatch, publish privileges, cancellation
//! - Sync failure handling and JSON framing

use std::sync::Arc;

use tokio::sync::broadcast;

use syncsocket_core::{ChannelId, LocalTime, Notification};
use syncsocket_runtime::{Channel, ChannelSpec, Connection, ConnectionConfig};

use crate::{init_tracing, CallLog, RecordingSink, ScriptedBinder, ScriptedClockProvider, TokioClock};

/// Local wall time at which every test client starts
pub const CLIENT_EPOCH_MS: i64 = 1_700_000_000_000;

/// One client connection wired to recording collaborators
pub struct TestClient {
    pub connection: Connection,
    pub sink: Arc<RecordingSink>,
    pub binder: Arc<ScriptedBinder>,
    pub clock: TokioClock,
    pub log: CallLog,
}

impl TestClient {
    /// Must be called inside a tokio runtime
    pub fn new(provider: Arc<ScriptedClockProvider>) -> Self {
        Self::with_config(provider, ConnectionConfig::default())
    }

    pub fn with_config(provider: Arc<ScriptedClockProvider>, config: ConnectionConfig) -> Self {
        init_tracing();
        let sink = RecordingSink::new();
        let binder = ScriptedBinder::new(provider);
        let clock = TokioClock::starting_at(LocalTime::from_millis(CLIENT_EPOCH_MS));
        let connection = Connection::with_clock(
            config,
            sink.clone(),
            binder.clone(),
            Arc::new(clock.clone()),
        );
        let log = CallLog::new(Arc::new(clock.clone()));

        TestClient {
            connection,
            sink,
            binder,
            clock,
            log,
        }
    }

    pub fn join(&self, spec: ChannelSpec) -> Channel {
        match self.connection.open_channel(spec) {
            Ok(channel) => channel,
            Err(e) => panic!("open_channel failed: {e}"),
        }
    }

    pub fn reports(&self, channel: &str) -> Vec<syncsocket_core::ChannelState> {
        self.sink.reports(&ChannelId::new(channel))
    }
}

/// Notifications received so far, without waiting
pub fn drain_notifications(rx: &mut broadcast::Receiver<Notification>) -> Vec<Notification> {
    let mut out = Vec::new();
    while let Ok(notification) = rx.try_recv() {
        out.push(notification);
    }
    out
}

/// Wait for the next `syncSuccessful`
pub async fn wait_for_sync(rx: &mut broadcast::Receiver<Notification>) {
    loop {
        match rx.recv().await {
            Ok(Notification::SyncSuccessful { .. }) => return,
            Ok(_) => {}
            Err(e) => panic!("notification stream failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::{json, Value};
    use syncsocket_core::{ChannelState, SyncResult, SyncSocketError, TimeserverId};
    use syncsocket_runtime::{ChannelConfig, SyncRetryPolicy};
    use syncsocket_time::WallClock;
    use syncsocket_transport::{start_decode_loop, JsonSink};
    use syncsocket_wire::Envelope;

    use crate::envelopes;
    use crate::CallKind;

    const ADJUST: f64 = 2_000.0;

    /// Join `lobby`, subscribe `topic`, initialize and wait for the sync
    async fn synced_lobby(client: &TestClient, spec: ChannelSpec, topic: &str) -> Channel {
        let channel = client.join(spec);
        let mut notes = channel.notifications();
        channel
            .subscribe(
                topic,
                client.log.callback(CallKind::Prepare, topic),
                client.log.callback(CallKind::Fire, topic),
            )
            .unwrap();
        channel
            .deliver(envelopes::initialize("lobby", "ts-1"))
            .await
            .unwrap();
        wait_for_sync(&mut notes).await;
        channel.barrier().await.unwrap();
        channel
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_starts_uninitialized() {
        let client = TestClient::new(ScriptedClockProvider::constant(0.0, 1.0));
        let channel = client.join(ChannelSpec::publisher("lobby"));
        let mut notes = channel.notifications();

        channel
            .deliver(envelopes::prepare("lobby", "x", Value::Null))
            .await
            .unwrap();
        channel
            .deliver(envelopes::synchronize("lobby"))
            .await
            .unwrap();
        channel.cancel().unwrap();
        channel.barrier().await.unwrap();

        assert_eq!(channel.current_state(), ChannelState::Uninitialized);
        assert!(drain_notifications(&mut notes).is_empty());
        assert_eq!(client.reports("lobby"), vec![ChannelState::Uninitialized]);

        channel
            .deliver(envelopes::initialize("lobby", "ts-1"))
            .await
            .unwrap();
        match drain_notifications(&mut notes).first() {
            Some(Notification::Transition { from, to }) => {
                assert_eq!((*from, *to), (ChannelState::Uninitialized, ChannelState::Unsynchronized));
            }
            other => panic!("expected first transition, got {other:?}"),
        }
        assert_eq!(client.binder.bound(), vec![TimeserverId::new("ts-1")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disallowed_events_do_not_transition() {
        let client = TestClient::new(ScriptedClockProvider::constant(0.0, 1.0));
        let channel = synced_lobby(&client, ChannelSpec::publisher("lobby"), "hey").await;
        let mut notes = channel.notifications();

        // None of these are legal from idle
        channel
            .deliver(envelopes::schedule("lobby", "hey", Value::Null, CLIENT_EPOCH_MS))
            .await
            .unwrap();
        channel.cancel().unwrap();
        channel
            .deliver(envelopes::initialize("lobby", "ts-2"))
            .await
            .unwrap();

        assert_eq!(channel.current_state(), ChannelState::Idle);
        assert!(drain_notifications(&mut notes).is_empty());
        assert_eq!(client.binder.bound().len(), 1);
        assert_eq!(channel.snapshot().stats.rejected_events, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_pending_transition_at_a_time() {
        let provider = ScriptedClockProvider::with_latency(
            Vec::new(),
            SyncResult::success(0.0, 1.0),
            Duration::from_millis(300),
        );
        let config = ConnectionConfig {
            channel: ChannelConfig::strict(),
            ..ConnectionConfig::default()
        };
        let client = TestClient::with_config(provider, config);
        let channel = client.join(ChannelSpec::publisher("lobby"));

        channel
            .deliver(envelopes::initialize("lobby", "ts-1"))
            .await
            .unwrap();
        channel
            .deliver(envelopes::synchronize("lobby"))
            .await
            .unwrap();
        channel
            .deliver(envelopes::synchronize("lobby"))
            .await
            .unwrap();
        assert!(channel.is_pending());
        assert_eq!(channel.current_state(), ChannelState::Unsynchronized);

        tokio::time::sleep(Duration::from_millis(400)).await;
        channel.barrier().await.unwrap();

        assert_eq!(client.binder.provider().calls(), 1);
        assert_eq!(channel.current_state(), ChannelState::Idle);
        assert!(!channel.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_transition_reported_once_in_order() {
        let client = TestClient::new(ScriptedClockProvider::constant(ADJUST, 3.0));
        let channel = client.join(ChannelSpec::publisher("lobby"));
        let mut notes = channel.notifications();
        channel
            .subscribe("hey", |_| {}, |_| {})
            .unwrap();

        channel
            .deliver(envelopes::initialize("lobby", "ts-1"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.barrier().await.unwrap();
        assert_eq!(channel.current_state(), ChannelState::Idle);
        for _ in 0..3 {
            channel
                .deliver(envelopes::prepare("lobby", "hey", Value::Null))
                .await
                .unwrap();
            let ticket = client.clock.now().as_millis() + ADJUST as i64 + 50;
            channel
                .deliver(envelopes::schedule("lobby", "hey", Value::Null, ticket))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(60)).await;
        }
        channel
            .deliver(envelopes::prepare("lobby", "hey", Value::Null))
            .await
            .unwrap();
        channel.cancel().unwrap();
        channel.barrier().await.unwrap();

        // The creation report has no transition behind it
        let mut transitions = vec![ChannelState::Uninitialized];
        transitions.extend(drain_notifications(&mut notes).into_iter().filter_map(|n| match n {
            Notification::Transition { to, .. } => Some(to),
            _ => None,
        }));

        assert_eq!(client.reports("lobby"), transitions);
        assert_eq!(transitions.len(), 1 + 2 + 3 * 3 + 2);
        assert_eq!(transitions.last(), Some(&ChannelState::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_without_privilege() {
        let client = TestClient::new(ScriptedClockProvider::constant(0.0, 1.0));
        let channel = client.join(ChannelSpec::subscriber("lobby"));
        let mut notes = channel.notifications();

        channel.publish("hey", json!({"x": 1}));
        channel.barrier().await.unwrap();

        assert!(client.sink.published(&ChannelId::new("lobby")).is_empty());
        let notes = drain_notifications(&mut notes);
        assert_eq!(notes.len(), 1);
        assert_eq!(
            notes[0],
            Notification::Error {
                reason: SyncSocketError::PublishDenied(ChannelId::new("lobby")).to_string()
            }
        );
        assert_eq!(channel.current_state(), ChannelState::Uninitialized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_with_privilege() {
        let client = TestClient::new(ScriptedClockProvider::constant(0.0, 1.0));
        let channel = client.join(ChannelSpec::publisher("lobby"));

        channel.publish("hey", json!({"x": 1}));
        channel.barrier().await.unwrap();

        let published = client.sink.published(&ChannelId::new("lobby"));
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "user.hey");
        assert_eq!(published[0].data, json!({"x": 1}));
        assert_eq!(channel.current_state(), ChannelState::Uninitialized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_no_earlier_than_translated_ticket() {
        let client = TestClient::new(ScriptedClockProvider::constant(ADJUST, 3.0));
        let channel = synced_lobby(&client, ChannelSpec::publisher("lobby"), "hey").await;

        channel
            .deliver(envelopes::prepare("lobby", "hey", json!({"round": 1})))
            .await
            .unwrap();
        let ticket = client.clock.now().as_millis() + ADJUST as i64 + 750;
        channel
            .deliver(envelopes::schedule("lobby", "hey", json!({"round": 1}), ticket))
            .await
            .unwrap();
        assert_eq!(channel.current_state(), ChannelState::Scheduled);

        tokio::time::sleep(Duration::from_millis(800)).await;
        channel.barrier().await.unwrap();

        let fires = client.log.fires();
        assert_eq!(fires.len(), 1);
        assert!(fires[0].at.as_millis() >= ticket - ADJUST as i64);
        assert!(fires[0].at.as_millis() <= ticket - ADJUST as i64 + 5);
        assert_eq!(fires[0].data, json!({"round": 1}));
        assert_eq!(channel.current_state(), ChannelState::Idle);
        assert_eq!(client.reports("lobby").last(), Some(&ChannelState::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wildcard_and_specific_dispatch() {
        let client = TestClient::new(ScriptedClockProvider::constant(0.0, 1.0));
        let wild = synced_lobby(&client, ChannelSpec::publisher("lobby"), "#").await;

        wild.deliver(envelopes::prepare("lobby", "anything", json!(1)))
            .await
            .unwrap();
        assert_eq!(client.log.prepares().len(), 1);
        assert_eq!(client.log.prepares()[0].tag, "#");
        assert_eq!(wild.current_state(), ChannelState::Ready);

        let other = TestClient::new(ScriptedClockProvider::constant(0.0, 1.0));
        let specific = synced_lobby(&other, ChannelSpec::publisher("lobby"), "specific").await;
        specific
            .deliver(envelopes::prepare("lobby", "other", json!(1)))
            .await
            .unwrap();

        assert!(other.log.calls().is_empty());
        assert_eq!(specific.current_state(), ChannelState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_undefined_timeserver_is_fatal() {
        let client = TestClient::new(ScriptedClockProvider::constant(0.0, 1.0));
        let channel = client.join(ChannelSpec::publisher("lobby"));
        let mut notes = channel.notifications();

        let result = channel
            .deliver(envelopes::initialize_without_timeserver("lobby"))
            .await;

        assert_eq!(result, Err(SyncSocketError::MissingTimeserver));
        assert_eq!(channel.current_state(), ChannelState::Uninitialized);
        assert!(client.binder.bound().is_empty());
        assert!(matches!(
            drain_notifications(&mut notes).as_slice(),
            [Notification::Error { .. }]
        ));

        // The channel stays usable
        channel
            .deliver(envelopes::initialize("lobby", "ts-1"))
            .await
            .unwrap();
        assert_ne!(channel.current_state(), ChannelState::Uninitialized);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_scheduled_never_fires() {
        let client = TestClient::new(ScriptedClockProvider::constant(ADJUST, 3.0));
        let channel = synced_lobby(&client, ChannelSpec::publisher("lobby"), "hey").await;

        channel
            .deliver(envelopes::prepare("lobby", "hey", Value::Null))
            .await
            .unwrap();
        let ticket = client.clock.now().as_millis() + ADJUST as i64 + 500;
        channel
            .deliver(envelopes::schedule("lobby", "hey", Value::Null, ticket))
            .await
            .unwrap();
        channel.cancel().unwrap();
        channel.barrier().await.unwrap();
        assert_eq!(channel.current_state(), ChannelState::Idle);

        tokio::time::sleep(Duration::from_secs(2)).await;
        channel.barrier().await.unwrap();

        assert!(client.log.fires().is_empty());
        assert_eq!(channel.current_state(), ChannelState::Idle);
    }

    /// Synced lobby with `hey` scheduled 500ms ahead, then resynced to idle
    async fn resynced_while_scheduled(client: &TestClient) -> Channel {
        let channel = synced_lobby(client, ChannelSpec::publisher("lobby"), "hey").await;
        channel
            .subscribe(
                "other",
                client.log.callback(CallKind::Prepare, "other"),
                client.log.callback(CallKind::Fire, "other"),
            )
            .unwrap();

        channel
            .deliver(envelopes::prepare("lobby", "hey", json!(1)))
            .await
            .unwrap();
        let ticket = client.clock.now().as_millis() + ADJUST as i64 + 500;
        channel
            .deliver(envelopes::schedule("lobby", "hey", json!(1), ticket))
            .await
            .unwrap();
        channel
            .deliver(envelopes::synchronize("lobby"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.barrier().await.unwrap();
        assert_eq!(channel.current_state(), ChannelState::Idle);
        channel
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_while_scheduled_never_fires_later() {
        let client = TestClient::new(ScriptedClockProvider::constant(ADJUST, 3.0));
        let channel = resynced_while_scheduled(&client).await;

        channel
            .deliver(envelopes::prepare("lobby", "other", json!(2)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        channel.barrier().await.unwrap();

        assert!(client.log.fires().is_empty());
        assert_eq!(channel.current_state(), ChannelState::Ready);
        assert_eq!(channel.snapshot().stats.rejected_events, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_then_reschedule_fires_new_event_only() {
        let client = TestClient::new(ScriptedClockProvider::constant(ADJUST, 3.0));
        let channel = resynced_while_scheduled(&client).await;

        channel
            .deliver(envelopes::prepare("lobby", "other", json!(2)))
            .await
            .unwrap();
        let ticket = client.clock.now().as_millis() + ADJUST as i64 + 800;
        channel
            .deliver(envelopes::schedule("lobby", "other", json!(2), ticket))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        channel.barrier().await.unwrap();

        let fires = client.log.fires();
        assert_eq!(fires.len(), 1);
        assert_eq!(fires[0].tag, "other");
        assert_eq!(channel.current_state(), ChannelState::Idle);
        assert_eq!(client.reports("lobby").last(), Some(&ChannelState::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_failure_exhausts_and_recovers() {
        let provider = ScriptedClockProvider::scripted(
            vec![SyncResult::failure(80.0); 3],
            SyncResult::success(5.0, 1.0),
        );
        let client = TestClient::new(provider);
        let channel = client.join(ChannelSpec::publisher("lobby"));
        let mut notes = channel.notifications();

        channel
            .deliver(envelopes::initialize("lobby", "ts-1"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        channel.barrier().await.unwrap();

        let failures = drain_notifications(&mut notes)
            .into_iter()
            .filter(|n| matches!(n, Notification::SyncFailed { .. }))
            .count();
        assert_eq!(failures, SyncRetryPolicy::default().max_attempts as usize);
        assert!(!channel.is_pending());
        assert_eq!(channel.current_state(), ChannelState::Unsynchronized);

        // The server asks again; the script is spent and the sync succeeds
        channel
            .deliver(envelopes::synchronize("lobby"))
            .await
            .unwrap();
        wait_for_sync(&mut notes).await;
        channel.barrier().await.unwrap();
        assert_eq!(channel.current_state(), ChannelState::Idle);
        assert_eq!(channel.last_sync_result(), Some(SyncResult::success(5.0, 1.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_state_is_forwarded() {
        let client = TestClient::new(ScriptedClockProvider::constant(0.0, 1.0));
        let channel = client.join(ChannelSpec::subscriber("lobby"));
        let mut notes = channel.notifications();

        channel
            .deliver(envelopes::initial_state("lobby", json!({"round": 4})))
            .await
            .unwrap();

        assert_eq!(
            drain_notifications(&mut notes),
            vec![Notification::InitialState {
                data: json!({"round": 4})
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_channels_are_independent() {
        let provider = ScriptedClockProvider::with_latency(
            Vec::new(),
            SyncResult::success(0.0, 1.0),
            Duration::from_millis(100),
        );
        let client = TestClient::new(provider);
        let a = client.join(ChannelSpec::publisher("a"));
        let b = client.join(ChannelSpec::publisher("b"));

        client
            .connection
            .dispatch(envelopes::initialize("a", "ts-a"))
            .unwrap();
        a.barrier().await.unwrap();

        // a is mid-sync; b still takes its own transitions
        assert!(a.is_pending());
        client
            .connection
            .dispatch(envelopes::initialize("b", "ts-b"))
            .unwrap();
        b.barrier().await.unwrap();
        assert_eq!(b.current_state(), ChannelState::Unsynchronized);

        tokio::time::sleep(Duration::from_millis(150)).await;
        a.barrier().await.unwrap();
        b.barrier().await.unwrap();
        assert_eq!(a.current_state(), ChannelState::Idle);
        assert_eq!(b.current_state(), ChannelState::Idle);
        assert_eq!(
            client.binder.bound(),
            vec![TimeserverId::new("ts-a"), TimeserverId::new("ts-b")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_json_frames_end_to_end() {
        init_tracing();
        let (sink, mut frames_out) = JsonSink::new();
        let provider = ScriptedClockProvider::constant(0.0, 1.0);
        let connection = Connection::new(
            ConnectionConfig::default(),
            Arc::new(sink),
            ScriptedBinder::new(provider),
        );
        let channel = connection
            .open_channel(ChannelSpec::publisher("lobby"))
            .unwrap();

        let (frames_tx, frames_rx) = tokio::sync::mpsc::channel(16);
        let inbound = start_decode_loop(frames_rx, 16);
        frames_tx
            .send(r#"{"channelId":"lobby","topic":"service.initialize","data":{"timeserver":"ts"}}"#.to_string())
            .await
            .unwrap();
        frames_tx.send("garbage".to_string()).await.unwrap();
        frames_tx
            .send(r#"{"channelId":"_SYSTEM","topic":"disconnect"}"#.to_string())
            .await
            .unwrap();

        connection.run_inbound(inbound).await;
        assert!(connection.is_closed());
        assert!(channel.barrier().await.is_err());

        let mut reported = Vec::new();
        while let Ok(frame) = frames_out.try_recv() {
            let envelope = Envelope::from_json(&frame).unwrap();
            reported.extend(envelope.reported_state());
        }
        assert_eq!(
            &reported[..2],
            &[ChannelState::Uninitialized, ChannelState::Unsynchronized]
        );
    }
}
