//! Test harness - recording sinks, scripted clocks and envelope builders

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use syncsocket_core::{ChannelId, ChannelState, LocalTime, RemoteTime, SyncResult, SyncSocketResult, TimeserverId};
use syncsocket_time::{ClockBinder, ClockOffsetProvider, SyncFuture, WallClock};
use syncsocket_transport::EnvelopeSink;
use syncsocket_wire::{control_topic, service_topic, Envelope, Phase, ServiceOp};

/// Install a test subscriber honouring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Sink that keeps every outbound envelope
#[derive(Debug, Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<Envelope>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingSink::default())
    }

    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().clone()
    }

    /// Sent envelopes of one channel
    pub fn sent_on(&self, channel: &ChannelId) -> Vec<Envelope> {
        self.sent
            .lock()
            .iter()
            .filter(|e| &e.channel_id == channel)
            .cloned()
            .collect()
    }

    /// States reported by one channel, in send order
    pub fn reports(&self, channel: &ChannelId) -> Vec<ChannelState> {
        self.sent_on(channel)
            .iter()
            .filter_map(Envelope::reported_state)
            .collect()
    }

    /// Non-report envelopes of one channel
    pub fn published(&self, channel: &ChannelId) -> Vec<Envelope> {
        self.sent_on(channel)
            .into_iter()
            .filter(|e| e.reported_state().is_none())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sent.lock().is_empty()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

impl EnvelopeSink for RecordingSink {
    fn send(&self, envelope: Envelope) -> SyncSocketResult<()> {
        self.sent.lock().push(envelope);
        Ok(())
    }
}

/// Clock-offset provider replaying scripted results.
///
/// Results are handed out in order; once the script runs dry every sync
/// returns `fallback`. Each sync takes `latency` of tokio time.
#[derive(Debug)]
pub struct ScriptedClockProvider {
    script: Mutex<VecDeque<SyncResult>>,
    fallback: SyncResult,
    latency: Duration,
    calls: AtomicU32,
}

impl ScriptedClockProvider {
    /// Always succeeds with `adjust`
    pub fn constant(adjust: f64, error: f64) -> Arc<Self> {
        Self::scripted(Vec::new(), SyncResult::success(adjust, error))
    }

    pub fn scripted(script: Vec<SyncResult>, fallback: SyncResult) -> Arc<Self> {
        Arc::new(ScriptedClockProvider {
            script: Mutex::new(script.into()),
            fallback,
            latency: Duration::ZERO,
            calls: AtomicU32::new(0),
        })
    }

    /// Same script, but every sync takes `latency`
    pub fn with_latency(script: Vec<SyncResult>, fallback: SyncResult, latency: Duration) -> Arc<Self> {
        Arc::new(ScriptedClockProvider {
            script: Mutex::new(script.into()),
            fallback,
            latency,
            calls: AtomicU32::new(0),
        })
    }

    /// Number of syncs started so far
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ClockOffsetProvider for ScriptedClockProvider {
    fn sync(&self) -> SyncFuture<'_> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = self.script.lock().pop_front().unwrap_or(self.fallback);
        let latency = self.latency;
        Box::pin(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            result
        })
    }
}

/// Binder handing out one shared provider and recording every bind
pub struct ScriptedBinder {
    provider: Arc<ScriptedClockProvider>,
    bound: Mutex<Vec<TimeserverId>>,
}

impl ScriptedBinder {
    pub fn new(provider: Arc<ScriptedClockProvider>) -> Arc<Self> {
        Arc::new(ScriptedBinder {
            provider,
            bound: Mutex::new(Vec::new()),
        })
    }

    pub fn provider(&self) -> &Arc<ScriptedClockProvider> {
        &self.provider
    }

    /// Timeservers bound so far, in order
    pub fn bound(&self) -> Vec<TimeserverId> {
        self.bound.lock().clone()
    }
}

impl ClockBinder for ScriptedBinder {
    fn bind(&self, timeserver: &TimeserverId) -> Arc<dyn ClockOffsetProvider> {
        self.bound.lock().push(timeserver.clone());
        Arc::clone(&self.provider) as Arc<dyn ClockOffsetProvider>
    }
}

/// Wall clock following tokio time, so paused-time tests see timers and
/// wall time move together
#[derive(Clone, Debug)]
pub struct TokioClock {
    base: LocalTime,
    origin: tokio::time::Instant,
}

impl TokioClock {
    /// Must be created inside a tokio runtime
    pub fn starting_at(base: LocalTime) -> Self {
        TokioClock {
            base,
            origin: tokio::time::Instant::now(),
        }
    }
}

impl WallClock for TokioClock {
    fn now(&self) -> LocalTime {
        self.base.saturating_add(self.origin.elapsed())
    }
}

/// Which callback ran
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallKind {
    Prepare,
    Fire,
}

/// One recorded callback invocation
#[derive(Clone, Debug, PartialEq)]
pub struct Call {
    pub kind: CallKind,
    pub tag: String,
    pub data: Value,
    /// Wall time of the call
    pub at: LocalTime,
}

/// Shared log of prepare/fire invocations
#[derive(Clone)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<Call>>>,
    clock: Arc<dyn WallClock>,
}

impl CallLog {
    pub fn new(clock: Arc<dyn WallClock>) -> Self {
        CallLog {
            calls: Arc::new(Mutex::new(Vec::new())),
            clock,
        }
    }

    /// Callback recording a `kind` call under `tag`
    pub fn callback(&self, kind: CallKind, tag: &str) -> impl Fn(&Value) + Send + Sync + 'static {
        let calls = Arc::clone(&self.calls);
        let clock = Arc::clone(&self.clock);
        let tag = tag.to_string();
        move |data: &Value| {
            calls.lock().push(Call {
                kind,
                tag: tag.clone(),
                data: data.clone(),
                at: clock.now(),
            })
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn fires(&self) -> Vec<Call> {
        self.of_kind(CallKind::Fire)
    }

    pub fn prepares(&self) -> Vec<Call> {
        self.of_kind(CallKind::Prepare)
    }

    fn of_kind(&self, kind: CallKind) -> Vec<Call> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.kind == kind)
            .cloned()
            .collect()
    }
}

/// Server-side envelope builders
pub mod envelopes {
    use super::*;

    pub fn initialize(channel: &str, timeserver: &str) -> Envelope {
        Envelope::service(
            ChannelId::new(channel),
            ServiceOp::Initialize,
            json!({ "timeserver": timeserver }),
        )
    }

    /// `service.initialize` without a timeserver
    pub fn initialize_without_timeserver(channel: &str) -> Envelope {
        Envelope::service(ChannelId::new(channel), ServiceOp::Initialize, json!({}))
    }

    pub fn synchronize(channel: &str) -> Envelope {
        Envelope::service(ChannelId::new(channel), ServiceOp::Synchronize, Value::Null)
    }

    pub fn initial_state(channel: &str, data: Value) -> Envelope {
        Envelope::new(ChannelId::new(channel), service_topic(ServiceOp::InitialState), data)
    }

    pub fn prepare(channel: &str, topic: &str, data: Value) -> Envelope {
        Envelope::new(ChannelId::new(channel), control_topic(topic, Phase::Prepare), data)
    }

    pub fn schedule(channel: &str, topic: &str, data: Value, ticket: i64) -> Envelope {
        Envelope::new(ChannelId::new(channel), control_topic(topic, Phase::Schedule), data)
            .with_timeticket(RemoteTime::from_millis(ticket))
    }
}
