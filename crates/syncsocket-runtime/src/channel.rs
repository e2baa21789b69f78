//! Channel driver
//!
//! A [`Channel`] is a cheap handle to one tokio task that owns the channel's
//! [`ChannelEngine`]. Every call on the handle becomes a command on the
//! task's queue, so engine operations for one channel never interleave.
//! Clock syncs, sync backoff and fire timers run as separate tasks that
//! post their outcome back onto the same queue.
//!
//! Topic callbacks and observers run on the channel task. They may call
//! back into the handle: commands are queued, never awaited.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use syncsocket_core::{
    ChannelId, ChannelState, Notification, Observer, SyncResult, SyncSocketError,
    SyncSocketResult, TimeserverId,
};
use syncsocket_time::{ClockBinder, ClockOffsetProvider, WallClock};
use syncsocket_transport::EnvelopeSink;
use syncsocket_wire::{Envelope, TopicFilter};

use crate::{ChannelConfig, ChannelEngine, ChannelSpec, Effect, EngineStats, Subscription, TimerId};

/// Capacity of the notification broadcast
const NOTIFICATION_BUFFER: usize = 256;

/// Channel state as of the last processed command
#[derive(Clone, Debug)]
pub struct ChannelSnapshot {
    pub state: ChannelState,
    pub pending: bool,
    pub last_sync: Option<SyncResult>,
    pub timeserver: Option<TimeserverId>,
    pub subscriptions: usize,
    pub stats: EngineStats,
}

impl ChannelSnapshot {
    fn of(engine: &ChannelEngine) -> Self {
        ChannelSnapshot {
            state: engine.current_state(),
            pending: engine.is_pending(),
            last_sync: engine.last_sync_result(),
            timeserver: engine.timeserver().cloned(),
            subscriptions: engine.registry().len(),
            stats: engine.stats().clone(),
        }
    }
}

enum Command {
    Subscribe {
        filter: TopicFilter,
        subscription: Subscription,
    },
    Unsubscribe(TopicFilter),
    Publish {
        topic: String,
        data: Value,
    },
    Inject {
        envelope: Envelope,
        reply: Option<oneshot::Sender<SyncSocketResult<()>>>,
    },
    Cancel,
    Observe(Observer),
    SyncCompleted {
        attempt: u32,
        result: SyncResult,
    },
    RetrySync {
        attempt: u32,
    },
    TimerFired(TimerId),
    Barrier(oneshot::Sender<()>),
    Close,
}

/// Handle to a running channel
#[derive(Clone)]
pub struct Channel {
    id: ChannelId,
    can_publish: bool,
    commands: mpsc::UnboundedSender<Command>,
    snapshot: Arc<RwLock<ChannelSnapshot>>,
    notifications: broadcast::Sender<Notification>,
}

impl Channel {
    /// Start the channel task. Must be called inside a tokio runtime.
    pub fn spawn(
        spec: ChannelSpec,
        config: ChannelConfig,
        clock: Arc<dyn WallClock>,
        binder: Arc<dyn ClockBinder>,
        sink: Arc<dyn EnvelopeSink>,
    ) -> Channel {
        let id = spec.channel_id.clone();
        let can_publish = spec.can_publish;

        let mut engine = ChannelEngine::new(spec, config, clock);
        let (notifications, _) = broadcast::channel(NOTIFICATION_BUFFER);
        let forward = notifications.clone();
        engine.observe(Box::new(move |notification| {
            // No subscribers is fine
            let _ = forward.send(notification.clone());
        }));

        let snapshot = Arc::new(RwLock::new(ChannelSnapshot::of(&engine)));
        let (tx, rx) = mpsc::unbounded_channel();

        let driver = Driver {
            engine,
            binder,
            provider: None,
            sink,
            commands: tx.downgrade(),
            timers: HashMap::new(),
            background: Vec::new(),
            snapshot: Arc::clone(&snapshot),
        };
        tokio::spawn(driver.run(rx));

        Channel {
            id,
            can_publish,
            commands: tx,
            snapshot,
            notifications,
        }
    }

    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    pub fn can_publish(&self) -> bool {
        self.can_publish
    }

    pub fn current_state(&self) -> ChannelState {
        self.snapshot.read().state
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        self.snapshot.read().clone()
    }

    pub fn last_sync_result(&self) -> Option<SyncResult> {
        self.snapshot.read().last_sync
    }

    pub fn timeserver(&self) -> Option<TimeserverId> {
        self.snapshot.read().timeserver.clone()
    }

    pub fn is_pending(&self) -> bool {
        self.snapshot.read().pending
    }

    /// Register prepare and fire callbacks for `topic` (`"#"` for every topic)
    pub fn subscribe<P, F>(&self, topic: impl Into<TopicFilter>, prepare: P, fire: F) -> SyncSocketResult<()>
    where
        P: Fn(&Value) + Send + Sync + 'static,
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.send(Command::Subscribe {
            filter: topic.into(),
            subscription: Subscription::new(prepare, fire),
        })
    }

    pub fn unsubscribe(&self, topic: impl Into<TopicFilter>) -> SyncSocketResult<()> {
        self.send(Command::Unsubscribe(topic.into()))
    }

    /// Publish `data` on `user.<topic>`. Denials arrive as an `error` notification.
    pub fn publish(&self, topic: &str, data: Value) {
        let command = Command::Publish {
            topic: topic.to_string(),
            data,
        };
        if let Err(e) = self.send(command) {
            tracing::warn!(channel = %self.id, topic, "publish dropped: {}", e);
        }
    }

    /// Queue an inbound envelope. Fatal failures are logged and raised as an
    /// `error` notification.
    pub fn inject_message(&self, envelope: Envelope) -> SyncSocketResult<()> {
        self.send(Command::Inject {
            envelope,
            reply: None,
        })
    }

    /// Process an inbound envelope and return the engine's verdict
    pub async fn deliver(&self, envelope: Envelope) -> SyncSocketResult<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Inject {
            envelope,
            reply: Some(reply),
        })?;
        rx.await
            .map_err(|_| SyncSocketError::ChannelClosed(self.id.clone()))?
    }

    /// Leave `ready`/`scheduled` for `idle` without firing
    pub fn cancel(&self) -> SyncSocketResult<()> {
        self.send(Command::Cancel)
    }

    /// Add a synchronous observer, called on the channel task
    pub fn on<F>(&self, observer: F) -> SyncSocketResult<()>
    where
        F: Fn(&Notification) + Send + 'static,
    {
        self.send(Command::Observe(Box::new(observer)))
    }

    /// Stream of notifications raised after this call
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// Wait until every command queued before this call has been processed
    pub async fn barrier(&self) -> SyncSocketResult<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Barrier(tx))?;
        rx.await
            .map_err(|_| SyncSocketError::ChannelClosed(self.id.clone()))
    }

    /// Stop the channel task; armed timers are dropped
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    fn send(&self, command: Command) -> SyncSocketResult<()> {
        self.commands
            .send(command)
            .map_err(|_| SyncSocketError::ChannelClosed(self.id.clone()))
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("can_publish", &self.can_publish)
            .field("state", &self.current_state())
            .finish()
    }
}

/// Task owning one engine
struct Driver {
    engine: ChannelEngine,
    binder: Arc<dyn ClockBinder>,
    provider: Option<Arc<dyn ClockOffsetProvider>>,
    sink: Arc<dyn EnvelopeSink>,
    commands: mpsc::WeakUnboundedSender<Command>,
    timers: HashMap<TimerId, JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
    snapshot: Arc<RwLock<ChannelSnapshot>>,
}

impl Driver {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        self.flush();

        while let Some(command) = rx.recv().await {
            if matches!(command, Command::Close) {
                break;
            }
            self.apply(command);
            self.flush();
        }

        tracing::debug!(channel = %self.engine.channel_id(), "channel task stopped");
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        for task in self.background.drain(..) {
            task.abort();
        }
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Subscribe {
                filter,
                subscription,
            } => self.engine.subscribe(filter, subscription),
            Command::Unsubscribe(filter) => {
                self.engine.unsubscribe(filter);
            }
            Command::Publish { topic, data } => self.engine.publish(&topic, data),
            Command::Inject { envelope, reply } => {
                let result = self.engine.inject_message(&envelope);
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            Command::Cancel => self.engine.cancel(),
            Command::Observe(observer) => self.engine.observe(observer),
            Command::SyncCompleted { attempt, result } => {
                self.engine.sync_completed(attempt, result)
            }
            Command::RetrySync { attempt } => self.engine.retry_sync(attempt),
            Command::TimerFired(id) => {
                self.timers.remove(&id);
                self.engine.timer_fired(id);
            }
            Command::Barrier(done) => {
                let _ = done.send(());
            }
            Command::Close => {}
        }
    }

    /// Execute queued effects, then publish the new snapshot
    fn flush(&mut self) {
        while self.engine.has_effects() {
            for effect in self.engine.drain_effects() {
                self.execute(effect);
            }
        }
        self.background.retain(|task| !task.is_finished());
        *self.snapshot.write() = ChannelSnapshot::of(&self.engine);
    }

    fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::Send(envelope) => {
                if let Err(e) = self.sink.send(envelope) {
                    tracing::warn!(channel = %self.engine.channel_id(), "send failed: {}", e);
                }
            }
            Effect::BindClock(timeserver) => {
                tracing::debug!(channel = %self.engine.channel_id(), "binding clock to {}", timeserver);
                self.provider = Some(self.binder.bind(&timeserver));
            }
            Effect::StartSync { attempt } => {
                let Some(provider) = self.provider.clone() else {
                    tracing::warn!(channel = %self.engine.channel_id(), "sync requested before clock bind");
                    self.engine.sync_completed(attempt, SyncResult::failure(0.0));
                    return;
                };
                let commands = self.commands.clone();
                self.background.push(tokio::spawn(async move {
                    let result = provider.sync().await;
                    post(&commands, Command::SyncCompleted { attempt, result });
                }));
            }
            Effect::ScheduleSyncRetry { attempt, delay } => {
                let commands = self.commands.clone();
                self.background.push(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    post(&commands, Command::RetrySync { attempt });
                }));
            }
            Effect::ArmTimer { id, delay } => {
                let commands = self.commands.clone();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    post(&commands, Command::TimerFired(id));
                });
                if let Some(previous) = self.timers.insert(id, timer) {
                    previous.abort();
                }
            }
            Effect::DisarmTimer(id) => {
                if let Some(timer) = self.timers.remove(&id) {
                    timer.abort();
                }
            }
        }
    }
}

fn post(commands: &mpsc::WeakUnboundedSender<Command>, command: Command) {
    if let Some(tx) = commands.upgrade() {
        let _ = tx.send(command);
    }
}
