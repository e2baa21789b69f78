//! Channel protocol engine
//!
//! Composes the state machine, the topic registry and fire planning into the
//! per-channel protocol. The engine is synchronous: it never sleeps, spawns
//! or sends. Work that needs the outside world is queued as [`Effect`]s and
//! drained by whoever drives the engine; results come back in through
//! [`ChannelEngine::sync_completed`], [`ChannelEngine::retry_sync`] and
//! [`ChannelEngine::timer_fired`].
//!
//! Every completed transition queues exactly one `service.reportstate`
//! envelope, in transition order.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use syncsocket_core::{
    channel_machine, ChannelId, ChannelMachine, ChannelState, Deferral, HandleError,
    Notification, NotificationHub, Observer, Outcome, ProtocolEvent, StateChange, SyncResult,
    SyncSocketError, SyncSocketResult, TimeserverId, TransitionError,
};
use syncsocket_time::{plan_fire, FirePlan, WallClock};
use syncsocket_wire::{Envelope, Phase, Route, ServiceOp, TopicFilter};

use crate::{ChannelConfig, ChannelSpec, ExhaustedPolicy, Subscription, TopicCallback, TopicRegistry};

/// Identity of one armed fire timer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

/// Work requested by the engine
#[derive(Clone, Debug, PartialEq)]
pub enum Effect {
    /// Send an envelope through the connection
    Send(Envelope),
    /// Create the channel's clock-offset provider
    BindClock(TimeserverId),
    /// Run one clock sync and report back with `sync_completed`
    StartSync { attempt: u32 },
    /// Call `retry_sync` after `delay`
    ScheduleSyncRetry { attempt: u32, delay: Duration },
    /// Call `timer_fired` after `delay`
    ArmTimer { id: TimerId, delay: Duration },
    /// The timer must not expire anymore
    DisarmTimer(TimerId),
}

/// Engine counters
#[derive(Clone, Debug, Default)]
pub struct EngineStats {
    pub envelopes_in: u64,
    pub envelopes_dropped: u64,
    pub transitions: u64,
    pub rejected_events: u64,
    pub sync_failures: u64,
    pub fires: u64,
    pub late_fires: u64,
    pub skipped_fires: u64,
}

/// Fire captured at schedule time
struct ArmedFire {
    id: TimerId,
    fire: TopicCallback,
    data: Value,
    fires: bool,
}

/// Everything transition actions may touch
struct Protocol {
    channel_id: ChannelId,
    config: ChannelConfig,
    registry: TopicRegistry,
    clock: Arc<dyn WallClock>,
    timeserver: Option<TimeserverId>,
    last_sync: Option<SyncResult>,
    armed: Option<ArmedFire>,
    next_timer: u64,
    sync_attempt: u32,
    stats: EngineStats,
    effects: Vec<Effect>,
}

impl Protocol {
    fn initialize(&mut self, data: &Value) -> SyncSocketResult<()> {
        let timeserver = match data.get("timeserver") {
            Some(Value::String(ts)) if !ts.is_empty() => TimeserverId::new(ts.as_str()),
            Some(Value::Number(ts)) => TimeserverId::new(ts.to_string()),
            _ => return Err(SyncSocketError::MissingTimeserver),
        };

        self.timeserver = Some(timeserver.clone());
        self.effects.push(Effect::BindClock(timeserver));
        Ok(())
    }

    fn synchronize(&mut self, deferral: &mut Deferral) -> SyncSocketResult<()> {
        deferral.defer();
        self.sync_attempt = 1;
        self.effects.push(Effect::StartSync { attempt: 1 });
        Ok(())
    }

    fn prepare(&mut self, topic: &str, data: &Value) -> SyncSocketResult<()> {
        let subscription = self
            .registry
            .resolve(topic)
            .ok_or_else(|| SyncSocketError::UnroutableEnvelope(topic.to_string()))?;
        (subscription.prepare)(data);
        Ok(())
    }

    fn schedule(&mut self, topic: &str, envelope: &Envelope) -> SyncSocketResult<()> {
        let sync = self.last_sync.ok_or(SyncSocketError::NotSynchronized)?;
        let ticket = envelope
            .timeticket()
            .ok_or(SyncSocketError::MissingTimeticket)?;
        let fire = self
            .registry
            .resolve(topic)
            .map(|s| Arc::clone(&s.fire))
            .ok_or_else(|| SyncSocketError::UnroutableEnvelope(topic.to_string()))?;

        let plan = plan_fire(
            ticket,
            &sync,
            self.clock.now(),
            self.config.late_fire,
            self.config.late_tolerance,
        );
        match plan {
            FirePlan::Arm { delay, fire_at } => {
                tracing::debug!(channel = %self.channel_id, topic, "fire at {:?} in {:?}", fire_at, delay);
            }
            FirePlan::Late { late_by, .. } => {
                self.stats.late_fires += 1;
                tracing::warn!(channel = %self.channel_id, topic, "fire is late by {:?}, firing now", late_by);
            }
            FirePlan::Skip { late_by, .. } => {
                self.stats.skipped_fires += 1;
                tracing::warn!(channel = %self.channel_id, topic, "fire is late by {:?}, skipping", late_by);
            }
        }

        self.disarm();
        let id = TimerId(self.next_timer);
        self.next_timer += 1;
        self.armed = Some(ArmedFire {
            id,
            fire,
            data: envelope.data.clone(),
            fires: plan.fires(),
        });
        self.effects.push(Effect::ArmTimer {
            id,
            delay: plan.delay(),
        });
        Ok(())
    }

    fn disarm(&mut self) {
        if let Some(armed) = self.armed.take() {
            self.effects.push(Effect::DisarmTimer(armed.id));
        }
    }
}

/// Per-channel protocol engine
pub struct ChannelEngine {
    machine: ChannelMachine,
    protocol: Protocol,
    hub: NotificationHub,
    can_publish: bool,
}

impl ChannelEngine {
    pub fn new(spec: ChannelSpec, config: ChannelConfig, clock: Arc<dyn WallClock>) -> Self {
        let report_initial = config.report_initial_state;
        let mut engine = ChannelEngine {
            machine: channel_machine(),
            protocol: Protocol {
                channel_id: spec.channel_id,
                config,
                registry: TopicRegistry::new(),
                clock,
                timeserver: None,
                last_sync: None,
                armed: None,
                next_timer: 1,
                sync_attempt: 0,
                stats: EngineStats::default(),
                effects: Vec::new(),
            },
            hub: NotificationHub::new(),
            can_publish: spec.can_publish,
        };

        if report_initial {
            engine.report(engine.machine.current());
        }
        engine
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.protocol.channel_id
    }

    pub fn current_state(&self) -> ChannelState {
        self.machine.current()
    }

    pub fn is_pending(&self) -> bool {
        self.machine.is_pending()
    }

    pub fn can_publish(&self) -> bool {
        self.can_publish
    }

    /// Most recent successful clock sync
    pub fn last_sync_result(&self) -> Option<SyncResult> {
        self.protocol.last_sync
    }

    pub fn timeserver(&self) -> Option<&TimeserverId> {
        self.protocol.timeserver.as_ref()
    }

    /// Fire timer currently armed, if any
    pub fn armed_timer(&self) -> Option<TimerId> {
        self.protocol.armed.as_ref().map(|armed| armed.id)
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.protocol.config
    }

    pub fn stats(&self) -> &EngineStats {
        &self.protocol.stats
    }

    pub fn registry(&self) -> &TopicRegistry {
        &self.protocol.registry
    }

    pub fn observe(&mut self, observer: Observer) {
        self.hub.subscribe(observer);
    }

    pub fn subscribe(&mut self, filter: impl Into<TopicFilter>, subscription: Subscription) {
        let filter = filter.into();
        if self.protocol.registry.subscribe(filter.clone(), subscription) {
            tracing::debug!(channel = %self.protocol.channel_id, "replaced subscription {:?}", filter);
        }
    }

    pub fn unsubscribe(&mut self, filter: impl Into<TopicFilter>) -> bool {
        self.protocol.registry.unsubscribe(&filter.into())
    }

    /// Send `user.<topic>`; without publish rights an `error` notification is
    /// raised instead.
    pub fn publish(&mut self, topic: &str, data: Value) {
        if !self.can_publish {
            let err = SyncSocketError::PublishDenied(self.protocol.channel_id.clone());
            tracing::debug!(channel = %self.protocol.channel_id, topic, "{}", err);
            self.hub.emit(Notification::Error {
                reason: err.to_string(),
            });
            return;
        }

        let envelope = Envelope::user(self.protocol.channel_id.clone(), topic, data);
        self.protocol.effects.push(Effect::Send(envelope));
    }

    /// Route one inbound envelope.
    ///
    /// Protocol anomalies are logged and absorbed; only fatal errors
    /// (an `initialize` without timeserver) are returned.
    pub fn inject_message(&mut self, envelope: &Envelope) -> SyncSocketResult<()> {
        self.protocol.stats.envelopes_in += 1;

        match envelope.route() {
            Route::Control { topic, phase } => {
                if !self.protocol.registry.accepts(topic) {
                    self.drop_envelope(envelope, "topic not subscribed");
                    return Ok(());
                }
                match phase {
                    Phase::Prepare => self.handle_event(ProtocolEvent::Prepare, |p, _| {
                        p.prepare(topic, &envelope.data)
                    }),
                    Phase::Schedule => self.handle_event(ProtocolEvent::Schedule, |p, _| {
                        p.schedule(topic, envelope)
                    }),
                }
            }
            Route::User { .. } => {
                self.drop_envelope(envelope, "invalid user sub-topic");
                Ok(())
            }
            Route::Service(ServiceOp::Initialize) => self.initialize(&envelope.data),
            Route::Service(ServiceOp::Synchronize) => self.synchronize(),
            Route::Service(ServiceOp::InitialState) => {
                self.hub.emit(Notification::InitialState {
                    data: envelope.data.clone(),
                });
                Ok(())
            }
            Route::Service(_) => {
                self.drop_envelope(envelope, "unrecognized service message");
                Ok(())
            }
            Route::Unknown(_) => {
                self.drop_envelope(envelope, "unknown namespace");
                Ok(())
            }
        }
    }

    /// Force `ready`/`scheduled` back to `idle`, clearing any armed fire
    pub fn cancel(&mut self) {
        let _ = self.handle_event(ProtocolEvent::Cancel, |p, _| {
            p.disarm();
            Ok(())
        });
    }

    /// Outcome of the sync started by `StartSync { attempt }`
    pub fn sync_completed(&mut self, attempt: u32, result: SyncResult) {
        if !self.sync_in_flight(attempt) {
            tracing::debug!(channel = %self.protocol.channel_id, attempt, "ignoring stale sync result");
            return;
        }

        if result.successful {
            self.protocol.last_sync = Some(result);
            self.protocol.sync_attempt = 0;
            match self.machine.finalize() {
                Ok(change) => {
                    // Leaving ready/scheduled for idle drops the pending fire
                    self.protocol.disarm();
                    self.did_transition(change);
                }
                Err(e) => {
                    tracing::warn!(channel = %self.protocol.channel_id, "sync finalize failed: {}", e);
                }
            }
            self.hub.emit(Notification::sync_successful(&result));
            return;
        }

        self.protocol.stats.sync_failures += 1;
        let policy = self.protocol.config.sync_retry;
        let will_retry = policy.should_retry(attempt);
        tracing::warn!(
            channel = %self.protocol.channel_id,
            attempt,
            will_retry,
            "{}",
            SyncSocketError::SyncFailure { error: result.error }
        );
        self.hub.emit(Notification::SyncFailed {
            error: result.error,
            attempt,
            will_retry,
        });

        if will_retry {
            self.protocol.sync_attempt = attempt + 1;
            self.protocol.effects.push(Effect::ScheduleSyncRetry {
                attempt: attempt + 1,
                delay: policy.backoff,
            });
            return;
        }

        match policy.on_exhausted {
            ExhaustedPolicy::Abandon => {
                self.machine.abandon();
                self.protocol.sync_attempt = 0;
                tracing::warn!(
                    channel = %self.protocol.channel_id,
                    state = %self.machine.current(),
                    "sync attempts exhausted, synchronize abandoned"
                );
                // A fire that ran during the sync still owes its finalize
                if self.machine.current() == ChannelState::Scheduled && self.protocol.armed.is_none() {
                    let _ = self.handle_event(ProtocolEvent::Finalize, |_, _| Ok(()));
                }
            }
            ExhaustedPolicy::StayPending => {
                tracing::warn!(
                    channel = %self.protocol.channel_id,
                    "sync attempts exhausted, synchronize left pending"
                );
            }
        }
    }

    /// Backoff for `ScheduleSyncRetry { attempt }` elapsed
    pub fn retry_sync(&mut self, attempt: u32) {
        if self.sync_in_flight(attempt) {
            self.protocol.effects.push(Effect::StartSync { attempt });
        }
    }

    /// Timer `id` expired: run the captured fire, then `finalize`
    pub fn timer_fired(&mut self, id: TimerId) {
        if self.armed_timer() != Some(id) {
            tracing::debug!(channel = %self.protocol.channel_id, "ignoring stale timer {:?}", id);
            return;
        }
        let Some(armed) = self.protocol.armed.take() else {
            return;
        };

        if armed.fires {
            self.protocol.stats.fires += 1;
            (armed.fire)(&armed.data);
        }
        if self.machine.is_pending() {
            // The pending synchronize lands in idle and reports it
            tracing::debug!(channel = %self.protocol.channel_id, "fired during synchronize, finalize skipped");
            return;
        }
        let _ = self.handle_event(ProtocolEvent::Finalize, |_, _| Ok(()));
    }

    /// Take the queued effects in order
    pub fn drain_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.protocol.effects)
    }

    pub fn has_effects(&self) -> bool {
        !self.protocol.effects.is_empty()
    }

    fn initialize(&mut self, data: &Value) -> SyncSocketResult<()> {
        let before = self.machine.current();
        self.handle_event(ProtocolEvent::Initialize, |p, _| p.initialize(data))?;

        let initialized = before == ChannelState::Uninitialized
            && self.machine.current() == ChannelState::Unsynchronized;
        if initialized && self.protocol.config.sync_on_initialize {
            self.synchronize()?;
        }
        Ok(())
    }

    fn synchronize(&mut self) -> SyncSocketResult<()> {
        self.handle_event(ProtocolEvent::Synchronize, |p, deferral| {
            p.synchronize(deferral)
        })
    }

    fn sync_in_flight(&self, attempt: u32) -> bool {
        let pending_sync = self
            .machine
            .pending()
            .is_some_and(|pending| pending.event == ProtocolEvent::Synchronize);
        pending_sync && attempt != 0 && attempt == self.protocol.sync_attempt
    }

    fn handle_event<F>(&mut self, event: ProtocolEvent, action: F) -> SyncSocketResult<()>
    where
        F: FnOnce(&mut Protocol, &mut Deferral) -> SyncSocketResult<()>,
    {
        let protocol = &mut self.protocol;
        let result = self
            .machine
            .handle_event(event, |deferral| action(protocol, deferral));

        match result {
            Ok(Outcome::Completed(change)) => {
                self.did_transition(change);
                Ok(())
            }
            Ok(Outcome::Deferred(pending)) => {
                tracing::debug!(
                    channel = %self.protocol.channel_id,
                    state = %pending.from,
                    "{} deferred towards {}",
                    event,
                    pending.target
                );
                Ok(())
            }
            Err(HandleError::Rejected(rejection)) => {
                self.protocol.stats.rejected_events += 1;
                let state = match &rejection {
                    TransitionError::NotAllowed { state, .. } => *state,
                    _ => self.machine.current(),
                };
                tracing::warn!(
                    channel = %self.protocol.channel_id,
                    "{} ({})",
                    SyncSocketError::InvalidTransition { event, state },
                    rejection
                );
                Ok(())
            }
            Err(HandleError::Action(err)) if err.is_fatal() => {
                tracing::error!(channel = %self.protocol.channel_id, "{} failed: {}", event, err);
                self.hub.emit(Notification::Error {
                    reason: err.to_string(),
                });
                Err(err)
            }
            Err(HandleError::Action(err)) => {
                tracing::warn!(channel = %self.protocol.channel_id, "{} dropped: {}", event, err);
                Ok(())
            }
        }
    }

    fn did_transition(&mut self, change: StateChange<ChannelState>) {
        self.protocol.stats.transitions += 1;
        tracing::debug!(channel = %self.protocol.channel_id, "{} -> {}", change.from, change.to);
        self.report(change.to);
        self.hub.emit(Notification::Transition {
            from: change.from,
            to: change.to,
        });
    }

    fn report(&mut self, state: ChannelState) {
        let envelope = Envelope::report_state(self.protocol.channel_id.clone(), state);
        self.protocol.effects.push(Effect::Send(envelope));
    }

    fn drop_envelope(&mut self, envelope: &Envelope, reason: &str) {
        self.protocol.stats.envelopes_dropped += 1;
        tracing::debug!(
            channel = %self.protocol.channel_id,
            topic = %envelope.topic,
            "{}",
            SyncSocketError::UnroutableEnvelope(reason.to_string())
        );
    }
}
