//! Fire-spread simulator - how simultaneous is "simultaneous"?
//!
//! Simulates:
//! - Many clients whose clocks are offset from the server's and drift apart
//! - Imperfect offset measurements (bounded by the sync `error`)
//! - Per-client delivery latency of the `schedule` envelope
//! - Stale offsets when clients re-synchronize only every few rounds
//!
//! Each client runs a real [`ChannelEngine`] against a [`ManualClock`]; the
//! simulator plays the server and measures, in server time, how far apart
//! the clients' fire callbacks ran.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};

use syncsocket_core::{ChannelId, LocalTime, RemoteTime, SyncResult};
use syncsocket_runtime::{ChannelConfig, ChannelEngine, ChannelSpec, Effect, Subscription};
use syncsocket_time::{ManualClock, WallClock};
use syncsocket_wire::{control_topic, service_topic, Envelope, Phase, ServiceOp};

const TOPIC: &str = "go";

/// Clock and link model of one simulated client
#[derive(Clone, Debug)]
pub struct ClientModel {
    /// Initial `remote - local` offset (ms)
    pub offset_ms: f64,
    /// Offset change per round (ms)
    pub drift_ms_per_round: f64,
    /// Bound of the measurement error of one sync (ms)
    pub sync_error_ms: f64,
    /// Delivery latency range of `schedule` (ms)
    pub latency_ms: (u64, u64),
}

impl ClientModel {
    pub fn new(offset_ms: f64, sync_error_ms: f64) -> Self {
        ClientModel {
            offset_ms,
            drift_ms_per_round: 0.0,
            sync_error_ms,
            latency_ms: (5, 40),
        }
    }

    /// Clock equal to the server's, exact measurements
    pub fn perfect() -> Self {
        Self::new(0.0, 0.0)
    }

    /// Clock several seconds off, measured to within a few ms
    pub fn skewed(offset_ms: f64) -> Self {
        Self::new(offset_ms, 4.0)
    }

    /// Drifting clock
    pub fn drifting(drift_ms_per_round: f64) -> Self {
        ClientModel {
            drift_ms_per_round,
            ..Self::new(0.0, 2.0)
        }
    }

    pub fn with_latency(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.latency_ms = (min_ms, max_ms);
        self
    }
}

/// One simulated client
pub struct SimulatedClient {
    pub model: ClientModel,
    engine: ChannelEngine,
    clock: ManualClock,
    /// Current true offset (ms)
    offset_ms: f64,
    /// Local time of the last fire callback
    fired_at: Arc<AtomicI64>,
}

impl SimulatedClient {
    fn new(id: usize, model: ClientModel, config: ChannelConfig) -> Self {
        let clock = ManualClock::new(LocalTime::from_millis(0));
        let channel = ChannelId::new(format!("client-{id}"));
        let mut engine = ChannelEngine::new(
            ChannelSpec::subscriber(channel.clone()),
            config,
            Arc::new(clock.clone()),
        );

        let fired_at = Arc::new(AtomicI64::new(i64::MIN));
        let fire_clock = clock.clone();
        let fire_slot = Arc::clone(&fired_at);
        engine.subscribe(
            TOPIC,
            Subscription::new(
                |_| {},
                move |_| fire_slot.store(fire_clock.now().as_millis(), Ordering::SeqCst),
            ),
        );

        let initialize = Envelope::service(
            channel,
            ServiceOp::Initialize,
            json!({ "timeserver": "sim" }),
        );
        if let Err(e) = engine.inject_message(&initialize) {
            tracing::error!("simulated client failed to initialize: {}", e);
        }

        SimulatedClient {
            offset_ms: model.offset_ms,
            model,
            engine,
            clock,
            fired_at,
        }
    }

    fn set_server_time(&self, server_ms: i64) {
        let local = server_ms - self.offset_ms.round() as i64;
        self.clock.set(LocalTime::from_millis(local));
    }

    /// Complete a sync with a noisy measurement of the current offset
    fn synchronize(&mut self, rng: &mut StdRng) {
        let error = self.model.sync_error_ms;
        let noise = if error > 0.0 {
            rng.gen_range(-error..=error)
        } else {
            0.0
        };
        let attempt = self
            .engine
            .drain_effects()
            .into_iter()
            .find_map(|effect| match effect {
                Effect::StartSync { attempt } => Some(attempt),
                _ => None,
            });
        if let Some(attempt) = attempt {
            self.engine
                .sync_completed(attempt, SyncResult::success(self.offset_ms + noise, error));
        }
        self.engine.drain_effects();
    }

    fn inject(&mut self, envelope: &Envelope) {
        if let Err(e) = self.engine.inject_message(envelope) {
            tracing::warn!("simulated client rejected envelope: {}", e);
        }
    }

    fn channel(&self) -> ChannelId {
        self.engine.channel_id().clone()
    }

    pub fn engine(&self) -> &ChannelEngine {
        &self.engine
    }
}

/// Outcome of one prepare/schedule round
#[derive(Clone, Debug, Default)]
pub struct RoundResult {
    /// Server time at which each client fired, `None` if it did not
    pub fire_times: Vec<Option<i64>>,
    pub ticket: i64,
}

impl RoundResult {
    /// Max minus min server fire time among clients that fired
    pub fn spread_ms(&self) -> i64 {
        let fired: Vec<i64> = self.fire_times.iter().flatten().copied().collect();
        match (fired.iter().min(), fired.iter().max()) {
            (Some(min), Some(max)) => max - min,
            _ => 0,
        }
    }

    /// Largest distance between a fire and the ticket
    pub fn max_deviation_ms(&self) -> i64 {
        self.fire_times
            .iter()
            .flatten()
            .map(|t| (t - self.ticket).abs())
            .max()
            .unwrap_or(0)
    }

    pub fn missed(&self) -> usize {
        self.fire_times.iter().filter(|t| t.is_none()).count()
    }
}

/// Aggregated simulation statistics
#[derive(Debug, Default)]
pub struct SimulationResult {
    pub rounds: usize,
    pub max_spread_ms: i64,
    pub avg_spread_ms: f64,
    pub max_deviation_ms: i64,
    pub missed_fires: usize,
    pub late_fires: u64,
    spreads: Vec<i64>,
}

impl SimulationResult {
    fn record(&mut self, round: &RoundResult) {
        let spread = round.spread_ms();
        self.rounds += 1;
        self.spreads.push(spread);
        self.max_spread_ms = self.max_spread_ms.max(spread);
        self.max_deviation_ms = self.max_deviation_ms.max(round.max_deviation_ms());
        self.missed_fires += round.missed();
    }

    fn finalize(&mut self, clients: &[SimulatedClient]) {
        if !self.spreads.is_empty() {
            let sum: i64 = self.spreads.iter().sum();
            self.avg_spread_ms = sum as f64 / self.spreads.len() as f64;
        }
        self.late_fires = clients.iter().map(|c| c.engine.stats().late_fires).sum();
    }
}

/// Server driving a group of clients through prepare/schedule rounds
pub struct FireSimulator {
    clients: Vec<SimulatedClient>,
    rng: StdRng,
    /// Server clock (ms)
    server_ms: i64,
    /// Ticket distance ahead of the server clock
    lead: Duration,
    /// Re-synchronize every n rounds (0: never after the first)
    resync_every: usize,
    round: usize,
}

impl FireSimulator {
    pub fn new(lead: Duration, seed: u64) -> Self {
        FireSimulator {
            clients: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
            server_ms: 1_700_000_000_000,
            lead,
            resync_every: 0,
            round: 0,
        }
    }

    pub fn with_resync_every(mut self, rounds: usize) -> Self {
        self.resync_every = rounds;
        self
    }

    /// Add a client with the default channel configuration
    pub fn add_client(&mut self, model: ClientModel) {
        self.add_client_with_config(model, ChannelConfig::default());
    }

    pub fn add_client_with_config(&mut self, model: ClientModel, config: ChannelConfig) {
        let mut client = SimulatedClient::new(self.clients.len(), model, config);
        client.set_server_time(self.server_ms);
        client.synchronize(&mut self.rng);
        self.clients.push(client);
    }

    pub fn clients(&self) -> &[SimulatedClient] {
        &self.clients
    }

    /// Run `rounds` rounds
    pub fn run(&mut self, rounds: usize) -> SimulationResult {
        let mut result = SimulationResult::default();
        for _ in 0..rounds {
            let round = self.run_round();
            result.record(&round);
        }
        result.finalize(&self.clients);
        result
    }

    /// One prepare/schedule/fire round across all clients
    pub fn run_round(&mut self) -> RoundResult {
        self.round += 1;
        self.server_ms += 1_000;

        for client in &mut self.clients {
            client.offset_ms += client.model.drift_ms_per_round;
        }
        if self.resync_every > 0 && self.round % self.resync_every == 0 {
            self.resynchronize();
        }

        let ticket = self.server_ms + self.lead.as_millis() as i64;
        let mut fire_times = Vec::with_capacity(self.clients.len());

        for client in &mut self.clients {
            let channel = client.channel();
            client.fired_at.store(i64::MIN, Ordering::SeqCst);

            client.set_server_time(self.server_ms);
            client.inject(&Envelope::new(
                channel.clone(),
                control_topic(TOPIC, Phase::Prepare),
                Value::Null,
            ));
            client.engine.drain_effects();

            let (min, max) = client.model.latency_ms;
            let latency = self.rng.gen_range(min..=max.max(min)) as i64;
            client.set_server_time(self.server_ms + latency);
            client.inject(
                &Envelope::new(channel, control_topic(TOPIC, Phase::Schedule), Value::Null)
                    .with_timeticket(RemoteTime::from_millis(ticket)),
            );

            let armed = client
                .engine
                .drain_effects()
                .into_iter()
                .find_map(|effect| match effect {
                    Effect::ArmTimer { id, delay } => Some((id, delay)),
                    _ => None,
                });
            if let Some((id, delay)) = armed {
                client.clock.advance(delay);
                client.engine.timer_fired(id);
                client.engine.drain_effects();
            }

            let fired = client.fired_at.load(Ordering::SeqCst);
            fire_times.push((fired != i64::MIN).then(|| fired + client.offset_ms.round() as i64));
        }

        RoundResult { fire_times, ticket }
    }

    fn resynchronize(&mut self) {
        for client in &mut self.clients {
            client.set_server_time(self.server_ms);
            let envelope = Envelope::new(client.channel(), service_topic(ServiceOp::Synchronize), Value::Null);
            client.inject(&envelope);
            client.synchronize(&mut self.rng);
        }
    }
}

/// Predefined scenarios
pub mod scenarios {
    use super::*;

    /// Clients sharing the server's clock
    pub fn perfect(count: usize) -> FireSimulator {
        let mut sim = FireSimulator::new(Duration::from_millis(200), 1);
        for _ in 0..count {
            sim.add_client(ClientModel::perfect());
        }
        sim
    }

    /// Clients seconds apart, each measured to within a few ms
    pub fn skewed(count: usize) -> FireSimulator {
        let mut sim = FireSimulator::new(Duration::from_millis(200), 2);
        for i in 0..count {
            let offset = (i as f64 - count as f64 / 2.0) * 1_500.0;
            sim.add_client(ClientModel::skewed(offset));
        }
        sim
    }

    /// Drifting clocks that never re-synchronize
    pub fn stale_offsets(count: usize) -> FireSimulator {
        let mut sim = FireSimulator::new(Duration::from_millis(200), 3);
        for i in 0..count {
            let drift = if i % 2 == 0 { 1.5 } else { -1.5 };
            sim.add_client(ClientModel::drifting(drift));
        }
        sim
    }

    /// Same drift, re-synchronized every round
    pub fn resynced_offsets(count: usize) -> FireSimulator {
        let mut sim = FireSimulator::new(Duration::from_millis(200), 3).with_resync_every(1);
        for i in 0..count {
            let drift = if i % 2 == 0 { 1.5 } else { -1.5 };
            sim.add_client(ClientModel::drifting(drift));
        }
        sim
    }

    /// Tickets closer than the delivery latency
    pub fn short_lead(count: usize) -> FireSimulator {
        let mut sim = FireSimulator::new(Duration::from_millis(10), 4);
        for _ in 0..count {
            sim.add_client(ClientModel::skewed(250.0).with_latency(20, 60));
        }
        sim
    }
}
