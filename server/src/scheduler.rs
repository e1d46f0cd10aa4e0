//! # Tick Scheduler
//!
//! Owns every piece of per-tick state and runs one iteration in a fixed order:
//!
//! 1. Receive transport events, in arrival order (sessions open and close,
//!    inbound actions are validated and queued)
//! 2. Update sessions (latency samples, ownership of vanished objects)
//! 3. Drain and apply queued actions
//! 4. Step the simulation by the fixed interval
//! 5. Run tick hooks in registration order
//! 6. Replicate and flush
//!
//! [`TickScheduler::run`] repeats that under the [`Pacer`] until the shutdown
//! signal fires. Nothing here is shared across tasks; the only suspension
//! point is the pacing sleep.

use crate::accumulator::ActionAccumulator;
use crate::error::ServerError;
use crate::pacing::{Pacer, PacerConfig, PacingStats};
use crate::replication::{GateStats, InterestConfig, ReplicationGate};
use crate::session::{DisconnectPolicy, SessionConfig, SessionRegistry};
use crate::simulation::Simulation;
use crate::transport::{Transport, TransportEvent};
use log::{debug, error, info, warn};
use shared::{encode, Message, ObjectId, PeerId};
use std::time::Instant;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub pacer: PacerConfig,
    pub interest: InterestConfig,
    pub session: SessionConfig,
    /// Ticks between periodic diagnostics; 0 disables them.
    pub log_interval: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            pacer: PacerConfig::default(),
            interest: InterestConfig::default(),
            session: SessionConfig::default(),
            log_interval: u64::from(shared::DEFAULT_TICK_RATE),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    Stopped,
}

/// Mutable view of the tick state handed to hooks.
pub struct TickContext<'a, S> {
    pub tick: u64,
    pub dt: f32,
    pub sim: &'a mut S,
    pub sessions: &'a mut SessionRegistry,
    pub actions: &'a mut ActionAccumulator,
}

/// Server-side extension point. Hooks run on the tick task, in the order they
/// were added.
pub trait TickHook<S> {
    /// Runs right after a session is created and its playout delay queued.
    fn on_session_connected(&mut self, _ctx: &mut TickContext<'_, S>, _peer: PeerId) {}

    /// Runs after the simulation step, before replication.
    fn on_tick(&mut self, _ctx: &mut TickContext<'_, S>) {}
}

/// What happened during one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub tick: u64,
    pub connected: Vec<PeerId>,
    pub disconnected: Vec<PeerId>,
    /// Peers refused at connect (server full).
    pub refused: Vec<PeerId>,
    pub dropped_inbound: usize,
    pub actions_applied: usize,
    pub messages_sent: usize,
    pub overflowed: usize,
}

pub struct TickScheduler<T, S> {
    transport: T,
    sim: S,
    sessions: SessionRegistry,
    actions: ActionAccumulator,
    gate: ReplicationGate,
    hooks: Vec<Box<dyn TickHook<S>>>,
    pacer: Pacer,
    state: SchedulerState,
    tick: u64,
    log_interval: u64,
    events: Vec<TransportEvent>,
}

impl<T: Transport, S: Simulation> TickScheduler<T, S> {
    pub fn new(transport: T, sim: S, config: SchedulerConfig) -> Self {
        Self {
            transport,
            sim,
            sessions: SessionRegistry::new(config.session),
            actions: ActionAccumulator::new(),
            gate: ReplicationGate::new(config.interest),
            hooks: Vec::new(),
            pacer: Pacer::new(config.pacer),
            state: SchedulerState::Idle,
            tick: 0,
            log_interval: config.log_interval,
            events: Vec::new(),
        }
    }

    pub fn with_hook(mut self, hook: impl TickHook<S> + 'static) -> Self {
        self.add_hook(hook);
        self
    }

    pub fn add_hook(&mut self, hook: impl TickHook<S> + 'static) {
        self.hooks.push(Box::new(hook));
    }

    /// Runs one full iteration without pacing.
    pub fn tick(&mut self) -> TickReport {
        if self.state == SchedulerState::Idle {
            self.state = SchedulerState::Running;
        }
        self.tick += 1;
        let dt = self.pacer.desired_dt().as_secs_f32();
        let mut report = TickReport {
            tick: self.tick,
            ..TickReport::default()
        };

        let mut events = std::mem::take(&mut self.events);
        self.transport.poll_events(&mut events);
        for event in events.drain(..) {
            match event {
                TransportEvent::Connected(peer) => self.open_session(peer, dt, &mut report),
                TransportEvent::Disconnected(peer) => {
                    if self.close_session(peer).is_some() {
                        report.disconnected.push(peer);
                    }
                }
                TransportEvent::Received(peer, payload) => {
                    if let Err(e) =
                        self.gate
                            .handle_inbound(peer, &payload, &self.sessions, &mut self.actions)
                    {
                        debug!("Dropped payload from {}: {}", peer, e);
                        report.dropped_inbound += 1;
                    }
                }
            }
        }
        self.events = events;

        for peer in self.sessions.peers() {
            if let Some(rtt) = self.transport.round_trip_time(peer) {
                self.sessions.update_latency(peer, rtt);
            }
        }
        let sim = &self.sim;
        self.sessions.retain_existing(|object| sim.contains(object));

        report.actions_applied = self.actions.drain_all(&mut self.sim);

        self.sim.step(dt);

        let mut ctx = TickContext {
            tick: self.tick,
            dt,
            sim: &mut self.sim,
            sessions: &mut self.sessions,
            actions: &mut self.actions,
        };
        for hook in &mut self.hooks {
            hook.on_tick(&mut ctx);
        }

        let output = self.gate.replicate(self.tick, &self.sim, &self.sessions);
        report.overflowed = output.overflowed;
        for outbound in output.messages {
            match self.send_message(outbound.peer, &outbound.message) {
                Ok(()) => report.messages_sent += 1,
                Err(e) => error!("Dropping message for {}: {}", outbound.peer, e),
            }
        }
        self.transport.flush();

        if self.log_interval > 0 && self.tick % self.log_interval == 0 {
            self.log_diagnostics();
        }
        report
    }

    /// Ticks under the pacer until `shutdown` turns true or its sender drops.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        self.state = SchedulerState::Running;
        info!(
            "Tick loop running at {:.1}Hz",
            1.0 / self.pacer.desired_dt().as_secs_f64()
        );

        while !*shutdown.borrow() {
            let delay = self.pacer.begin_iteration(Instant::now());
            self.tick();

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.state = SchedulerState::Stopped;
        let stats = self.pacer.stats();
        info!(
            "Tick loop stopped after {} ticks ({} overruns, average period {:?})",
            self.tick, stats.overruns, stats.average_period
        );
    }

    /// Drops a peer from the server side and cleans up exactly like a
    /// transport disconnect. Returns the objects the session owned.
    pub fn evict(&mut self, peer: PeerId) -> Option<Vec<ObjectId>> {
        if !self.sessions.contains(peer) {
            return None;
        }
        info!("Evicting {}", peer);
        self.transport.disconnect(peer);
        self.close_session(peer)
    }

    fn open_session(&mut self, peer: PeerId, dt: f32, report: &mut TickReport) {
        let measured_rtt = self.transport.round_trip_time(peer);
        let playout_delay = match self.sessions.on_connect(peer, measured_rtt) {
            Ok(session) => session.playout_delay,
            Err(e) => {
                warn!("Refusing {}: {}", peer, e);
                self.transport.disconnect(peer);
                report.refused.push(peer);
                return;
            }
        };

        let delay_micros = u64::try_from(playout_delay.as_micros()).unwrap_or(u64::MAX);
        if let Err(e) = self.send_message(peer, &Message::SetPlayoutDelay { delay_micros }) {
            error!("Failed to send playout delay to {}: {}", peer, e);
        }
        report.connected.push(peer);

        let mut ctx = TickContext {
            tick: self.tick,
            dt,
            sim: &mut self.sim,
            sessions: &mut self.sessions,
            actions: &mut self.actions,
        };
        for hook in &mut self.hooks {
            hook.on_session_connected(&mut ctx, peer);
        }
    }

    fn close_session(&mut self, peer: PeerId) -> Option<Vec<ObjectId>> {
        self.gate.forget_peer(peer);
        let owned = self.sessions.on_disconnect(peer)?;

        let policy = self.sessions.config().disconnect_policy;
        for object in &owned {
            self.actions.discard(*object);
            if policy == DisconnectPolicy::DestroyOwned {
                self.sim.destroy(*object);
            }
        }
        Some(owned)
    }

    fn send_message(&mut self, peer: PeerId, message: &Message) -> Result<(), ServerError> {
        let bytes = encode(message)?;
        self.transport.send(peer, bytes, message.channel());
        Ok(())
    }

    fn log_diagnostics(&self) {
        let pacing = self.pacer.stats();
        let gate = self.gate.stats();
        debug!(
            "Tick {}: {} sessions, {} objects, {:.1}Hz, {} overruns, dropped {}/{}/{}/{}",
            self.tick,
            self.sessions.len(),
            self.sim.object_ids().len(),
            1.0 / pacing.average_period.as_secs_f64().max(f64::EPSILON),
            pacing.overruns,
            gate.malformed,
            gate.unowned,
            gate.non_finite,
            gate.unexpected
        );
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    pub fn sim(&self) -> &S {
        &self.sim
    }

    pub fn sim_mut(&mut self) -> &mut S {
        &mut self.sim
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn sessions_mut(&mut self) -> &mut SessionRegistry {
        &mut self.sessions
    }

    pub fn actions_mut(&mut self) -> &mut ActionAccumulator {
        &mut self.actions
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn gate_stats(&self) -> GateStats {
        self.gate.stats()
    }

    pub fn pacing_stats(&self) -> &PacingStats {
        self.pacer.stats()
    }
}
