//! Replication gate between the simulation and the connected peers
//!
//! Outbound, each peer gets an interest set every tick: the objects it owns
//! plus whatever lies inside an axis-aligned box around its anchor (the
//! position of its first owned object). Objects entering the set are
//! constructed over the reliable channel, known objects get unreliable
//! snapshots carrying only changed fields, and objects leaving the set or the
//! world are torn down reliably.
//!
//! Snapshots are diffed against the last state sent, so a lost or late diff
//! would otherwise leave a field stale on the client. Every known object is
//! therefore resent in full once per `refresh_interval` ticks, which bounds
//! how long any loss can linger.
//!
//! Inbound, client payloads are decoded and validated here before anything
//! reaches the [`ActionAccumulator`]. Bad input is counted in [`GateStats`]
//! and dropped; it never aborts the tick.

use crate::accumulator::{ActionAccumulator, ActionRejected};
use crate::session::SessionRegistry;
use crate::simulation::Simulation;
use log::{debug, warn};
use shared::{decode, CodecError, Message, ObjectId, ObjectState, PeerId};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InterestConfig {
    /// Half extent of the interest box on each axis.
    pub half_extent: [f32; 3],
    /// Cap on replicated objects per peer. Owned objects always count and are
    /// always admitted.
    pub max_interest: usize,
    /// Ticks between full-state snapshots of a known object; 0 disables them.
    pub refresh_interval: u64,
}

impl Default for InterestConfig {
    fn default() -> Self {
        Self {
            half_extent: [50.0; 3],
            max_interest: 256,
            refresh_interval: 60,
        }
    }
}

/// Counters for dropped inbound payloads and interest overflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateStats {
    pub malformed: u64,
    pub unowned: u64,
    pub non_finite: u64,
    pub unexpected: u64,
    pub overflow: u64,
}

#[derive(Debug, Error)]
pub enum InboundError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] CodecError),
    #[error("non-finite action value for {0}")]
    NonFinite(ObjectId),
    #[error(transparent)]
    Unowned(#[from] ActionRejected),
    #[error("unexpected {0} message from client")]
    Unexpected(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub peer: PeerId,
    pub message: Message,
}

#[derive(Debug, Default)]
pub struct ReplicationOutput {
    /// Messages in send order; per-peer order is preserved.
    pub messages: Vec<Outbound>,
    /// Objects left out of interest sets because of the cap, summed over peers.
    pub overflowed: usize,
}

#[derive(Debug, Clone, Copy)]
struct KnownObject {
    /// Last state sent.
    state: ObjectState,
    /// Tick of the last construction or full refresh.
    refreshed_at: u64,
}

#[derive(Debug, Default)]
struct PeerView {
    known: BTreeMap<ObjectId, KnownObject>,
    owned_notified: BTreeSet<ObjectId>,
}

fn inside(center: [f32; 3], half_extent: [f32; 3], point: [f32; 3]) -> bool {
    (0..3).all(|axis| (point[axis] - center[axis]).abs() <= half_extent[axis])
}

fn distance_squared(a: [f32; 3], b: [f32; 3]) -> f32 {
    (0..3).map(|axis| (a[axis] - b[axis]).powi(2)).sum()
}

fn message_name(message: &Message) -> &'static str {
    match message {
        Message::SetPlayoutDelay { .. } => "SetPlayoutDelay",
        Message::ObjectConstructed { .. } => "ObjectConstructed",
        Message::ObjectDestroyed { .. } => "ObjectDestroyed",
        Message::OwnershipChanged { .. } => "OwnershipChanged",
        Message::ControlAction { .. } => "ControlAction",
        Message::StateSnapshot { .. } => "StateSnapshot",
    }
}

pub struct ReplicationGate {
    config: InterestConfig,
    views: HashMap<PeerId, PeerView>,
    stats: GateStats,
}

impl ReplicationGate {
    pub fn new(config: InterestConfig) -> Self {
        Self {
            config,
            views: HashMap::new(),
            stats: GateStats::default(),
        }
    }

    pub fn stats(&self) -> GateStats {
        self.stats
    }

    /// Drops everything remembered about a peer.
    pub fn forget_peer(&mut self, peer: PeerId) {
        self.views.remove(&peer);
    }

    /// Decodes one client payload and forwards valid actions to the accumulator.
    pub fn handle_inbound(
        &mut self,
        peer: PeerId,
        payload: &[u8],
        sessions: &SessionRegistry,
        actions: &mut ActionAccumulator,
    ) -> Result<(), InboundError> {
        let message = decode::<Message>(payload).map_err(|e| {
            self.stats.malformed += 1;
            debug!("Malformed payload ({} bytes) from {}: {}", payload.len(), peer, e);
            InboundError::from(e)
        })?;

        match message {
            Message::ControlAction { object_id, action } => {
                if !action.is_finite() {
                    self.stats.non_finite += 1;
                    debug!("Non-finite {:?} from {} for {}", action, peer, object_id);
                    return Err(InboundError::NonFinite(object_id));
                }
                actions
                    .submit(sessions, peer, object_id, action)
                    .map_err(|rejected| {
                        self.stats.unowned += 1;
                        InboundError::from(rejected)
                    })
            }
            other => {
                self.stats.unexpected += 1;
                let name = message_name(&other);
                debug!("Unexpected {} from {}", name, peer);
                Err(InboundError::Unexpected(name))
            }
        }
    }

    /// Computes this tick's outbound messages for every session.
    ///
    /// Per peer the order is: teardown (destroyed objects, lost ownership),
    /// then constructions and snapshots, then gained ownership.
    pub fn replicate<S: Simulation>(
        &mut self,
        tick: u64,
        sim: &S,
        sessions: &SessionRegistry,
    ) -> ReplicationOutput {
        self.views.retain(|peer, _| sessions.contains(*peer));

        let mut output = ReplicationOutput::default();
        let all_objects = sim.object_ids();
        let refresh_interval = self.config.refresh_interval;

        for peer in sessions.peers() {
            let Some(session) = sessions.get(peer) else {
                continue;
            };
            let owned: Vec<ObjectId> = session
                .owned_objects
                .iter()
                .copied()
                .filter(|object| sim.contains(*object))
                .collect();

            let (interest, overflowed) = self.interest_set(&owned, &all_objects, sim);
            if overflowed > 0 {
                self.stats.overflow += overflowed as u64;
                warn!(
                    "Interest overflow for {}: {} objects not replicated",
                    peer, overflowed
                );
            }
            output.overflowed += overflowed;

            let view = self.views.entry(peer).or_default();
            let mut push = |message: Message| output.messages.push(Outbound { peer, message });

            let leaving: Vec<ObjectId> = view
                .known
                .keys()
                .copied()
                .filter(|object| !interest.contains(object))
                .collect();
            for object_id in leaving {
                view.known.remove(&object_id);
                view.owned_notified.remove(&object_id);
                push(Message::ObjectDestroyed { object_id });
            }

            let released: Vec<ObjectId> = view
                .owned_notified
                .iter()
                .copied()
                .filter(|object| !owned.contains(object))
                .collect();
            for object_id in released {
                view.owned_notified.remove(&object_id);
                push(Message::OwnershipChanged {
                    object_id,
                    owned: false,
                });
            }

            for &object_id in &interest {
                let Some(state) = sim.object_state(object_id) else {
                    continue;
                };
                match view.known.get_mut(&object_id) {
                    Some(known) => {
                        let refresh = refresh_interval > 0
                            && tick.saturating_sub(known.refreshed_at) >= refresh_interval;
                        let changes = if refresh {
                            known.refreshed_at = tick;
                            state.fields()
                        } else {
                            known.state.diff(&state)
                        };
                        if !changes.is_empty() {
                            known.state = state;
                            push(Message::StateSnapshot {
                                tick,
                                object_id,
                                changes,
                            });
                        }
                    }
                    None => {
                        push(Message::ObjectConstructed {
                            object_id,
                            state,
                            settings: sim.settings(object_id),
                        });
                        view.known.insert(
                            object_id,
                            KnownObject {
                                state,
                                refreshed_at: tick,
                            },
                        );
                    }
                }
            }

            for &object_id in &owned {
                if view.owned_notified.insert(object_id) {
                    push(Message::OwnershipChanged {
                        object_id,
                        owned: true,
                    });
                }
            }
        }

        output
    }

    /// Owned objects first, then volume objects nearest the anchor until the
    /// cap. Returns the set and how many volume objects did not fit.
    fn interest_set<S: Simulation>(
        &self,
        owned: &[ObjectId],
        all_objects: &[ObjectId],
        sim: &S,
    ) -> (BTreeSet<ObjectId>, usize) {
        let mut interest: BTreeSet<ObjectId> = owned.iter().copied().collect();

        let anchor = owned
            .first()
            .and_then(|object| sim.object_state(*object))
            .map(|state| state.position);
        let Some(anchor) = anchor else {
            return (interest, 0);
        };

        let mut nearby: Vec<(f32, ObjectId)> = all_objects
            .iter()
            .filter(|object| !interest.contains(*object))
            .filter_map(|object| {
                let position = sim.object_state(*object)?.position;
                inside(anchor, self.config.half_extent, position)
                    .then(|| (distance_squared(anchor, position), *object))
            })
            .collect();
        nearby.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        let room = self.config.max_interest.saturating_sub(interest.len());
        let overflowed = nearby.len().saturating_sub(room);
        interest.extend(nearby.into_iter().take(room).map(|(_, object)| object));
        (interest, overflowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionConfig;
    use shared::{encode, ActionRecord, ControlState, FieldChange, ObjectKind, VehicleSettings};

    /// Simulation stand-in whose objects the test moves by hand.
    #[derive(Default)]
    struct ScriptedWorld {
        objects: BTreeMap<ObjectId, ObjectState>,
    }

    impl ScriptedWorld {
        fn put(&mut self, id: u32, position: [f32; 3]) -> ObjectId {
            let object = ObjectId(id);
            self.objects.insert(
                object,
                ObjectState {
                    kind: ObjectKind::Vehicle,
                    position,
                    heading: 0.0,
                    velocity: [0.0; 3],
                    control: Some(ControlState::default()),
                },
            );
            object
        }
    }

    impl Simulation for ScriptedWorld {
        fn step(&mut self, _dt: f32) {}

        fn contains(&self, object: ObjectId) -> bool {
            self.objects.contains_key(&object)
        }

        fn object_ids(&self) -> Vec<ObjectId> {
            self.objects.keys().copied().collect()
        }

        fn object_state(&self, object: ObjectId) -> Option<ObjectState> {
            self.objects.get(&object).copied()
        }

        fn control_state_mut(&mut self, object: ObjectId) -> Option<&mut ControlState> {
            self.objects.get_mut(&object)?.control.as_mut()
        }

        fn settings(&self, _object: ObjectId) -> Option<VehicleSettings> {
            Some(VehicleSettings::default())
        }

        fn is_object_active(&self, _object: ObjectId) -> bool {
            true
        }

        fn wake(&mut self, _object: ObjectId) {}

        fn destroy(&mut self, object: ObjectId) -> bool {
            self.objects.remove(&object).is_some()
        }
    }

    fn sessions_with(peers: &[u64]) -> SessionRegistry {
        let mut sessions = SessionRegistry::new(SessionConfig::default());
        for peer in peers {
            sessions.on_connect(PeerId(*peer), None).unwrap();
        }
        sessions
    }

    fn messages_for(output: &ReplicationOutput, peer: PeerId) -> Vec<Message> {
        output
            .messages
            .iter()
            .filter(|outbound| outbound.peer == peer)
            .map(|outbound| outbound.message.clone())
            .collect()
    }

    #[test]
    fn test_owned_object_is_constructed_then_ownership_announced() {
        let mut world = ScriptedWorld::default();
        let vehicle = world.put(1, [0.0; 3]);
        let mut sessions = sessions_with(&[1]);
        sessions.assign_ownership(PeerId(1), &[vehicle]).unwrap();
        let mut gate = ReplicationGate::new(InterestConfig::default());

        let output = gate.replicate(1, &world, &sessions);
        let messages = messages_for(&output, PeerId(1));

        assert_eq!(messages.len(), 2);
        assert!(matches!(
            messages[0],
            Message::ObjectConstructed { object_id, settings: Some(_), .. } if object_id == vehicle
        ));
        assert_eq!(
            messages[1],
            Message::OwnershipChanged {
                object_id: vehicle,
                owned: true
            }
        );
    }

    #[test]
    fn test_snapshots_carry_only_changed_fields() {
        let mut world = ScriptedWorld::default();
        let vehicle = world.put(1, [0.0; 3]);
        let mut sessions = sessions_with(&[1]);
        sessions.assign_ownership(PeerId(1), &[vehicle]).unwrap();
        let mut gate = ReplicationGate::new(InterestConfig::default());
        gate.replicate(1, &world, &sessions);

        let unchanged = gate.replicate(2, &world, &sessions);
        assert!(unchanged.messages.is_empty());

        world.objects.get_mut(&vehicle).unwrap().heading = 0.5;
        let output = gate.replicate(3, &world, &sessions);
        assert_eq!(
            messages_for(&output, PeerId(1)),
            vec![Message::StateSnapshot {
                tick: 3,
                object_id: vehicle,
                changes: vec![FieldChange::Heading(0.5)],
            }]
        );
    }

    #[test]
    fn test_unchanged_object_is_refreshed_in_full() {
        let mut world = ScriptedWorld::default();
        let vehicle = world.put(1, [2.0, 0.0, 0.0]);
        let mut sessions = sessions_with(&[1]);
        sessions.assign_ownership(PeerId(1), &[vehicle]).unwrap();
        let mut gate = ReplicationGate::new(InterestConfig {
            refresh_interval: 3,
            ..InterestConfig::default()
        });
        gate.replicate(1, &world, &sessions);

        assert!(gate.replicate(2, &world, &sessions).messages.is_empty());
        assert!(gate.replicate(3, &world, &sessions).messages.is_empty());

        let state = world.object_state(vehicle).unwrap();
        let output = gate.replicate(4, &world, &sessions);
        assert_eq!(
            messages_for(&output, PeerId(1)),
            vec![Message::StateSnapshot {
                tick: 4,
                object_id: vehicle,
                changes: state.fields(),
            }]
        );
        assert!(gate.replicate(5, &world, &sessions).messages.is_empty());
    }

    /// A diff that never arrives is repaired by the next full refresh.
    #[test]
    fn test_lost_diff_is_repaired_by_refresh() {
        let mut world = ScriptedWorld::default();
        let vehicle = world.put(1, [0.0; 3]);
        let mut sessions = sessions_with(&[1]);
        sessions.assign_ownership(PeerId(1), &[vehicle]).unwrap();
        let mut gate = ReplicationGate::new(InterestConfig {
            refresh_interval: 10,
            ..InterestConfig::default()
        });

        let mut client_copy = None;
        for message in messages_for(&gate.replicate(1, &world, &sessions), PeerId(1)) {
            if let Message::ObjectConstructed { state, .. } = message {
                client_copy = Some(state);
            }
        }
        let mut client_copy = client_copy.unwrap();

        world.control_state_mut(vehicle).unwrap().throttle = 1.0;
        let lost = gate.replicate(2, &world, &sessions);
        assert_eq!(lost.messages.len(), 1);

        for tick in 3..=11 {
            world.objects.get_mut(&vehicle).unwrap().position[2] += 0.1;
            for message in messages_for(&gate.replicate(tick, &world, &sessions), PeerId(1)) {
                if let Message::StateSnapshot { changes, .. } = message {
                    client_copy.apply(&changes);
                }
            }
        }

        assert_eq!(client_copy, world.object_state(vehicle).unwrap());
        assert_eq!(client_copy.control.unwrap().throttle, 1.0);
    }

    #[test]
    fn test_no_anchor_means_owned_objects_only() {
        let mut world = ScriptedWorld::default();
        world.put(1, [0.0; 3]);
        let sessions = sessions_with(&[1]);
        let mut gate = ReplicationGate::new(InterestConfig::default());

        let output = gate.replicate(1, &world, &sessions);
        assert!(output.messages.is_empty());
    }

    #[test]
    fn test_object_leaving_volume_is_torn_down() {
        let mut world = ScriptedWorld::default();
        let mine = world.put(1, [0.0; 3]);
        let other = world.put(2, [10.0, 0.0, 0.0]);
        let mut sessions = sessions_with(&[1]);
        sessions.assign_ownership(PeerId(1), &[mine]).unwrap();
        let mut gate = ReplicationGate::new(InterestConfig {
            half_extent: [20.0; 3],
            max_interest: 16,
            ..InterestConfig::default()
        });

        let output = gate.replicate(1, &world, &sessions);
        assert!(messages_for(&output, PeerId(1)).iter().any(|message| matches!(
            message,
            Message::ObjectConstructed { object_id, .. } if *object_id == other
        )));

        world.objects.get_mut(&other).unwrap().position = [100.0, 0.0, 0.0];
        let output = gate.replicate(2, &world, &sessions);
        assert_eq!(
            messages_for(&output, PeerId(1)),
            vec![Message::ObjectDestroyed { object_id: other }]
        );
    }

    #[test]
    fn test_destroyed_object_is_torn_down_for_every_peer() {
        let mut world = ScriptedWorld::default();
        let a = world.put(1, [0.0; 3]);
        let b = world.put(2, [1.0, 0.0, 0.0]);
        let mut sessions = sessions_with(&[1, 2]);
        sessions.assign_ownership(PeerId(1), &[a]).unwrap();
        sessions.assign_ownership(PeerId(2), &[b]).unwrap();
        let mut gate = ReplicationGate::new(InterestConfig::default());
        gate.replicate(1, &world, &sessions);

        sessions.on_disconnect(PeerId(1));
        world.destroy(a);
        let output = gate.replicate(2, &world, &sessions);

        assert_eq!(
            messages_for(&output, PeerId(2)),
            vec![Message::ObjectDestroyed { object_id: a }]
        );
        assert!(messages_for(&output, PeerId(1)).is_empty());
    }

    #[test]
    fn test_released_ownership_is_announced_before_snapshots() {
        let mut world = ScriptedWorld::default();
        let a = world.put(1, [0.0; 3]);
        let b = world.put(2, [1.0, 0.0, 0.0]);
        let mut sessions = sessions_with(&[1]);
        sessions.assign_ownership(PeerId(1), &[a, b]).unwrap();
        let mut gate = ReplicationGate::new(InterestConfig::default());
        gate.replicate(1, &world, &sessions);

        sessions.release_ownership(PeerId(1), &[b]);
        world.objects.get_mut(&b).unwrap().heading = 1.0;
        let output = gate.replicate(2, &world, &sessions);
        let messages = messages_for(&output, PeerId(1));

        assert_eq!(
            messages[0],
            Message::OwnershipChanged {
                object_id: b,
                owned: false
            }
        );
        assert!(matches!(
            messages[1],
            Message::StateSnapshot { object_id, .. } if object_id == b
        ));
    }

    #[test]
    fn test_interest_cap_admits_owned_then_nearest() {
        let mut world = ScriptedWorld::default();
        let mine = world.put(1, [0.0; 3]);
        let near = world.put(2, [1.0, 0.0, 0.0]);
        world.put(3, [5.0, 0.0, 0.0]);
        world.put(4, [9.0, 0.0, 0.0]);
        let mut sessions = sessions_with(&[1]);
        sessions.assign_ownership(PeerId(1), &[mine]).unwrap();
        let mut gate = ReplicationGate::new(InterestConfig {
            half_extent: [10.0; 3],
            max_interest: 2,
            ..InterestConfig::default()
        });

        let output = gate.replicate(1, &world, &sessions);
        let constructed: Vec<ObjectId> = output
            .messages
            .iter()
            .filter_map(|outbound| match outbound.message {
                Message::ObjectConstructed { object_id, .. } => Some(object_id),
                _ => None,
            })
            .collect();

        assert_eq!(constructed, vec![mine, near]);
        assert_eq!(output.overflowed, 2);
        assert_eq!(gate.stats().overflow, 2);
    }

    #[test]
    fn test_inbound_action_reaches_accumulator() {
        let mut sessions = sessions_with(&[1]);
        sessions.assign_ownership(PeerId(1), &[ObjectId(7)]).unwrap();
        let mut actions = ActionAccumulator::new();
        let mut gate = ReplicationGate::new(InterestConfig::default());

        let payload = encode(&Message::ControlAction {
            object_id: ObjectId(7),
            action: ActionRecord::Throttle(1.0),
        })
        .unwrap();
        gate.handle_inbound(PeerId(1), &payload, &sessions, &mut actions)
            .unwrap();

        assert_eq!(actions.pending(ObjectId(7)), 1);
        assert_eq!(gate.stats(), GateStats::default());
    }

    #[test]
    fn test_bad_inbound_payloads_are_counted_and_dropped() {
        let mut sessions = sessions_with(&[1, 2]);
        sessions.assign_ownership(PeerId(1), &[ObjectId(7)]).unwrap();
        let mut actions = ActionAccumulator::new();
        let mut gate = ReplicationGate::new(InterestConfig::default());

        let malformed = gate.handle_inbound(PeerId(1), &[0xff, 0x01], &sessions, &mut actions);
        assert!(matches!(malformed, Err(InboundError::Malformed(_))));

        let nan = encode(&Message::ControlAction {
            object_id: ObjectId(7),
            action: ActionRecord::Steering(f32::NAN),
        })
        .unwrap();
        let non_finite = gate.handle_inbound(PeerId(1), &nan, &sessions, &mut actions);
        assert!(matches!(non_finite, Err(InboundError::NonFinite(ObjectId(7)))));

        let foreign = encode(&Message::ControlAction {
            object_id: ObjectId(7),
            action: ActionRecord::Brake(1.0),
        })
        .unwrap();
        let unowned = gate.handle_inbound(PeerId(2), &foreign, &sessions, &mut actions);
        assert!(matches!(unowned, Err(InboundError::Unowned(_))));

        let server_only = encode(&Message::ObjectDestroyed {
            object_id: ObjectId(7),
        })
        .unwrap();
        let unexpected = gate.handle_inbound(PeerId(1), &server_only, &sessions, &mut actions);
        assert!(matches!(
            unexpected,
            Err(InboundError::Unexpected("ObjectDestroyed"))
        ));

        assert_eq!(
            gate.stats(),
            GateStats {
                malformed: 1,
                unowned: 1,
                non_finite: 1,
                unexpected: 1,
                overflow: 0,
            }
        );
        assert_eq!(actions.pending(ObjectId(7)), 0);
    }
}
