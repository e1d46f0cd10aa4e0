//! Per-object queues of pending control actions
//!
//! Actions are appended in arrival order and drained exactly once per tick,
//! before the simulation steps. Draining applies every queued record in FIFO
//! order through one handler per action kind. Repeated actions of the same
//! kind overwrite each other in order (last write wins). They are never
//! summed or coalesced.

use crate::session::SessionRegistry;
use crate::simulation::Simulation;
use log::{debug, warn};
use shared::{ActionRecord, ControlState, ObjectId, PeerId};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ActionRejected {
    #[error("{peer} does not own {object} (owner: {owner:?})")]
    NotOwner {
        peer: PeerId,
        object: ObjectId,
        owner: Option<PeerId>,
    },
}

fn apply_steering(control: &mut ControlState, value: f32) {
    control.steering_target = value.clamp(-1.0, 1.0);
}

fn apply_throttle(control: &mut ControlState, value: f32) {
    control.throttle = value.clamp(0.0, 1.0);
}

fn apply_brake(control: &mut ControlState, value: f32) {
    control.brake = value.clamp(0.0, 1.0);
}

/// Applies one action to a control state.
pub fn apply_action(control: &mut ControlState, action: ActionRecord) {
    match action {
        ActionRecord::Steering(value) => apply_steering(control, value),
        ActionRecord::Throttle(value) => apply_throttle(control, value),
        ActionRecord::Brake(value) => apply_brake(control, value),
    }
}

#[derive(Debug, Default)]
pub struct ActionAccumulator {
    pending: HashMap<ObjectId, VecDeque<ActionRecord>>,
}

impl ActionAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a client-originated action. Rejected unless `peer` owns `object`.
    pub fn submit(
        &mut self,
        sessions: &SessionRegistry,
        peer: PeerId,
        object: ObjectId,
        action: ActionRecord,
    ) -> Result<(), ActionRejected> {
        if !sessions.is_owner(peer, object) {
            let owner = sessions.owner_of(object);
            debug!(
                "Dropping {:?} from {} for {} (owner: {:?})",
                action, peer, object, owner
            );
            return Err(ActionRejected::NotOwner {
                peer,
                object,
                owner,
            });
        }

        self.pending.entry(object).or_default().push_back(action);
        Ok(())
    }

    /// Queues a server-originated action, bypassing the ownership check.
    pub fn submit_local(&mut self, object: ObjectId, action: ActionRecord) {
        self.pending.entry(object).or_default().push_back(action);
    }

    pub fn pending(&self, object: ObjectId) -> usize {
        self.pending.get(&object).map_or(0, VecDeque::len)
    }

    /// Drops queued actions for an object that was destroyed or released.
    pub fn discard(&mut self, object: ObjectId) {
        self.pending.remove(&object);
    }

    /// Applies and clears every queued action for `object`.
    ///
    /// Wakes the body if at least one action was applied and it was asleep.
    /// Returns the number of actions applied; an empty queue is a no-op.
    pub fn drain_and_apply<S: Simulation>(&mut self, object: ObjectId, sim: &mut S) -> usize {
        let Some(queue) = self.pending.remove(&object) else {
            return 0;
        };
        if queue.is_empty() {
            return 0;
        }

        let Some(control) = sim.control_state_mut(object) else {
            warn!(
                "Discarding {} actions for {}: not a controlled object",
                queue.len(),
                object
            );
            return 0;
        };

        let applied = queue.len();
        for action in queue {
            apply_action(control, action);
        }

        if !sim.is_object_active(object) {
            sim.wake(object);
        }
        applied
    }

    /// Drains every object with queued actions, in ascending id order.
    pub fn drain_all<S: Simulation>(&mut self, sim: &mut S) -> usize {
        let mut objects: Vec<ObjectId> = self.pending.keys().copied().collect();
        objects.sort();
        objects
            .into_iter()
            .map(|object| self.drain_and_apply(object, sim))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionConfig;
    use crate::world::SimpleWorld;
    use shared::VehicleSettings;

    struct Fixture {
        sessions: SessionRegistry,
        world: SimpleWorld,
        accumulator: ActionAccumulator,
        vehicle: ObjectId,
    }

    fn fixture() -> Fixture {
        let mut sessions = SessionRegistry::new(SessionConfig::default());
        let mut world = SimpleWorld::new();
        let vehicle = world.spawn_vehicle([0.0; 3], 0.0, VehicleSettings::default());
        sessions.on_connect(PeerId(1), None).unwrap();
        sessions.on_connect(PeerId(2), None).unwrap();
        sessions.assign_ownership(PeerId(1), &[vehicle]).unwrap();

        Fixture {
            sessions,
            world,
            accumulator: ActionAccumulator::new(),
            vehicle,
        }
    }

    #[test]
    fn test_later_action_of_same_kind_wins() {
        let mut f = fixture();
        f.accumulator
            .submit(&f.sessions, PeerId(1), f.vehicle, ActionRecord::Steering(0.2))
            .unwrap();
        f.accumulator
            .submit(&f.sessions, PeerId(1), f.vehicle, ActionRecord::Steering(-0.5))
            .unwrap();

        assert_eq!(f.accumulator.drain_and_apply(f.vehicle, &mut f.world), 2);

        let control = f.world.object_state(f.vehicle).unwrap().control.unwrap();
        assert_eq!(control.steering_target, -0.5);
    }

    #[test]
    fn test_mixed_kinds_are_all_applied() {
        let mut f = fixture();
        for action in [
            ActionRecord::Throttle(0.7),
            ActionRecord::Steering(0.1),
            ActionRecord::Brake(0.2),
        ] {
            f.accumulator
                .submit(&f.sessions, PeerId(1), f.vehicle, action)
                .unwrap();
        }
        f.accumulator.drain_and_apply(f.vehicle, &mut f.world);

        let control = f.world.object_state(f.vehicle).unwrap().control.unwrap();
        assert_eq!(control.throttle, 0.7);
        assert_eq!(control.steering_target, 0.1);
        assert_eq!(control.brake, 0.2);
    }

    #[test]
    fn test_non_owner_submission_is_rejected() {
        let mut f = fixture();
        let result =
            f.accumulator
                .submit(&f.sessions, PeerId(2), f.vehicle, ActionRecord::Throttle(1.0));

        assert_eq!(
            result,
            Err(ActionRejected::NotOwner {
                peer: PeerId(2),
                object: f.vehicle,
                owner: Some(PeerId(1)),
            })
        );
        assert_eq!(f.accumulator.pending(f.vehicle), 0);

        f.accumulator.drain_and_apply(f.vehicle, &mut f.world);
        let control = f.world.object_state(f.vehicle).unwrap().control.unwrap();
        assert_eq!(control, ControlState::default());
    }

    #[test]
    fn test_second_drain_is_a_no_op() {
        let mut f = fixture();
        f.accumulator
            .submit(&f.sessions, PeerId(1), f.vehicle, ActionRecord::Throttle(0.5))
            .unwrap();

        assert_eq!(f.accumulator.drain_and_apply(f.vehicle, &mut f.world), 1);
        assert_eq!(f.accumulator.pending(f.vehicle), 0);

        // A server-side change between drains must not be overwritten by a replay.
        f.world.control_state_mut(f.vehicle).unwrap().throttle = 0.0;
        assert_eq!(f.accumulator.drain_and_apply(f.vehicle, &mut f.world), 0);
        let control = f.world.object_state(f.vehicle).unwrap().control.unwrap();
        assert_eq!(control.throttle, 0.0);
    }

    #[test]
    fn test_applying_an_action_wakes_sleeping_body() {
        let mut f = fixture();
        f.world.put_to_sleep(f.vehicle);
        f.accumulator
            .submit(&f.sessions, PeerId(1), f.vehicle, ActionRecord::Brake(0.0))
            .unwrap();

        f.accumulator.drain_and_apply(f.vehicle, &mut f.world);
        assert!(f.world.is_object_active(f.vehicle));
    }

    #[test]
    fn test_empty_drain_does_not_wake() {
        let mut f = fixture();
        f.world.put_to_sleep(f.vehicle);

        f.accumulator.drain_and_apply(f.vehicle, &mut f.world);
        assert!(!f.world.is_object_active(f.vehicle));
    }

    #[test]
    fn test_values_are_clamped() {
        let mut control = ControlState::default();
        apply_action(&mut control, ActionRecord::Steering(3.0));
        apply_action(&mut control, ActionRecord::Throttle(-1.0));
        apply_action(&mut control, ActionRecord::Brake(2.0));

        assert_eq!(control.steering_target, 1.0);
        assert_eq!(control.throttle, 0.0);
        assert_eq!(control.brake, 1.0);
    }

    #[test]
    fn test_local_actions_for_props_are_discarded() {
        let mut f = fixture();
        let prop = f.world.spawn_prop([1.0, 0.0, 0.0]);
        f.accumulator.submit_local(prop, ActionRecord::Throttle(1.0));

        assert_eq!(f.accumulator.drain_all(&mut f.world), 0);
        assert_eq!(f.accumulator.pending(prop), 0);
        assert!(!f.world.is_object_active(prop));
    }
}
