use shared::{ControlState, ObjectId, ObjectState, VehicleSettings};

/// Boundary to the physics engine driven by the tick scheduler.
///
/// Controlled objects are the ones that expose a control state; everything
/// else is replicated but never accepts actions.
pub trait Simulation {
    /// Advances the simulation by one fixed interval.
    fn step(&mut self, dt: f32);

    fn contains(&self, object: ObjectId) -> bool;

    /// Every live object in ascending id order.
    fn object_ids(&self) -> Vec<ObjectId>;

    fn object_state(&self, object: ObjectId) -> Option<ObjectState>;

    fn control_state_mut(&mut self, object: ObjectId) -> Option<&mut ControlState>;

    fn settings(&self, object: ObjectId) -> Option<VehicleSettings>;

    fn is_object_active(&self, object: ObjectId) -> bool;

    fn wake(&mut self, object: ObjectId);

    /// Removes the object; returns false if it did not exist.
    fn destroy(&mut self, object: ObjectId) -> bool;
}
