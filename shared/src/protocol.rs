//! Application-level messages exchanged between the server and its clients.
//!
//! Messages that describe state which must eventually converge (construction,
//! teardown, ownership, playout delay, control actions) travel on the reliable
//! ordered channel. Incremental transform state travels unreliable and is
//! superseded by later ticks.

use crate::ObjectId;
use serde::{Deserialize, Serialize};

/// Delivery class requested from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    Reliable,
    Unreliable,
}

/// A discrete control action. Carries no timestamp: queue order is the ordering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ActionRecord {
    /// Set the steering target, -1.0 (full left) to 1.0 (full right).
    Steering(f32),
    /// Set the throttle, 0.0 to 1.0.
    Throttle(f32),
    /// Set the brake, 0.0 to 1.0.
    Brake(f32),
}

impl ActionRecord {
    pub fn value(&self) -> f32 {
        match *self {
            ActionRecord::Steering(v) | ActionRecord::Throttle(v) | ActionRecord::Brake(v) => v,
        }
    }

    /// NaN and infinities are rejected at the network edge.
    pub fn is_finite(&self) -> bool {
        self.value().is_finite()
    }
}

/// Control inputs currently applied to a controlled object. Every field is bounded.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ControlState {
    pub steering_target: f32,
    pub throttle: f32,
    pub brake: f32,
}

/// Static tunables of a controlled vehicle. Read-only during normal operation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VehicleSettings {
    /// Radians at full lock.
    pub max_steering_angle: f32,
    /// Radians per second the wheels may turn.
    pub max_steering_rate: f32,
    pub max_engine_torque: f32,
    pub max_brake_torque: f32,
}

impl Default for VehicleSettings {
    fn default() -> Self {
        Self {
            max_steering_angle: 0.6,
            max_steering_rate: 2.5,
            max_engine_torque: 400.0,
            max_brake_torque: 1500.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectKind {
    Vehicle,
    Prop,
}

/// Replicated view of one simulation object.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObjectState {
    pub kind: ObjectKind,
    pub position: [f32; 3],
    /// Yaw in radians.
    pub heading: f32,
    pub velocity: [f32; 3],
    /// Present for controlled objects only.
    pub control: Option<ControlState>,
}

/// One changed field of an [`ObjectState`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FieldChange {
    Position([f32; 3]),
    Heading(f32),
    Velocity([f32; 3]),
    Control(ControlState),
}

impl FieldChange {
    /// Number of distinct replicated fields.
    pub const COUNT: usize = 4;

    /// Stable index of the field this change writes.
    pub fn slot(&self) -> usize {
        match self {
            FieldChange::Position(_) => 0,
            FieldChange::Heading(_) => 1,
            FieldChange::Velocity(_) => 2,
            FieldChange::Control(_) => 3,
        }
    }
}

impl ObjectState {
    /// Every replicated field, for a full refresh.
    pub fn fields(&self) -> Vec<FieldChange> {
        let mut fields = vec![
            FieldChange::Position(self.position),
            FieldChange::Heading(self.heading),
            FieldChange::Velocity(self.velocity),
        ];
        if let Some(control) = self.control {
            fields.push(FieldChange::Control(control));
        }
        fields
    }

    /// Fields of `newer` that differ from `self`.
    pub fn diff(&self, newer: &ObjectState) -> Vec<FieldChange> {
        let mut changes = Vec::new();
        if self.position != newer.position {
            changes.push(FieldChange::Position(newer.position));
        }
        if self.heading != newer.heading {
            changes.push(FieldChange::Heading(newer.heading));
        }
        if self.velocity != newer.velocity {
            changes.push(FieldChange::Velocity(newer.velocity));
        }
        if self.control != newer.control {
            if let Some(control) = newer.control {
                changes.push(FieldChange::Control(control));
            }
        }
        changes
    }

    pub fn apply(&mut self, changes: &[FieldChange]) {
        for change in changes {
            match *change {
                FieldChange::Position(p) => self.position = p,
                FieldChange::Heading(h) => self.heading = h,
                FieldChange::Velocity(v) => self.velocity = v,
                FieldChange::Control(c) => self.control = Some(c),
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Buffering delay the peer should apply to the incoming snapshot stream.
    SetPlayoutDelay { delay_micros: u64 },
    ObjectConstructed {
        object_id: ObjectId,
        state: ObjectState,
        settings: Option<VehicleSettings>,
    },
    ObjectDestroyed { object_id: ObjectId },
    OwnershipChanged { object_id: ObjectId, owned: bool },
    ControlAction {
        object_id: ObjectId,
        action: ActionRecord,
    },
    StateSnapshot {
        tick: u64,
        object_id: ObjectId,
        changes: Vec<FieldChange>,
    },
}

impl Message {
    pub fn channel(&self) -> Channel {
        match self {
            Message::StateSnapshot { .. } => Channel::Unreliable,
            _ => Channel::Reliable,
        }
    }
}
