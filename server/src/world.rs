//! Reference kinematic world used by the server binary and the tests.
//!
//! Vehicles follow a bicycle model on the x/z plane: the front wheels slew
//! toward the steering target at the vehicle's max steering rate, throttle and
//! brake produce forces limited by the torque settings, and drag plus rolling
//! resistance bring an idle vehicle to rest. Bodies that stay still for
//! [`SLEEP_TICKS`] consecutive steps fall asleep and are skipped until woken.

use crate::simulation::Simulation;
use log::info;
use shared::{ControlState, ObjectId, ObjectKind, ObjectState, VehicleSettings};
use std::collections::BTreeMap;

pub const SLEEP_TICKS: u32 = 60;

const VEHICLE_MASS: f32 = 1200.0;
const WHEEL_RADIUS: f32 = 0.35;
const WHEELBASE: f32 = 2.6;
const DRAG: f32 = 0.45;
const ROLLING_RESISTANCE: f32 = 12.0;
const REST_SPEED: f32 = 0.01;

#[derive(Debug, Clone)]
struct Body {
    kind: ObjectKind,
    position: [f32; 3],
    heading: f32,
    speed: f32,
    steering_angle: f32,
    control: Option<ControlState>,
    settings: Option<VehicleSettings>,
    active: bool,
    still_ticks: u32,
}

impl Body {
    fn forward(&self) -> [f32; 3] {
        [self.heading.sin(), 0.0, self.heading.cos()]
    }

    fn velocity(&self) -> [f32; 3] {
        let f = self.forward();
        [f[0] * self.speed, 0.0, f[2] * self.speed]
    }

    fn state(&self) -> ObjectState {
        ObjectState {
            kind: self.kind,
            position: self.position,
            heading: self.heading,
            velocity: self.velocity(),
            control: self.control,
        }
    }

    fn integrate_vehicle(&mut self, control: ControlState, settings: VehicleSettings, dt: f32) {
        let target_angle = control.steering_target * settings.max_steering_angle;
        let max_delta = settings.max_steering_rate * dt;
        self.steering_angle += (target_angle - self.steering_angle).clamp(-max_delta, max_delta);

        let drive = control.throttle * settings.max_engine_torque / WHEEL_RADIUS;
        let resistance = DRAG * self.speed * self.speed.abs() + ROLLING_RESISTANCE * self.speed;
        self.speed += (drive - resistance) / VEHICLE_MASS * dt;

        // Braking decelerates toward zero but never reverses the vehicle.
        let brake_dv = control.brake * settings.max_brake_torque / WHEEL_RADIUS / VEHICLE_MASS * dt;
        if self.speed.abs() <= brake_dv {
            self.speed = 0.0;
        } else {
            self.speed -= brake_dv * self.speed.signum();
        }

        let yaw_rate = self.speed / WHEELBASE * self.steering_angle.tan();
        self.heading += yaw_rate * dt;

        let velocity = self.velocity();
        self.position[0] += velocity[0] * dt;
        self.position[2] += velocity[2] * dt;

        let settled = self.speed.abs() < REST_SPEED
            && control.throttle == 0.0
            && (target_angle - self.steering_angle).abs() < f32::EPSILON;
        if settled {
            self.speed = 0.0;
            self.still_ticks += 1;
        } else {
            self.still_ticks = 0;
        }
    }
}

/// Authoritative world: vehicles and static props keyed by object id.
#[derive(Debug, Default)]
pub struct SimpleWorld {
    bodies: BTreeMap<ObjectId, Body>,
    next_id: u32,
    pub tick: u64,
}

impl SimpleWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn_vehicle(
        &mut self,
        position: [f32; 3],
        heading: f32,
        settings: VehicleSettings,
    ) -> ObjectId {
        let id = self.allocate_id();
        self.bodies.insert(
            id,
            Body {
                kind: ObjectKind::Vehicle,
                position,
                heading,
                speed: 0.0,
                steering_angle: 0.0,
                control: Some(ControlState::default()),
                settings: Some(settings),
                active: true,
                still_ticks: 0,
            },
        );
        info!("Spawned vehicle {} at {:?}", id, position);
        id
    }

    /// Props start asleep and never move.
    pub fn spawn_prop(&mut self, position: [f32; 3]) -> ObjectId {
        let id = self.allocate_id();
        self.bodies.insert(
            id,
            Body {
                kind: ObjectKind::Prop,
                position,
                heading: 0.0,
                speed: 0.0,
                steering_angle: 0.0,
                control: None,
                settings: None,
                active: false,
                still_ticks: 0,
            },
        );
        id
    }

    /// Forces a body to sleep. Used by content setup and tests.
    pub fn put_to_sleep(&mut self, object: ObjectId) {
        if let Some(body) = self.bodies.get_mut(&object) {
            body.active = false;
            body.speed = 0.0;
        }
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }

    fn allocate_id(&mut self) -> ObjectId {
        self.next_id += 1;
        ObjectId(self.next_id)
    }
}

impl Simulation for SimpleWorld {
    fn step(&mut self, dt: f32) {
        for body in self.bodies.values_mut() {
            if !body.active {
                continue;
            }

            match (body.control, body.settings) {
                (Some(control), Some(settings)) => body.integrate_vehicle(control, settings, dt),
                _ => body.still_ticks += 1,
            }

            if body.still_ticks >= SLEEP_TICKS {
                body.active = false;
                body.still_ticks = 0;
            }
        }
        self.tick += 1;
    }

    fn contains(&self, object: ObjectId) -> bool {
        self.bodies.contains_key(&object)
    }

    fn object_ids(&self) -> Vec<ObjectId> {
        self.bodies.keys().copied().collect()
    }

    fn object_state(&self, object: ObjectId) -> Option<ObjectState> {
        self.bodies.get(&object).map(Body::state)
    }

    fn control_state_mut(&mut self, object: ObjectId) -> Option<&mut ControlState> {
        self.bodies.get_mut(&object)?.control.as_mut()
    }

    fn settings(&self, object: ObjectId) -> Option<VehicleSettings> {
        self.bodies.get(&object)?.settings
    }

    fn is_object_active(&self, object: ObjectId) -> bool {
        self.bodies.get(&object).is_some_and(|body| body.active)
    }

    fn wake(&mut self, object: ObjectId) {
        if let Some(body) = self.bodies.get_mut(&object) {
            body.active = true;
            body.still_ticks = 0;
        }
    }

    fn destroy(&mut self, object: ObjectId) -> bool {
        let removed = self.bodies.remove(&object).is_some();
        if removed {
            info!("Destroyed {}", object);
        }
        removed
    }
}
