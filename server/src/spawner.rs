use crate::scheduler::{TickContext, TickHook};
use crate::simulation::Simulation;
use crate::world::SimpleWorld;
use log::{info, warn};
use shared::{PeerId, VehicleSettings};

const GRID_COLUMNS: u32 = 8;

/// Gives every new session a vehicle of its own, laid out on a grid so
/// consecutive spawns do not overlap.
pub struct VehicleSpawner {
    settings: VehicleSettings,
    spacing: f32,
    spawned: u32,
}

impl VehicleSpawner {
    pub fn new(settings: VehicleSettings, spacing: f32) -> Self {
        Self {
            settings,
            spacing,
            spawned: 0,
        }
    }

    fn next_position(&mut self) -> [f32; 3] {
        let slot = self.spawned;
        self.spawned += 1;
        let column = (slot % GRID_COLUMNS) as f32;
        let row = (slot / GRID_COLUMNS) as f32;
        [column * self.spacing, 0.0, row * self.spacing]
    }
}

impl Default for VehicleSpawner {
    fn default() -> Self {
        Self::new(VehicleSettings::default(), 6.0)
    }
}

impl TickHook<SimpleWorld> for VehicleSpawner {
    fn on_session_connected(&mut self, ctx: &mut TickContext<'_, SimpleWorld>, peer: PeerId) {
        let position = self.next_position();
        let vehicle = ctx.sim.spawn_vehicle(position, 0.0, self.settings);

        match ctx.sessions.assign_ownership(peer, &[vehicle]) {
            Ok(()) => info!("{} now drives {}", peer, vehicle),
            Err(e) => {
                warn!("Could not hand {} to {}: {}", vehicle, peer, e);
                ctx.sim.destroy(vehicle);
            }
        }
    }
}
