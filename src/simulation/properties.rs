// Simulation properties

use super::layout::PARTICLE_STRIDE;
use glam::{UVec3, Vec3, Vec4};

pub const DEFAULT_LOCAL_SIZE: u32 = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationProperties {
    pub particle_count: usize,
    /// Requested work-group width; clamped to the particle count.
    pub local_size: u32,
    pub min_velocity: Vec3,
    pub max_velocity: Vec3,
    pub random_colors: bool,
    pub ping_color: Vec4,
    pub pong_color: Vec4,
    /// Fixed RNG seed; `None` seeds from the clock.
    pub seed: Option<u64>,
    pub max_frames: Option<u64>,
}

impl Default for SimulationProperties {
    fn default() -> Self {
        Self {
            particle_count: 1024,
            local_size: DEFAULT_LOCAL_SIZE,
            min_velocity: Vec3::splat(-0.5),
            max_velocity: Vec3::splat(0.5),
            random_colors: false,
            ping_color: Vec4::new(1.0, 1.0, 1.0, 1.0),
            pong_color: Vec4::new(0.2, 0.4, 1.0, 1.0),
            seed: None,
            max_frames: None,
        }
    }
}

impl SimulationProperties {
    pub fn with_particle_count(mut self, count: usize) -> Self {
        self.particle_count = count;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Byte size of each particle channel (position, velocity, color).
    pub fn channel_size(&self) -> usize {
        self.particle_count * PARTICLE_STRIDE
    }

    pub fn local_work_size(&self) -> UVec3 {
        let width = (self.local_size.max(1) as usize).min(self.particle_count.max(1));
        UVec3::new(width as u32, 1, 1)
    }

    /// Particle count rounded up to a whole number of work-groups.
    pub fn global_work_size(&self) -> UVec3 {
        let local = self.local_work_size().x as usize;
        let groups = self.particle_count.max(1).div_ceil(local);
        UVec3::new((groups * local) as u32, 1, 1)
    }
}
