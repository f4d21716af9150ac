// Device-side data layouts
//
// Shared by the host kernels and the compute shaders; all vectors are
// padded to four floats.

/// Must match `Bounds` in particle_sim.comp / apply_pulse.comp.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct BoundsUniform {
    pub center: [f32; 4],
    pub min: [f32; 4],
    pub max: [f32; 4],
}

/// Must match `FrameTime` in particle_sim.comp.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct FrameUniform {
    pub elapsed: f32,
    pub delta: f32,
    pub particle_count: u32,
    pub sphere_count: u32,
    pub pong_color: [f32; 4],
}

/// One particle channel element (position, velocity or color).
pub type Particle = [f32; 4];

/// Sphere obstacle: xyz center, w collision radius.
pub type Sphere = [f32; 4];

pub const PARTICLE_STRIDE: usize = std::mem::size_of::<Particle>();
