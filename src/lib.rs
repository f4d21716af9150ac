// particle-interop
//
// Compute/graphics interop engine driving a particle simulation over buffers
// shared with the renderer's vertex stage.

pub mod backend;
pub mod compute;
pub mod config;
pub mod reload;
pub mod simulation;

pub use compute::{ComputeContext, ComputeError, ComputeResult, Program};
pub use simulation::{ParticleSimulationPipeline, SimulationProperties};
