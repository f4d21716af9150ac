// Particle simulation on top of the compute layer

pub mod clock;
pub mod layout;
pub mod pipeline;
pub mod properties;
pub mod random;
pub mod world;

pub use clock::{FixedClock, FrameTime, InstantClock, SimulationClock};
pub use layout::{BoundsUniform, FrameUniform, Particle, Sphere};
pub use pipeline::{ParticleSimulationPipeline, PipelineState};
pub use properties::SimulationProperties;
pub use random::Random;
pub use world::{SimulationBounds, SimulationWorld};
