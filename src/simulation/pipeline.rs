// Particle simulation pipeline
//
// Owns the program, the shared vertex buffers and the simulation state, and
// drives every compute pass through the interop protocol: acquire the
// shared buffers, dispatch, flush, release. Position and color live in
// graphics vertex buffers so the renderer draws them without a copy.

use super::clock::{InstantClock, SimulationClock};
use super::layout::{BoundsUniform, FrameUniform, Particle};
use super::properties::SimulationProperties;
use super::random::Random;
use super::world::{SimulationBounds, SimulationWorld};
use crate::compute::backend::AccessMode;
use crate::compute::buffer::{GraphicsBuffer, VertexBufferFactory};
use crate::compute::error::ComputeResult;
use crate::compute::kernel::KernelArg;
use crate::compute::program::Program;
use glam::Vec4;
use std::time::Duration;

pub const POSITION_BUFFER: &str = "positionBuffer";
pub const VELOCITY_BUFFER: &str = "velocityBuffer";
pub const COLOR_BUFFER: &str = "colorBuffer";
pub const BOUNDS_BUFFER: &str = "boundsBuffer";
pub const SPHERES_BUFFER: &str = "spheresBuffer";
pub const TIME_BUFFER: &str = "time";

pub const SIMULATION_KERNEL: &str = "ParticleSimulation";
pub const PULSE_KERNEL: &str = "ApplyPulse";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Buffers and kernels are ready; `tick` does nothing.
    Built,
    Running,
}

struct VertexBuffers {
    position: GraphicsBuffer,
    color: GraphicsBuffer,
}

impl VertexBuffers {
    fn create(graphics: &dyn VertexBufferFactory, bytes: usize) -> ComputeResult<Self> {
        let position = graphics.create_vertex_buffer("particle positions", bytes)?;
        let color = match graphics.create_vertex_buffer("particle colors", bytes) {
            Ok(color) => color,
            Err(err) => {
                graphics.destroy_vertex_buffer(position);
                return Err(err);
            }
        };
        Ok(Self { position, color })
    }

    fn destroy(&self, graphics: &dyn VertexBufferFactory) {
        graphics.destroy_vertex_buffer(self.position);
        graphics.destroy_vertex_buffer(self.color);
    }
}

pub struct ParticleSimulationPipeline {
    program: Program,
    graphics: Box<dyn VertexBufferFactory>,
    vertex_buffers: VertexBuffers,
    properties: SimulationProperties,
    world: SimulationWorld,
    random: Random,
    clock: Box<dyn SimulationClock>,
    state: PipelineState,
    frames: u64,
}

impl ParticleSimulationPipeline {
    /// Allocate and register every buffer and kernel on `program`, upload
    /// the world, and reset the particles.
    pub fn new(
        mut program: Program,
        graphics: Box<dyn VertexBufferFactory>,
        properties: SimulationProperties,
        world: SimulationWorld,
    ) -> ComputeResult<Self> {
        log::info!(
            "Building particle simulation: {} particles, {} obstacles",
            properties.particle_count,
            world.spheres().len()
        );

        let vertex_buffers = VertexBuffers::create(graphics.as_ref(), properties.channel_size())?;
        if let Err(err) = Self::register(&mut program, &vertex_buffers, &properties, &world) {
            drop(program);
            vertex_buffers.destroy(graphics.as_ref());
            return Err(err);
        }

        let random = match properties.seed {
            Some(seed) => Random::new(seed),
            None => Random::from_time(),
        };

        let mut pipeline = Self {
            program,
            graphics,
            vertex_buffers,
            properties,
            world,
            random,
            clock: Box::new(InstantClock::new()),
            state: PipelineState::Built,
            frames: 0,
        };
        pipeline.reset()?;
        Ok(pipeline)
    }

    /// Replace the time source, e.g. with a fixed step.
    pub fn with_clock(mut self, clock: impl SimulationClock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    fn register(
        program: &mut Program,
        vertex_buffers: &VertexBuffers,
        properties: &SimulationProperties,
        world: &SimulationWorld,
    ) -> ComputeResult<()> {
        let spheres = world.sphere_data();

        program.add_interop_buffer(POSITION_BUFFER, AccessMode::ReadWrite, vertex_buffers.position)?;
        program.add_interop_buffer(COLOR_BUFFER, AccessMode::ReadWrite, vertex_buffers.color)?;
        program.add_buffer(VELOCITY_BUFFER, properties.channel_size(), AccessMode::ReadWrite)?;
        program.add_buffer(
            BOUNDS_BUFFER,
            std::mem::size_of::<BoundsUniform>(),
            AccessMode::ReadOnly,
        )?;
        program.add_buffer(
            SPHERES_BUFFER,
            std::mem::size_of_val(spheres.as_slice()),
            AccessMode::ReadOnly,
        )?;
        program.add_buffer(TIME_BUFFER, std::mem::size_of::<FrameUniform>(), AccessMode::ReadOnly)?;

        let simulation_args = Self::global_args(
            program,
            &[
                POSITION_BUFFER,
                VELOCITY_BUFFER,
                COLOR_BUFFER,
                BOUNDS_BUFFER,
                SPHERES_BUFFER,
                TIME_BUFFER,
            ],
        )?;
        program.add_kernel(SIMULATION_KERNEL, simulation_args)?;

        let pulse_args = Self::global_args(
            program,
            &[POSITION_BUFFER, VELOCITY_BUFFER, BOUNDS_BUFFER, TIME_BUFFER],
        )?;
        program.add_kernel(PULSE_KERNEL, pulse_args)?;

        program.write_pod(BOUNDS_BUFFER, &[world.bounds().to_uniform()])?;
        program.write_pod(SPHERES_BUFFER, &spheres)?;
        program.write_pod(TIME_BUFFER, &[Self::frame_uniform(properties, world, 0.0, 0.0)])?;
        program.flush()
    }

    fn global_args(program: &Program, names: &[&str]) -> ComputeResult<Vec<KernelArg>> {
        names
            .iter()
            .map(|name| program.buffer(name).map(KernelArg::global))
            .collect()
    }

    fn frame_uniform(
        properties: &SimulationProperties,
        world: &SimulationWorld,
        elapsed: f32,
        delta: f32,
    ) -> FrameUniform {
        FrameUniform {
            elapsed,
            delta,
            particle_count: properties.particle_count as u32,
            sphere_count: world.spheres().len() as u32,
            pong_color: properties.pong_color.to_array(),
        }
    }

    // ---- state ----

    pub fn start(&mut self) {
        if self.state != PipelineState::Running {
            log::info!("Particle simulation started");
        }
        self.state = PipelineState::Running;
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn is_finished(&self) -> bool {
        self.properties
            .max_frames
            .is_some_and(|max| self.frames >= max)
    }

    /// Advance the simulation one frame. Does nothing until `start`.
    pub fn tick(&mut self) -> ComputeResult<()> {
        if self.state != PipelineState::Running {
            return Ok(());
        }

        let time = self.clock.advance();
        let uniform = Self::frame_uniform(&self.properties, &self.world, time.elapsed, time.delta);
        self.program.write_pod(TIME_BUFFER, &[uniform])?;

        let global = self.properties.global_work_size();
        let local = self.properties.local_work_size();

        self.with_acquired(&[POSITION_BUFFER, COLOR_BUFFER], |program| {
            program.execute(SIMULATION_KERNEL, global, local, 0)?;
            program.flush()
        })?;

        self.frames += 1;
        Ok(())
    }

    /// Kick every particle away from the bounds center.
    pub fn apply_pulse(&mut self) -> ComputeResult<()> {
        let global = self.properties.global_work_size();
        let local = self.properties.local_work_size();

        self.with_acquired(&[POSITION_BUFFER], |program| {
            program.execute(PULSE_KERNEL, global, local, 0)?;
            program.flush()
        })?;

        log::debug!("Pulse applied at frame {}", self.frames);
        Ok(())
    }

    /// Regenerate every particle and stop the simulation.
    ///
    /// Positions fill the sphere inscribed in the bounds, velocities are
    /// uniform per axis between the configured limits.
    pub fn reset(&mut self) -> ComputeResult<()> {
        self.state = PipelineState::Built;

        let count = self.properties.particle_count;
        let bounds = *self.world.bounds();
        let center = bounds.center();
        let radius = bounds.inscribed_radius();

        let positions: Vec<Particle> = (0..count)
            .map(|_| (center + self.random.in_unit_sphere() * radius).extend(1.0).to_array())
            .collect();

        let colors: Vec<Particle> = (0..count)
            .map(|_| {
                if self.properties.random_colors {
                    self.random.color().to_array()
                } else {
                    self.properties.ping_color.to_array()
                }
            })
            .collect();

        let (min, max) = (self.properties.min_velocity, self.properties.max_velocity);
        let velocities: Vec<Particle> = (0..count)
            .map(|_| self.random.vec3_between(min, max).extend(0.0).to_array())
            .collect();

        self.program.write_pod(VELOCITY_BUFFER, &velocities)?;
        self.with_acquired(&[POSITION_BUFFER, COLOR_BUFFER], |program| {
            program.write_pod(POSITION_BUFFER, &positions)?;
            program.write_pod(COLOR_BUFFER, &colors)?;
            program.flush()
        })?;

        log::debug!("Reset {} particles (radius {:.3})", count, radius);
        Ok(())
    }

    pub fn reseed(&mut self, seed: u64) {
        self.random.reseed(seed);
    }

    /// Acquire `names`, run `pass`, and release them again even if the
    /// pass failed. The pass error wins over a release error.
    fn with_acquired<F>(&mut self, names: &[&str], pass: F) -> ComputeResult<()>
    where
        F: FnOnce(&mut Program) -> ComputeResult<()>,
    {
        for (i, name) in names.iter().enumerate() {
            if let Err(err) = self.program.enqueue_acquire_graphics(name) {
                for held in &names[..i] {
                    let _ = self.program.enqueue_release_graphics(held);
                }
                return Err(err);
            }
        }

        let result = pass(&mut self.program);

        let mut released = Ok(());
        for name in names {
            if let Err(err) = self.program.enqueue_release_graphics(name) {
                released = released.and(Err(err));
            }
        }

        result.and(released)
    }

    // ---- world & resizing ----

    pub fn world(&self) -> &SimulationWorld {
        &self.world
    }

    /// Move or resize the bounds, then upload them.
    pub fn update_bounds(&mut self, update: impl FnOnce(&mut SimulationBounds)) -> ComputeResult<()> {
        update(self.world.bounds_mut());
        let uniform = self.world.bounds().to_uniform();
        self.program.write_pod(BOUNDS_BUFFER, &[uniform])?;
        self.program.flush()?;

        log::debug!(
            "Bounds now {:?} .. {:?}",
            self.world.bounds().min_extents(),
            self.world.bounds().max_extents()
        );
        Ok(())
    }

    /// Rebuild the particle channels for a new count and reset them.
    ///
    /// On failure the program is pointed back at the old channels and the
    /// particle count is unchanged.
    pub fn set_particle_count(&mut self, count: usize) -> ComputeResult<()> {
        if count == self.properties.particle_count {
            return Ok(());
        }

        let mut resized = self.properties.clone();
        resized.particle_count = count;

        let fresh = VertexBuffers::create(self.graphics.as_ref(), resized.channel_size())?;
        let swapped = self
            .program
            .recreate_interop_buffer(POSITION_BUFFER, fresh.position)
            .and_then(|_| self.program.recreate_interop_buffer(COLOR_BUFFER, fresh.color))
            .and_then(|_| self.program.recreate_buffer(VELOCITY_BUFFER, resized.channel_size()));

        if let Err(err) = swapped {
            self.roll_back_resize(fresh);
            return Err(err);
        }

        let old = std::mem::replace(&mut self.vertex_buffers, fresh);
        old.destroy(self.graphics.as_ref());

        log::info!(
            "Particle count changed {} -> {}",
            self.properties.particle_count,
            count
        );
        self.properties = resized;

        // Kernels bound the dispatch by the uploaded count, not the buffer size.
        let uniform = Self::frame_uniform(&self.properties, &self.world, 0.0, 0.0);
        self.program.write_pod(TIME_BUFFER, &[uniform])?;
        self.reset()
    }

    /// Undo whichever channel swaps of a failed resize went through.
    fn roll_back_resize(&mut self, fresh: VertexBuffers) {
        let channels = [
            (POSITION_BUFFER, fresh.position, self.vertex_buffers.position),
            (COLOR_BUFFER, fresh.color, self.vertex_buffers.color),
        ];
        for (name, new, previous) in channels {
            if self.bound_vertex_buffer(name) == Some(new) {
                if let Err(err) = self.program.recreate_interop_buffer(name, previous) {
                    log::error!("Could not rebind '{}' to its previous vertex buffer: {}", name, err);
                }
            }
            if self.bound_vertex_buffer(name) == Some(new) {
                log::error!("'{}' still views the resized vertex buffer, leaving it allocated", name);
            } else {
                self.graphics.destroy_vertex_buffer(new);
            }
        }

        let size = self.properties.channel_size();
        let velocity_size = self.program.buffer(VELOCITY_BUFFER).map(|b| b.size());
        if velocity_size.is_ok_and(|current| current != size) {
            log::warn!("Velocity buffer was already reallocated, restoring it zeroed");
            if let Err(err) = self.program.recreate_buffer(VELOCITY_BUFFER, size) {
                log::error!("Could not restore the velocity buffer: {}", err);
            }
        }
    }

    fn bound_vertex_buffer(&self, name: &str) -> Option<GraphicsBuffer> {
        self.program.buffer(name).ok().and_then(|b| b.graphics())
    }

    /// Swap in a freshly built program, keeping particle state and the
    /// accumulated kernel timings.
    pub fn reload_program(&mut self, mut program: Program) -> ComputeResult<()> {
        let mut velocities = vec![[0.0f32; 4]; self.properties.particle_count];
        self.program.read_pod(VELOCITY_BUFFER, &mut velocities)?;

        Self::register(&mut program, &self.vertex_buffers, &self.properties, &self.world)?;
        program.write_pod(VELOCITY_BUFFER, &velocities)?;
        program.flush()?;

        program.absorb_timings(&self.program);
        self.program = program;
        log::info!("Compute program reloaded");
        Ok(())
    }

    // ---- accessors ----

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn properties(&self) -> &SimulationProperties {
        &self.properties
    }

    pub fn position_vertex_buffer(&self) -> GraphicsBuffer {
        self.vertex_buffers.position
    }

    pub fn color_vertex_buffer(&self) -> GraphicsBuffer {
        self.vertex_buffers.color
    }

    pub fn set_pong_color(&mut self, color: Vec4) {
        self.properties.pong_color = color;
    }

    /// Host time spent enqueueing kernels so far.
    pub fn device_time(&self) -> Duration {
        self.program.total_execution_time()
    }

    /// Particle updates per second over `wall` seconds of running.
    pub fn particles_per_second(&self, wall: Duration) -> f64 {
        let secs = wall.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        (self.frames as f64 * self.properties.particle_count as f64) / secs
    }
}

impl Drop for ParticleSimulationPipeline {
    fn drop(&mut self) {
        if let Err(err) = self.program.flush() {
            log::warn!("Flush before teardown failed: {}", err);
        }
        self.vertex_buffers.destroy(self.graphics.as_ref());
    }
}
