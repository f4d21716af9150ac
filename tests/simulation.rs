// Particle simulation pipeline end to end on the host backend

use glam::{Vec3, Vec4};
use particle_interop::backend::host::QueueEvent;
use particle_interop::backend::{HostBackend, HostGraphics};
use particle_interop::compute::{ComputeContext, Status};
use particle_interop::simulation::layout::BoundsUniform;
use particle_interop::simulation::pipeline::{
    BOUNDS_BUFFER, COLOR_BUFFER, POSITION_BUFFER, SIMULATION_KERNEL, VELOCITY_BUFFER,
};
use particle_interop::simulation::{
    FixedClock, Particle, PipelineState, SimulationBounds, SimulationProperties, SimulationWorld,
};
use particle_interop::{ParticleSimulationPipeline, Program};
use std::sync::Arc;

const KERNELS: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/kernels/particles.cl");
const SEED: u64 = 0x5eed;

struct Harness {
    backend: Arc<HostBackend>,
    graphics: HostGraphics,
    ctx: Arc<ComputeContext>,
}

impl Harness {
    fn new() -> Self {
        Self::with_backend(|backend| backend)
    }

    fn with_backend(configure: impl FnOnce(HostBackend) -> HostBackend) -> Self {
        let graphics = HostGraphics::new();
        let backend = Arc::new(configure(
            HostBackend::new()
                .with_graphics(&graphics)
                .with_tracing(true),
        ));
        let ctx =
            ComputeContext::initialize(backend.clone(), Some(graphics.share_group())).unwrap();
        Self {
            backend,
            graphics,
            ctx,
        }
    }

    fn program(&self) -> Program {
        Program::from_file(&self.ctx, KERNELS).unwrap()
    }

    fn pipeline(&self, properties: SimulationProperties) -> ParticleSimulationPipeline {
        let world = SimulationWorld::default_scene(SimulationBounds::default());
        ParticleSimulationPipeline::new(
            self.program(),
            Box::new(self.graphics.clone()),
            properties,
            world,
        )
        .unwrap()
        .with_clock(FixedClock::new(1.0 / 60.0))
    }

    fn positions(&self, pipeline: &ParticleSimulationPipeline) -> Vec<Vec3> {
        let mut raw = vec![[0.0f32; 4]; pipeline.properties().particle_count];
        self.graphics
            .read_vertex_pod(pipeline.position_vertex_buffer(), &mut raw)
            .unwrap();
        raw.iter().map(|p| Vec4::from_array(*p).truncate()).collect()
    }
}

fn velocities(pipeline: &ParticleSimulationPipeline) -> Vec<Particle> {
    let mut raw = vec![[0.0f32; 4]; pipeline.properties().particle_count];
    pipeline.program().read_pod(VELOCITY_BUFFER, &mut raw).unwrap();
    raw
}

fn seeded(count: usize) -> SimulationProperties {
    SimulationProperties::default()
        .with_particle_count(count)
        .with_seed(SEED)
}

fn position_of(trace: &[QueueEvent], wanted: impl Fn(&QueueEvent) -> bool) -> Vec<usize> {
    trace
        .iter()
        .enumerate()
        .filter(|(_, e)| wanted(e))
        .map(|(i, _)| i)
        .collect()
}

fn assert_interop_order(count: usize) {
    let harness = Harness::new();
    let mut pipeline = harness.pipeline(seeded(count));
    pipeline.start();
    harness.backend.take_trace();

    pipeline.tick().unwrap();
    let trace = harness.backend.take_trace();

    let acquires = position_of(&trace, |e| matches!(e, QueueEvent::Acquire { .. }));
    let dispatches = position_of(&trace, |e| matches!(e, QueueEvent::Dispatch { .. }));
    let finishes = position_of(&trace, |e| matches!(e, QueueEvent::Finish));
    let releases = position_of(&trace, |e| matches!(e, QueueEvent::Release { .. }));

    assert_eq!(acquires.len(), 2, "count {}: {:?}", count, trace);
    assert_eq!(releases.len(), 2, "count {}: {:?}", count, trace);
    assert_eq!(dispatches.len(), 1, "count {}: {:?}", count, trace);

    let dispatch = dispatches[0];
    assert!(acquires.iter().all(|&a| a < dispatch), "count {}", count);
    let flushed = finishes
        .iter()
        .copied()
        .find(|&f| f > dispatch)
        .expect("no finish after the dispatch");
    assert!(releases.iter().all(|&r| r > flushed), "count {}", count);

    assert_eq!(pipeline.frames(), 1);
}

#[test]
fn tick_acquires_dispatches_flushes_then_releases() {
    for count in [1, 7, 64, 1000, 65_536] {
        assert_interop_order(count);
    }
}

#[test]
#[ignore = "allocates three 256 MiB channels"]
fn tick_order_holds_at_sixteen_million_particles() {
    assert_interop_order(16_777_216);
}

#[test]
fn reset_places_particles_inside_the_bounds() {
    let harness = Harness::new();
    let properties = seeded(1024);
    let (min, max) = (properties.min_velocity, properties.max_velocity);
    let pipeline = harness.pipeline(properties);
    let bounds = *pipeline.world().bounds();

    for p in harness.positions(&pipeline) {
        assert!(bounds.contains(p), "{:?} outside bounds", p);
    }
    for v in velocities(&pipeline) {
        let v3 = Vec4::from_array(v).truncate();
        assert!(v3.cmpge(min).all() && v3.cmple(max).all(), "{:?}", v);
        assert_eq!(v[3], 0.0);
    }
    assert_eq!(pipeline.state(), PipelineState::Built);
}

#[test]
fn reset_fills_the_inscribed_sphere_evenly() {
    let harness = Harness::new();
    let pipeline = harness.pipeline(seeded(4096));
    let bounds = pipeline.world().bounds();
    let (center, radius) = (bounds.center(), bounds.inscribed_radius());

    let positions = harness.positions(&pipeline);
    assert!(positions
        .iter()
        .all(|p| p.distance(center) <= radius * 1.0001));

    let mean = positions.iter().copied().sum::<Vec3>() / positions.len() as f32;
    assert!(mean.distance(center) < 0.05 * radius, "mean {:?}", mean);

    // A ball of half the radius holds an eighth of the volume.
    let inner = positions
        .iter()
        .filter(|p| p.distance(center) < radius * 0.5)
        .count() as f32
        / positions.len() as f32;
    assert!((0.09..0.16).contains(&inner), "inner fraction {}", inner);
}

#[test]
fn same_seed_gives_same_particles() {
    let (first, second) = (Harness::new(), Harness::new());
    let a = first.pipeline(seeded(256));
    let b = second.pipeline(seeded(256));

    assert_eq!(first.positions(&a), second.positions(&b));
    assert_eq!(velocities(&a), velocities(&b));
}

#[test]
fn reset_draws_fresh_particles_unless_reseeded() {
    let harness = Harness::new();
    let mut pipeline = harness.pipeline(seeded(256));
    let first = harness.positions(&pipeline);

    pipeline.reset().unwrap();
    let second = harness.positions(&pipeline);
    assert_ne!(first, second);

    let radius = pipeline.world().bounds().inscribed_radius();
    let center = pipeline.world().bounds().center();
    assert!(second
        .iter()
        .all(|p| p.distance(center) <= radius * 1.0001));

    pipeline.reseed(SEED);
    pipeline.reset().unwrap();
    assert_eq!(harness.positions(&pipeline), first);
}

#[test]
fn tick_does_nothing_before_start() {
    let harness = Harness::new();
    let mut pipeline = harness.pipeline(seeded(64));
    let before = harness.positions(&pipeline);
    harness.backend.take_trace();

    pipeline.tick().unwrap();

    assert!(harness.backend.take_trace().is_empty());
    assert_eq!(pipeline.frames(), 0);
    assert_eq!(harness.positions(&pipeline), before);
}

#[test]
fn particles_stay_in_bounds_while_running() {
    let harness = Harness::new();
    let mut pipeline = harness.pipeline(seeded(2048));
    pipeline.start();
    for _ in 0..120 {
        pipeline.tick().unwrap();
    }

    let bounds = *pipeline.world().bounds();
    let positions = harness.positions(&pipeline);
    assert!(positions.iter().all(|p| bounds.contains(*p)));
    assert_eq!(pipeline.frames(), 120);
    assert_eq!(
        pipeline.program().kernel_timing("ParticleSimulation").unwrap().dispatches,
        120
    );
}

#[test]
fn graphics_cannot_read_while_compute_holds_the_buffer() {
    let harness = Harness::new();
    let pipeline = harness.pipeline(seeded(16));
    let vertex = pipeline.position_vertex_buffer();
    let mut out = vec![[0.0f32; 4]; 16];

    pipeline.program().enqueue_acquire_graphics(POSITION_BUFFER).unwrap();
    assert!(harness.graphics.is_compute_owned(vertex));
    assert!(harness.graphics.read_vertex_pod(vertex, &mut out).is_err());

    pipeline.program().enqueue_release_graphics(POSITION_BUFFER).unwrap();
    harness.graphics.read_vertex_pod(vertex, &mut out).unwrap();
}

#[test]
fn pulse_pushes_particles_away_from_the_center() {
    let harness = Harness::new();
    let mut pipeline = harness.pipeline(seeded(512));
    let center = pipeline.world().bounds().center();
    let positions = harness.positions(&pipeline);
    let before = velocities(&pipeline);

    pipeline.apply_pulse().unwrap();
    let after = velocities(&pipeline);

    for ((p, v0), v1) in positions.iter().zip(&before).zip(&after) {
        let kick = Vec4::from_array(*v1).truncate() - Vec4::from_array(*v0).truncate();
        let away = *p - center;
        if away.length() > 1e-4 {
            assert!(kick.dot(away) > 0.0);
            assert!((kick.length() - 2.0).abs() < 1e-3, "kick {:?}", kick);
        }
    }
    assert!(!harness.graphics.is_compute_owned(pipeline.position_vertex_buffer()));
}

#[test]
fn moved_bounds_are_uploaded() {
    let harness = Harness::new();
    let mut pipeline = harness.pipeline(seeded(32));

    pipeline
        .update_bounds(|bounds| bounds.move_to(Vec3::new(1.0, 2.0, 3.0)))
        .unwrap();

    let mut uniform = [BoundsUniform {
        center: [0.0; 4],
        min: [0.0; 4],
        max: [0.0; 4],
    }];
    pipeline.program().read_pod(BOUNDS_BUFFER, &mut uniform).unwrap();
    assert_eq!(uniform[0].center, [1.0, 2.0, 3.0, 1.0]);
    assert_eq!(uniform[0].min, [0.5, 1.5, 2.5, 1.0]);
    assert_eq!(uniform[0].max, [1.5, 2.5, 3.5, 1.0]);
}

#[test]
fn changing_the_count_swaps_the_vertex_buffers() {
    let harness = Harness::new();
    let mut pipeline = harness.pipeline(seeded(100));
    pipeline.start();
    let old = pipeline.position_vertex_buffer();
    assert_eq!(harness.graphics.live_buffers(), 2);

    pipeline.set_particle_count(300).unwrap();

    assert_eq!(harness.graphics.live_buffers(), 2);
    assert_ne!(pipeline.position_vertex_buffer(), old);
    assert_eq!(pipeline.properties().particle_count, 300);
    assert_eq!(pipeline.state(), PipelineState::Built);
    assert_eq!(
        pipeline.program().buffer(POSITION_BUFFER).unwrap().size(),
        300 * 16
    );
    assert_eq!(velocities(&pipeline).len(), 300);

    let bounds = *pipeline.world().bounds();
    assert!(harness
        .positions(&pipeline)
        .iter()
        .all(|p| bounds.contains(*p)));

    pipeline.start();
    pipeline.tick().unwrap();
}

#[test]
fn pulse_after_growing_reaches_every_particle() {
    let harness = Harness::new();
    let mut pipeline = harness.pipeline(seeded(64));
    pipeline.set_particle_count(128).unwrap();
    let before = velocities(&pipeline);

    pipeline.apply_pulse().unwrap();

    let kicked = before
        .iter()
        .zip(&velocities(&pipeline))
        .filter(|(v0, v1)| {
            let kick = Vec4::from_array(**v1).truncate() - Vec4::from_array(**v0).truncate();
            (kick.length() - 2.0).abs() < 1e-3
        })
        .count();
    assert_eq!(kicked, 128);
}

#[test]
fn failed_resize_keeps_the_old_channels() {
    // Room for 64 particles per compute allocation, not 128.
    let harness = Harness::with_backend(|backend| backend.with_max_allocation(64 * 16));
    let mut pipeline = harness.pipeline(seeded(64));
    let position = pipeline.position_vertex_buffer();
    let color = pipeline.color_vertex_buffer();
    let before = velocities(&pipeline);

    let err = pipeline.set_particle_count(128).unwrap_err();
    assert_eq!(err.status(), Some(Status::InvalidBufferSize));

    assert_eq!(pipeline.properties().particle_count, 64);
    assert_eq!(pipeline.position_vertex_buffer(), position);
    assert_eq!(pipeline.color_vertex_buffer(), color);
    assert_eq!(harness.graphics.live_buffers(), 2);
    assert_eq!(velocities(&pipeline), before);

    let program = pipeline.program();
    assert_eq!(program.buffer(POSITION_BUFFER).unwrap().graphics(), Some(position));
    assert_eq!(program.buffer(COLOR_BUFFER).unwrap().graphics(), Some(color));
    assert_eq!(program.buffer(VELOCITY_BUFFER).unwrap().size(), 64 * 16);

    pipeline.start();
    pipeline.tick().unwrap();
    assert_eq!(pipeline.frames(), 1);
}

#[test]
fn reloading_keeps_accumulated_kernel_time() {
    let harness = Harness::new();
    let mut pipeline = harness.pipeline(seeded(256));
    pipeline.start();
    for _ in 0..5 {
        pipeline.tick().unwrap();
    }
    let before = pipeline.device_time();

    pipeline.reload_program(harness.program()).unwrap();

    assert!(pipeline.device_time() >= before);
    let timing = pipeline.program().kernel_timing(SIMULATION_KERNEL).unwrap();
    assert_eq!(timing.dispatches, 5);

    pipeline.tick().unwrap();
    let timing = pipeline.program().kernel_timing(SIMULATION_KERNEL).unwrap();
    assert_eq!(timing.dispatches, 6);
    assert!(pipeline.device_time() >= before);
}

#[test]
fn reloading_keeps_particle_velocities() {
    let harness = Harness::new();
    let mut pipeline = harness.pipeline(seeded(128));
    pipeline.start();
    pipeline.tick().unwrap();
    let before = velocities(&pipeline);

    pipeline.reload_program(harness.program()).unwrap();

    assert_eq!(velocities(&pipeline), before);
    pipeline.tick().unwrap();
    assert_eq!(pipeline.frames(), 2);
}

#[test]
fn dropping_the_pipeline_frees_its_vertex_buffers() {
    let harness = Harness::new();
    let pipeline = harness.pipeline(seeded(8));
    assert_eq!(harness.graphics.live_buffers(), 2);

    drop(pipeline);
    assert_eq!(harness.graphics.live_buffers(), 0);
}
