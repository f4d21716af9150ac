// =============================================================================
// PARTICLE INTEROP - headless driver
// =============================================================================
//
// FLOW:
// 1. Load config.toml and set up logging
// 2. Pick the compute backend and link it to the graphics side
// 3. Build the program and the particle simulation on top of it
// 4. Tick until the frame budget runs out, pulsing and hot-reloading
//    along the way
//
// =============================================================================

use anyhow::{Context, Result};
use particle_interop::backend::{HostBackend, HostGraphics};
use particle_interop::compute::{ComputeBackend, VertexBufferFactory};
use particle_interop::config::{BackendKind, Config};
use particle_interop::reload::KernelWatcher;
use particle_interop::simulation::SimulationWorld;
use particle_interop::{ComputeContext, ParticleSimulationPipeline, Program};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

fn main() -> Result<()> {
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting particle interop ({:?} backend)", config.compute.backend);

    let (backend, graphics, share_group) = open_backend(&config)?;

    let ctx = ComputeContext::initialize(backend, share_group)
        .context("Failed to initialize compute context")?;
    ctx.set_debug_errors(config.compute.debug_errors);

    let program_path = config.compute.program_path().to_path_buf();
    let program = Program::from_file(&ctx, &program_path)
        .with_context(|| format!("Failed to build {:?}", program_path))?;

    let properties = config.simulation.properties();
    let world = SimulationWorld::default_scene(config.simulation.bounds());
    let mut pipeline = ParticleSimulationPipeline::new(program, graphics, properties, world)
        .context("Failed to build particle simulation")?;

    let watcher = if config.debug.hot_reload {
        match KernelWatcher::new(&program_path) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                log::warn!("Hot reload disabled: {:#}", e);
                None
            }
        }
    } else {
        None
    };

    run(&config, &ctx, &mut pipeline, watcher.as_ref())?;

    log::info!("Shutting down");
    Ok(())
}

type OpenedBackend = (
    Arc<dyn ComputeBackend>,
    Box<dyn VertexBufferFactory>,
    Option<particle_interop::compute::GraphicsShareGroup>,
);

fn open_backend(config: &Config) -> Result<OpenedBackend> {
    match config.compute.backend {
        BackendKind::Host => {
            let graphics = HostGraphics::new();
            let backend = HostBackend::new().with_graphics(&graphics);
            let share_group = graphics.share_group();
            let backend: Arc<dyn ComputeBackend> = Arc::new(backend);
            let graphics: Box<dyn VertexBufferFactory> = Box::new(graphics);
            Ok((backend, graphics, Some(share_group)))
        }
        #[cfg(feature = "vulkan")]
        BackendKind::Vulkan => {
            use particle_interop::backend::{VulkanBackend, VulkanGraphics};
            use particle_interop::compute::DeviceSelector;

            let backend = Arc::new(VulkanBackend::new(config.compute.validation_layers)?);
            let device = DeviceSelector::new().select(backend.as_ref())?;
            let share_group = backend.share_group(device.device);
            let graphics: Box<dyn VertexBufferFactory> =
                Box::new(VulkanGraphics::new(Arc::clone(&backend)));
            let backend: Arc<dyn ComputeBackend> = backend;
            Ok((backend, graphics, Some(share_group)))
        }
        #[cfg(not(feature = "vulkan"))]
        BackendKind::Vulkan => {
            anyhow::bail!("This build has no Vulkan support; rebuild with --features vulkan")
        }
    }
}

fn run(
    config: &Config,
    ctx: &Arc<ComputeContext>,
    pipeline: &mut ParticleSimulationPipeline,
    watcher: Option<&KernelWatcher>,
) -> Result<()> {
    let pulse_every = config.simulation.pulse_every;
    let started = Instant::now();
    let mut last_report = Instant::now();
    let mut frames_since_report = 0u32;

    pipeline.start();
    while !pipeline.is_finished() {
        if let Some(watcher) = watcher {
            if watcher.poll() {
                reload(ctx, pipeline, watcher);
            }
        }

        pipeline.tick()?;
        frames_since_report += 1;

        if pulse_every > 0 && pipeline.frames() % pulse_every == 0 {
            log::debug!("Pulse at frame {}", pipeline.frames());
            pipeline.apply_pulse()?;
        }

        let elapsed = last_report.elapsed();
        if elapsed.as_secs_f32() >= 1.0 {
            let fps = frames_since_report as f32 / elapsed.as_secs_f32();
            log::info!(
                "FPS: {:.1} ({:.2}ms/frame)",
                fps,
                1000.0 / fps.max(f32::EPSILON)
            );
            frames_since_report = 0;
            last_report = Instant::now();
        }
    }

    let wall = started.elapsed();
    log::info!(
        "Ran {} frames in {:.2?} ({:.2?} enqueue time, {:.0} particles/s)",
        pipeline.frames(),
        wall,
        pipeline.device_time(),
        pipeline.particles_per_second(wall)
    );
    Ok(())
}

/// Rebuild the program from disk; a broken edit keeps the running program.
fn reload(ctx: &Arc<ComputeContext>, pipeline: &mut ParticleSimulationPipeline, watcher: &KernelWatcher) {
    log::info!("{:?} changed, rebuilding", watcher.path());

    let result = Program::from_file(ctx, watcher.path())
        .and_then(|program| pipeline.reload_program(program));
    if let Err(e) = result {
        log::warn!("Keeping previous program: {}", e);
    }
}

/// Initialize logging with optional file output
fn init_logging(config: &Config) {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);
    builder.init();

    // Create/clear log file if enabled
    if config.debug.log_to_file {
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            let _ = writeln!(file, "=== Particle Interop Log ===");
            let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
            let _ = writeln!(file);
        }
    }
}
