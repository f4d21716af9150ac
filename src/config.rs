// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Compute backend selection, simulation parameters and debug output.
// Missing sections or a missing file fall back to defaults.

use crate::simulation::{SimulationBounds, SimulationProperties};
use anyhow::{Context, Result};
use glam::{Vec3, Vec4};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub compute: ComputeConfig,
    pub simulation: SimulationConfig,
    pub debug: DebugConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Host,
    Vulkan,
}

/// Compute settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    pub backend: BackendKind,
    /// Host backend program source.
    pub kernel_source: PathBuf,
    /// SPIR-V module for the Vulkan backend.
    pub spirv_module: PathBuf,
    pub debug_errors: bool,
    pub validation_layers: bool,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Host,
            kernel_source: PathBuf::from("kernels/particles.cl"),
            spirv_module: PathBuf::from("shaders/particles.spv"),
            debug_errors: true,
            validation_layers: true,
        }
    }
}

impl ComputeConfig {
    /// Program file for the configured backend.
    pub fn program_path(&self) -> &Path {
        match self.backend {
            BackendKind::Host => &self.kernel_source,
            BackendKind::Vulkan => &self.spirv_module,
        }
    }
}

/// Simulation settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub particle_count: usize,
    pub local_size: u32,
    pub min_velocity: [f32; 3],
    pub max_velocity: [f32; 3],
    pub bounds_center: [f32; 3],
    pub bounds_size: [f32; 3],
    pub random_colors: bool,
    pub ping_color: [f32; 4],
    pub pong_color: [f32; 4],
    /// 0 seeds from the clock.
    pub seed: u64,
    /// 0 runs until interrupted.
    pub max_frames: u64,
    /// Apply a pulse every N frames; 0 disables.
    pub pulse_every: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        let props = SimulationProperties::default();
        Self {
            particle_count: 65_536,
            local_size: props.local_size,
            min_velocity: props.min_velocity.to_array(),
            max_velocity: props.max_velocity.to_array(),
            bounds_center: [0.0, 0.0, 0.0],
            bounds_size: [1.0, 1.0, 1.0],
            random_colors: false,
            ping_color: props.ping_color.to_array(),
            pong_color: props.pong_color.to_array(),
            seed: 0,
            max_frames: 600,
            pulse_every: 120,
        }
    }
}

impl SimulationConfig {
    pub fn properties(&self) -> SimulationProperties {
        SimulationProperties {
            particle_count: self.particle_count,
            local_size: self.local_size,
            min_velocity: Vec3::from_array(self.min_velocity),
            max_velocity: Vec3::from_array(self.max_velocity),
            random_colors: self.random_colors,
            ping_color: Vec4::from_array(self.ping_color),
            pong_color: Vec4::from_array(self.pong_color),
            seed: (self.seed != 0).then_some(self.seed),
            max_frames: (self.max_frames != 0).then_some(self.max_frames),
        }
    }

    pub fn bounds(&self) -> SimulationBounds {
        SimulationBounds::new(
            Vec3::from_array(self.bounds_center),
            Vec3::from_array(self.bounds_size),
        )
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub log_to_file: bool,
    pub log_file: String,
    /// Rebuild the program when its source file changes.
    pub hot_reload: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_to_file: false,
            log_file: "particle_interop.log".to_string(),
            hot_reload: false,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [compute]
            backend = "vulkan"

            [simulation]
            particle_count = 1000
            seed = 9
            "#,
        )
        .unwrap();

        assert_eq!(config.compute.backend, BackendKind::Vulkan);
        assert_eq!(config.compute.program_path(), Path::new("shaders/particles.spv"));

        let props = config.simulation.properties();
        assert_eq!(props.particle_count, 1000);
        assert_eq!(props.seed, Some(9));
        assert_eq!(props.max_frames, Some(600));
        assert!(!config.debug.hot_reload);
    }

    #[test]
    fn zero_means_unset() {
        let config: Config = toml::from_str("[simulation]\nseed = 0\nmax_frames = 0\n").unwrap();
        let props = config.simulation.properties();
        assert_eq!(props.seed, None);
        assert_eq!(props.max_frames, None);
    }

    #[test]
    fn missing_file_gives_defaults() {
        let config = Config::load_from_path("does/not/exist.toml").unwrap();
        assert_eq!(config.compute.backend, BackendKind::Host);
        assert_eq!(config.simulation.bounds().size(), Vec3::ONE);
    }

    #[test]
    fn unknown_backend_is_an_error() {
        assert!(toml::from_str::<Config>("[compute]\nbackend = \"metal\"\n").is_err());
    }
}
