//! TOML configuration deserialisation for simulation jobs.

use serde::Deserialize;
use waveorder_core::types::{MicroscopeParams, ReconstructionParams};

/// Top-level job configuration.
#[derive(Debug, Deserialize)]
pub struct JobConfig {
    pub microscope: MicroscopeParams,
    #[serde(default)]
    pub specimen: SpecimenConfig,
    #[serde(default)]
    pub reconstruction: ReconstructionParams,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub compute: ComputeConfig,
}

/// Siemens-star test specimen. Each map is the star pattern scaled by the
/// given peak value.
#[derive(Debug, Deserialize)]
pub struct SpecimenConfig {
    /// Peak retardance (radians).
    #[serde(default = "default_retardance")]
    pub retardance: f64,
    /// Peak phase (radians).
    #[serde(default = "default_phase")]
    pub phase: f64,
    /// Peak amplitude attenuation.
    #[serde(default)]
    pub absorption: f64,
    /// Gaussian blur of the star in pixels.
    #[serde(default = "default_blur")]
    pub blur_px: f64,
}

impl Default for SpecimenConfig {
    fn default() -> Self {
        Self {
            retardance: default_retardance(),
            phase: default_phase(),
            absorption: 0.0,
            blur_px: default_blur(),
        }
    }
}

fn default_retardance() -> f64 {
    0.5
}
fn default_phase() -> f64 {
    0.1
}
fn default_blur() -> f64 {
    2.0
}

/// Output configuration.
#[derive(Debug, Deserialize)]
pub struct OutputConfig {
    /// Output directory (default: "./output").
    #[serde(default = "default_output_dir")]
    pub directory: String,
    /// Whether to write per-plane polarization maps as CSV (default: true).
    #[serde(default = "default_true")]
    pub save_maps: bool,
    /// Whether to write the phase reconstruction as CSV (default: true).
    #[serde(default = "default_true")]
    pub save_phase: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_output_dir(),
            save_maps: true,
            save_phase: true,
        }
    }
}

fn default_output_dir() -> String {
    "./output".into()
}
fn default_true() -> bool {
    true
}

/// Compute backend selection.
#[derive(Debug, Deserialize)]
pub struct ComputeConfig {
    /// Compute backend: "auto" or "cpu". Default: "auto".
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Worker threads for the CPU backend; unset uses the global pool.
    #[serde(default)]
    pub threads: Option<usize>,
    /// Sum source points through the backend's parallel reduction.
    #[serde(default = "default_true")]
    pub parallel: bool,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            threads: None,
            parallel: true,
        }
    }
}

fn default_backend() -> String {
    "auto".into()
}

/// Load and parse a TOML job configuration file.
pub fn load_config(path: &std::path::Path) -> anyhow::Result<JobConfig> {
    use anyhow::Context;

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading job file {}", path.display()))?;
    parse_config(&content).with_context(|| format!("parsing job file {}", path.display()))
}

/// Parse a TOML job configuration from a string.
pub fn parse_config(content: &str) -> anyhow::Result<JobConfig> {
    let config: JobConfig = toml::from_str(content)?;
    Ok(config)
}
