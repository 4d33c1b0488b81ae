//! Core types shared across the waveorder engine.
//!
//! This module defines the optical parameter bundle, the illumination
//! variants, and the result containers produced by the simulator and the
//! reconstructor.
//!
//! # Array conventions
//!
//! Images are `(N, M)` = (rows/y, columns/x). Stacks that carry several
//! measurement planes put the plane axis last: a Stokes stack is
//! `(4, N, M, P)`, an intensity stack `(5, N, M, P)`. With `D` defocus planes
//! and `J` illumination patterns, `P = D·J` and plane `m` of pattern `j`
//! lives at index `m·J + j`.

use ndarray::{Array2, Array3, Array4};
use serde::{Deserialize, Serialize};

/// Number of Stokes parameters (S0..S3).
pub const N_STOKES: usize = 4;

/// Number of analyzer channels. Fixed by the 5×4 calibration matrix.
pub const N_CHANNELS: usize = 5;

/// Number of channels in a normalised Stokes stack
/// `[S0, S1/S3, S2/S3, S3, DoP]`.
pub const N_NORMALIZED: usize = 5;

/// Illumination source geometry in the condenser back focal plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum IlluminationMode {
    /// Filled circular source of numerical aperture `na`.
    BrightField { na: f64 },
    /// Annular source between `inner_na` and `na`, with a matching
    /// attenuating phase ring in the objective pupil.
    PhaseRing {
        na: f64,
        #[serde(default)]
        inner_na: Option<f64>,
    },
    /// One or more user-supplied `(N, M)` source masks in FFT-native layout.
    /// Points with value 1 are active.
    Arbitrary { patterns: Vec<Array2<f64>> },
}

impl Default for IlluminationMode {
    fn default() -> Self {
        IlluminationMode::BrightField { na: 0.5 }
    }
}

/// Handedness of the circularly polarised illumination.
///
/// Only the sign convention of the recovered slow-axis angle depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Handedness {
    #[default]
    Rhc,
    Lhc,
}

/// Whether to sum source-point contributions on one thread or through the
/// backend's parallel reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Execution {
    #[default]
    Sequential,
    Parallel,
}

/// Optical parameters of the microscope. All lengths share one unit
/// (typically micrometres).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicroscopeParams {
    /// Image dimensions `[N, M]` (rows, columns).
    pub image_dims: [usize; 2],
    /// Illumination wavelength in vacuum.
    pub wavelength: f64,
    /// Pixel size at the specimen plane.
    pub pixel_size: f64,
    /// Numerical aperture of the objective.
    pub na_obj: f64,
    /// Axial defocus of each acquired plane. Order defines the plane order.
    #[serde(default = "default_z_defocus")]
    pub z_defocus: Vec<f64>,
    /// Analyzer swing angle (radians).
    pub chi: f64,
    /// Refractive index of the immersion medium.
    #[serde(default = "default_n_media")]
    pub n_media: f64,
    #[serde(default)]
    pub illumination: IlluminationMode,
}

fn default_z_defocus() -> Vec<f64> {
    vec![0.0]
}

fn default_n_media() -> f64 {
    1.0
}

impl Default for MicroscopeParams {
    fn default() -> Self {
        Self {
            image_dims: [64, 64],
            wavelength: 0.532,
            pixel_size: 0.1,
            na_obj: 0.9,
            z_defocus: default_z_defocus(),
            chi: 0.25,
            n_media: default_n_media(),
            illumination: IlluminationMode::default(),
        }
    }
}

/// Settings that only affect the inverse path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconstructionParams {
    #[serde(default)]
    pub handedness: Handedness,
    /// Tikhonov regularisation added to the diagonal of the WOTF normal
    /// equations.
    #[serde(default = "default_regularization")]
    pub regularization: f64,
}

fn default_regularization() -> f64 {
    1e-3
}

impl Default for ReconstructionParams {
    fn default() -> Self {
        Self {
            handedness: Handedness::default(),
            regularization: default_regularization(),
        }
    }
}

/// Output of a polarised forward simulation.
#[derive(Debug, Clone)]
pub struct SimulationOutput {
    /// Analyzer intensities, shape `(5, N, M, P)`.
    pub intensity: Array4<f64>,
    /// Stokes parameters, shape `(4, N, M, P)`.
    pub stokes: Array4<f64>,
}

/// Physical polarisation quantities, each of shape `(N, M, P)`.
#[derive(Debug, Clone)]
pub struct PolarizationMaps {
    /// Retardance (radians).
    pub retardance: Array3<f64>,
    /// Slow-axis orientation in `[0, π)`.
    pub slow_axis: Array3<f64>,
    /// Transmittance (S0).
    pub transmittance: Array3<f64>,
    /// Degree of polarisation.
    pub dop: Array3<f64>,
}

/// Linearised absorption and phase recovered from an S0 defocus stack.
#[derive(Debug, Clone)]
pub struct PhaseReconstruction {
    /// Log-amplitude in the WOTF convention `t ≈ 1 + absorption + iφ`,
    /// i.e. the negative of the attenuation `μ` in `exp(−μ + iφ)`.
    pub absorption: Array2<f64>,
    /// Phase in radians, zero-mean.
    pub phase: Array2<f64>,
}
