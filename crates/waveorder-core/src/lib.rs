//! # Waveorder Core
//!
//! The numerical engine of waveorder: forward simulation of polarized,
//! partially coherent microscopy through birefringent specimens, and
//! reconstruction of retardance, slow axis, transmittance, degree of
//! polarization and quantitative phase from five-channel defocus stacks.
//!
//! ## Architecture
//!
//! All FFTs and source-point reductions go through an injected
//! [`waveorder_compute::ComputeBackend`]. [`simulator::ForwardSimulator`]
//! precomputes every optics-only quantity once and is read-only afterwards;
//! [`reconstruct::Reconstructor`] holds the inverted calibration matrix.
//!
//! ## Modules
//!
//! - [`types`]: Parameter bundles, illumination modes and result containers.
//! - [`grid`]: Spatial and frequency coordinates (DC at index 0).
//! - [`pupil`]: Pupil masks, defocus kernels, phase ring.
//! - [`jones`]: Jones specimen operator, Stokes conversion, analyzer states.
//! - [`specimen`]: Thin and inclined specimen models, Siemens star target.
//! - [`simulator`]: Forward models (thin, inclined, scalar multi-slice).
//! - [`wotf`]: Weak-object transfer functions.
//! - [`reconstruct`]: Stokes inversion, polarization maps, phase deconvolution.

pub mod error;
pub mod grid;
pub mod jones;
pub mod pupil;
pub mod reconstruct;
pub mod simulator;
pub mod specimen;
pub mod types;
pub mod wotf;

pub use error::{Result, WaveorderError};
