//! # Waveorder Compute
//!
//! Numeric primitive provider for the waveorder engine. This crate provides
//! a [`ComputeBackend`](backend::ComputeBackend) trait that isolates the
//! optics code from device-specific execution details: the simulator and
//! reconstructor hold an `Arc<dyn ComputeBackend>` and never switch
//! implementations at runtime.
//!
//! ## Available backends
//!
//! | Backend | Feature flag | Status |
//! |---------|-------------|--------|
//! | CPU (rustfft + Rayon) | `cpu` (default) | Implemented |

pub mod backend;

#[cfg(feature = "cpu")]
pub mod cpu;

pub use backend::{AccumulateFn, ComputeBackend, ComputeError, DeviceInfo};

#[cfg(feature = "cpu")]
pub use cpu::CpuBackend;
