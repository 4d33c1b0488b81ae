//! Compute backend trait and device abstraction.
//!
//! The [`ComputeBackend`] trait isolates the optics code in `waveorder-core`
//! from the numeric primitive provider. The engine only ever needs two
//! things from a device:
//!
//! - a matched forward/inverse 2D FFT pair using the FFT-native
//!   (DC-at-index-0) layout, and
//! - an additive reduction over independent tasks, used to sum the
//!   contributions of incoherent illumination source points.
//!
//! Swapping the backend must never change a documented numeric contract;
//! only the summation order of the reduction may differ.

use ndarray::ArrayViewMut2;
use num_complex::Complex64;
use thiserror::Error;

/// Errors originating from compute backends.
#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("Backend not available: {0}")]
    Unavailable(String),

    #[error("Device error: {0}")]
    DeviceError(String),
}

/// Describes the capabilities of a compute backend.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub compute_units: Option<usize>,
}

/// Per-task accumulation callback.
///
/// Called once per task index with a zero-initialised (or partially
/// accumulated) buffer; the callback must only *add* into the buffer so that
/// the reduction is order-independent.
pub type AccumulateFn<'a> = dyn Fn(usize, &mut [f64]) + Send + Sync + 'a;

/// Abstraction over compute backends.
pub trait ComputeBackend: Send + Sync {
    /// Return information about the device.
    fn device_info(&self) -> DeviceInfo;

    /// In-place unnormalised forward 2D DFT,
    /// $X[u,v] = \sum_{k,l} x[k,l]\, e^{-2\pi i (uk/N + vl/M)}$.
    fn fft2(&self, data: ArrayViewMut2<'_, Complex64>);

    /// In-place inverse 2D DFT, normalised by $1/(NM)$ so that
    /// `ifft2(fft2(x)) == x`.
    fn ifft2(&self, data: ArrayViewMut2<'_, Complex64>);

    /// Sum the contributions of `tasks` independent tasks into a buffer of
    /// length `len`, one task after the other.
    fn accumulate(&self, tasks: usize, len: usize, task_fn: &AccumulateFn<'_>) -> Vec<f64> {
        let mut acc = vec![0.0; len];
        for task in 0..tasks {
            task_fn(task, &mut acc);
        }
        acc
    }

    /// Same contract as [`ComputeBackend::accumulate`], but free to run tasks
    /// concurrently and combine partial sums in any order.
    ///
    /// Results may differ from the sequential path by floating-point
    /// summation-order rounding only.
    fn parallel_accumulate(
        &self,
        tasks: usize,
        len: usize,
        task_fn: &AccumulateFn<'_>,
    ) -> Vec<f64> {
        self.accumulate(tasks, len, task_fn)
    }
}
