//! Scalar multi-slice (beam propagation) forward model.
//!
//! The specimen is a stack of thin complex transmission slices, one per
//! defocus plane, spaced by the uniform defocus step. Each source plane wave
//! is multiplied by a slice, propagated one step in frequency space, and so
//! on; after the last slice the field is refocused to every detection plane
//! and its intensity recorded.

use std::f64::consts::PI;

use ndarray::{Array2, Array3, Array4, ArrayView3, Axis, Zip};
use num_complex::Complex64;

use super::ForwardSimulator;
use crate::error::{Result, WaveorderError};
use crate::pupil::{oblique_factor, pupil};
use crate::types::Execution;

/// Relative tolerance on the defocus step when checking for uniform spacing.
const SPACING_TOLERANCE: f64 = 1e-9;

/// Uniform axial step of `z`, or `InvalidParameter` if the planes are not
/// equally spaced.
pub fn uniform_step(z: &[f64]) -> Result<f64> {
    if z.len() < 2 {
        return Err(WaveorderError::InvalidParameter(format!(
            "multi-slice propagation needs at least two defocus planes, got {}",
            z.len()
        )));
    }
    let delta = z[1] - z[0];
    let step = delta.abs();
    if step == 0.0 || !step.is_finite() {
        return Err(WaveorderError::InvalidParameter(format!(
            "defocus step must be non-zero and finite, got {step}"
        )));
    }
    for pair in z.windows(2) {
        let gap = pair[1] - pair[0];
        if (gap - delta).abs() > SPACING_TOLERANCE * step {
            return Err(WaveorderError::InvalidParameter(format!(
                "multi-slice propagation requires uniformly spaced defocus planes; \
                 found step {gap} after {}, expected {delta}",
                pair[0]
            )));
        }
    }
    Ok(step)
}

impl ForwardSimulator {
    /// Propagate every source plane wave through `transmission`
    /// (`(D, N, M)`, slice `m` at defocus plane `m`) and record the
    /// intensity at each detection plane.
    ///
    /// Returns `(patterns, N, M, D)`.
    pub fn simulate_scalar_stack(
        &self,
        transmission: &ArrayView3<'_, Complex64>,
        execution: Execution,
    ) -> Result<Array4<f64>> {
        let z = &self.params().z_defocus;
        let step = uniform_step(z)?;
        let n_slices = z.len();
        let (n, m) = self.grid().dims();
        if transmission.dim() != (n_slices, n, m) {
            return Err(WaveorderError::shape(
                "scalar transmission stack",
                format!("({n_slices}, {n}, {m})"),
                transmission.shape(),
            ));
        }

        let lambda = self.medium_wavelength();
        let propagation = pupil(self.grid(), 1.0, lambda);
        let fz = oblique_factor(self.grid(), &propagation.view(), lambda);

        let kernel = |dz: f64| -> Array2<Complex64> {
            Zip::from(&propagation)
                .and(&fz)
                .map_collect(|&p, &f| p * Complex64::from_polar(1.0, 2.0 * PI * dz * f))
        };
        let step_kernel = kernel(step);
        let offset = (n_slices as f64 / 2.0 - 1.0) * step;
        let mut detection = Array3::zeros((n_slices, n, m));
        for (mut plane, &zm) in detection.outer_iter_mut().zip(z.iter()) {
            plane.assign(&kernel(zm - offset));
            plane *= self.objective();
        }

        let nm = n * m;
        let per_source = |point: &super::SourcePoint, acc: &mut [f64]| {
            let mut field = self.plane_wave(point);
            for (index, slice) in transmission.outer_iter().enumerate() {
                field *= &slice;
                self.backend().fft2(field.view_mut());
                if index + 1 < n_slices {
                    field *= &step_kernel;
                    self.backend().ifft2(field.view_mut());
                } else {
                    let mut out = Array2::<Complex64>::zeros((n, m));
                    for (d, h) in detection.outer_iter().enumerate() {
                        out.assign(&field);
                        out *= &h;
                        self.backend().ifft2(out.view_mut());
                        let block = &mut acc[d * nm..(d + 1) * nm];
                        for (a, v) in block.iter_mut().zip(out.iter()) {
                            *a += v.norm_sqr();
                        }
                    }
                }
            }
        };

        let mut intensity = Array4::zeros((self.n_patterns(), n, m, n_slices));
        for j in 0..self.n_patterns() {
            let acc = self.accumulate_pattern(
                "simulate_scalar_stack",
                j,
                n_slices * nm,
                execution,
                &per_source,
            );
            let view = ArrayView3::from_shape((n_slices, n, m), &acc)
                .map_err(|e| WaveorderError::shape("accumulator", e.to_string(), &[acc.len()]))?;
            // (D, N, M) -> (N, M, D)
            let reordered = view.permuted_axes([1, 2, 0]);
            intensity.index_axis_mut(Axis(0), j).assign(&reordered);
        }
        Ok(intensity)
    }
}
