//! Thick uniaxial specimen with an inclined optic axis.
//!
//! The extraordinary index seen by a plane wave depends on the angle `α`
//! between its propagation direction `w` and the optic axis `a`:
//!
//! $$ n_e(\alpha) = \left(\frac{\sin^2\alpha}{n_e^2} + \frac{\cos^2\alpha}{n_o^2}\right)^{-1/2} $$
//!
//! so the eigen-transmission is rebuilt for every source point before the
//! field goes through the usual thin-specimen Jones operator.

use std::f64::consts::PI;

use ndarray::Array3;
use num_complex::Complex64;

use super::{ForwardSimulator, SourcePoint};
use crate::jones::apply_sample_unchecked;
use crate::specimen::InclinedSpecimen;
use crate::types::{Execution, SimulationOutput};

/// Effective extraordinary index for `cos α` between ray and optic axis.
pub fn effective_extraordinary_index(n_e: f64, n_o: f64, cos_alpha: f64) -> f64 {
    let cos2 = cos_alpha * cos_alpha;
    1.0 / ((1.0 - cos2) / (n_e * n_e) + cos2 / (n_o * n_o)).sqrt()
}

impl ForwardSimulator {
    /// Simulate a thick uniaxial specimen. Output layout matches
    /// [`ForwardSimulator::simulate`].
    pub fn simulate_inclined(
        &self,
        specimen: &InclinedSpecimen,
        execution: Execution,
    ) -> crate::Result<SimulationOutput> {
        self.check_dims("inclined specimen", specimen.dims())?;

        self.run_polarized("simulate_inclined", execution, |point, acc| {
            let eigen = self.inclined_eigen(specimen, point);
            let field = self.illumination_field(point);
            let sample =
                apply_sample_unchecked(&field.view(), &eigen.view(), &specimen.orientation.view());
            self.detect_into(sample, acc);
        })
    }

    /// Per-pixel `(t0, t1)` for a plane wave from `point`.
    pub(crate) fn inclined_eigen(
        &self,
        specimen: &InclinedSpecimen,
        point: &SourcePoint,
    ) -> Array3<Complex64> {
        let lambda = self.medium_wavelength();
        let n_media = self.params().n_media;
        let wx = lambda * point.fx;
        let wy = lambda * point.fy;
        let wz = (1.0 - wx * wx - wy * wy).max(0.0).sqrt();

        let k = 2.0 * PI * specimen.thickness / lambda;
        let ordinary_phase = k * (specimen.n_o / n_media - 1.0);

        let (n, m) = specimen.dims();
        let mut eigen = Array3::zeros((2, n, m));
        for i in 0..n {
            for j in 0..m {
                let (sin_inc, cos_inc) = specimen.inclination[[i, j]].sin_cos();
                let (sin_az, cos_az) = specimen.orientation[[i, j]].sin_cos();
                let cos_alpha = sin_inc * cos_az * wx + sin_inc * sin_az * wy + cos_inc * wz;
                let n_alpha = effective_extraordinary_index(specimen.n_e, specimen.n_o, cos_alpha);

                let mu = specimen.absorption[[i, j]];
                let extraordinary_phase = k * (n_alpha / n_media - 1.0);
                eigen[[0, i, j]] = Complex64::new(-mu, extraordinary_phase).exp();
                eigen[[1, i, j]] = Complex64::new(-mu, ordinary_phase).exp();
            }
        }
        eigen
    }
}
