//! Tikhonov-regularised absorption/phase deconvolution with the WOTF.
//!
//! Each defocus plane of the S0 stack is linearised to `S0/mean − 1` and
//! moved to frequency space. The normal equations then decouple per
//! frequency bin into a 2×2 system
//!
//! ```text
//! | Σ|Hu|²+reg    Σ conj(Hu)Hp | |μ|   | Σ conj(Hu)·F{S0} |
//! | Σ conj(Hp)Hu  Σ|Hp|²+reg   | |φ| = | Σ conj(Hp)·F{S0} |
//! ```
//!
//! solved in closed form. No iteration is involved.

use ndarray::{Array2, ArrayView3, Axis, Zip};
use num_complex::Complex64;

use super::Reconstructor;
use crate::error::{Result, WaveorderError};
use crate::types::PhaseReconstruction;
use crate::wotf::Wotf;

impl Reconstructor {
    /// Recover absorption and phase from a `(D, N, M)` S0 defocus stack
    /// whose planes match `wotf`.
    ///
    /// `reg` must be finite and non-negative. A frequency bin whose 2×2
    /// system is singular (for instance `reg = 0` where both transfer
    /// functions vanish) is an `IllDefinedOperation`.
    pub fn phase_from_wotf(
        &self,
        s0_stack: &ArrayView3<'_, f64>,
        wotf: &Wotf,
        reg: f64,
    ) -> Result<PhaseReconstruction> {
        if s0_stack.dim() != wotf.hu.dim() {
            let (d, n, m) = wotf.hu.dim();
            return Err(WaveorderError::shape(
                "phase_from_wotf S0 stack",
                format!("({d}, {n}, {m})"),
                s0_stack.shape(),
            ));
        }
        if !reg.is_finite() || reg < 0.0 {
            return Err(WaveorderError::InvalidParameter(format!(
                "regularisation must be finite and non-negative, got {reg}"
            )));
        }

        let (_, n, m) = s0_stack.dim();
        let mut aha = [
            Array2::<Complex64>::from_elem((n, m), Complex64::new(reg, 0.0)),
            Array2::<Complex64>::zeros((n, m)),
            Array2::<Complex64>::zeros((n, m)),
            Array2::<Complex64>::from_elem((n, m), Complex64::new(reg, 0.0)),
        ];
        let mut b_u = Array2::<Complex64>::zeros((n, m));
        let mut b_p = Array2::<Complex64>::zeros((n, m));

        for (d, plane) in s0_stack.outer_iter().enumerate() {
            let mean = plane.mean().unwrap_or(f64::NAN);
            if mean == 0.0 || !mean.is_finite() {
                return Err(WaveorderError::IllDefinedOperation(format!(
                    "S0 plane {d} has mean {mean}; cannot normalise"
                )));
            }
            let mut spectrum = plane.mapv(|v| Complex64::new(v / mean - 1.0, 0.0));
            self.backend.fft2(spectrum.view_mut());

            let hu = wotf.hu.index_axis(Axis(0), d);
            let hp = wotf.hp.index_axis(Axis(0), d);
            let [a0, a1, a2, a3] = &mut aha;
            Zip::from(a0)
                .and(a1)
                .and(a2)
                .and(a3)
                .and(&hu)
                .and(&hp)
                .for_each(|uu, up, pu, pp, &u, &p| {
                    *uu += u.norm_sqr();
                    *up += u.conj() * p;
                    *pu += p.conj() * u;
                    *pp += p.norm_sqr();
                });
            Zip::from(&mut b_u)
                .and(&mut b_p)
                .and(&hu)
                .and(&hp)
                .and(&spectrum)
                .for_each(|bu, bp, &u, &p, &f| {
                    *bu += u.conj() * f;
                    *bp += p.conj() * f;
                });
        }

        let mut mu = Array2::<Complex64>::zeros((n, m));
        let mut phi = Array2::<Complex64>::zeros((n, m));
        let [a0, a1, a2, a3] = &aha;
        for i in 0..n {
            for j in 0..m {
                let (uu, up, pu, pp) = (a0[[i, j]], a1[[i, j]], a2[[i, j]], a3[[i, j]]);
                let (bu, bp) = (b_u[[i, j]], b_p[[i, j]]);
                let det = uu * pp - up * pu;
                if det.norm() == 0.0 || !det.is_finite() {
                    return Err(WaveorderError::IllDefinedOperation(format!(
                        "singular phase system at frequency bin ({i}, {j}) with reg = {reg}"
                    )));
                }
                mu[[i, j]] = (bu * pp - bp * up) / det;
                phi[[i, j]] = (bp * uu - bu * pu) / det;
            }
        }

        self.backend.ifft2(mu.view_mut());
        self.backend.ifft2(phi.view_mut());

        Ok(PhaseReconstruction {
            absorption: mu.mapv(|v| v.re),
            phase: phi.mapv(|v| v.re),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Handedness;
    use ndarray::{Array3, Axis};
    use std::sync::Arc;
    use waveorder_compute::CpuBackend;

    fn flat_wotf(d: usize, n: usize, m: usize) -> Wotf {
        Wotf {
            hu: Array3::from_elem((d, n, m), Complex64::new(2.0, 0.0)),
            hp: Array3::from_elem((d, n, m), Complex64::new(0.0, 0.0)),
        }
    }

    fn reconstructor() -> Reconstructor {
        Reconstructor::new(0.25, Handedness::Rhc, Arc::new(CpuBackend::new())).unwrap()
    }

    #[test]
    fn test_uniform_stack_recovers_nothing() {
        let r = reconstructor();
        let stack = Array3::from_elem((2, 8, 8), 3.5);
        let out = r.phase_from_wotf(&stack.view(), &flat_wotf(2, 8, 8), 1e-3).unwrap();
        assert!(out.phase.iter().all(|v| v.abs() < 1e-12));
        assert!(out.absorption.iter().all(|v| v.abs() < 1e-12));
    }

    #[test]
    fn test_pure_absorption_transfer() {
        // Hu = 2 everywhere, Hp = 0: μ = Σ 2·F{δS} / (8 + reg) over two planes
        // and φ = 0.
        let r = reconstructor();
        let mut stack = Array3::from_elem((2, 4, 4), 1.0);
        for mut plane in stack.axis_iter_mut(Axis(0)) {
            plane[[1, 2]] = 1.16;
        }
        let reg = 1e-3;
        let out = r.phase_from_wotf(&stack.view(), &flat_wotf(2, 4, 4), reg).unwrap();
        let mean = 1.01;
        let expected = 4.0 * (1.16 / mean - 1.0) / (8.0 + reg);
        approx::assert_abs_diff_eq!(out.absorption[[1, 2]], expected, epsilon = 1e-12);
        assert!(out.phase.iter().all(|v| v.abs() < 1e-12));
    }

    #[test]
    fn test_zero_mean_plane_is_ill_defined() {
        let r = reconstructor();
        let mut stack = Array3::from_elem((2, 4, 4), 1.0);
        stack.index_axis_mut(Axis(0), 1).fill(0.0);
        assert!(matches!(
            r.phase_from_wotf(&stack.view(), &flat_wotf(2, 4, 4), 1e-3),
            Err(WaveorderError::IllDefinedOperation(_))
        ));
    }

    #[test]
    fn test_unregularised_singular_bin_is_ill_defined() {
        // Hp = 0 everywhere, so without regularisation every bin is singular.
        let r = reconstructor();
        let mut stack = Array3::from_elem((2, 4, 4), 1.0);
        stack[[0, 1, 2]] = 1.2;
        assert!(matches!(
            r.phase_from_wotf(&stack.view(), &flat_wotf(2, 4, 4), 0.0),
            Err(WaveorderError::IllDefinedOperation(_))
        ));
        assert!(r.phase_from_wotf(&stack.view(), &flat_wotf(2, 4, 4), 1e-3).is_ok());
    }

    #[test]
    fn test_stack_shape_and_regularisation_checked() {
        let r = reconstructor();
        let stack = Array3::from_elem((3, 4, 4), 1.0);
        assert!(matches!(
            r.phase_from_wotf(&stack.view(), &flat_wotf(2, 4, 4), 1e-3),
            Err(WaveorderError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            r.phase_from_wotf(&stack.view(), &flat_wotf(3, 4, 4), -1.0),
            Err(WaveorderError::InvalidParameter(_))
        ));
    }
}
