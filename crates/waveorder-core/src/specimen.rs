//! Specimen models consumed by the forward simulator.
//!
//! A thin specimen is described by its two principal complex transmittances
//! and the orientation of the first (slow) axis. A thick, inclined uniaxial
//! specimen instead carries material indices and per-pixel geometry; its
//! eigen-transmission depends on the illumination direction and is built
//! per source point by the simulator.

use std::f64::consts::PI;

use ndarray::{Array2, Array3, ArrayView2};
use num_complex::Complex64;
use waveorder_compute::ComputeBackend;

use crate::error::{ensure_positive, Result, WaveorderError};
use crate::grid::ifftshift2;

/// Thin birefringent specimen.
#[derive(Debug, Clone)]
pub struct Specimen {
    /// Principal transmittances `(t0, t1)`, shape `(2, N, M)`.
    pub eigen: Array3<Complex64>,
    /// Angle of the `t0` axis per pixel (radians), shape `(N, M)`.
    pub orientation: Array2<f64>,
}

impl Specimen {
    pub fn new(eigen: Array3<Complex64>, orientation: Array2<f64>) -> Result<Self> {
        let (c, n, m) = eigen.dim();
        if c != 2 {
            return Err(WaveorderError::shape(
                "specimen eigen-transmission",
                "(2, N, M)",
                eigen.shape(),
            ));
        }
        if orientation.dim() != (n, m) {
            return Err(WaveorderError::shape(
                "specimen orientation",
                format!("({n}, {m})"),
                orientation.shape(),
            ));
        }
        Ok(Self { eigen, orientation })
    }

    /// Fully transparent, isotropic specimen.
    pub fn clear(n: usize, m: usize) -> Self {
        Self {
            eigen: Array3::from_elem((2, n, m), Complex64::new(1.0, 0.0)),
            orientation: Array2::zeros((n, m)),
        }
    }

    /// Build from physical maps: `t0 = exp(−μ + i(φ + ρ/2))`,
    /// `t1 = exp(−μ + i(φ − ρ/2))`, with `t0` along `orientation`.
    pub fn from_optical_maps(
        absorption: &ArrayView2<'_, f64>,
        phase: &ArrayView2<'_, f64>,
        retardance: &ArrayView2<'_, f64>,
        orientation: &ArrayView2<'_, f64>,
    ) -> Result<Self> {
        let (n, m) = absorption.dim();
        let others = [
            ("phase", phase.dim()),
            ("retardance", retardance.dim()),
            ("orientation", orientation.dim()),
        ];
        for (name, dims) in others {
            if dims != (n, m) {
                return Err(WaveorderError::ShapeMismatch {
                    context: "specimen optical maps",
                    expected: format!("{name} of shape ({n}, {m})"),
                    found: vec![dims.0, dims.1],
                });
            }
        }

        let mut eigen = Array3::zeros((2, n, m));
        for i in 0..n {
            for j in 0..m {
                let mu = absorption[[i, j]];
                let phi = phase[[i, j]];
                let half = retardance[[i, j]] / 2.0;
                eigen[[0, i, j]] = Complex64::new(-mu, phi + half).exp();
                eigen[[1, i, j]] = Complex64::new(-mu, phi - half).exp();
            }
        }
        Ok(Self {
            eigen,
            orientation: orientation.to_owned(),
        })
    }

    pub fn dims(&self) -> (usize, usize) {
        self.orientation.dim()
    }
}

/// Thick uniaxial specimen whose optic axis may tilt out of the image
/// plane.
#[derive(Debug, Clone)]
pub struct InclinedSpecimen {
    /// Extraordinary index.
    pub n_e: f64,
    /// Ordinary index.
    pub n_o: f64,
    /// Physical thickness, same units as the wavelength.
    pub thickness: f64,
    /// Amplitude attenuation `μ` per pixel.
    pub absorption: Array2<f64>,
    /// In-plane azimuth of the optic axis per pixel.
    pub orientation: Array2<f64>,
    /// Polar angle of the optic axis from the optical axis per pixel.
    pub inclination: Array2<f64>,
}

impl InclinedSpecimen {
    pub fn new(
        n_e: f64,
        n_o: f64,
        thickness: f64,
        absorption: Array2<f64>,
        orientation: Array2<f64>,
        inclination: Array2<f64>,
    ) -> Result<Self> {
        ensure_positive("extraordinary index", n_e)?;
        ensure_positive("ordinary index", n_o)?;
        if !thickness.is_finite() || thickness < 0.0 {
            return Err(WaveorderError::InvalidParameter(format!(
                "thickness must be finite and non-negative, got {thickness}"
            )));
        }
        let dims = absorption.dim();
        for (name, map) in [("orientation", &orientation), ("inclination", &inclination)] {
            if map.dim() != dims {
                return Err(WaveorderError::ShapeMismatch {
                    context: "inclined specimen maps",
                    expected: format!("{name} of shape ({}, {})", dims.0, dims.1),
                    found: map.shape().to_vec(),
                });
            }
        }
        Ok(Self {
            n_e,
            n_o,
            thickness,
            absorption,
            orientation,
            inclination,
        })
    }

    pub fn dims(&self) -> (usize, usize) {
        self.absorption.dim()
    }
}

/// 40-spoke Siemens star test target with a 10-pixel empty border.
///
/// The raw pattern `1 + cos(40θ)` is blurred with a Gaussian of standard
/// deviation `blur_px` pixels (FFT convolution), clamped at zero and scaled
/// to a maximum of 1. Returns `(star, theta)` where `theta` is the polar
/// angle about the image centre.
pub fn siemens_star(
    backend: &dyn ComputeBackend,
    n: usize,
    m: usize,
    blur_px: f64,
) -> Result<(Array2<f64>, Array2<f64>)> {
    const BORDER: usize = 10;
    const SPOKES: f64 = 40.0;

    if n <= 2 * BORDER || m <= 2 * BORDER {
        return Err(WaveorderError::InvalidParameter(format!(
            "Siemens star needs more than {} pixels per side, got ({n}, {m})",
            2 * BORDER
        )));
    }
    ensure_positive("blur width", blur_px)?;

    let (cy, cx) = ((n / 2) as f64, (m / 2) as f64);
    let theta = Array2::from_shape_fn((n, m), |(i, j)| (i as f64 - cy).atan2(j as f64 - cx));

    let mut star = Array2::from_shape_fn((n, m), |(i, j)| {
        let inside = (BORDER..n - BORDER).contains(&i) && (BORDER..m - BORDER).contains(&j);
        if inside {
            Complex64::new(1.0 + (SPOKES * theta[[i, j]]).cos(), 0.0)
        } else {
            Complex64::new(0.0, 0.0)
        }
    });

    let centred = Array2::from_shape_fn((n, m), |(i, j)| {
        let r2 = (i as f64 - cy).powi(2) + (j as f64 - cx).powi(2);
        Complex64::new((-r2 / (2.0 * blur_px * blur_px)).exp(), 0.0)
    });
    let mut kernel = ifftshift2(&centred.view());

    backend.fft2(star.view_mut());
    backend.fft2(kernel.view_mut());
    star *= &kernel;
    backend.ifft2(star.view_mut());

    let mut blurred = star.mapv(|v| v.re.max(0.0));
    let peak = blurred.fold(0.0_f64, |acc, &v| acc.max(v));
    if peak <= 0.0 {
        return Err(WaveorderError::IllDefinedOperation(
            "blurred Siemens star has no positive value".into(),
        ));
    }
    blurred.mapv_inplace(|v| v / peak);
    Ok((blurred, theta))
}

/// Wrap an angle into `[0, π)`. A rounding result of exactly `π` folds back to 0.
pub fn wrap_half_turn(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(PI);
    if wrapped >= PI {
        0.0
    } else {
        wrapped
    }
}

/// Convenience: build a specimen whose retardance and slow axis follow a
/// Siemens star, with phase and absorption scaled by the same pattern.
pub fn star_specimen(
    star: &ArrayView2<'_, f64>,
    theta: &ArrayView2<'_, f64>,
    retardance: f64,
    phase: f64,
    absorption: f64,
) -> Result<Specimen> {
    let ret = star.mapv(|s| s * retardance);
    let phi = star.mapv(|s| s * phase);
    let mu = star.mapv(|s| s * absorption);
    let azimuth = theta.mapv(wrap_half_turn);
    Specimen::from_optical_maps(&mu.view(), &phi.view(), &ret.view(), &azimuth.view())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use waveorder_compute::CpuBackend;

    #[test]
    fn test_clear_specimen() {
        let s = Specimen::clear(4, 6);
        assert_eq!(s.dims(), (4, 6));
        assert!(s.eigen.iter().all(|t| *t == Complex64::new(1.0, 0.0)));
    }

    #[test]
    fn test_optical_maps_split_retardance() {
        let mu = Array2::from_elem((2, 2), 0.1);
        let phi = Array2::from_elem((2, 2), 0.4);
        let rho = Array2::from_elem((2, 2), 0.6);
        let theta = Array2::from_elem((2, 2), 0.3);
        let s = Specimen::from_optical_maps(&mu.view(), &phi.view(), &rho.view(), &theta.view())
            .unwrap();
        let t0 = s.eigen[[0, 1, 1]];
        let t1 = s.eigen[[1, 1, 1]];
        assert_abs_diff_eq!(t0.norm(), (-0.1f64).exp(), epsilon = 1e-14);
        assert_abs_diff_eq!(t0.arg(), 0.7, epsilon = 1e-14);
        assert_abs_diff_eq!(t1.arg(), 0.1, epsilon = 1e-14);
        assert_eq!(s.orientation[[0, 0]], 0.3);
    }

    #[test]
    fn test_optical_maps_shape_mismatch() {
        let a = Array2::<f64>::zeros((3, 3));
        let b = Array2::<f64>::zeros((3, 4));
        match Specimen::from_optical_maps(&a.view(), &a.view(), &b.view(), &a.view()) {
            Err(WaveorderError::ShapeMismatch { expected, found, .. }) => {
                assert!(expected.starts_with("retardance"));
                assert_eq!(found, vec![3, 4]);
            }
            other => panic!("expected shape mismatch, got {other:?}"),
        }
        let phase = Array2::<f64>::zeros((2, 3));
        assert!(matches!(
            Specimen::from_optical_maps(&a.view(), &phase.view(), &a.view(), &a.view()),
            Err(WaveorderError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_wrap_half_turn() {
        assert_eq!(wrap_half_turn(-1e-300), 0.0);
        assert_eq!(wrap_half_turn(PI), 0.0);
        assert_abs_diff_eq!(wrap_half_turn(-PI / 4.0), 3.0 * PI / 4.0, epsilon = 1e-15);
        assert_abs_diff_eq!(wrap_half_turn(PI / 3.0), PI / 3.0, epsilon = 1e-15);
    }

    #[test]
    fn test_inclined_specimen_validation() {
        let z = Array2::<f64>::zeros((4, 4));
        assert!(InclinedSpecimen::new(1.5, 1.4, 1.0, z.clone(), z.clone(), z.clone()).is_ok());
        assert!(matches!(
            InclinedSpecimen::new(-1.5, 1.4, 1.0, z.clone(), z.clone(), z.clone()),
            Err(WaveorderError::InvalidParameter(_))
        ));
        assert!(matches!(
            InclinedSpecimen::new(1.5, 1.4, 1.0, z.clone(), Array2::zeros((4, 5)), z),
            Err(WaveorderError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_siemens_star_range_and_border() {
        let backend = CpuBackend::new();
        let (star, theta) = siemens_star(&backend, 64, 64, 2.0).unwrap();
        assert_eq!(star.dim(), (64, 64));
        let max = star.fold(f64::NEG_INFINITY, |a, &v| a.max(v));
        let min = star.fold(f64::INFINITY, |a, &v| a.min(v));
        assert_abs_diff_eq!(max, 1.0, epsilon = 1e-12);
        assert!(min >= 0.0);
        // Far corner lies more than five blur widths from any spoke.
        assert!(star[[0, 0]] < 1e-3);
        assert_abs_diff_eq!(theta[[32, 40]], 0.0, epsilon = 1e-15);
    }

    #[test]
    fn test_siemens_star_rejects_small_grid() {
        let backend = CpuBackend::new();
        assert!(matches!(
            siemens_star(&backend, 16, 64, 2.0),
            Err(WaveorderError::InvalidParameter(_))
        ));
    }
}
