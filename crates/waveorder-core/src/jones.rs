//! Jones-calculus specimen operator, Stokes conversion and the five-state
//! polarization analyzer.
//!
//! A field is a `(2, N, M)` complex array holding the two orthogonal
//! components `(E0, E1)`. Every operation here is pointwise: the per-pixel
//! kernels are exposed so the simulator can fuse them into its inner loop
//! without allocating intermediate arrays.

use std::f64::consts::{FRAC_PI_2, PI};

use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis, Zip};
use num_complex::Complex64;

use crate::error::{Result, WaveorderError};
use crate::types::{N_CHANNELS, N_STOKES};

/// Apply the rotated diagonal operator `R(−θ)·diag(t0, t1)·R(θ)` to one
/// pixel.
#[inline]
pub fn jones_pixel(
    e0: Complex64,
    e1: Complex64,
    t0: Complex64,
    t1: Complex64,
    theta: f64,
) -> (Complex64, Complex64) {
    let (s, c) = theta.sin_cos();
    let diag0 = t0 * c * c + t1 * s * s;
    let diag1 = t0 * s * s + t1 * c * c;
    let off = (t0 - t1) * s * c;
    (diag0 * e0 + off * e1, off * e0 + diag1 * e1)
}

/// Stokes vector `[S0, S1, S2, S3]` of one coherent pixel, with
/// `S3 = 2·Im(E0*·E1)` so that right-handed circular light has `S3 > 0`.
#[inline]
pub fn stokes_pixel(e0: Complex64, e1: Complex64) -> [f64; N_STOKES] {
    let i0 = e0.norm_sqr();
    let i1 = e1.norm_sqr();
    let cross = e0.conj() * e1;
    [i0 + i1, i0 - i1, 2.0 * cross.re, 2.0 * cross.im]
}

fn check_field(context: &'static str, field: &ArrayView3<'_, Complex64>) -> Result<(usize, usize)> {
    let (c, n, m) = field.dim();
    if c != 2 {
        return Err(WaveorderError::shape(context, "(2, N, M)", field.shape()));
    }
    Ok((n, m))
}

/// Pass `field` through a specimen with principal transmittances
/// `eigen = (t0, t1)` of shape `(2, N, M)` whose `t0` axis sits at
/// `orientation` (radians) per pixel.
pub fn apply_sample(
    field: &ArrayView3<'_, Complex64>,
    eigen: &ArrayView3<'_, Complex64>,
    orientation: &ArrayView2<'_, f64>,
) -> Result<Array3<Complex64>> {
    let (n, m) = check_field("apply_sample field", field)?;
    if eigen.dim() != (2, n, m) {
        return Err(WaveorderError::shape(
            "apply_sample eigen-transmission",
            format!("(2, {n}, {m})"),
            eigen.shape(),
        ));
    }
    if orientation.dim() != (n, m) {
        return Err(WaveorderError::shape(
            "apply_sample orientation",
            format!("({n}, {m})"),
            orientation.shape(),
        ));
    }
    Ok(apply_sample_unchecked(field, eigen, orientation))
}

pub(crate) fn apply_sample_unchecked(
    field: &ArrayView3<'_, Complex64>,
    eigen: &ArrayView3<'_, Complex64>,
    orientation: &ArrayView2<'_, f64>,
) -> Array3<Complex64> {
    let (_, n, m) = field.dim();
    let mut out = Array3::zeros((2, n, m));
    for i in 0..n {
        for j in 0..m {
            let (o0, o1) = jones_pixel(
                field[[0, i, j]],
                field[[1, i, j]],
                eigen[[0, i, j]],
                eigen[[1, i, j]],
                orientation[[i, j]],
            );
            out[[0, i, j]] = o0;
            out[[1, i, j]] = o1;
        }
    }
    out
}

/// Stokes parameters of a coherent field, shape `(4, N, M)`.
pub fn to_stokes(field: &ArrayView3<'_, Complex64>) -> Result<Array3<f64>> {
    let (n, m) = check_field("to_stokes", field)?;
    let mut out = Array3::zeros((N_STOKES, n, m));
    for i in 0..n {
        for j in 0..m {
            let s = stokes_pixel(field[[0, i, j]], field[[1, i, j]]);
            for (k, v) in s.iter().enumerate() {
                out[[k, i, j]] = *v;
            }
        }
    }
    Ok(out)
}

/// One elliptical analyzer state. `alpha` sets the ellipticity retardance
/// and `beta` the orientation retardance of the liquid-crystal pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalyzerSetting {
    pub alpha: f64,
    pub beta: f64,
}

impl AnalyzerSetting {
    pub fn new(alpha: f64, beta: f64) -> Self {
        Self { alpha, beta }
    }

    /// The five states of a swing-angle-`chi` acquisition, in channel order.
    /// The calibration matrix used by the reconstructor assumes this order.
    pub fn five_state(chi: f64) -> [AnalyzerSetting; N_CHANNELS] {
        [
            Self::new(FRAC_PI_2, PI),
            Self::new(FRAC_PI_2 - chi, PI),
            Self::new(FRAC_PI_2, PI - chi),
            Self::new(FRAC_PI_2 + chi, PI),
            Self::new(FRAC_PI_2, PI + chi),
        ]
    }

    /// Projection coefficients `(a0, a1)` such that the transmitted amplitude
    /// is `a0·E0 + a1·E1`.
    #[inline]
    pub fn coefficients(&self) -> (Complex64, Complex64) {
        let (sa, ca) = (self.alpha / 2.0).sin_cos();
        let a0 = Complex64::from_polar(ca, -self.beta / 2.0);
        let a1 = Complex64::new(0.0, -sa) * Complex64::from_polar(1.0, self.beta / 2.0);
        (a0, a1)
    }

    /// Detected intensity of one pixel.
    #[inline]
    pub fn detect_pixel(&self, e0: Complex64, e1: Complex64) -> f64 {
        let (a0, a1) = self.coefficients();
        (a0 * e0 + a1 * e1).norm_sqr()
    }

    /// Detected intensity `|projection|²` over a `(2, N, M)` field.
    pub fn detect(&self, field: &ArrayView3<'_, Complex64>) -> Result<Array2<f64>> {
        check_field("detect", field)?;
        let (a0, a1) = self.coefficients();
        Ok(Zip::from(field.index_axis(Axis(0), 0))
            .and(field.index_axis(Axis(0), 1))
            .map_collect(|&e0, &e1| (a0 * e0 + a1 * e1).norm_sqr()))
    }
}

/// The 5×4 calibration matrix mapping `[S0, S1, S2, S3]` to the five
/// analyzer intensities of [`AnalyzerSetting::five_state`].
pub fn calibration_matrix(chi: f64) -> [[f64; N_STOKES]; N_CHANNELS] {
    let (s, c) = chi.sin_cos();
    [
        [0.5, 0.0, 0.0, -0.5],
        [0.5, 0.5 * s, 0.0, -0.5 * c],
        [0.5, 0.0, 0.5 * s, -0.5 * c],
        [0.5, -0.5 * s, 0.0, -0.5 * c],
        [0.5, 0.0, -0.5 * s, -0.5 * c],
    ]
}
