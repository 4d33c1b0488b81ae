//! Weak-object transfer functions for partially coherent illumination.
//!
//! For a source `S` and a defocus plane with detection transfer `H`, the
//! absorption and phase transfer functions are built from the two
//! cross-correlations of `S·H` with `H`:
//!
//! $$ H_1 = \mathcal{F}^{-1}\{\overline{\mathcal{F}\{S H\}}\,\mathcal{F}\{H\}\}, \quad
//!    H_2 = \mathcal{F}^{-1}\{\mathcal{F}\{S H\}\,\overline{\mathcal{F}\{H\}}\} $$
//!
//! $$ H_u = (H_1 + H_2)/I_0, \quad H_p = i(H_1 - H_2)/I_0, \quad I_0 = \sum S |H|^2 $$
//!
//! Both are kept complex. Any imaginary residue in their spatial-domain
//! products is discarded by the reconstructor, not here.

use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis, Zip};
use num_complex::Complex64;
use waveorder_compute::ComputeBackend;

use crate::error::{Result, WaveorderError};

/// Absorption (`hu`) and phase (`hp`) transfer functions, each `(D, N, M)`.
#[derive(Debug, Clone)]
pub struct Wotf {
    pub hu: Array3<Complex64>,
    pub hp: Array3<Complex64>,
}

impl Wotf {
    pub fn n_planes(&self) -> usize {
        self.hu.len_of(Axis(0))
    }

    pub fn dims(&self) -> (usize, usize) {
        let (_, n, m) = self.hu.dim();
        (n, m)
    }
}

/// Build the WOTF pair for `source` (`(N, M)` weights) and one transfer
/// function per defocus plane (`(D, N, M)`).
///
/// Fails with `IllDefinedOperation` when the source carries no energy
/// through some plane's transfer (`I_0 = 0`).
pub fn build_wotf(
    backend: &dyn ComputeBackend,
    source: &ArrayView2<'_, f64>,
    transfer: &ArrayView3<'_, Complex64>,
) -> Result<Wotf> {
    let (d, n, m) = transfer.dim();
    if source.dim() != (n, m) {
        return Err(WaveorderError::shape(
            "WOTF source",
            format!("({n}, {m})"),
            source.shape(),
        ));
    }

    let mut hu = Array3::zeros((d, n, m));
    let mut hp = Array3::zeros((d, n, m));

    for (plane, h) in transfer.outer_iter().enumerate() {
        let norm: f64 = Zip::from(source)
            .and(&h)
            .fold(0.0, |acc, &s, hz| acc + s * hz.norm_sqr());
        if norm == 0.0 || !norm.is_finite() {
            return Err(WaveorderError::IllDefinedOperation(format!(
                "WOTF normalisation is {norm} at plane {plane}: source misses the detection pupil"
            )));
        }

        let mut weighted: Array2<Complex64> = Zip::from(source).and(&h).map_collect(|&s, &hz| hz * s);
        let mut spectrum = h.to_owned();
        backend.fft2(weighted.view_mut());
        backend.fft2(spectrum.view_mut());

        let mut h1 = Zip::from(&weighted)
            .and(&spectrum)
            .map_collect(|a, b| a.conj() * b);
        let mut h2 = Zip::from(&weighted)
            .and(&spectrum)
            .map_collect(|a, b| a * b.conj());
        backend.ifft2(h1.view_mut());
        backend.ifft2(h2.view_mut());

        let i = Complex64::new(0.0, 1.0);
        Zip::from(hu.index_axis_mut(Axis(0), plane))
            .and(hp.index_axis_mut(Axis(0), plane))
            .and(&h1)
            .and(&h2)
            .for_each(|u, p, &a, &b| {
                *u = (a + b) / norm;
                *p = i * (a - b) / norm;
            });
    }

    Ok(Wotf { hu, hp })
}
