//! Pupil masks and defocus propagation kernels.
//!
//! Both objective and illumination supports are binary discs in frequency
//! space of radius `NA / λ`. Callers working in an immersion medium pass the
//! medium wavelength and the NA divided by the medium index.

use std::f64::consts::PI;

use ndarray::{Array2, Array3, ArrayView2, Zip};
use num_complex::Complex64;

use crate::error::{ensure_positive, Result, WaveorderError};
use crate::grid::Grid;

/// Binary circular support `sqrt(fx² + fy²) ≤ na / wavelength`.
///
/// `na ≤ 0` yields an all-zero mask.
pub fn pupil(grid: &Grid, na: f64, wavelength: f64) -> Array2<f64> {
    if na <= 0.0 || !na.is_finite() {
        let (n, m) = grid.dims();
        return Array2::zeros((n, m));
    }
    let cutoff = na / wavelength;
    grid.radial_frequency()
        .mapv(|fr| if fr <= cutoff { 1.0 } else { 0.0 })
}

/// Build one complex propagation kernel per requested defocus, in the order
/// given:
///
/// $$ H_z = P \exp\left(i \tfrac{2\pi}{\lambda} z \sqrt{\max(0, 1 - \lambda^2 f_r^2)}\, P\right) $$
///
/// Evanescent components are clamped to a zero axial frequency. At `z = 0`
/// the kernel equals the pupil exactly.
pub fn defocus_stack(
    grid: &Grid,
    pupil: &ArrayView2<'_, f64>,
    wavelength: f64,
    z_defocus: &[f64],
) -> Result<Array3<Complex64>> {
    grid.check_map("defocus pupil", pupil)?;
    ensure_positive("wavelength", wavelength)?;
    if let Some(z) = z_defocus.iter().find(|z| !z.is_finite()) {
        return Err(WaveorderError::InvalidParameter(format!(
            "defocus offsets must be finite, got {z}"
        )));
    }

    let (n, m) = grid.dims();
    let axial = oblique_factor(grid, pupil, wavelength);

    let mut stack = Array3::zeros((z_defocus.len(), n, m));
    for (mut plane, &z) in stack.outer_iter_mut().zip(z_defocus) {
        let k = 2.0 * PI * z;
        Zip::from(&mut plane)
            .and(pupil)
            .and(&axial)
            .for_each(|h, &p, &fz| {
                *h = p * Complex64::from_polar(1.0, k * fz);
            });
    }
    Ok(stack)
}

/// Axial spatial frequency `sqrt(max(0, 1 − λ²fr²)) · P / λ`.
pub(crate) fn oblique_factor(grid: &Grid, pupil: &ArrayView2<'_, f64>, wavelength: f64) -> Array2<f64> {
    let lambda_sq = wavelength * wavelength;
    let mut fz = grid.radial_frequency();
    Zip::from(&mut fz).and(pupil).for_each(|f, &p| {
        *f = (1.0 - lambda_sq * *f * *f).max(0.0).sqrt() * p / wavelength;
    });
    fz
}

/// Attenuating phase ring for phase-contrast objectives:
/// `exp((R_out − R_in)(ln 0.7 − iπ/2))`, where `R_out`, `R_in` are the discs
/// of NA `outer_na` and `inner_na`. Equal to 1 outside the annulus.
pub fn phase_ring(grid: &Grid, outer_na: f64, inner_na: f64, wavelength: f64) -> Array2<Complex64> {
    let exponent = Complex64::new(PHASE_RING_ATTENUATION.ln(), -PI / 2.0);
    let outer = pupil(grid, outer_na, wavelength);
    let inner = pupil(grid, inner_na, wavelength);
    Zip::from(&outer)
        .and(&inner)
        .map_collect(|&o, &i| (exponent * (o - i)).exp())
}

/// Amplitude transmission of the phase ring annulus.
pub const PHASE_RING_ATTENUATION: f64 = 0.7;

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn test_grid() -> Grid {
        Grid::new(32, 32, 0.1).unwrap()
    }

    #[test]
    fn test_pupil_is_binary_and_contains_dc() {
        let grid = test_grid();
        let p = pupil(&grid, 0.5, 0.5);
        assert!(p.iter().all(|&v| v == 0.0 || v == 1.0));
        assert_eq!(p[[0, 0]], 1.0);
        // Cut-off 1.0 µm⁻¹, spacing 1/3.2 µm⁻¹: index 3 is inside, 4 is not.
        assert_eq!(p[[0, 3]], 1.0);
        assert_eq!(p[[0, 4]], 0.0);
    }

    #[test]
    fn test_pupil_symmetry() {
        let grid = test_grid();
        let p = pupil(&grid, 0.7, 0.532);
        let (n, m) = grid.dims();
        for i in 1..n {
            for j in 1..m {
                assert_eq!(p[[i, j]], p[[n - i, m - j]]);
                assert_eq!(p[[i, j]], p[[j, i]]);
            }
        }
    }

    #[test]
    fn test_zero_na_pupil_is_empty() {
        let grid = test_grid();
        let p = pupil(&grid, 0.0, 0.532);
        assert!(p.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_zero_defocus_equals_pupil() {
        let grid = test_grid();
        let p = pupil(&grid, 0.9, 0.532);
        let stack = defocus_stack(&grid, &p.view(), 0.532, &[0.0]).unwrap();
        for (h, &pv) in stack.iter().zip(p.iter()) {
            assert_eq!(h.re, pv);
            assert_eq!(h.im, 0.0);
        }
    }

    #[test]
    fn test_defocus_preserves_plane_order() {
        let grid = test_grid();
        let p = pupil(&grid, 0.9, 0.532);
        let z = [1.5, -0.5, 0.0];
        let stack = defocus_stack(&grid, &p.view(), 0.532, &z).unwrap();
        assert_eq!(stack.dim(), (3, 32, 32));

        let single = defocus_stack(&grid, &p.view(), 0.532, &[-0.5]).unwrap();
        for (a, b) in stack.index_axis(ndarray::Axis(0), 1).iter().zip(single.iter()) {
            assert_abs_diff_eq!(a.re, b.re, epsilon = 1e-15);
            assert_abs_diff_eq!(a.im, b.im, epsilon = 1e-15);
        }
    }

    #[test]
    fn test_defocus_is_unit_modulus_inside_pupil() {
        let grid = test_grid();
        let p = pupil(&grid, 0.9, 0.532);
        let stack = defocus_stack(&grid, &p.view(), 0.532, &[2.0]).unwrap();
        for (h, &pv) in stack.iter().zip(p.iter()) {
            assert_abs_diff_eq!(h.norm(), pv, epsilon = 1e-12);
        }
        // DC propagates with the on-axis phase 2πz/λ.
        let expected = Complex64::from_polar(1.0, 2.0 * PI * 2.0 / 0.532);
        assert_abs_diff_eq!(stack[[0, 0, 0]].re, expected.re, epsilon = 1e-12);
        assert_abs_diff_eq!(stack[[0, 0, 0]].im, expected.im, epsilon = 1e-12);
    }

    #[test]
    fn test_defocus_rejects_bad_pupil_shape() {
        let grid = test_grid();
        let p = Array2::<f64>::ones((16, 32));
        assert!(matches!(
            defocus_stack(&grid, &p.view(), 0.532, &[0.0]),
            Err(WaveorderError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_phase_ring_annulus() {
        let grid = test_grid();
        let ring = phase_ring(&grid, 1.0, 0.6, 1.0);
        // Spacing 1/3.2: index 2 (0.625) lies in the annulus, DC does not.
        assert_abs_diff_eq!(ring[[0, 0]].re, 1.0, epsilon = 1e-15);
        assert_abs_diff_eq!(ring[[0, 2]].norm(), PHASE_RING_ATTENUATION, epsilon = 1e-12);
        assert_abs_diff_eq!(ring[[0, 2]].arg(), -PI / 2.0, epsilon = 1e-12);
    }
}
