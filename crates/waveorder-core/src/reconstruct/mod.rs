//! Inverse path: analyzer intensities → Stokes parameters → physical
//! polarization quantities, and defocus stack → absorption and phase.
//!
//! Stacks use the `(channel, N, M, P)` layout of the forward simulator, so a
//! simulated [`SimulationOutput`](crate::types::SimulationOutput) can be fed
//! straight back in.

mod phase;

use std::sync::Arc;

use nalgebra::DMatrix;
use ndarray::{s, Array2, Array4, ArrayView4, Axis, Zip};
use waveorder_compute::ComputeBackend;

use crate::error::{Result, WaveorderError};
use crate::jones::calibration_matrix;
use crate::specimen::wrap_half_turn;
use crate::types::{
    Handedness, MicroscopeParams, PolarizationMaps, ReconstructionParams, N_CHANNELS,
    N_NORMALIZED, N_STOKES,
};

/// Singular values below this fraction are dropped from the calibration
/// pseudo-inverse.
const PINV_EPSILON: f64 = 1e-12;

/// Acquisition order of the analyzer states relative to the simulator's
/// channel order: channel `k` of the output is channel
/// `ACQUISITION_ORDER[k]` of the recorded stack.
pub const ACQUISITION_ORDER: [usize; N_CHANNELS] = [0, 4, 3, 1, 2];

/// Polarization and phase reconstructor for one analyzer configuration.
pub struct Reconstructor {
    chi: f64,
    handedness: Handedness,
    backend: Arc<dyn ComputeBackend>,
    calibration: Array2<f64>,
    inverse: Array2<f64>,
}

impl Reconstructor {
    /// Build the 5×4 calibration matrix for swing `chi` and invert it once.
    pub fn new(chi: f64, handedness: Handedness, backend: Arc<dyn ComputeBackend>) -> Result<Self> {
        if !chi.is_finite() {
            return Err(WaveorderError::InvalidParameter(format!(
                "swing angle must be finite, got {chi}"
            )));
        }
        let rows = calibration_matrix(chi);
        let calibration = Array2::from_shape_fn((N_CHANNELS, N_STOKES), |(i, j)| rows[i][j]);

        let forward = DMatrix::from_fn(N_CHANNELS, N_STOKES, |i, j| rows[i][j]);
        let pinv = forward
            .pseudo_inverse(PINV_EPSILON)
            .map_err(|e| WaveorderError::IllDefinedOperation(format!("calibration pseudo-inverse: {e}")))?;
        let inverse = Array2::from_shape_fn((N_STOKES, N_CHANNELS), |(i, j)| pinv[(i, j)]);

        Ok(Self {
            chi,
            handedness,
            backend,
            calibration,
            inverse,
        })
    }

    pub fn from_params(
        params: &MicroscopeParams,
        recon: &ReconstructionParams,
        backend: Arc<dyn ComputeBackend>,
    ) -> Result<Self> {
        Self::new(params.chi, recon.handedness, backend)
    }

    pub fn chi(&self) -> f64 {
        self.chi
    }

    pub fn handedness(&self) -> Handedness {
        self.handedness
    }

    /// Forward calibration matrix, `(5, 4)`.
    pub fn calibration(&self) -> &Array2<f64> {
        &self.calibration
    }

    /// Pseudo-inverse of the calibration matrix, `(4, 5)`.
    pub fn inverse_calibration(&self) -> &Array2<f64> {
        &self.inverse
    }

    /// Recover `(4, N, M, P)` Stokes parameters from a `(5, N, M, P)`
    /// intensity stack.
    pub fn stokes_from_intensity(&self, intensity: &ArrayView4<'_, f64>) -> Result<Array4<f64>> {
        let (c, n, m, p) = intensity.dim();
        if c != N_CHANNELS {
            return Err(WaveorderError::shape(
                "stokes_from_intensity",
                "5 analyzer channels",
                intensity.shape(),
            ));
        }
        let flat = intensity
            .to_shape((N_CHANNELS, n * m * p))
            .map_err(|e| WaveorderError::shape("stokes_from_intensity", e.to_string(), intensity.shape()))?;
        self.inverse
            .dot(&flat)
            .into_shape_with_order((N_STOKES, n, m, p))
            .map_err(|e| WaveorderError::shape("stokes_from_intensity", e.to_string(), intensity.shape()))
    }

    /// Normalised channels `[S0, S1/S3, S2/S3, S3, √(S1²+S2²+S3²)/S0]`.
    ///
    /// Pixels where `S3` or `S0` is exactly zero produce NaN/Inf.
    pub fn normalize_polarization(&self, stokes: &ArrayView4<'_, f64>) -> Result<Array4<f64>> {
        let (c, n, m, p) = stokes.dim();
        if c != N_STOKES {
            return Err(WaveorderError::shape(
                "normalize_polarization",
                "4 Stokes channels",
                stokes.shape(),
            ));
        }
        let s0 = stokes.index_axis(Axis(0), 0);
        let s1 = stokes.index_axis(Axis(0), 1);
        let s2 = stokes.index_axis(Axis(0), 2);
        let s3 = stokes.index_axis(Axis(0), 3);

        let mut out = Array4::zeros((N_NORMALIZED, n, m, p));
        out.index_axis_mut(Axis(0), 0).assign(&s0);
        out.index_axis_mut(Axis(0), 1).assign(&(&s1 / &s3));
        out.index_axis_mut(Axis(0), 2).assign(&(&s2 / &s3));
        out.index_axis_mut(Axis(0), 3).assign(&s3);
        Zip::from(out.index_axis_mut(Axis(0), 4))
            .and(&s0)
            .and(&s1)
            .and(&s2)
            .and(&s3)
            .for_each(|dop, &a, &b, &c, &d| {
                *dop = (b * b + c * c + d * d).sqrt() / a;
            });
        Ok(out)
    }

    /// Remove the background from normalised Stokes stacks acquired under
    /// identical optics: channels 0 and 4 are divided, channels 1 and 2
    /// subtracted, channel 3 is left as is.
    pub fn background_correct(
        &self,
        sample: &ArrayView4<'_, f64>,
        background: &ArrayView4<'_, f64>,
    ) -> Result<Array4<f64>> {
        if sample.len_of(Axis(0)) != N_NORMALIZED {
            return Err(WaveorderError::shape(
                "background_correct sample",
                "5 normalised channels",
                sample.shape(),
            ));
        }
        if background.shape() != sample.shape() {
            return Err(WaveorderError::shape(
                "background_correct background",
                format!("{:?}", sample.shape()),
                background.shape(),
            ));
        }

        let mut out = sample.to_owned();
        for channel in [0, 4] {
            let mut target = out.index_axis_mut(Axis(0), channel);
            target /= &background.index_axis(Axis(0), channel);
        }
        for channel in [1, 2] {
            let mut target = out.index_axis_mut(Axis(0), channel);
            target -= &background.index_axis(Axis(0), channel);
        }
        Ok(out)
    }

    /// Retardance, slow axis, transmittance and degree of polarization from
    /// normalised (optionally background-corrected) Stokes channels.
    pub fn polarization_parameters(&self, normalized: &ArrayView4<'_, f64>) -> Result<PolarizationMaps> {
        if normalized.len_of(Axis(0)) != N_NORMALIZED {
            return Err(WaveorderError::shape(
                "polarization_parameters",
                "5 normalised channels",
                normalized.shape(),
            ));
        }
        let s1 = normalized.index_axis(Axis(0), 1);
        let s2 = normalized.index_axis(Axis(0), 2);
        let s3 = normalized.index_axis(Axis(0), 3);

        let retardance = Zip::from(&s1)
            .and(&s2)
            .and(&s3)
            .map_collect(|&a, &b, &c| ((a * a + b * b).sqrt() * c).atan2(c));

        let sign = match self.handedness {
            Handedness::Rhc => 1.0,
            Handedness::Lhc => -1.0,
        };
        let slow_axis = Zip::from(&s1)
            .and(&s2)
            .map_collect(|&a, &b| wrap_half_turn(0.5 * (-a).atan2(sign * b)));

        Ok(PolarizationMaps {
            retardance,
            slow_axis,
            transmittance: normalized.slice(s![0, .., .., ..]).to_owned(),
            dop: normalized.slice(s![4, .., .., ..]).to_owned(),
        })
    }
}

/// Reorder a `(5, N, M, P)` stack recorded in acquisition order into the
/// analyzer channel order used by the simulator and the calibration matrix.
pub fn intensity_from_acquisition_order(stack: &ArrayView4<'_, f64>) -> Result<Array4<f64>> {
    if stack.len_of(Axis(0)) != N_CHANNELS {
        return Err(WaveorderError::shape(
            "intensity_from_acquisition_order",
            "5 analyzer channels",
            stack.shape(),
        ));
    }
    let mut out = Array4::zeros(stack.raw_dim());
    for (k, &source) in ACQUISITION_ORDER.iter().enumerate() {
        out.index_axis_mut(Axis(0), k)
            .assign(&stack.index_axis(Axis(0), source));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::PI;
    use waveorder_compute::CpuBackend;

    fn reconstructor(handedness: Handedness) -> Reconstructor {
        Reconstructor::new(0.25, handedness, Arc::new(CpuBackend::new())).unwrap()
    }

    fn stokes_stack(values: [f64; 4]) -> Array4<f64> {
        Array4::from_shape_fn((4, 3, 2, 2), |(c, _, _, _)| values[c])
    }

    #[test]
    fn test_pseudo_inverse_is_left_inverse() {
        let r = reconstructor(Handedness::Rhc);
        let product = r.inverse_calibration().dot(r.calibration());
        for i in 0..4 {
            for j in 0..4 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(product[[i, j]], expected, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn test_stokes_round_trip_through_calibration() {
        let r = reconstructor(Handedness::Rhc);
        let truth = [1.3, 0.2, -0.4, 0.9];
        let a = r.calibration();
        let intensity = Array4::from_shape_fn((5, 3, 2, 2), |(c, _, _, _)| {
            (0..4).map(|k| a[[c, k]] * truth[k]).sum::<f64>()
        });
        let s = r.stokes_from_intensity(&intensity.view()).unwrap();
        assert_eq!(s.dim(), (4, 3, 2, 2));
        for ((c, _, _, _), v) in s.indexed_iter() {
            assert_abs_diff_eq!(*v, truth[c], epsilon = 1e-10);
        }
    }

    #[test]
    fn test_stokes_from_intensity_requires_five_channels() {
        let r = reconstructor(Handedness::Rhc);
        let bad = Array4::<f64>::zeros((4, 3, 3, 1));
        assert!(matches!(
            r.stokes_from_intensity(&bad.view()),
            Err(WaveorderError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_normalize_polarization() {
        let r = reconstructor(Handedness::Rhc);
        let s = stokes_stack([2.0, 0.3, 0.4, 1.2]);
        let norm = r.normalize_polarization(&s.view()).unwrap();
        assert_eq!(norm.dim(), (5, 3, 2, 2));
        assert_abs_diff_eq!(norm[[0, 1, 1, 0]], 2.0);
        assert_abs_diff_eq!(norm[[1, 1, 1, 0]], 0.25, epsilon = 1e-15);
        assert_abs_diff_eq!(norm[[2, 1, 1, 0]], 0.4 / 1.2, epsilon = 1e-15);
        assert_abs_diff_eq!(norm[[3, 1, 1, 0]], 1.2);
        assert_abs_diff_eq!(norm[[4, 1, 1, 0]], 1.3 / 2.0, epsilon = 1e-15);
    }

    #[test]
    fn test_normalize_zero_s3_is_not_finite() {
        let r = reconstructor(Handedness::Rhc);
        let s = stokes_stack([1.0, 0.5, 0.0, 0.0]);
        let norm = r.normalize_polarization(&s.view()).unwrap();
        assert!(!norm[[1, 0, 0, 0]].is_finite());
    }

    #[test]
    fn test_background_correct_identity() {
        let r = reconstructor(Handedness::Rhc);
        let s = stokes_stack([1.7, -0.2, 0.35, 0.8]);
        let norm = r.normalize_polarization(&s.view()).unwrap();
        let corrected = r.background_correct(&norm.view(), &norm.view()).unwrap();
        for v in corrected.index_axis(Axis(0), 0).iter() {
            assert_abs_diff_eq!(*v, 1.0, epsilon = 1e-15);
        }
        for v in corrected.index_axis(Axis(0), 4).iter() {
            assert_abs_diff_eq!(*v, 1.0, epsilon = 1e-15);
        }
        for channel in [1, 2] {
            for v in corrected.index_axis(Axis(0), channel).iter() {
                assert_abs_diff_eq!(*v, 0.0, epsilon = 1e-15);
            }
        }
        assert_abs_diff_eq!(corrected[[3, 0, 0, 0]], 0.8);
    }

    #[test]
    fn test_background_shape_mismatch() {
        let r = reconstructor(Handedness::Rhc);
        let a = Array4::<f64>::ones((5, 2, 2, 1));
        let b = Array4::<f64>::ones((5, 2, 2, 2));
        assert!(matches!(
            r.background_correct(&a.view(), &b.view()),
            Err(WaveorderError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_polarization_parameters_handedness() {
        // Normalised channels of a retarder δ = 0.3 with its slow axis at
        // π/8 under RHC illumination: S1' = −sin 2θ tan δ, S2' = cos 2θ tan δ.
        let (delta, theta) = (0.3_f64, PI / 8.0);
        let t = delta.tan();
        let values = [1.0, -(2.0 * theta).sin() * t, (2.0 * theta).cos() * t, delta.cos(), 1.0];
        let norm = Array4::from_shape_fn((5, 2, 2, 1), |(c, _, _, _)| values[c]);

        let rhc = reconstructor(Handedness::Rhc)
            .polarization_parameters(&norm.view())
            .unwrap();
        assert_abs_diff_eq!(rhc.retardance[[0, 0, 0]], delta, epsilon = 1e-12);
        assert_abs_diff_eq!(rhc.slow_axis[[0, 0, 0]], theta, epsilon = 1e-12);
        assert_abs_diff_eq!(rhc.transmittance[[1, 1, 0]], 1.0);
        assert_abs_diff_eq!(rhc.dop[[1, 1, 0]], 1.0);

        let lhc = reconstructor(Handedness::Lhc)
            .polarization_parameters(&norm.view())
            .unwrap();
        assert_abs_diff_eq!(lhc.slow_axis[[0, 0, 0]], PI / 2.0 - theta, epsilon = 1e-12);
        for v in lhc.slow_axis.iter().chain(rhc.slow_axis.iter()) {
            assert!((0.0..PI).contains(v));
        }
    }

    #[test]
    fn test_acquisition_order_mapping() {
        let recorded = Array4::from_shape_fn((5, 2, 2, 1), |(c, _, _, _)| c as f64);
        let ordered = intensity_from_acquisition_order(&recorded.view()).unwrap();
        let channels: Vec<f64> = (0..5).map(|k| ordered[[k, 0, 0, 0]]).collect();
        assert_eq!(channels, vec![0.0, 4.0, 3.0, 1.0, 2.0]);
    }
}
