//! Partially coherent forward model.
//!
//! The illumination is an incoherent sum of coherent plane waves, one per
//! active point of the source pattern. Each point source is propagated
//! through the specimen and the defocused detection optics independently and
//! only its Stokes vector and analyzer intensities are added to the result,
//! never its complex field. The per-source work is therefore independent and
//! additive, which is what lets the backend reduce it in any order.
//!
//! Three specimen models share this structure:
//!
//! - [`ForwardSimulator::simulate`]: thin birefringent specimen.
//! - [`ForwardSimulator::simulate_inclined`]: thick uniaxial specimen with a
//!   tilted optic axis (see [`inclined`]).
//! - [`ForwardSimulator::simulate_scalar_stack`]: scalar multi-slice
//!   propagation through a 3D transmission stack (see [`scalar`]).

pub mod inclined;
pub mod scalar;

use std::f64::consts::{FRAC_1_SQRT_2, PI};
use std::sync::Arc;
use std::time::Instant;

use ndarray::{s, Array2, Array3, Array4, ArrayView4, Axis, Zip};
use num_complex::Complex64;
use waveorder_compute::ComputeBackend;

use crate::error::{ensure_positive, Result, WaveorderError};
use crate::grid::Grid;
use crate::jones::{apply_sample_unchecked, stokes_pixel, AnalyzerSetting};
use crate::pupil::{defocus_stack, phase_ring, pupil};
use crate::specimen::Specimen;
use crate::types::{
    Execution, IlluminationMode, MicroscopeParams, SimulationOutput, N_CHANNELS, N_STOKES,
};
use crate::wotf::{build_wotf, Wotf};

/// Stokes parameters followed by analyzer channels in one accumulation plane.
const VALUES_PER_PIXEL: usize = N_STOKES + N_CHANNELS;

/// Inner edge offset of the phase-contrast annulus (vacuum NA units).
const RING_SOURCE_MARGIN: f64 = 0.005;
/// Outer and inner widening of the objective phase ring (vacuum NA units).
const RING_OUTER_MARGIN: f64 = 0.03;
const RING_INNER_MARGIN: f64 = 0.01;

/// One active illumination point, in FFT-native grid coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourcePoint {
    pub row: usize,
    pub col: usize,
    pub fx: f64,
    pub fy: f64,
}

/// A source mask and its active points, enumerated once in row-major order.
#[derive(Debug, Clone)]
pub struct SourcePattern {
    pub mask: Array2<f64>,
    pub points: Vec<SourcePoint>,
}

impl SourcePattern {
    fn from_mask(grid: &Grid, mask: Array2<f64>) -> Self {
        let points = mask
            .indexed_iter()
            .filter(|&(_, &v)| v == 1.0)
            .map(|((row, col), _)| SourcePoint {
                row,
                col,
                fx: grid.fx[[row, col]],
                fy: grid.fy[[row, col]],
            })
            .collect();
        Self { mask, points }
    }
}

/// Forward simulator for a fixed microscope configuration.
///
/// Everything that depends only on the optics (grid, pupils, defocus
/// kernels, source points, WOTFs) is built once in [`ForwardSimulator::new`]
/// and read-only afterwards, so a simulator can be shared across threads.
pub struct ForwardSimulator {
    params: MicroscopeParams,
    backend: Arc<dyn ComputeBackend>,
    grid: Grid,
    /// Wavelength in the immersion medium.
    wavelength: f64,
    /// Binary objective support.
    pupil: Array2<f64>,
    /// Objective pupil including any phase ring.
    objective: Array2<Complex64>,
    /// Propagation kernels on the support, `(D, N, M)`.
    defocus: Array3<Complex64>,
    /// `objective · defocus`, `(D, N, M)`.
    transfer: Array3<Complex64>,
    patterns: Vec<SourcePattern>,
    wotf: Vec<Option<Wotf>>,
    analyzer: [AnalyzerSetting; N_CHANNELS],
}

impl ForwardSimulator {
    /// Validate `params` and precompute all optics.
    pub fn new(params: MicroscopeParams, backend: Arc<dyn ComputeBackend>) -> Result<Self> {
        let start = Instant::now();
        let [n, m] = params.image_dims;
        let grid = Grid::new(n, m, params.pixel_size)?;

        ensure_positive("wavelength", params.wavelength)?;
        ensure_positive("objective NA", params.na_obj)?;
        ensure_positive("medium refractive index", params.n_media)?;
        if !params.chi.is_finite() {
            return Err(WaveorderError::InvalidParameter(format!(
                "swing angle must be finite, got {}",
                params.chi
            )));
        }
        if params.z_defocus.is_empty() {
            return Err(WaveorderError::InvalidParameter(
                "at least one defocus plane is required".into(),
            ));
        }

        let n_media = params.n_media;
        let wavelength = params.wavelength / n_media;
        let na_obj = params.na_obj / n_media;

        let support = pupil(&grid, na_obj, wavelength);
        let mut objective = support.mapv(|p| Complex64::new(p, 0.0));

        let masks = match &params.illumination {
            IlluminationMode::BrightField { na } => {
                ensure_positive("illumination NA", *na)?;
                vec![pupil(&grid, na / n_media, wavelength)]
            }
            IlluminationMode::PhaseRing { na, inner_na } => {
                ensure_positive("illumination NA", *na)?;
                let inner = inner_na.ok_or_else(|| {
                    WaveorderError::InvalidParameter(
                        "phase-ring illumination requires inner_na".into(),
                    )
                })?;
                if !(0.0..*na).contains(&inner) {
                    return Err(WaveorderError::InvalidParameter(format!(
                        "phase-ring inner_na must lie in [0, {na}), got {inner}"
                    )));
                }
                let outer = pupil(&grid, na / n_media, wavelength);
                let hole = pupil(&grid, (inner + RING_SOURCE_MARGIN) / n_media, wavelength);
                let ring = phase_ring(
                    &grid,
                    (na + RING_OUTER_MARGIN) / n_media,
                    (inner - RING_INNER_MARGIN) / n_media,
                    wavelength,
                );
                objective *= &ring;
                vec![outer - hole]
            }
            IlluminationMode::Arbitrary { patterns } => {
                if patterns.is_empty() {
                    return Err(WaveorderError::InvalidParameter(
                        "arbitrary illumination requires at least one source pattern".into(),
                    ));
                }
                for pattern in patterns {
                    grid.check_map("illumination pattern", &pattern.view())?;
                }
                patterns.clone()
            }
        };

        let patterns: Vec<SourcePattern> = masks
            .into_iter()
            .map(|mask| SourcePattern::from_mask(&grid, mask))
            .collect();
        if let Some(j) = patterns.iter().position(|p| p.points.is_empty()) {
            return Err(WaveorderError::InvalidParameter(format!(
                "illumination pattern {j} has no active source points"
            )));
        }

        let defocus = defocus_stack(&grid, &support.view(), wavelength, &params.z_defocus)?;
        let mut transfer = defocus.clone();
        for mut plane in transfer.outer_iter_mut() {
            plane *= &objective;
        }

        let mut wotf = Vec::with_capacity(patterns.len());
        for (j, pattern) in patterns.iter().enumerate() {
            match build_wotf(backend.as_ref(), &pattern.mask.view(), &transfer.view()) {
                Ok(w) => wotf.push(Some(w)),
                Err(WaveorderError::IllDefinedOperation(reason)) => {
                    log::warn!("WOTF for pattern {j} unavailable: {reason}");
                    wotf.push(None);
                }
                Err(e) => return Err(e),
            }
        }

        let analyzer = AnalyzerSetting::five_state(params.chi);

        log::info!(
            "Simulator ready: {}x{} grid, {} defocus plane(s), {} pattern(s) with {} source point(s), backend {} ({:.2?})",
            n,
            m,
            params.z_defocus.len(),
            patterns.len(),
            patterns.iter().map(|p| p.points.len()).sum::<usize>(),
            backend.device_info().name,
            start.elapsed()
        );

        Ok(Self {
            params,
            backend,
            grid,
            wavelength,
            pupil: support,
            objective,
            defocus,
            transfer,
            patterns,
            wotf,
            analyzer,
        })
    }

    pub fn params(&self) -> &MicroscopeParams {
        &self.params
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn backend(&self) -> &Arc<dyn ComputeBackend> {
        &self.backend
    }

    /// Wavelength in the immersion medium.
    pub fn medium_wavelength(&self) -> f64 {
        self.wavelength
    }

    pub fn objective_support(&self) -> &Array2<f64> {
        &self.pupil
    }

    /// Complex objective pupil (support times any phase ring).
    pub fn objective(&self) -> &Array2<Complex64> {
        &self.objective
    }

    pub fn defocus_kernels(&self) -> &Array3<Complex64> {
        &self.defocus
    }

    /// Effective detection transfer per defocus plane.
    pub fn transfer(&self) -> &Array3<Complex64> {
        &self.transfer
    }

    pub fn n_defocus(&self) -> usize {
        self.params.z_defocus.len()
    }

    pub fn n_patterns(&self) -> usize {
        self.patterns.len()
    }

    /// Number of output planes, `defocus planes × patterns`.
    pub fn n_planes(&self) -> usize {
        self.n_defocus() * self.n_patterns()
    }

    /// Output plane index of defocus plane `m` under pattern `j`.
    pub fn plane_index(&self, m: usize, j: usize) -> usize {
        m * self.n_patterns() + j
    }

    pub fn patterns(&self) -> &[SourcePattern] {
        &self.patterns
    }

    pub fn analyzer_settings(&self) -> &[AnalyzerSetting; N_CHANNELS] {
        &self.analyzer
    }

    /// WOTF of illumination pattern `j`.
    pub fn wotf(&self, j: usize) -> Result<&Wotf> {
        match self.wotf.get(j) {
            Some(Some(w)) => Ok(w),
            Some(None) => Err(WaveorderError::IllDefinedOperation(format!(
                "pattern {j} transmits no light through the objective; its WOTF is undefined"
            ))),
            None => Err(WaveorderError::InvalidParameter(format!(
                "pattern index {j} out of range (have {})",
                self.patterns.len()
            ))),
        }
    }

    /// Simulate the five analyzer channels and the Stokes parameters of a
    /// thin specimen.
    ///
    /// Output stacks are `(5, N, M, P)` and `(4, N, M, P)` with
    /// `P = D × patterns`, plane `m` of pattern `j` at
    /// [`ForwardSimulator::plane_index`]. Parallel execution changes only
    /// the floating-point summation order.
    ///
    /// Intensities are not normalised by the source size. Each source point
    /// carries unit intensity, so a clear specimen yields `S0` equal to the
    /// number of source points the objective transmits, with
    /// `S / S0 = [1, 0, 0, 1]` for RHC illumination.
    pub fn simulate(&self, specimen: &Specimen, execution: Execution) -> Result<SimulationOutput> {
        self.check_dims("specimen", specimen.dims())?;
        let eigen = specimen.eigen.view();
        let orientation = specimen.orientation.view();

        self.run_polarized("simulate", execution, |point, acc| {
            let field = self.illumination_field(point);
            let sample = apply_sample_unchecked(&field.view(), &eigen, &orientation);
            self.detect_into(sample, acc);
        })
    }

    pub(crate) fn check_dims(&self, what: &'static str, dims: (usize, usize)) -> Result<()> {
        if dims == self.grid.dims() {
            Ok(())
        } else {
            let (n, m) = self.grid.dims();
            Err(WaveorderError::shape(what, format!("({n}, {m})"), &[dims.0, dims.1]))
        }
    }

    /// RHC plane wave `(p, i·p)/√2`, `p = exp(i2π(fx₀x + fy₀y))`.
    pub(crate) fn illumination_field(&self, point: &SourcePoint) -> Array3<Complex64> {
        let (n, m) = self.grid.dims();
        let mut field = Array3::zeros((2, n, m));
        let wave = self.plane_wave(point);
        field
            .index_axis_mut(Axis(0), 0)
            .assign(&wave.mapv(|p| p * FRAC_1_SQRT_2));
        field
            .index_axis_mut(Axis(0), 1)
            .assign(&wave.mapv(|p| p * Complex64::new(0.0, FRAC_1_SQRT_2)));
        field
    }

    pub(crate) fn plane_wave(&self, point: &SourcePoint) -> Array2<Complex64> {
        Zip::from(&self.grid.x)
            .and(&self.grid.y)
            .map_collect(|&x, &y| Complex64::from_polar(1.0, 2.0 * PI * (point.fx * x + point.fy * y)))
    }

    /// Propagate a specimen-plane field to every defocus plane and add its
    /// Stokes vector and analyzer intensities into `acc`, laid out as
    /// `(D, 9, N, M)`.
    pub(crate) fn detect_into(&self, field: Array3<Complex64>, acc: &mut [f64]) {
        let (n, m) = self.grid.dims();
        let nm = n * m;
        let coefficients: Vec<(Complex64, Complex64)> =
            self.analyzer.iter().map(AnalyzerSetting::coefficients).collect();

        let mut spectrum = field;
        for component in spectrum.outer_iter_mut() {
            self.backend.fft2(component);
        }

        let mut out = Array3::<Complex64>::zeros((2, n, m));
        for (d, h) in self.transfer.outer_iter().enumerate() {
            for k in 0..2 {
                let mut component = out.index_axis_mut(Axis(0), k);
                component.assign(&spectrum.index_axis(Axis(0), k));
                component *= &h;
                self.backend.ifft2(component);
            }

            let block = &mut acc[d * VALUES_PER_PIXEL * nm..(d + 1) * VALUES_PER_PIXEL * nm];
            for ((i, j), &e0) in out.index_axis(Axis(0), 0).indexed_iter() {
                let e1 = out[[1, i, j]];
                let px = i * m + j;
                for (c, v) in stokes_pixel(e0, e1).iter().enumerate() {
                    block[c * nm + px] += v;
                }
                for (c, (a0, a1)) in coefficients.iter().enumerate() {
                    block[(N_STOKES + c) * nm + px] += (a0 * e0 + a1 * e1).norm_sqr();
                }
            }
        }
    }

    /// Run `per_source` for every source point of every pattern and gather
    /// the `(D, 9, N, M)` accumulators into Stokes and intensity stacks.
    pub(crate) fn run_polarized<F>(
        &self,
        label: &str,
        execution: Execution,
        per_source: F,
    ) -> Result<SimulationOutput>
    where
        F: Fn(&SourcePoint, &mut [f64]) + Send + Sync,
    {
        let (n, m) = self.grid.dims();
        let n_defocus = self.n_defocus();
        let n_planes = self.n_planes();
        let mut stokes = Array4::zeros((N_STOKES, n, m, n_planes));
        let mut intensity = Array4::zeros((N_CHANNELS, n, m, n_planes));

        let len = n_defocus * VALUES_PER_PIXEL * n * m;
        for j in 0..self.n_patterns() {
            let acc = self.accumulate_pattern(label, j, len, execution, &per_source);
            let view = ArrayView4::from_shape((n_defocus, VALUES_PER_PIXEL, n, m), &acc)
                .map_err(|e| WaveorderError::shape("accumulator", e.to_string(), &[acc.len()]))?;
            for d in 0..n_defocus {
                let q = self.plane_index(d, j);
                stokes
                    .slice_mut(s![.., .., .., q])
                    .assign(&view.slice(s![d, ..N_STOKES, .., ..]));
                intensity
                    .slice_mut(s![.., .., .., q])
                    .assign(&view.slice(s![d, N_STOKES.., .., ..]));
            }
        }

        Ok(SimulationOutput { intensity, stokes })
    }

    /// Sum `per_source` over the points of pattern `j` through the backend.
    pub(crate) fn accumulate_pattern<F>(
        &self,
        label: &str,
        j: usize,
        len: usize,
        execution: Execution,
        per_source: &F,
    ) -> Vec<f64>
    where
        F: Fn(&SourcePoint, &mut [f64]) + Send + Sync,
    {
        let start = Instant::now();
        let points = &self.patterns[j].points;
        let total = points.len();
        let n_patterns = self.n_patterns();

        let task = |s: usize, acc: &mut [f64]| {
            per_source(&points[s], acc);
            if (s + 1) % 100 == 0 || s + 1 == total {
                log::debug!(
                    "{label}: source point {} / {total} in pattern {} / {n_patterns}",
                    s + 1,
                    j + 1
                );
            }
        };

        let acc = match execution {
            Execution::Sequential => self.backend.accumulate(total, len, &task),
            Execution::Parallel => self.backend.parallel_accumulate(total, len, &task),
        };
        log::info!(
            "{label}: pattern {} / {n_patterns}, {total} source point(s) in {:.2?}",
            j + 1,
            start.elapsed()
        );
        acc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use waveorder_compute::CpuBackend;

    fn backend() -> Arc<dyn ComputeBackend> {
        Arc::new(CpuBackend::new())
    }

    fn params(illumination: IlluminationMode) -> MicroscopeParams {
        MicroscopeParams {
            image_dims: [16, 16],
            wavelength: 0.532,
            pixel_size: 0.1,
            na_obj: 0.9,
            z_defocus: vec![0.0, 0.5],
            chi: 0.25,
            n_media: 1.0,
            illumination,
        }
    }

    #[test]
    fn test_source_points_follow_mask_order() {
        let mut mask = Array2::zeros((16, 16));
        mask[[3, 1]] = 1.0;
        mask[[0, 5]] = 1.0;
        mask[[3, 0]] = 0.5;
        let sim = ForwardSimulator::new(
            params(IlluminationMode::Arbitrary { patterns: vec![mask] }),
            backend(),
        )
        .unwrap();
        let points = &sim.patterns()[0].points;
        assert_eq!(points.len(), 2);
        assert_eq!((points[0].row, points[0].col), (0, 5));
        assert_eq!((points[1].row, points[1].col), (3, 1));
        assert_eq!(points[1].fy, sim.grid().fy[[3, 1]]);
    }

    #[test]
    fn test_phase_ring_requires_inner_na() {
        let result = ForwardSimulator::new(
            params(IlluminationMode::PhaseRing { na: 0.5, inner_na: None }),
            backend(),
        );
        assert!(matches!(result, Err(WaveorderError::InvalidParameter(_))));

        let result = ForwardSimulator::new(
            params(IlluminationMode::PhaseRing { na: 0.5, inner_na: Some(0.6) }),
            backend(),
        );
        assert!(matches!(result, Err(WaveorderError::InvalidParameter(_))));
    }

    #[test]
    fn test_phase_ring_objective_is_complex() {
        let mut p = params(IlluminationMode::PhaseRing { na: 0.6, inner_na: Some(0.3) });
        p.image_dims = [32, 32];
        let sim = ForwardSimulator::new(p, backend()).unwrap();
        assert!(sim.objective().iter().any(|v| v.im.abs() > 0.1));
        assert!(!sim.patterns()[0].points.is_empty());
        assert!(sim.wotf(0).is_ok());
    }

    #[test]
    fn test_invalid_parameters() {
        let mut p = params(IlluminationMode::BrightField { na: 0.3 });
        p.pixel_size = 0.0;
        assert!(matches!(
            ForwardSimulator::new(p, backend()),
            Err(WaveorderError::InvalidParameter(_))
        ));

        let mut p = params(IlluminationMode::BrightField { na: 0.3 });
        p.image_dims = [0, 16];
        assert!(matches!(
            ForwardSimulator::new(p, backend()),
            Err(WaveorderError::InvalidParameter(_))
        ));

        let mut p = params(IlluminationMode::BrightField { na: 0.3 });
        p.na_obj = -0.5;
        assert!(matches!(
            ForwardSimulator::new(p, backend()),
            Err(WaveorderError::InvalidParameter(_))
        ));

        let empty = Array2::zeros((16, 16));
        assert!(matches!(
            ForwardSimulator::new(
                params(IlluminationMode::Arbitrary { patterns: vec![empty] }),
                backend()
            ),
            Err(WaveorderError::InvalidParameter(_))
        ));

        let wrong = Array2::ones((8, 16));
        assert!(matches!(
            ForwardSimulator::new(
                params(IlluminationMode::Arbitrary { patterns: vec![wrong] }),
                backend()
            ),
            Err(WaveorderError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_source_outside_objective_has_no_wotf() {
        // Objective cut-off ≈ 0.376 µm⁻¹; the point at fx = 0.625 µm⁻¹ is
        // outside it.
        let mut p = params(IlluminationMode::BrightField { na: 0.3 });
        p.na_obj = 0.2;
        let mut mask = Array2::zeros((16, 16));
        mask[[0, 1]] = 1.0;
        p.illumination = IlluminationMode::Arbitrary { patterns: vec![mask] };
        let sim = ForwardSimulator::new(p, backend()).unwrap();
        assert!(matches!(sim.wotf(0), Err(WaveorderError::IllDefinedOperation(_))));
        assert!(matches!(sim.wotf(3), Err(WaveorderError::InvalidParameter(_))));
    }

    #[test]
    fn test_illumination_field_is_unit_rhc() {
        let sim = ForwardSimulator::new(params(IlluminationMode::BrightField { na: 0.9 }), backend())
            .unwrap();
        let point = *sim.patterns()[0].points.last().unwrap();
        assert!(point.fx != 0.0 || point.fy != 0.0);
        let field = sim.illumination_field(&point);
        for i in 0..16 {
            for j in 0..16 {
                let s = stokes_pixel(field[[0, i, j]], field[[1, i, j]]);
                assert_abs_diff_eq!(s[0], 1.0, epsilon = 1e-12);
                assert_abs_diff_eq!(s[3], 1.0, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn test_specimen_shape_checked() {
        let sim = ForwardSimulator::new(params(IlluminationMode::BrightField { na: 0.3 }), backend())
            .unwrap();
        let specimen = Specimen::clear(8, 16);
        assert!(matches!(
            sim.simulate(&specimen, Execution::Sequential),
            Err(WaveorderError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_output_layout() {
        let sim = ForwardSimulator::new(params(IlluminationMode::BrightField { na: 0.01 }), backend())
            .unwrap();
        let out = sim.simulate(&Specimen::clear(16, 16), Execution::Sequential).unwrap();
        assert_eq!(out.intensity.dim(), (5, 16, 16, 2));
        assert_eq!(out.stokes.dim(), (4, 16, 16, 2));
        for v in out.stokes.slice(s![0, .., .., ..]).iter() {
            assert_abs_diff_eq!(*v, 1.0, epsilon = 1e-12);
        }
    }
}
