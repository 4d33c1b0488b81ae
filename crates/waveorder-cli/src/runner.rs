//! Job runner: synthetic specimen, forward simulation, reconstruction.

use std::f64::consts::PI;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use ndarray::{s, Array2, Array3, Array4, ArrayView2, Axis};
use serde::Serialize;

use waveorder_compute::{ComputeBackend, CpuBackend};
use waveorder_core::reconstruct::Reconstructor;
use waveorder_core::simulator::ForwardSimulator;
use waveorder_core::specimen::{siemens_star, star_specimen, wrap_half_turn, Specimen};
use waveorder_core::types::{
    Execution, PhaseReconstruction, PolarizationMaps, SimulationOutput,
};

use crate::config::{ComputeConfig, JobConfig};

/// Specimen maps the simulation was driven with.
pub struct GroundTruth {
    pub retardance: Array2<f64>,
    pub slow_axis: Array2<f64>,
    pub phase: Array2<f64>,
    pub absorption: Array2<f64>,
}

/// Run statistics written to `summary.json`.
#[derive(Debug, Serialize)]
pub struct Summary {
    pub version: String,
    pub backend: String,
    pub image_dims: [usize; 2],
    pub z_defocus: Vec<f64>,
    pub n_patterns: usize,
    pub sources_per_pattern: Vec<usize>,
    /// Plane index (pattern 0) closest to focus, used for the error figures.
    pub focus_plane: usize,
    pub retardance_rms_error: f64,
    /// Angular RMS error (mod π) where the true retardance exceeds 10% of
    /// its peak.
    pub slow_axis_rms_error: Option<f64>,
    pub phase_rms_error: Option<f64>,
    pub absorption_rms_error: Option<f64>,
    pub elapsed_seconds: f64,
}

/// Results from a job run.
pub struct RunOutput {
    pub maps: PolarizationMaps,
    pub phase: Option<PhaseReconstruction>,
    pub truth: GroundTruth,
    pub summary: Summary,
}

/// Run a full simulate-then-reconstruct job from a parsed configuration.
pub fn run_job(job: &JobConfig) -> Result<RunOutput> {
    let start = Instant::now();
    let backend = create_backend(&job.compute)?;
    let execution = if job.compute.parallel {
        Execution::Parallel
    } else {
        Execution::Sequential
    };

    let sim = ForwardSimulator::new(job.microscope.clone(), backend.clone())
        .context("building forward simulator")?;
    let sources_per_pattern: Vec<usize> = sim.patterns().iter().map(|p| p.points.len()).collect();
    println!(
        "Grid {}x{}, {} defocus plane(s), {} pattern(s), sources {:?}",
        job.microscope.image_dims[0],
        job.microscope.image_dims[1],
        sim.n_defocus(),
        sim.n_patterns(),
        sources_per_pattern
    );

    let [n, m] = job.microscope.image_dims;
    let spec = &job.specimen;
    let (star, theta) = siemens_star(backend.as_ref(), n, m, spec.blur_px)
        .context("building Siemens star")?;
    let specimen = star_specimen(
        &star.view(),
        &theta.view(),
        spec.retardance,
        spec.phase,
        spec.absorption,
    )?;
    let truth = GroundTruth {
        retardance: star.mapv(|v| v * spec.retardance),
        slow_axis: theta.mapv(wrap_half_turn),
        phase: star.mapv(|v| v * spec.phase),
        absorption: star.mapv(|v| v * spec.absorption),
    };

    println!("Simulating specimen...");
    let sample = sim.simulate(&specimen, execution)?;
    println!("Simulating background...");
    let background = sim.simulate(&Specimen::clear(n, m), execution)?;

    let recon = Reconstructor::from_params(&job.microscope, &job.reconstruction, backend.clone())?;
    let normalized = |out: &SimulationOutput| -> Result<Array4<f64>> {
        let stokes = recon.stokes_from_intensity(&out.intensity.view())?;
        Ok(recon.normalize_polarization(&stokes.view())?)
    };
    let corrected = recon.background_correct(
        &normalized(&sample)?.view(),
        &normalized(&background)?.view(),
    )?;
    let maps = recon.polarization_parameters(&corrected.view())?;

    let phase = match sim.wotf(0) {
        Ok(wotf) => {
            println!("Reconstructing phase from {} plane(s)...", sim.n_defocus());
            let s0 = s0_stack(&sample.stokes, &sim);
            Some(recon.phase_from_wotf(&s0.view(), wotf, job.reconstruction.regularization)?)
        }
        Err(e) => {
            log::warn!("skipping phase reconstruction: {e}");
            None
        }
    };

    let focus = focus_index(&job.microscope.z_defocus);
    let q = sim.plane_index(focus, 0);
    let summary = Summary {
        version: env!("CARGO_PKG_VERSION").to_string(),
        backend: backend.device_info().name,
        image_dims: job.microscope.image_dims,
        z_defocus: job.microscope.z_defocus.clone(),
        n_patterns: sim.n_patterns(),
        sources_per_pattern,
        focus_plane: q,
        retardance_rms_error: rms_difference(
            &maps.retardance.index_axis(Axis(2), q),
            &truth.retardance.view(),
        ),
        slow_axis_rms_error: slow_axis_error(
            &maps.slow_axis.index_axis(Axis(2), q),
            &truth.slow_axis.view(),
            &truth.retardance.view(),
        ),
        phase_rms_error: phase
            .as_ref()
            .map(|p| rms_difference(&centred(&p.phase.view()).view(), &centred(&truth.phase.view()).view())),
        // Recovered absorption is the log-amplitude, i.e. −μ.
        absorption_rms_error: phase.as_ref().map(|p| {
            let attenuation = p.absorption.mapv(|v| -v);
            rms_difference(
                &centred(&attenuation.view()).view(),
                &centred(&truth.absorption.view()).view(),
            )
        }),
        elapsed_seconds: start.elapsed().as_secs_f64(),
    };
    log::info!("job finished in {:.2} s", summary.elapsed_seconds);

    Ok(RunOutput {
        maps,
        phase,
        truth,
        summary,
    })
}

/// `(D, N, M)` S0 stack of illumination pattern 0.
fn s0_stack(stokes: &Array4<f64>, sim: &ForwardSimulator) -> Array3<f64> {
    let (_, n, m, _) = stokes.dim();
    let mut stack = Array3::zeros((sim.n_defocus(), n, m));
    for (d, mut plane) in stack.axis_iter_mut(Axis(0)).enumerate() {
        plane.assign(&stokes.slice(s![0, .., .., sim.plane_index(d, 0)]));
    }
    stack
}

/// Index of the defocus plane nearest to focus.
fn focus_index(z: &[f64]) -> usize {
    z.iter()
        .enumerate()
        .min_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

fn centred(a: &ArrayView2<'_, f64>) -> Array2<f64> {
    let mean = a.mean().unwrap_or(0.0);
    a.mapv(|v| v - mean)
}

fn rms_difference(a: &ArrayView2<'_, f64>, b: &ArrayView2<'_, f64>) -> f64 {
    let sum: f64 = a.iter().zip(b.iter()).map(|(x, y)| (x - y).powi(2)).sum();
    (sum / a.len().max(1) as f64).sqrt()
}

fn slow_axis_error(
    recovered: &ArrayView2<'_, f64>,
    truth: &ArrayView2<'_, f64>,
    retardance: &ArrayView2<'_, f64>,
) -> Option<f64> {
    let peak = retardance.fold(0.0_f64, |acc, &v| acc.max(v));
    let (sum, count) = recovered
        .iter()
        .zip(truth.iter())
        .zip(retardance.iter())
        .filter(|&(_, &r)| r > 0.1 * peak)
        .fold((0.0, 0usize), |(sum, count), ((&a, &b), _)| {
            let d = (a - b).rem_euclid(PI);
            let d = d.min(PI - d);
            (sum + d * d, count + 1)
        });
    (count > 0).then(|| (sum / count as f64).sqrt())
}

/// Write per-plane polarization maps, the phase reconstruction and
/// `summary.json` into `out_dir`.
pub fn write_outputs(result: &RunOutput, job: &JobConfig, out_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("creating output directory {}", out_dir.display()))?;

    if job.output.save_maps {
        let n_patterns = result.summary.n_patterns.max(1);
        for q in 0..result.maps.retardance.len_of(Axis(2)) {
            let path = out_dir.join(format!("maps_plane{q}.csv"));
            let z = job.microscope.z_defocus.get(q / n_patterns).copied().unwrap_or(0.0);
            write_maps_csv(result, q, z, q % n_patterns, job, &path)?;
        }
    }

    if job.output.save_phase {
        if let Some(phase) = &result.phase {
            write_phase_csv(phase, &result.truth, job, &out_dir.join("phase.csv"))?;
        }
    }

    let json = serde_json::to_string_pretty(&result.summary)
        .map_err(|e| anyhow::anyhow!("JSON serialisation error: {}", e))?;
    let path = out_dir.join("summary.json");
    std::fs::write(&path, json)?;
    println!("Summary written to: {}", path.display());
    Ok(())
}

fn write_header(file: &mut impl Write, title: &str, job: &JobConfig) -> Result<()> {
    let mic = &job.microscope;
    writeln!(file, "# waveorder: {title}")?;
    writeln!(file, "# Version: {}", env!("CARGO_PKG_VERSION"))?;
    writeln!(
        file,
        "# wavelength: {}, pixel_size: {}, na_obj: {}, chi: {}, n_media: {}",
        mic.wavelength, mic.pixel_size, mic.na_obj, mic.chi, mic.n_media
    )?;
    Ok(())
}

/// Write one plane of the polarization maps, with the ground truth.
fn write_maps_csv(
    result: &RunOutput,
    q: usize,
    z: f64,
    pattern: usize,
    job: &JobConfig,
    path: &Path,
) -> Result<()> {
    let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
    write_header(&mut file, "polarization maps", job)?;
    writeln!(file, "# plane: {q}, z: {z}, pattern: {pattern}")?;
    writeln!(file, "#")?;
    writeln!(
        file,
        "x,y,retardance,slow_axis,transmittance,dop,retardance_truth,slow_axis_truth"
    )?;

    let ps = job.microscope.pixel_size;
    let maps = &result.maps;
    for ((i, j), &truth_ret) in result.truth.retardance.indexed_iter() {
        writeln!(
            file,
            "{:.4},{:.4},{:.6e},{:.6e},{:.6e},{:.6e},{:.6e},{:.6e}",
            j as f64 * ps,
            i as f64 * ps,
            maps.retardance[[i, j, q]],
            maps.slow_axis[[i, j, q]],
            maps.transmittance[[i, j, q]],
            maps.dop[[i, j, q]],
            truth_ret,
            result.truth.slow_axis[[i, j]],
        )?;
    }
    Ok(())
}

/// Write the phase reconstruction, with the ground truth.
fn write_phase_csv(
    phase: &PhaseReconstruction,
    truth: &GroundTruth,
    job: &JobConfig,
    path: &Path,
) -> Result<()> {
    let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
    write_header(&mut file, "phase reconstruction", job)?;
    writeln!(file, "# regularization: {}", job.reconstruction.regularization)?;
    writeln!(file, "#")?;
    writeln!(file, "x,y,phase,absorption,phase_truth,absorption_truth")?;

    let ps = job.microscope.pixel_size;
    for ((i, j), &phi) in phase.phase.indexed_iter() {
        writeln!(
            file,
            "{:.4},{:.4},{:.6e},{:.6e},{:.6e},{:.6e}",
            j as f64 * ps,
            i as f64 * ps,
            phi,
            phase.absorption[[i, j]],
            truth.phase[[i, j]],
            truth.absorption[[i, j]],
        )?;
    }
    println!("Phase written to: {}", path.display());
    Ok(())
}

/// Create a compute backend based on the user's preference string.
///
/// - `"cpu"`: the rayon/rustfft backend.
/// - `"auto"` (default): the best available backend, currently the CPU.
pub fn create_backend(config: &ComputeConfig) -> Result<Arc<dyn ComputeBackend>> {
    match config.backend.as_str() {
        "cpu" | "auto" => {
            let cpu = match config.threads {
                Some(threads) => CpuBackend::with_threads(threads)
                    .with_context(|| format!("building a {threads}-thread CPU backend"))?,
                None => CpuBackend::new(),
            };
            println!("Backend: {}", cpu.device_info().name);
            Ok(Arc::new(cpu))
        }
        other => anyhow::bail!("Unsupported backend '{}'. Valid values: auto, cpu", other),
    }
}
