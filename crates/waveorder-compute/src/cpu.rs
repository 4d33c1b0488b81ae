//! CPU compute backend: rustfft for transforms, Rayon for source-point
//! parallelism.

use std::sync::{Arc, Mutex, PoisonError};

use ndarray::ArrayViewMut2;
use num_complex::Complex64;
use rustfft::{Fft, FftDirection, FftPlanner};

use crate::backend::{AccumulateFn, ComputeBackend, ComputeError, DeviceInfo};

/// CPU backend that plans FFTs with rustfft and parallelises reductions
/// across threads via Rayon.
pub struct CpuBackend {
    num_threads: usize,
    /// Dedicated pool when a thread count was requested explicitly.
    pool: Option<rayon::ThreadPool>,
    /// rustfft caches plans internally; the lock is held only while planning.
    planner: Mutex<FftPlanner<f64>>,
}

impl CpuBackend {
    /// Create a new CPU backend on the global Rayon pool.
    pub fn new() -> Self {
        Self {
            num_threads: rayon::current_num_threads(),
            pool: None,
            planner: Mutex::new(FftPlanner::new()),
        }
    }

    /// Create a CPU backend with its own pool of `num_threads` workers.
    pub fn with_threads(num_threads: usize) -> Result<Self, ComputeError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .map_err(|e| ComputeError::DeviceError(e.to_string()))?;
        Ok(Self {
            num_threads: pool.current_num_threads(),
            pool: Some(pool),
            planner: Mutex::new(FftPlanner::new()),
        })
    }

    fn plan(&self, len: usize, direction: FftDirection) -> Arc<dyn Fft<f64>> {
        let mut planner = self.planner.lock().unwrap_or_else(PoisonError::into_inner);
        planner.plan_fft(len, direction)
    }

    /// Row-column 2D transform. Lines are copied into a contiguous buffer so
    /// that arbitrary (strided) views are supported.
    fn transform_2d(&self, mut data: ArrayViewMut2<'_, Complex64>, direction: FftDirection) {
        let (rows, cols) = data.dim();
        if rows == 0 || cols == 0 {
            return;
        }

        let row_fft = self.plan(cols, direction);
        let col_fft = self.plan(rows, direction);
        let scratch_len = row_fft
            .get_inplace_scratch_len()
            .max(col_fft.get_inplace_scratch_len());
        let mut scratch = vec![Complex64::default(); scratch_len];
        let mut line = vec![Complex64::default(); rows.max(cols)];

        for mut row in data.rows_mut() {
            let buf = &mut line[..cols];
            for (dst, src) in buf.iter_mut().zip(row.iter()) {
                *dst = *src;
            }
            row_fft.process_with_scratch(buf, &mut scratch[..row_fft.get_inplace_scratch_len()]);
            for (dst, src) in row.iter_mut().zip(buf.iter()) {
                *dst = *src;
            }
        }

        for mut col in data.columns_mut() {
            let buf = &mut line[..rows];
            for (dst, src) in buf.iter_mut().zip(col.iter()) {
                *dst = *src;
            }
            col_fft.process_with_scratch(buf, &mut scratch[..col_fft.get_inplace_scratch_len()]);
            for (dst, src) in col.iter_mut().zip(buf.iter()) {
                *dst = *src;
            }
        }
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeBackend for CpuBackend {
    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            name: format!("CPU ({} threads)", self.num_threads),
            compute_units: Some(self.num_threads),
        }
    }

    fn fft2(&self, data: ArrayViewMut2<'_, Complex64>) {
        self.transform_2d(data, FftDirection::Forward);
    }

    fn ifft2(&self, mut data: ArrayViewMut2<'_, Complex64>) {
        let (rows, cols) = data.dim();
        self.transform_2d(data.view_mut(), FftDirection::Inverse);
        if rows > 0 && cols > 0 {
            let scale = 1.0 / (rows * cols) as f64;
            data.mapv_inplace(|v| v * scale);
        }
    }

    fn parallel_accumulate(
        &self,
        tasks: usize,
        len: usize,
        task_fn: &AccumulateFn<'_>,
    ) -> Vec<f64> {
        use rayon::prelude::*;

        let run = || {
            (0..tasks)
                .into_par_iter()
                .fold(
                    || vec![0.0; len],
                    |mut acc, task| {
                        task_fn(task, &mut acc);
                        acc
                    },
                )
                .reduce(
                    || vec![0.0; len],
                    |mut total, partial| {
                        for (t, p) in total.iter_mut().zip(&partial) {
                            *t += *p;
                        }
                        total
                    },
                )
        };

        match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        }
    }
}
