//! Spatial and spatial-frequency coordinate grids.
//!
//! Every array is stored in FFT-native order: index 0 is the origin (or DC),
//! positive coordinates follow, and the negative half wraps around to the
//! end. Along an axis of length $L$ with sample spacing $\Delta$ the
//! coordinate of index $k$ is
//!
//! $$ c_k = \begin{cases} k\,\Delta & k < \lceil L/2 \rceil \\ (k - L)\,\Delta & \text{otherwise} \end{cases} $$
//!
//! so no shift is ever needed around a forward/inverse transform pair.

use ndarray::{Array2, ArrayView2};

use crate::error::{ensure_positive, Result, WaveorderError};

/// Immutable coordinate arrays for an `(N, M)` image with a given pixel size.
#[derive(Debug, Clone)]
pub struct Grid {
    n: usize,
    m: usize,
    pixel_size: f64,
    /// Column coordinate, shape `(N, M)`.
    pub x: Array2<f64>,
    /// Row coordinate, shape `(N, M)`.
    pub y: Array2<f64>,
    /// Spatial frequency along columns, spacing `1/(M·ps)`.
    pub fx: Array2<f64>,
    /// Spatial frequency along rows, spacing `1/(N·ps)`.
    pub fy: Array2<f64>,
}

/// Signed FFT-native index of sample `k` along an axis of length `len`.
fn signed_index(k: usize, len: usize) -> f64 {
    if k < len.div_ceil(2) {
        k as f64
    } else {
        k as f64 - len as f64
    }
}

impl Grid {
    /// Build the grid for `n` rows and `m` columns.
    pub fn new(n: usize, m: usize, pixel_size: f64) -> Result<Self> {
        if n == 0 || m == 0 {
            return Err(WaveorderError::InvalidParameter(format!(
                "image dimensions must be positive, got ({n}, {m})"
            )));
        }
        ensure_positive("pixel size", pixel_size)?;

        let dfx = 1.0 / (m as f64 * pixel_size);
        let dfy = 1.0 / (n as f64 * pixel_size);

        let x = Array2::from_shape_fn((n, m), |(_, j)| signed_index(j, m) * pixel_size);
        let y = Array2::from_shape_fn((n, m), |(i, _)| signed_index(i, n) * pixel_size);
        let fx = Array2::from_shape_fn((n, m), |(_, j)| signed_index(j, m) * dfx);
        let fy = Array2::from_shape_fn((n, m), |(i, _)| signed_index(i, n) * dfy);

        Ok(Self { n, m, pixel_size, x, y, fx, fy })
    }

    pub fn dims(&self) -> (usize, usize) {
        (self.n, self.m)
    }

    pub fn pixel_size(&self) -> f64 {
        self.pixel_size
    }

    /// Radial spatial frequency $\sqrt{f_x^2 + f_y^2}$.
    pub fn radial_frequency(&self) -> Array2<f64> {
        let mut fr = &self.fx * &self.fx + &self.fy * &self.fy;
        fr.mapv_inplace(f64::sqrt);
        fr
    }

    /// Shape check used by every operation that takes `(N, M)` maps.
    pub(crate) fn check_map<T>(&self, context: &'static str, map: &ArrayView2<'_, T>) -> Result<()> {
        if map.dim() == (self.n, self.m) {
            Ok(())
        } else {
            Err(WaveorderError::shape(
                context,
                format!("({}, {})", self.n, self.m),
                map.shape(),
            ))
        }
    }
}

/// Move the zero-frequency sample from index 0 to the array centre
/// (display ordering).
pub fn fftshift2<T: Clone>(data: &ArrayView2<'_, T>) -> Array2<T> {
    let (rows, cols) = data.dim();
    Array2::from_shape_fn((rows, cols), |(i, j)| {
        data[[(i + rows - rows / 2) % rows, (j + cols - cols / 2) % cols]].clone()
    })
}

/// Inverse of [`fftshift2`]: move the array centre to index 0.
pub fn ifftshift2<T: Clone>(data: &ArrayView2<'_, T>) -> Array2<T> {
    let (rows, cols) = data.dim();
    Array2::from_shape_fn((rows, cols), |(i, j)| {
        data[[(i + rows / 2) % rows, (j + cols / 2) % cols]].clone()
    })
}
