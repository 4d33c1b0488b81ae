//! Error taxonomy for simulation and reconstruction calls.
//!
//! Parameter and shape errors are raised at the boundary of the offending
//! call, before any accumulation starts. Numeric ill-conditioning of the
//! deconvolution is handled by the Tikhonov term, not by an error.

use thiserror::Error;

/// Errors that can occur while building or running the optics engine.
#[derive(Debug, Error)]
pub enum WaveorderError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Shape mismatch in {context}: expected {expected}, found {found:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: String,
        found: Vec<usize>,
    },

    #[error("Ill-defined operation: {0}")]
    IllDefinedOperation(String),
}

impl WaveorderError {
    pub(crate) fn shape(context: &'static str, expected: impl Into<String>, found: &[usize]) -> Self {
        WaveorderError::ShapeMismatch {
            context,
            expected: expected.into(),
            found: found.to_vec(),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, WaveorderError>;

/// Fail with `InvalidParameter` unless `value` is finite and strictly positive.
pub(crate) fn ensure_positive(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(WaveorderError::InvalidParameter(format!(
            "{name} must be positive and finite, got {value}"
        )))
    }
}
