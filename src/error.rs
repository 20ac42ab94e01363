//! Error taxonomy for training, indexing and interpretation runs.
//!
//! Training errors are fatal and surface to the caller immediately.
//! Per-feature interpreter failures are a separate type
//! ([`InterpreterError`](crate::interpreter::InterpreterError)) and are
//! recorded on registry entries instead of being propagated.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used across the library.
pub type SaeResult<T> = std::result::Result<T, SaeError>;

/// Errors raised by the SAE engine.
#[derive(Debug, Error)]
pub enum SaeError {
    /// Invalid or inconsistent run configuration. Raised before any training.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A tensor did not have the shape the model expects.
    #[error("shape mismatch in {context}: expected {expected}, got {actual}")]
    ShapeMismatch {
        context: String,
        expected: String,
        actual: String,
    },

    /// A parameter update produced NaN or Inf values.
    #[error("non-finite values in parameter '{parameter}'")]
    NonFiniteWeights { parameter: String },

    /// NaN/Inf in the loss or parameters during training. The run is aborted.
    #[error("numeric instability at epoch {epoch}, batch {batch}: {detail}")]
    NumericInstability {
        epoch: usize,
        batch: usize,
        detail: String,
    },

    /// A batch does not fit in the available memory. Never retried with a
    /// smaller batch; fix `batch_size` instead.
    #[error("resource exhaustion: {0} (reduce batch_size)")]
    ResourceExhaustion(String),

    /// Every attempted interpreter call failed to reach the service.
    #[error("interpreter unreachable: {failed} of {attempted} calls failed ({last_error})")]
    InterpreterUnreachable {
        attempted: usize,
        failed: usize,
        last_error: String,
    },

    /// A required file is missing.
    #[error("file not found: {}", .0.display())]
    MissingFile(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),

    #[error(transparent)]
    SafeTensors(#[from] safetensors::SafeTensorError),
}

impl SaeError {
    /// Shorthand for a [`SaeError::Configuration`].
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Shorthand for a [`SaeError::ShapeMismatch`].
    pub fn shape(
        context: impl Into<String>,
        expected: impl std::fmt::Display,
        actual: impl std::fmt::Display,
    ) -> Self {
        Self::ShapeMismatch {
            context: context.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Reclassify device allocation failures as [`SaeError::ResourceExhaustion`].
    ///
    /// candle reports CUDA/Metal OOM as a generic backend error, so the
    /// message is the only signal available.
    pub fn classify_tensor(err: candle_core::Error) -> Self {
        let msg = err.to_string();
        let lower = msg.to_ascii_lowercase();
        if lower.contains("out of memory")
            || lower.contains("out_of_memory")
            || lower.contains("memory allocation")
        {
            Self::ResourceExhaustion(msg)
        } else {
            Self::Tensor(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_oom() {
        let err = candle_core::Error::Msg("CUDA_ERROR_OUT_OF_MEMORY".to_string());
        assert!(matches!(
            SaeError::classify_tensor(err),
            SaeError::ResourceExhaustion(_)
        ));
    }

    #[test]
    fn test_classify_other_tensor_error() {
        let err = candle_core::Error::Msg("unexpected rank".to_string());
        assert!(matches!(SaeError::classify_tensor(err), SaeError::Tensor(_)));
    }

    #[test]
    fn test_display_numeric_instability() {
        let err = SaeError::NumericInstability {
            epoch: 2,
            batch: 17,
            detail: "loss is NaN".into(),
        };
        assert_eq!(
            err.to_string(),
            "numeric instability at epoch 2, batch 17: loss is NaN"
        );
    }
}
