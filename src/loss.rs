//! Sparsity-penalized reconstruction loss
//!
//! ```text
//! reconstruction = mean((x - x_hat)^2)            over B×D
//! sparsity       = scale * alpha * mean(|f|)      over B×F
//! total          = reconstruction + sparsity
//! ```
//!
//! `alpha` sets the sparsity/fidelity trade-off; `scale` moves the penalty's
//! overall magnitude without changing that ratio.

use candle_core::Tensor;

use crate::error::{SaeError, SaeResult};

/// Differentiable loss terms for one batch.
#[derive(Debug, Clone)]
pub struct LossTerms {
    pub total: Tensor,
    pub reconstruction: Tensor,
    pub sparsity: Tensor,
}

/// Scalar loss values for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LossBreakdown {
    pub total: f32,
    pub reconstruction: f32,
    pub sparsity: f32,
}

impl LossBreakdown {
    pub fn is_finite(&self) -> bool {
        self.total.is_finite() && self.reconstruction.is_finite() && self.sparsity.is_finite()
    }
}

impl LossTerms {
    /// Pull the three scalars to the host.
    pub fn breakdown(&self) -> SaeResult<LossBreakdown> {
        Ok(LossBreakdown {
            total: self.total.to_scalar::<f32>()?,
            reconstruction: self.reconstruction.to_scalar::<f32>()?,
            sparsity: self.sparsity.to_scalar::<f32>()?,
        })
    }
}

/// Reconstruction + L1 sparsity penalty.
#[derive(Debug, Clone, Copy)]
pub struct SparsityLoss {
    pub alpha: f64,
    pub scale: f64,
}

impl SparsityLoss {
    pub fn new(alpha: f64, scale: f64) -> Self {
        Self { alpha, scale }
    }

    /// Compute the loss terms. Non-finite values are passed through so the
    /// caller can report where they appeared.
    pub fn compute(
        &self,
        batch: &Tensor,
        activations: &Tensor,
        reconstruction: &Tensor,
    ) -> SaeResult<LossTerms> {
        if batch.dims() != reconstruction.dims() {
            return Err(SaeError::shape(
                "loss reconstruction",
                format!("{:?}", batch.dims()),
                format!("{:?}", reconstruction.dims()),
            ));
        }
        let b = batch.dims().first().copied().unwrap_or(0);
        if activations.dims().first().copied().unwrap_or(0) != b {
            return Err(SaeError::shape(
                "loss activations batch",
                b,
                format!("{:?}", activations.dims()),
            ));
        }

        let recon = batch.sub(reconstruction)?.sqr()?.mean_all()?;
        let sparsity = activations
            .abs()?
            .mean_all()?
            .affine(self.scale * self.alpha, 0.0)?;
        let total = (&recon + &sparsity)?;

        Ok(LossTerms {
            total,
            reconstruction: recon,
            sparsity,
        })
    }
}

/// Mean squared reconstruction error only, as an `f32`.
pub fn reconstruction_mse(batch: &Tensor, reconstruction: &Tensor) -> SaeResult<f32> {
    Ok(batch
        .sub(reconstruction)?
        .sqr()?
        .mean_all()?
        .to_scalar::<f32>()?)
}
