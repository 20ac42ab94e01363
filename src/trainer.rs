//! SAE training loop
//!
//! One writer, one pass over shuffled mini-batches per epoch:
//!
//! ```text
//! for epoch in 0..epoch_count:
//!     shuffle row order (StdRng seeded from config.seed)
//!     for batch in order.chunks(batch_size):
//!         forward -> loss -> AdamW step -> renormalize decoder -> finiteness check
//! ```
//!
//! Any NaN/Inf aborts the run with the epoch and batch index. Allocation
//! failures abort with [`SaeError::ResourceExhaustion`] and are not retried.

use std::path::{Path, PathBuf};

use candle_core::DType;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::checkpoint::{write_checkpoint, StagedDir};
use crate::config::RunConfig;
use crate::data::EmbeddingMatrix;
use crate::error::{SaeError, SaeResult};
use crate::loss::{LossBreakdown, SparsityLoss};
use crate::sae::SparseAutoencoder;

/// Offset so the shuffle stream differs from the init stream for one seed.
const SHUFFLE_SEED_OFFSET: u64 = 0x5348_5546;

/// Loss record for one optimizer step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecord {
    pub epoch: usize,
    pub batch: usize,
    pub step: usize,
    pub rows: usize,
    pub lr: f64,
    pub loss: LossBreakdown,
}

/// Aggregates for one epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochSummary {
    pub epoch: usize,
    /// Row-weighted mean of the batch losses
    pub mean_loss: LossBreakdown,
    /// Features that never fired during the epoch
    pub dead_features: usize,
    /// Mean over features of the fraction of rows each fired on
    pub mean_density: f32,
}

/// Everything recorded during a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingLog {
    pub batches: Vec<BatchRecord>,
    pub epochs: Vec<EpochSummary>,
}

impl TrainingLog {
    /// Loss of the last recorded step.
    pub fn final_loss(&self) -> Option<LossBreakdown> {
        self.batches.last().map(|b| b.loss)
    }
}

/// Result of a successful run.
#[derive(Debug)]
pub struct TrainingOutcome {
    pub model: SparseAutoencoder,
    pub log: TrainingLog,
    /// Final checkpoint location, if one was written
    pub checkpoint: Option<PathBuf>,
}

/// Drives an [`SparseAutoencoder`] against a [`SparsityLoss`].
pub struct Trainer {
    config: RunConfig,
    checkpoint_dir: Option<PathBuf>,
}

impl Trainer {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            checkpoint_dir: None,
        }
    }

    /// Write the final checkpoint to `dir` (must not exist yet).
    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Train a fresh model on `embeddings`.
    pub fn run(&self, embeddings: &EmbeddingMatrix) -> SaeResult<TrainingOutcome> {
        self.run_with_observer(embeddings, |_, _| Ok(()))
    }

    /// Train, calling `observer` after every completed step.
    pub fn run_with_observer<F>(
        &self,
        embeddings: &EmbeddingMatrix,
        mut observer: F,
    ) -> SaeResult<TrainingOutcome>
    where
        F: FnMut(&BatchRecord, &SparseAutoencoder) -> SaeResult<()>,
    {
        let config = &self.config;
        let n_rows = embeddings.n_rows();
        config.validate_for(n_rows, embeddings.dim())?;
        if let Some(budget) = config.memory_budget_bytes {
            let needed = config.estimated_batch_bytes();
            if needed > budget {
                return Err(SaeError::ResourceExhaustion(format!(
                    "batch_size {} needs ~{needed} bytes, budget is {budget}",
                    config.batch_size
                )));
            }
        }

        // Staging before any work so a bad target fails fast.
        let staged = match &self.checkpoint_dir {
            Some(dir) => Some(StagedDir::create(dir)?),
            None => None,
        };

        let n_features = config.n_features();
        let model = SparseAutoencoder::new(
            config.embedding_dimension,
            n_features,
            config.seed,
            embeddings.device(),
        )?;
        let loss_fn = SparsityLoss::new(config.sparsity_alpha, config.sparsity_scale);
        let mut optimizer = AdamW::new(
            model.vars(),
            ParamsAdamW {
                lr: config.learning_rate,
                weight_decay: 0.0,
                ..Default::default()
            },
        )?;

        let n_batches = n_rows.div_ceil(config.batch_size);
        let total_steps = n_batches * config.epoch_count;
        info!(
            "Training SAE: {n_rows} rows, d_model={}, n_features={n_features}, \
             {n_batches} batches x {} epochs, lr={:.2e}, alpha={}, scale={}",
            config.embedding_dimension,
            config.epoch_count,
            config.learning_rate,
            config.sparsity_alpha,
            config.sparsity_scale
        );

        let mut rng = rand::rngs::StdRng::seed_from_u64(config.seed.wrapping_add(SHUFFLE_SEED_OFFSET));
        let mut order: Vec<usize> = (0..n_rows).collect();
        let mut log = TrainingLog::default();
        let mut step = 0usize;

        for epoch in 0..config.epoch_count {
            order.shuffle(&mut rng);
            let mut active_counts = vec![0f32; n_features];
            let mut weighted = LossBreakdown::default();

            for (batch_idx, rows) in order.chunks(config.batch_size).enumerate() {
                let lr = config.lr_schedule.lr_at(config.learning_rate, step, total_steps);
                optimizer.set_learning_rate(lr);

                let loss = train_step(
                    &model,
                    &loss_fn,
                    &mut optimizer,
                    embeddings,
                    rows,
                    &mut active_counts,
                )
                .map_err(|e| locate(e, epoch, batch_idx))?;

                let w = rows.len() as f32;
                weighted.total += loss.total * w;
                weighted.reconstruction += loss.reconstruction * w;
                weighted.sparsity += loss.sparsity * w;

                let record = BatchRecord {
                    epoch,
                    batch: batch_idx,
                    step,
                    rows: rows.len(),
                    lr,
                    loss,
                };
                if config.log_every > 0 && step % config.log_every == 0 {
                    debug!(
                        "[epoch {epoch} batch {batch_idx:>5}/{n_batches}] loss={:.6} recon={:.6} sparsity={:.6} lr={lr:.2e}",
                        loss.total, loss.reconstruction, loss.sparsity
                    );
                }
                observer(&record, &model)?;
                log.batches.push(record);
                step += 1;
            }

            let n = n_rows as f32;
            let summary = EpochSummary {
                epoch,
                mean_loss: LossBreakdown {
                    total: weighted.total / n,
                    reconstruction: weighted.reconstruction / n,
                    sparsity: weighted.sparsity / n,
                },
                dead_features: active_counts.iter().filter(|&&c| c == 0.0).count(),
                mean_density: active_counts.iter().map(|c| c / n).sum::<f32>() / n_features as f32,
            };
            info!(
                "Epoch {}/{}: loss={:.6} recon={:.6} sparsity={:.6} dead={} density={:.4}",
                epoch + 1,
                config.epoch_count,
                summary.mean_loss.total,
                summary.mean_loss.reconstruction,
                summary.mean_loss.sparsity,
                summary.dead_features,
                summary.mean_density
            );
            log.epochs.push(summary);

            if config.checkpoint_every_epoch {
                if let Some(staged) = &staged {
                    let dir = epoch_dir(staged.path(), epoch);
                    write_checkpoint(&dir, &model, config, &log)?;
                    debug!("Wrote epoch checkpoint {}", dir.display());
                }
            }
        }

        let checkpoint = match staged {
            Some(staged) => {
                write_checkpoint(staged.path(), &model, config, &log)?;
                let path = staged.commit()?;
                info!("Checkpoint saved to {}", path.display());
                Some(path)
            }
            None => None,
        };

        Ok(TrainingOutcome {
            model,
            log,
            checkpoint,
        })
    }
}

/// Location of the per-epoch checkpoint inside a run directory.
pub fn epoch_dir(run_dir: &Path, epoch: usize) -> PathBuf {
    run_dir.join("epochs").join(format!("epoch_{epoch}"))
}

/// One optimizer step on the given rows. Adds per-feature activity counts.
fn train_step(
    model: &SparseAutoencoder,
    loss_fn: &SparsityLoss,
    optimizer: &mut AdamW,
    embeddings: &EmbeddingMatrix,
    rows: &[usize],
    active_counts: &mut [f32],
) -> SaeResult<LossBreakdown> {
    let batch = embeddings.rows(rows)?;
    let (activations, reconstruction) = model.forward(&batch)?;
    let terms = loss_fn.compute(&batch, &activations, &reconstruction)?;
    let loss = terms.breakdown()?;
    if !loss.is_finite() {
        return Err(SaeError::NumericInstability {
            epoch: 0,
            batch: 0,
            detail: format!(
                "non-finite loss (total={}, recon={}, sparsity={})",
                loss.total, loss.reconstruction, loss.sparsity
            ),
        });
    }

    optimizer.backward_step(&terms.total)?;
    model.normalize_decoder()?;
    model.check_finite()?;

    let fired = activations
        .gt(0f32)?
        .to_dtype(DType::F32)?
        .sum(0)?
        .to_vec1::<f32>()?;
    for (count, f) in active_counts.iter_mut().zip(fired) {
        *count += f;
    }
    Ok(loss)
}

/// Attach the epoch/batch position to step errors and classify device OOM.
fn locate(err: SaeError, epoch: usize, batch: usize) -> SaeError {
    match err {
        SaeError::NumericInstability { detail, .. } => {
            SaeError::NumericInstability { epoch, batch, detail }
        }
        SaeError::NonFiniteWeights { parameter } => SaeError::NumericInstability {
            epoch,
            batch,
            detail: format!("non-finite values in '{parameter}' after update"),
        },
        SaeError::Tensor(e) => SaeError::classify_tensor(e),
        other => other,
    }
}
