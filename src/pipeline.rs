//! End-to-end runs: train a checkpoint, or extract and interpret features
//!
//! `train` and `extract` are what the CLI calls. Each loads its inputs,
//! drives the engine modules, and returns a serializable report.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::Device;
use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{info, warn};

use crate::checkpoint::Checkpoint;
use crate::config::{ExtractConfig, RunConfig};
use crate::data::{row_ids, EmbeddingMatrix, TextCorpus};
use crate::error::{SaeError, SaeResult};
use crate::indexer::ActivationIndexer;
use crate::interpret::{InterpretationRequester, InterpretationSummary};
use crate::interpreter::Interpreter;
use crate::loss::LossBreakdown;
use crate::registry::{FailureKind, FeatureRegistry, Interpretation, RegistrySummary};
use crate::trainer::Trainer;

/// Inputs for a training run.
#[derive(Debug, Clone)]
pub struct TrainRequest {
    pub config: RunConfig,
    pub embeddings_path: PathBuf,
    /// Only checked for row alignment during training
    pub texts_path: Option<PathBuf>,
    /// Parent of the timestamped run directory
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainReport {
    pub run_name: String,
    pub checkpoint: PathBuf,
    pub rows: usize,
    pub n_features: usize,
    pub epochs: usize,
    pub final_loss: Option<LossBreakdown>,
    /// Features that never fired in the last epoch
    pub dead_features: usize,
}

/// `<run_name>_<YYYYmmdd_HHMMSS>`
pub fn run_dir_name(run_name: &str, at: DateTime<Local>) -> String {
    format!("{run_name}_{}", at.format("%Y%m%d_%H%M%S"))
}

/// Train an SAE and write its checkpoint under `output_dir`.
pub fn train(request: &TrainRequest, device: &Device) -> SaeResult<TrainReport> {
    let config = &request.config;
    config.validate()?;

    let embeddings = EmbeddingMatrix::load(&request.embeddings_path, device)?;
    if let Some(texts_path) = &request.texts_path {
        TextCorpus::load(texts_path)?.check_aligned(&embeddings)?;
    }

    let run_dir = request
        .output_dir
        .join(run_dir_name(&config.run_name, Local::now()));
    let outcome = Trainer::new(config.clone())
        .with_checkpoint_dir(&run_dir)
        .run(&embeddings)?;

    Ok(TrainReport {
        run_name: config.run_name.clone(),
        checkpoint: outcome.checkpoint.unwrap_or(run_dir),
        rows: embeddings.n_rows(),
        n_features: outcome.model.n_features(),
        epochs: outcome.log.epochs.len(),
        final_loss: outcome.log.final_loss(),
        dead_features: outcome.log.epochs.last().map_or(0, |e| e.dead_features),
    })
}

/// Inputs for an extraction run.
#[derive(Debug, Clone)]
pub struct ExtractRequest {
    pub config: ExtractConfig,
    /// Explicit checkpoint directory
    pub checkpoint_dir: PathBuf,
    pub embeddings_path: PathBuf,
    pub texts_path: Option<PathBuf>,
    /// Registry JSON, created or merged into
    pub registry_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractReport {
    pub registry_path: PathBuf,
    pub indexed: usize,
    pub interpretation: InterpretationSummary,
    pub registry: RegistrySummary,
}

/// Index a checkpoint over a corpus, interpret the selected features, and
/// merge the result into the registry file.
///
/// Existing explanations are carried onto the re-indexed entries, so
/// features this run does not select keep them. Selected features are
/// requested again unless `skip_explained` is set.
///
/// Per-feature failures are recorded in the registry. The only interpreter
/// error returned is [`SaeError::InterpreterUnreachable`], raised after the
/// registry is saved when no attempted call got any response.
pub async fn extract(
    request: &ExtractRequest,
    interpreter: Arc<dyn Interpreter>,
    device: &Device,
) -> SaeResult<ExtractReport> {
    let config = &request.config;
    config.validate()?;

    let checkpoint = Checkpoint::load(&request.checkpoint_dir, device)?;
    let embeddings = EmbeddingMatrix::load(&request.embeddings_path, device)?;
    let (example_ids, texts) = match &request.texts_path {
        Some(path) => {
            let corpus = TextCorpus::load(path)?;
            corpus.check_aligned(&embeddings)?;
            (corpus.example_ids()?, Some(corpus.texts()))
        }
        None => (row_ids(embeddings.n_rows()), None),
    };

    let mut indexed = ActivationIndexer::new(config.top_k)
        .with_contrast(config.contrast_k, config.seed)
        .with_batch_size(config.index_batch_size)
        .index(&checkpoint.model, &embeddings, &example_ids, texts.as_deref())?;

    let existing = FeatureRegistry::load_or_default(&request.registry_path)?;
    carry_explanations(&existing, &mut indexed);

    let requester = InterpretationRequester::new(interpreter, config.clone());
    let (interpreted, summary) = requester.interpret(indexed).await?;
    let indexed_count = interpreted.len();

    let last_silent_error = interpreted
        .entries()
        .filter_map(|e| match &e.interpretation {
            Interpretation::Failed {
                kind: FailureKind::Transport | FailureKind::Timeout,
                reason,
                ..
            } => Some(reason.clone()),
            _ => None,
        })
        .last();

    let registry = existing.merge(interpreted);
    registry.save(&request.registry_path)?;

    if summary.is_unreachable() {
        return Err(SaeError::InterpreterUnreachable {
            attempted: summary.attempted,
            failed: summary.failed,
            last_error: last_silent_error.unwrap_or_default(),
        });
    }
    if summary.failed > 0 {
        warn!(
            "{} of {} interpreter calls failed; see registry for reasons",
            summary.failed, summary.attempted
        );
    }

    Ok(ExtractReport {
        registry_path: request.registry_path.clone(),
        indexed: indexed_count,
        interpretation: summary,
        registry: registry.summary(),
    })
}

/// Copy existing explanations onto the re-indexed entries with the same id.
fn carry_explanations(existing: &FeatureRegistry, indexed: &mut FeatureRegistry) {
    let mut carried = 0usize;
    for entry in existing.entries() {
        if !entry.interpretation.is_explained() {
            continue;
        }
        if let Some(fresh) = indexed.get_mut(entry.feature_id) {
            fresh.interpretation = entry.interpretation.clone();
            carried += 1;
        }
    }
    if carried > 0 {
        info!("Keeping {carried} existing explanations");
    }
}

/// Registry path default: `<checkpoint>/feature_registry.json`.
pub fn default_registry_path(checkpoint_dir: &Path) -> PathBuf {
    checkpoint_dir.join("feature_registry.json")
}
