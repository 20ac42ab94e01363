//! Run and extraction configuration.
//!
//! Both structs are built once at process start, validated, and then only
//! borrowed. [`RunConfig`] is serialized into every checkpoint so a trained
//! model can be reloaded without any training-time state.

use std::time::Duration;

use candle_core::Device;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{SaeError, SaeResult};
use crate::prompt::PromptType;

/// How the latent width F is derived.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureCount {
    /// Exactly `n` features.
    Count(usize),
    /// `embedding_dimension * m` features.
    Multiplier(usize),
}

impl FeatureCount {
    /// Resolve to a concrete feature count for an embedding dimension.
    pub fn resolve(&self, embedding_dimension: usize) -> usize {
        match *self {
            Self::Count(n) => n,
            Self::Multiplier(m) => embedding_dimension * m,
        }
    }
}

/// Learning-rate schedule applied per optimizer step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum LrSchedule {
    Constant,
    /// Linear warmup to the base rate, then cosine decay to
    /// `base * min_lr_ratio` at the final step.
    WarmupCosine {
        warmup_steps: usize,
        min_lr_ratio: f64,
    },
}

impl LrSchedule {
    /// Learning rate for a zero-based `step` out of `total_steps`.
    pub fn lr_at(&self, base: f64, step: usize, total_steps: usize) -> f64 {
        match *self {
            Self::Constant => base,
            Self::WarmupCosine {
                warmup_steps,
                min_lr_ratio,
            } => {
                if warmup_steps > 0 && step < warmup_steps {
                    return base * (step + 1) as f64 / warmup_steps as f64;
                }
                let min_lr = base * min_lr_ratio;
                let decay_steps = total_steps.saturating_sub(warmup_steps).max(1);
                let progress =
                    (step.saturating_sub(warmup_steps) as f64 / decay_steps as f64).min(1.0);
                min_lr + 0.5 * (base - min_lr) * (1.0 + (std::f64::consts::PI * progress).cos())
            }
        }
    }
}

/// Configuration for a training run. Immutable once validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Run name, used for the checkpoint directory
    pub run_name: String,
    /// Embedding model the inputs came from (provenance only)
    pub model_name: Option<String>,
    /// Embedding dimension D; must equal the matrix column count
    pub embedding_dimension: usize,
    /// Latent width F
    pub features: FeatureCount,
    /// Sparsity/fidelity trade-off
    pub sparsity_alpha: f64,
    /// Overall magnitude multiplier on the sparsity term
    pub sparsity_scale: f64,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub epoch_count: usize,
    /// Seed for weight init and per-epoch shuffling
    pub seed: u64,
    pub lr_schedule: LrSchedule,
    /// Also write `epochs/epoch_{n}/` checkpoints
    pub checkpoint_every_epoch: bool,
    /// Log a batch line every `log_every` steps (0 disables)
    pub log_every: usize,
    /// Upper bound on the estimated per-batch working set
    pub memory_budget_bytes: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            run_name: "final_one".to_string(),
            model_name: None,
            embedding_dimension: 768,
            features: FeatureCount::Multiplier(8),
            sparsity_alpha: 1.0,
            sparsity_scale: 1.0,
            batch_size: 512,
            learning_rate: 1e-5,
            epoch_count: 1,
            seed: 42,
            lr_schedule: LrSchedule::Constant,
            checkpoint_every_epoch: false,
            log_every: 100,
            memory_budget_bytes: None,
        }
    }
}

impl RunConfig {
    /// Latent width F for this configuration.
    pub fn n_features(&self) -> usize {
        self.features.resolve(self.embedding_dimension)
    }

    /// Check internal consistency. Does not look at data.
    pub fn validate(&self) -> SaeResult<()> {
        if self.run_name.trim().is_empty() {
            return Err(SaeError::config("run_name must not be empty"));
        }
        if self.embedding_dimension == 0 {
            return Err(SaeError::config("embedding_dimension must be >= 1"));
        }
        if self.n_features() == 0 {
            return Err(SaeError::config(format!(
                "feature count resolves to 0 ({:?})",
                self.features
            )));
        }
        if self.batch_size == 0 {
            return Err(SaeError::config("batch_size must be >= 1"));
        }
        if self.epoch_count == 0 {
            return Err(SaeError::config("epoch_count must be >= 1"));
        }
        if !self.sparsity_alpha.is_finite() || self.sparsity_alpha < 0.0 {
            return Err(SaeError::config(format!(
                "sparsity_alpha must be finite and >= 0, got {}",
                self.sparsity_alpha
            )));
        }
        if !self.sparsity_scale.is_finite() || self.sparsity_scale < 0.0 {
            return Err(SaeError::config(format!(
                "sparsity_scale must be finite and >= 0, got {}",
                self.sparsity_scale
            )));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(SaeError::config(format!(
                "learning_rate must be finite and > 0, got {}",
                self.learning_rate
            )));
        }
        if let LrSchedule::WarmupCosine { min_lr_ratio, .. } = self.lr_schedule {
            if !(0.0..=1.0).contains(&min_lr_ratio) {
                return Err(SaeError::config(format!(
                    "min_lr_ratio must be in [0, 1], got {min_lr_ratio}"
                )));
            }
        }
        Ok(())
    }

    /// Validate against the embedding matrix shape `(n_rows, n_cols)`.
    pub fn validate_for(&self, n_rows: usize, n_cols: usize) -> SaeResult<()> {
        self.validate()?;
        if n_cols != self.embedding_dimension {
            return Err(SaeError::config(format!(
                "embedding_dimension is {} but the embedding matrix has {n_cols} columns",
                self.embedding_dimension
            )));
        }
        if n_rows == 0 {
            return Err(SaeError::config("embedding matrix has no rows"));
        }
        Ok(())
    }

    /// Rough per-batch working set in bytes: inputs, pre-activations,
    /// activations, reconstruction and their gradients, all f32.
    pub fn estimated_batch_bytes(&self) -> u64 {
        let b = self.batch_size as u64;
        let d = self.embedding_dimension as u64;
        let f = self.n_features() as u64;
        4 * 2 * (b * d * 2 + b * f * 2)
    }
}

/// CUDA device 0 when available and not disabled, else CPU.
pub fn select_device(force_cpu: bool) -> Device {
    if force_cpu {
        info!("Forcing CPU mode");
        return Device::Cpu;
    }
    match Device::cuda_if_available(0) {
        Ok(dev) if dev.is_cuda() => {
            info!("Using CUDA device");
            dev
        }
        _ => {
            info!("CUDA not available, using CPU");
            Device::Cpu
        }
    }
}

/// Order in which registry entries are picked for interpretation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Ascending feature id, first `max_features`.
    #[default]
    RegistryOrder,
    /// Descending max activation; ties by ascending feature id.
    ByMaxActivation,
    /// Descending density; ties by ascending feature id.
    ByDensity,
}

impl std::str::FromStr for SelectionPolicy {
    type Err = SaeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "registry" | "registry_order" => Ok(Self::RegistryOrder),
            "max_activation" => Ok(Self::ByMaxActivation),
            "density" => Ok(Self::ByDensity),
            other => Err(SaeError::config(format!(
                "unknown selection policy '{other}' (expected registry, max_activation, density)"
            ))),
        }
    }
}

/// Configuration for indexing and interpreting a trained model.
#[derive(Debug, Clone)]
pub struct ExtractConfig {
    /// Upper bound on features sent to the interpreter
    pub max_features: usize,
    /// Top-activating examples kept per feature
    pub top_k: usize,
    /// Zero-activation examples kept per feature
    pub contrast_k: usize,
    pub prompt_type: PromptType,
    /// Interpreter model identifier
    pub interpreter_model: String,
    pub selection: SelectionPolicy,
    /// Do not re-request features that already have an explanation
    pub skip_explained: bool,
    /// Bounded pool size for concurrent interpreter calls
    pub max_concurrency: usize,
    pub call_timeout: Duration,
    /// Retries after the first attempt, for retryable failures only
    pub max_retries: u32,
    pub retry_backoff: Duration,
    /// Ask the interpreter to score structured explanations
    pub score_interpretations: bool,
    /// Rows per encoder batch while indexing (memory only)
    pub index_batch_size: usize,
    /// Seed for the contrast-example permutation
    pub seed: u64,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            max_features: 100,
            top_k: 50,
            contrast_k: 20,
            prompt_type: PromptType::Structured,
            interpreter_model: "gpt-4o-mini".to_string(),
            selection: SelectionPolicy::RegistryOrder,
            skip_explained: false,
            max_concurrency: 4,
            call_timeout: Duration::from_secs(60),
            max_retries: 2,
            retry_backoff: Duration::from_millis(500),
            score_interpretations: false,
            index_batch_size: 1024,
            seed: 42,
        }
    }
}

impl ExtractConfig {
    pub fn validate(&self) -> SaeResult<()> {
        if self.top_k == 0 {
            return Err(SaeError::config("top_k must be >= 1"));
        }
        if self.max_concurrency == 0 {
            return Err(SaeError::config("max_concurrency must be >= 1"));
        }
        if self.call_timeout.is_zero() {
            return Err(SaeError::config("call_timeout must be > 0"));
        }
        if self.max_retries > 3 {
            return Err(SaeError::config(format!(
                "max_retries must be <= 3, got {}",
                self.max_retries
            )));
        }
        if self.index_batch_size == 0 {
            return Err(SaeError::config("index_batch_size must be >= 1"));
        }
        if self.interpreter_model.trim().is_empty() {
            return Err(SaeError::config("interpreter_model must not be empty"));
        }
        Ok(())
    }
}
