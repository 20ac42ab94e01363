// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // f64→f32 for logged losses
#![allow(clippy::many_single_char_names)] // x, f, d standard in math
#![allow(clippy::similar_names)] // related variables like `w_enc`/`b_enc`
#![allow(clippy::module_name_repetitions)] // FeatureRegistry in registry.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive

//! sae-interp: sparse autoencoders over text embeddings
//!
//! Trains an overcomplete ReLU autoencoder with an L1 sparsity penalty on a
//! fixed embedding matrix, indexes which corpus examples activate each
//! latent feature, and asks a language model to explain the features.
//!
//! ## Architecture
//!
//! - `config`: RunConfig / ExtractConfig, learning-rate schedules, device selection
//! - `data`: Embedding matrix and aligned text corpus loading
//! - `sae`: SparseAutoencoder (encode, decode, decoder renormalization, safetensors IO)
//! - `loss`: Reconstruction MSE + scaled L1 sparsity penalty
//! - `trainer`: Seeded mini-batch AdamW loop with numeric-instability abort
//! - `checkpoint`: Checkpoint directories with staged, atomic commits
//! - `indexer`: Streaming per-feature top-k over a corpus
//! - `registry`: Persistent feature id -> evidence + interpretation map
//! - `prompt`: Interpretation / scoring prompt templates and response parsing
//! - `interpreter`: Interpreter trait and OpenAI-compatible HTTP client
//! - `interpret`: Concurrent, bounded interpretation requests with retries
//! - `pipeline`: End-to-end `train` and `extract` runs

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod indexer;
pub mod interpret;
pub mod interpreter;
pub mod loss;
pub mod pipeline;
pub mod prompt;
pub mod registry;
pub mod sae;
pub mod trainer;

pub use checkpoint::{write_checkpoint, Checkpoint, StagedDir};
pub use config::{
    select_device, ExtractConfig, FeatureCount, LrSchedule, RunConfig, SelectionPolicy,
};
pub use data::{row_ids, EmbeddingMatrix, TextCorpus, TextSample};
pub use error::{SaeError, SaeResult};
pub use indexer::{index, top_features, ActivationIndexer, SparseActivations};
pub use interpret::{select_features, InterpretationRequester, InterpretationSummary};
pub use interpreter::{HttpInterpreter, Interpreter, InterpreterError};
pub use loss::{LossBreakdown, SparsityLoss};
pub use pipeline::{
    default_registry_path, extract, train, ExtractReport, ExtractRequest, TrainReport,
    TrainRequest,
};
pub use prompt::{Prompt, PromptBuilder, PromptType};
pub use registry::{
    ExampleActivation, FailureKind, FeatureEntry, FeatureRegistry, FeatureStats, Interpretation,
    RegistrySummary,
};
pub use sae::SparseAutoencoder;
pub use trainer::{Trainer, TrainingLog, TrainingOutcome};
