//! Activation indexing: trained encoder over a corpus -> per-feature top-k
//!
//! The full N×F activation matrix is never materialized. Rows are encoded in
//! batches and every feature keeps a bounded min-heap of its best candidates,
//! so the result does not depend on the batch size.
//!
//! Ordering of a feature's examples: descending activation, ties broken by
//! ascending example id. Only strictly positive activations count as
//! evidence; a dead feature gets an entry with no examples.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::data::EmbeddingMatrix;
use crate::error::{SaeError, SaeResult};
use crate::registry::{ExampleActivation, FeatureEntry, FeatureRegistry, FeatureStats};
use crate::sae::SparseAutoencoder;

/// Candidate example for a feature's top-k. Greater = ranks higher.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    activation: f32,
    row: usize,
    example_id: u64,
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.activation
            .total_cmp(&other.activation)
            .then_with(|| other.example_id.cmp(&self.example_id))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Per-feature accumulator.
#[derive(Debug, Default)]
struct FeatureAccumulator {
    heap: BinaryHeap<Reverse<Candidate>>,
    sum: f64,
    max: f32,
    active: usize,
    contrast: Vec<(usize, u64)>,
}

impl FeatureAccumulator {
    fn observe(&mut self, candidate: Candidate, top_k: usize, contrast_k: usize) {
        let v = candidate.activation;
        if v > 0.0 {
            self.sum += f64::from(v);
            self.active += 1;
            if v > self.max {
                self.max = v;
            }
            if self.heap.len() < top_k {
                self.heap.push(Reverse(candidate));
            } else if let Some(Reverse(worst)) = self.heap.peek() {
                if candidate > *worst {
                    self.heap.pop();
                    self.heap.push(Reverse(candidate));
                }
            }
        } else if v == 0.0 && self.contrast.len() < contrast_k {
            self.contrast.push((candidate.row, candidate.example_id));
        }
    }
}

/// Sparse view of one example's activations, strongest first.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseActivations {
    /// Active `(feature_id, activation)` pairs, sorted descending.
    pub features: Vec<(usize, f32)>,
}

impl SparseActivations {
    /// Number of active features.
    pub fn len(&self) -> usize {
        self.features.len()
    }

    /// Whether no features are active.
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

/// Builds a [`FeatureRegistry`] from a trained model and a corpus.
#[derive(Debug, Clone)]
pub struct ActivationIndexer {
    top_k: usize,
    contrast_k: usize,
    batch_size: usize,
    seed: u64,
}

impl ActivationIndexer {
    pub fn new(top_k: usize) -> Self {
        Self {
            top_k,
            contrast_k: 0,
            batch_size: 1024,
            seed: 42,
        }
    }

    /// Keep up to `contrast_k` zero-activation examples per feature.
    pub fn with_contrast(mut self, contrast_k: usize, seed: u64) -> Self {
        self.contrast_k = contrast_k;
        self.seed = seed;
        self
    }

    /// Rows per encoder call. Memory only; results do not change.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Index the corpus. `texts`, if given, must be aligned with the rows.
    pub fn index(
        &self,
        model: &SparseAutoencoder,
        embeddings: &EmbeddingMatrix,
        example_ids: &[u64],
        texts: Option<&[String]>,
    ) -> SaeResult<FeatureRegistry> {
        let n_rows = embeddings.n_rows();
        if example_ids.len() != n_rows {
            return Err(SaeError::config(format!(
                "{} example ids for {n_rows} embedding rows",
                example_ids.len()
            )));
        }
        if let Some(texts) = texts {
            if texts.len() != n_rows {
                return Err(SaeError::config(format!(
                    "{} texts for {n_rows} embedding rows",
                    texts.len()
                )));
            }
        }
        if embeddings.dim() != model.d_model() {
            return Err(SaeError::shape(
                "indexer embedding columns",
                model.d_model(),
                embeddings.dim(),
            ));
        }

        let n_features = model.n_features();
        info!(
            "Indexing {n_rows} examples over {n_features} features (top_k={}, contrast_k={})",
            self.top_k, self.contrast_k
        );

        // Visiting order only decides which zero-activation rows become
        // contrast examples; top-k and stats are order independent.
        let mut order: Vec<usize> = (0..n_rows).collect();
        if self.contrast_k > 0 {
            let mut rng = rand::rngs::StdRng::seed_from_u64(self.seed);
            order.shuffle(&mut rng);
        }

        let mut accs: Vec<FeatureAccumulator> =
            (0..n_features).map(|_| FeatureAccumulator::default()).collect();

        for (batch_idx, rows) in order.chunks(self.batch_size).enumerate() {
            let batch = embeddings.rows(rows)?;
            let acts: Vec<Vec<f32>> = model.encode(&batch)?.to_vec2()?;
            for (&row, row_acts) in rows.iter().zip(&acts) {
                let example_id = example_ids[row];
                for (acc, &activation) in accs.iter_mut().zip(row_acts) {
                    acc.observe(
                        Candidate {
                            activation,
                            row,
                            example_id,
                        },
                        self.top_k,
                        self.contrast_k,
                    );
                }
            }
            debug!("Indexed batch {batch_idx} ({} rows)", rows.len());
        }

        let text_of = |row: usize| texts.map(|t| t[row].clone());
        let registry = FeatureRegistry::from_entries(accs.into_iter().enumerate().map(
            |(feature_id, acc)| {
                let mut top = acc.heap.into_vec();
                top.sort_by(|a, b| b.cmp(a));
                FeatureEntry {
                    feature_id,
                    top_examples: top
                        .into_iter()
                        .map(|Reverse(c)| ExampleActivation {
                            example_id: c.example_id,
                            activation: c.activation,
                            text: text_of(c.row),
                        })
                        .collect(),
                    stats: FeatureStats {
                        max_activation: acc.max,
                        mean_activation: (acc.sum / n_rows as f64) as f32,
                        density: acc.active as f32 / n_rows as f32,
                    },
                    contrast_examples: acc
                        .contrast
                        .into_iter()
                        .map(|(row, example_id)| ExampleActivation {
                            example_id,
                            activation: 0.0,
                            text: text_of(row),
                        })
                        .collect(),
                    interpretation: Default::default(),
                }
            },
        ));

        let dead = registry.dead_features().len();
        info!(
            "Indexed {} features ({dead} dead, {:.1}%)",
            registry.len(),
            100.0 * dead as f64 / n_features.max(1) as f64
        );
        Ok(registry)
    }
}

/// Index with default batching and no contrast examples.
pub fn index(
    model: &SparseAutoencoder,
    embeddings: &EmbeddingMatrix,
    example_ids: &[u64],
    top_k: usize,
) -> SaeResult<FeatureRegistry> {
    ActivationIndexer::new(top_k).index(model, embeddings, example_ids, None)
}

/// Strongest `k` features for a single embedding of shape `[D]` or `[1, D]`.
pub fn top_features(
    model: &SparseAutoencoder,
    embedding: &candle_core::Tensor,
    k: usize,
) -> SaeResult<SparseActivations> {
    let row = embedding.flatten_all()?.unsqueeze(0)?;
    let acts: Vec<f32> = model.encode(&row)?.squeeze(0)?.to_vec1()?;
    let mut features: Vec<(usize, f32)> = acts
        .into_iter()
        .enumerate()
        .filter(|(_, v)| *v > 0.0)
        .collect();
    features.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    features.truncate(k);
    Ok(SparseActivations { features })
}
