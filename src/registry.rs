//! Feature registry: feature id -> top-activating examples + explanation
//!
//! Entries live in a `BTreeMap` keyed by feature id, so ids are unique and
//! iteration is in ascending id order. The registry is append-only across
//! runs: [`FeatureRegistry::merge`] overwrites matching ids and leaves every
//! other entry untouched.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{SaeError, SaeResult};

/// One piece of evidence for a feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExampleActivation {
    pub example_id: u64,
    pub activation: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Corpus-level statistics for one feature.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureStats {
    pub max_activation: f32,
    pub mean_activation: f32,
    /// Fraction of examples with activation > 0
    pub density: f32,
}

/// Why an interpretation request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    RateLimited,
    Transport,
    Status,
    Malformed,
    /// The request task panicked or was cancelled.
    Internal,
}

/// Interpretation state of a feature.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Interpretation {
    /// Indexed, not yet sent to an interpreter.
    #[default]
    Pending,
    Explained {
        explanation: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attributes: Vec<String>,
        /// |high-activation match % - contrast match %| / 100
        #[serde(default, skip_serializing_if = "Option::is_none")]
        confidence: Option<f32>,
        model: String,
        at: DateTime<Utc>,
    },
    /// The interpreter could not produce an explanation.
    Failed {
        kind: FailureKind,
        reason: String,
        attempts: u32,
        at: DateTime<Utc>,
    },
    /// The feature never fired, so there is nothing to interpret.
    NoExamples,
}

impl Interpretation {
    pub fn is_explained(&self) -> bool {
        matches!(self, Self::Explained { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// The stored explanation, if any.
    pub fn explanation(&self) -> Option<&str> {
        match self {
            Self::Explained { explanation, .. } => Some(explanation),
            _ => None,
        }
    }
}

/// Registry entry for one feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureEntry {
    pub feature_id: usize,
    /// At most k examples, descending activation, ties by ascending id
    pub top_examples: Vec<ExampleActivation>,
    #[serde(default)]
    pub stats: FeatureStats,
    /// Examples on which the feature is exactly zero
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contrast_examples: Vec<ExampleActivation>,
    #[serde(default)]
    pub interpretation: Interpretation,
}

impl FeatureEntry {
    /// Empty entry, as created at registry initialization.
    pub fn new(feature_id: usize) -> Self {
        Self {
            feature_id,
            top_examples: Vec::new(),
            stats: FeatureStats::default(),
            contrast_examples: Vec::new(),
            interpretation: Interpretation::Pending,
        }
    }

    /// No positive activation anywhere in the indexed corpus.
    pub fn is_dead(&self) -> bool {
        self.top_examples.iter().all(|e| e.activation <= 0.0)
    }
}

/// Counts of entries per interpretation state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistrySummary {
    pub total: usize,
    pub dead: usize,
    pub pending: usize,
    pub explained: usize,
    pub failed: usize,
    pub no_examples: usize,
}

/// Persisted mapping from feature id to its evidence and explanation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureRegistry {
    entries: BTreeMap<usize, FeatureEntry>,
}

impl FeatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with an empty entry for every id in `0..n_features`.
    pub fn with_features(n_features: usize) -> Self {
        Self {
            entries: (0..n_features).map(|id| (id, FeatureEntry::new(id))).collect(),
        }
    }

    pub fn from_entries(entries: impl IntoIterator<Item = FeatureEntry>) -> Self {
        let mut registry = Self::new();
        for entry in entries {
            registry.insert(entry);
        }
        registry
    }

    /// Insert or replace the entry for `entry.feature_id`.
    pub fn insert(&mut self, entry: FeatureEntry) -> Option<FeatureEntry> {
        self.entries.insert(entry.feature_id, entry)
    }

    pub fn get(&self, feature_id: usize) -> Option<&FeatureEntry> {
        self.entries.get(&feature_id)
    }

    pub fn get_mut(&mut self, feature_id: usize) -> Option<&mut FeatureEntry> {
        self.entries.get_mut(&feature_id)
    }

    /// Entries in ascending feature id order.
    pub fn entries(&self) -> impl Iterator<Item = &FeatureEntry> {
        self.entries.values()
    }

    pub fn feature_ids(&self) -> Vec<usize> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Update only the interpretation of an existing entry.
    pub fn set_interpretation(
        &mut self,
        feature_id: usize,
        interpretation: Interpretation,
    ) -> SaeResult<()> {
        let entry = self.entries.get_mut(&feature_id).ok_or_else(|| {
            SaeError::config(format!("feature {feature_id} is not in the registry"))
        })?;
        entry.interpretation = interpretation;
        Ok(())
    }

    /// Overwrite by feature id. Entries only in `self` are kept as-is.
    pub fn merge(mut self, new_entries: FeatureRegistry) -> Self {
        let incoming = new_entries.len();
        let mut replaced = 0usize;
        for (id, entry) in new_entries.entries {
            if self.entries.insert(id, entry).is_some() {
                replaced += 1;
            }
        }
        debug!(
            "Merged {incoming} entries ({replaced} replaced, {} added)",
            incoming - replaced
        );
        self
    }

    /// Ids of features without any positive activation.
    pub fn dead_features(&self) -> Vec<usize> {
        self.entries
            .values()
            .filter(|e| e.is_dead())
            .map(|e| e.feature_id)
            .collect()
    }

    pub fn summary(&self) -> RegistrySummary {
        let mut summary = RegistrySummary {
            total: self.entries.len(),
            ..Default::default()
        };
        for entry in self.entries.values() {
            if entry.is_dead() {
                summary.dead += 1;
            }
            match entry.interpretation {
                Interpretation::Pending => summary.pending += 1,
                Interpretation::Explained { .. } => summary.explained += 1,
                Interpretation::Failed { .. } => summary.failed += 1,
                Interpretation::NoExamples => summary.no_examples += 1,
            }
        }
        summary
    }

    // --- Persistence ---

    /// Load a registry JSON file.
    pub fn load(path: &Path) -> SaeResult<Self> {
        if !path.exists() {
            return Err(SaeError::MissingFile(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        let file: RegistryFile = serde_json::from_str(&content)?;
        let registry = Self::from_entries(file.features);
        info!("Loaded registry {} ({} features)", path.display(), registry.len());
        Ok(registry)
    }

    /// Load `path` if it exists, otherwise start empty.
    pub fn load_or_default(path: &Path) -> SaeResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            debug!("No registry at {}, starting empty", path.display());
            Ok(Self::new())
        }
    }

    /// Write JSON atomically: temp file in the target directory, then rename.
    pub fn save(&self, path: &Path) -> SaeResult<()> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;
        let file = RegistryFileRef {
            updated_at: Utc::now(),
            features: self.entries.values().collect(),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(serde_json::to_string_pretty(&file)?.as_bytes())?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| SaeError::Io(e.error))?;
        info!("Saved registry {} ({} features)", path.display(), self.len());
        Ok(())
    }
}

/// On-disk layout.
#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[allow(dead_code)]
    updated_at: Option<DateTime<Utc>>,
    features: Vec<FeatureEntry>,
}

#[derive(Serialize)]
struct RegistryFileRef<'a> {
    updated_at: DateTime<Utc>,
    features: Vec<&'a FeatureEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: usize, acts: &[(u64, f32)]) -> FeatureEntry {
        FeatureEntry {
            feature_id: id,
            top_examples: acts
                .iter()
                .map(|&(example_id, activation)| ExampleActivation {
                    example_id,
                    activation,
                    text: None,
                })
                .collect(),
            stats: FeatureStats {
                max_activation: acts.first().map_or(0.0, |a| a.1),
                ..Default::default()
            },
            contrast_examples: vec![],
            interpretation: Interpretation::Pending,
        }
    }

    #[test]
    fn test_merge_with_self_is_identity() {
        let registry =
            FeatureRegistry::from_entries([entry(0, &[(1, 2.0)]), entry(3, &[(4, 1.0)])]);
        let merged = registry.clone().merge(registry.clone());
        assert_eq!(merged, registry);
    }

    #[test]
    fn test_merge_overwrites_only_matching_ids() {
        let existing = FeatureRegistry::from_entries([
            entry(0, &[(1, 2.0)]),
            entry(1, &[(2, 1.0)]),
            entry(2, &[(3, 0.5)]),
        ]);
        let update = FeatureRegistry::from_entries([entry(1, &[(9, 7.0)]), entry(5, &[])]);

        let merged = existing.clone().merge(update);
        assert_eq!(merged.feature_ids(), vec![0, 1, 2, 5]);
        assert_eq!(merged.get(0), existing.get(0));
        assert_eq!(merged.get(2), existing.get(2));
        assert_eq!(merged.get(1).unwrap().top_examples[0].example_id, 9);
    }

    #[test]
    fn test_set_interpretation_keeps_examples() {
        let mut registry = FeatureRegistry::from_entries([entry(4, &[(1, 3.0), (2, 1.0)])]);
        let before = registry.get(4).unwrap().clone();
        registry
            .set_interpretation(4, Interpretation::NoExamples)
            .unwrap();
        let after = registry.get(4).unwrap();
        assert_eq!(after.top_examples, before.top_examples);
        assert_eq!(after.stats, before.stats);
        assert_eq!(after.interpretation, Interpretation::NoExamples);
        assert!(registry
            .set_interpretation(99, Interpretation::NoExamples)
            .is_err());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("registry.json");
        let mut registry =
            FeatureRegistry::from_entries([entry(0, &[(1, 2.0)]), entry(7, &[])]);
        registry
            .set_interpretation(
                0,
                Interpretation::Explained {
                    explanation: "mentions of rivers".into(),
                    label: Some("rivers".into()),
                    attributes: vec!["water".into()],
                    confidence: Some(0.4),
                    model: "test-model".into(),
                    at: Utc::now(),
                },
            )
            .unwrap();
        registry.save(&path).unwrap();

        let loaded = FeatureRegistry::load(&path).unwrap();
        assert_eq!(loaded, registry);
    }

    #[test]
    fn test_load_or_default_missing() {
        let dir = tempfile::tempdir().unwrap();
        let registry = FeatureRegistry::load_or_default(&dir.path().join("none.json")).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_summary_and_dead_features() {
        let mut registry = FeatureRegistry::from_entries([
            entry(0, &[(1, 2.0)]),
            entry(1, &[]),
            entry(2, &[(5, 0.0)]),
        ]);
        registry
            .set_interpretation(1, Interpretation::NoExamples)
            .unwrap();
        assert_eq!(registry.dead_features(), vec![1, 2]);
        let summary = registry.summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.dead, 2);
        assert_eq!(summary.pending, 2);
        assert_eq!(summary.no_examples, 1);
    }

    #[test]
    fn test_with_features_creates_empty_entries() {
        let registry = FeatureRegistry::with_features(3);
        assert_eq!(registry.feature_ids(), vec![0, 1, 2]);
        assert!(registry.entries().all(|e| e.top_examples.is_empty()));
    }
}
