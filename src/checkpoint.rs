//! Checkpoint directories
//!
//! A checkpoint is a directory holding:
//! - `sae.safetensors`: model parameters
//! - `config.json`: the [`RunConfig`] the model was trained with
//! - `training_log.json`: per-batch and per-epoch losses (optional on load)
//!
//! Writes go through [`StagedDir`]: everything lands in a hidden sibling
//! directory that is renamed into place on commit and removed on drop, so a
//! failed run never leaves a half-written checkpoint behind.

use std::path::{Path, PathBuf};

use candle_core::Device;
use tracing::{info, warn};

use crate::config::RunConfig;
use crate::error::{SaeError, SaeResult};
use crate::sae::SparseAutoencoder;
use crate::trainer::TrainingLog;

pub const CONFIG_FILE: &str = "config.json";
pub const LOG_FILE: &str = "training_log.json";

/// Write model, config and log into `dir` (created if missing).
pub fn write_checkpoint(
    dir: &Path,
    model: &SparseAutoencoder,
    config: &RunConfig,
    log: &TrainingLog,
) -> SaeResult<()> {
    std::fs::create_dir_all(dir)?;
    model.save(dir)?;
    std::fs::write(dir.join(CONFIG_FILE), serde_json::to_string_pretty(config)?)?;
    std::fs::write(dir.join(LOG_FILE), serde_json::to_string_pretty(log)?)?;
    Ok(())
}

/// A loaded checkpoint.
#[derive(Debug)]
pub struct Checkpoint {
    pub config: RunConfig,
    pub model: SparseAutoencoder,
    pub log: Option<TrainingLog>,
}

impl Checkpoint {
    /// Load a checkpoint directory. Only parameter shapes and the stored
    /// configuration are needed; the training log is optional.
    pub fn load(dir: &Path, device: &Device) -> SaeResult<Self> {
        let config_path = dir.join(CONFIG_FILE);
        if !config_path.exists() {
            return Err(SaeError::MissingFile(config_path));
        }
        let config: RunConfig = serde_json::from_str(&std::fs::read_to_string(&config_path)?)?;
        let model = SparseAutoencoder::load(dir, device)?;

        if model.d_model() != config.embedding_dimension {
            return Err(SaeError::shape(
                "checkpoint d_model vs config",
                config.embedding_dimension,
                model.d_model(),
            ));
        }
        if model.n_features() != config.n_features() {
            return Err(SaeError::shape(
                "checkpoint n_features vs config",
                config.n_features(),
                model.n_features(),
            ));
        }

        let log_path = dir.join(LOG_FILE);
        let log = if log_path.exists() {
            Some(serde_json::from_str(&std::fs::read_to_string(&log_path)?)?)
        } else {
            None
        };

        info!(
            "Loaded checkpoint {} (run={}, d_model={}, n_features={})",
            dir.display(),
            config.run_name,
            model.d_model(),
            model.n_features()
        );
        Ok(Self { config, model, log })
    }
}

/// Staging directory that becomes `target` on [`commit`](Self::commit).
#[derive(Debug)]
pub struct StagedDir {
    staging: PathBuf,
    target: PathBuf,
    committed: bool,
}

impl StagedDir {
    /// Create the staging directory next to `target`. Fails if `target`
    /// already exists.
    pub fn create(target: &Path) -> SaeResult<Self> {
        if target.exists() {
            return Err(SaeError::config(format!(
                "checkpoint directory {} already exists",
                target.display()
            )));
        }
        let name = target
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| SaeError::config(format!("invalid checkpoint path {}", target.display())))?;
        let parent = target.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;
        let staging = parent.join(format!(".{name}.partial"));
        if staging.exists() {
            std::fs::remove_dir_all(&staging)?;
        }
        std::fs::create_dir_all(&staging)?;
        Ok(Self {
            staging,
            target: target.to_path_buf(),
            committed: false,
        })
    }

    /// Path to write into before commit.
    pub fn path(&self) -> &Path {
        &self.staging
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Atomically move the staging directory to its final location.
    pub fn commit(mut self) -> SaeResult<PathBuf> {
        std::fs::rename(&self.staging, &self.target)?;
        self.committed = true;
        Ok(self.target.clone())
    }
}

impl Drop for StagedDir {
    fn drop(&mut self) {
        if !self.committed && self.staging.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.staging) {
                warn!("Failed to remove staging dir {}: {e}", self.staging.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staged_dir_commit() {
        let root = tempfile::tempdir().unwrap();
        let target = root.path().join("run_a");
        let staged = StagedDir::create(&target).unwrap();
        std::fs::write(staged.path().join("x.txt"), "x").unwrap();
        assert!(!target.exists());

        let final_dir = staged.commit().unwrap();
        assert_eq!(final_dir, target);
        assert!(target.join("x.txt").exists());
        assert!(!root.path().join(".run_a.partial").exists());
    }

    #[test]
    fn test_staged_dir_dropped_leaves_nothing() {
        let root = tempfile::tempdir().unwrap();
        let target = root.path().join("run_b");
        {
            let staged = StagedDir::create(&target).unwrap();
            std::fs::write(staged.path().join("x.txt"), "x").unwrap();
        }
        assert!(!target.exists());
        assert!(!root.path().join(".run_b.partial").exists());
    }

    #[test]
    fn test_staged_dir_refuses_existing_target() {
        let root = tempfile::tempdir().unwrap();
        assert!(StagedDir::create(root.path()).is_err());
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let root = tempfile::tempdir().unwrap();
        let config = RunConfig {
            embedding_dimension: 4,
            features: crate::config::FeatureCount::Multiplier(2),
            ..Default::default()
        };
        let model = SparseAutoencoder::new(4, 8, 1, &Device::Cpu).unwrap();
        write_checkpoint(root.path(), &model, &config, &TrainingLog::default()).unwrap();

        let loaded = Checkpoint::load(root.path(), &Device::Cpu).unwrap();
        assert_eq!(loaded.config, config);
        assert_eq!(loaded.model.n_features(), 8);
        assert!(loaded.log.is_some());
    }

    #[test]
    fn test_checkpoint_config_mismatch() {
        let root = tempfile::tempdir().unwrap();
        let config = RunConfig {
            embedding_dimension: 4,
            features: crate::config::FeatureCount::Count(16),
            ..Default::default()
        };
        let model = SparseAutoencoder::new(4, 8, 1, &Device::Cpu).unwrap();
        write_checkpoint(root.path(), &model, &config, &TrainingLog::default()).unwrap();
        assert!(matches!(
            Checkpoint::load(root.path(), &Device::Cpu),
            Err(SaeError::ShapeMismatch { .. })
        ));
    }
}
