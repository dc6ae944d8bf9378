use anyhow::{Context, Result};
use crate::model::ContrastiveEncoder;
use burn::prelude::*;
use burn::record::CompactRecorder;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

pub const TRAINING_STATE_FILE: &str = "training_state.json";
/// Extension written by `CompactRecorder`
const MODEL_EXTENSION: &str = "mpk";

/// Progress marker written next to the model files after every checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Last completed epoch, starting at 1
    pub epoch: usize,
    pub global_step: usize,
    pub learning_rate: f64,
    pub train_loss: f64,
    /// Set when the run stopped on Ctrl+C before finishing all epochs
    #[serde(default)]
    pub interrupted: bool,
}

/// Saves per-epoch model files into the serialization directory and keeps only the newest ones.
pub struct CheckpointManager {
    dir: PathBuf,
    num_to_keep: usize,
    saved: VecDeque<usize>,
}

impl CheckpointManager {
    /// `num_to_keep == 0` keeps every checkpoint
    pub fn new<P: AsRef<Path>>(dir: P, num_to_keep: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(Self {
            dir,
            num_to_keep,
            saved: VecDeque::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File stem of the model saved for `epoch`; the recorder appends its own extension
    pub fn model_stem(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!("model_epoch_{epoch}"))
    }

    fn model_file(&self, epoch: usize) -> PathBuf {
        self.model_stem(epoch).with_extension(MODEL_EXTENSION)
    }

    pub fn save_model<B: Backend>(
        &mut self,
        model: &ContrastiveEncoder<B>,
        state: &TrainingState,
    ) -> Result<()> {
        let stem = self.model_stem(state.epoch);
        model
            .clone()
            .save_file(stem.clone(), &CompactRecorder::new())
            .with_context(|| format!("Failed to save checkpoint {}", stem.display()))?;
        self.save_state(state)?;

        self.saved.retain(|&epoch| epoch != state.epoch);
        self.saved.push_back(state.epoch);
        while self.num_to_keep > 0 && self.saved.len() > self.num_to_keep {
            if let Some(old) = self.saved.pop_front() {
                let file = self.model_file(old);
                if let Err(err) = fs::remove_file(&file) {
                    tracing::warn!("Could not remove old checkpoint {}: {}", file.display(), err);
                }
            }
        }

        tracing::info!("Saved checkpoint for epoch {} to {}", state.epoch, stem.display());
        Ok(())
    }

    pub fn save_state(&self, state: &TrainingState) -> Result<()> {
        let path = self.dir.join(TRAINING_STATE_FILE);
        fs::write(&path, serde_json::to_string_pretty(state)?)
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn load_state(&self) -> Result<TrainingState> {
        let path = self.dir.join(TRAINING_STATE_FILE);
        let json = fs::read_to_string(&path)
            .with_context(|| format!("Cannot read {}", path.display()))?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Restore weights saved for `epoch` into `model`
    pub fn load_model<B: Backend>(
        &self,
        model: ContrastiveEncoder<B>,
        epoch: usize,
        device: &B::Device,
    ) -> Result<ContrastiveEncoder<B>> {
        let stem = self.model_stem(epoch);
        model
            .load_file(stem.clone(), &CompactRecorder::new(), device)
            .with_context(|| format!("Cannot load checkpoint {}", stem.display()))
    }

    /// Epochs whose model files are still on disk, oldest first
    pub fn retained_epochs(&self) -> Vec<usize> {
        self.saved.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EncoderConfig;
    use burn::backend::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray;

    fn state(epoch: usize) -> TrainingState {
        TrainingState {
            epoch,
            global_step: epoch * 10,
            learning_rate: 1e-4,
            train_loss: 1.5,
            interrupted: false,
        }
    }

    #[test]
    fn test_keeps_newest_checkpoints() -> Result<()> {
        let dir = TempDir::new()?;
        let device = Default::default();
        let model = ContrastiveEncoder::<TestBackend>::new(
            &EncoderConfig::new(32, 8).with_d_model(16).with_d_ff(32).with_n_layers(1),
            &device,
        );

        let mut manager = CheckpointManager::new(dir.path(), 2)?;
        for epoch in 1..=3 {
            manager.save_model(&model, &state(epoch))?;
        }

        assert_eq!(manager.retained_epochs(), vec![2, 3]);
        assert!(!manager.model_file(1).exists());
        assert!(manager.model_file(3).exists());
        assert_eq!(manager.load_state()?, state(3));

        let restored = manager.load_model(model.clone(), 3, &device)?;
        assert_eq!(restored.num_params(), model.num_params());
        Ok(())
    }
}
