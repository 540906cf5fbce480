use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{error::Result, training::TrainingConfig};

pub const MODEL_FILE: &str = "model";
pub const OPTIMIZER_FILE: &str = "optimizer";
pub const CHECKPOINT_FILE: &str = "checkpoint.json";
pub const CONFIG_FILE: &str = "config.json";
pub const HISTORY_FILE: &str = "training_history.json";

/// Per-epoch curves, accuracies in percent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub train_loss: Vec<f64>,
    pub train_acc: Vec<f64>,
    pub val_loss: Vec<f64>,
    pub val_acc: Vec<f64>,
}

impl TrainingHistory {
    pub fn push(&mut self, train_loss: f64, train_acc: f64, val_loss: f64, val_acc: f64) {
        self.train_loss.push(train_loss);
        self.train_acc.push(train_acc);
        self.val_loss.push(val_loss);
        self.val_acc.push(val_acc);
    }

    pub fn epochs(&self) -> usize {
        self.val_acc.len()
    }

    /// Train minus validation accuracy at `epoch`.
    pub fn gap(&self, epoch: usize) -> Option<f64> {
        Some(self.train_acc.get(epoch)? - self.val_acc.get(epoch)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Metadata written next to the best weights.
#[derive(Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub epoch: usize,
    pub best_acc: f64,
    pub classes: Vec<String>,
    pub history: TrainingHistory,
    pub config: TrainingConfig,
}

impl Checkpoint {
    pub fn save(&self, model_dir: &Path) -> Result<()> {
        fs::create_dir_all(model_dir)?;
        let path = model_dir.join(CHECKPOINT_FILE);
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        info!(path = %path.display(), epoch = self.epoch + 1, "checkpoint saved");
        Ok(())
    }

    pub fn load(model_dir: &Path) -> Result<Self> {
        let body = fs::read_to_string(model_dir.join(CHECKPOINT_FILE))?;
        Ok(serde_json::from_str(&body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_gap_and_json_keys() {
        let mut history = TrainingHistory::default();
        history.push(1.2, 60.0, 1.0, 55.5);
        history.push(0.9, 70.0, 0.8, 72.0);
        assert_eq!(history.epochs(), 2);
        assert_eq!(history.gap(0), Some(4.5));
        assert_eq!(history.gap(1), Some(-2.0));
        assert_eq!(history.gap(2), None);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join(HISTORY_FILE);
        history.save(&path).unwrap();
        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(raw["val_acc"][1], 72.0);
        assert_eq!(raw["train_loss"].as_array().unwrap().len(), 2);
    }
}
