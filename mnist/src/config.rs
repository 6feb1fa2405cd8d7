use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{Result, WorkloadErr};

/// The knobs of a training run, read from JSON.
///
/// Missing fields take their default value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkloadConfig {
    /// The batch size summed over every worker.
    pub global_batch_size: usize,
    pub label_smoothing: f32,
    pub seed: u64,
    /// The amount of train steps to run.
    pub steps: usize,
    pub learning_rate: f32,
    /// The size of the generated dataset used when no real data is loaded.
    pub synthetic_examples: usize,
    /// The amount of examples evaluated after training.
    pub eval_examples: usize,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            global_batch_size: 64,
            label_smoothing: 0.,
            seed: 0,
            steps: 10,
            learning_rate: 0.1,
            synthetic_examples: 1024,
            eval_examples: 1024,
        }
    }
}

impl WorkloadConfig {
    /// Parses and validates a config.
    ///
    /// # Errors
    /// `WorkloadErr::Config` for malformed JSON or out of range values.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(s).map_err(|e| WorkloadErr::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a config file.
    ///
    /// # Errors
    /// I/O errors, and everything `from_json_str` rejects.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.global_batch_size == 0 {
            return Err(WorkloadErr::Config(
                "global_batch_size must be positive".into(),
            ));
        }

        if !(0. ..=1.).contains(&self.label_smoothing) {
            return Err(WorkloadErr::Config(format!(
                "label_smoothing must be in [0, 1], got {}",
                self.label_smoothing
            )));
        }

        if !self.learning_rate.is_finite() {
            return Err(WorkloadErr::Config("learning_rate must be finite".into()));
        }

        Ok(())
    }
}
