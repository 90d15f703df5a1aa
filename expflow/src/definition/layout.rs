//! Typed view of the step settings inside a definition.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a step's output may be reused across runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Always execute.
    #[default]
    None,
    /// Use the run's cache root with the standard layout.
    DefaultLocation,
    /// Render this template (local path or remote URI).
    Template(String),
}

impl CachePolicy {
    /// Returns true when the step never consults a cache.
    #[must_use]
    pub const fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// Cache settings shared by packaging steps.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StepCacheConfig {
    /// Cache policy for the step's output.
    #[serde(default)]
    pub cache: CachePolicy,
}

/// A feature state generated by the engine before encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureStateConfig {
    /// Data location (relative to the data base) the state is built from.
    pub source: String,
    /// Cache policy for the generated state file.
    #[serde(default)]
    pub cache: CachePolicy,
}

/// Declares a training step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Shell command template, see [`crate::engine::TrainingCommand`].
    pub command: String,
    /// Cache policy for the trained parameter file.
    #[serde(default)]
    pub cache: CachePolicy,
}

/// Per-task engine tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecutionParameters {
    /// Engine worker threads.
    #[serde(default)]
    pub max_threads: Option<usize>,
    /// Engine queue length.
    #[serde(default)]
    pub queue_length: Option<usize>,
    /// Engine batch size.
    #[serde(default)]
    pub batch_size: Option<usize>,
}

impl ExecutionParameters {
    /// Fills unset values from `fallback`.
    #[must_use]
    pub const fn or(self, fallback: Self) -> Self {
        Self {
            max_threads: match self.max_threads {
                Some(v) => Some(v),
                None => fallback.max_threads,
            },
            queue_length: match self.queue_length {
                Some(v) => Some(v),
                None => fallback.queue_length,
            },
            batch_size: match self.batch_size {
                Some(v) => Some(v),
                None => fallback.batch_size,
            },
        }
    }
}

/// Step settings of a definition. Unknown keys are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefinitionLayout {
    /// Feature states by logical name.
    #[serde(default)]
    pub feature_states: BTreeMap<String, FeatureStateConfig>,
    /// Training data location relative to the data base.
    #[serde(default)]
    pub train_data_location: Option<String>,
    /// Number of daily partitions, ending at the cutoff, used for training.
    #[serde(default = "default_training_days")]
    pub training_days: u32,
    /// Test data location relative to the data base. Falls back to the training location.
    #[serde(default)]
    pub test_data_location: Option<String>,
    /// Days between the cutoff and the test date.
    #[serde(default = "default_test_lag_days")]
    pub test_lag_days: u32,
    /// Training step, if the algorithm is trained.
    #[serde(default)]
    pub training: Option<TrainingConfig>,
    /// Encode-parameter packaging.
    #[serde(default)]
    pub encode_parameters: StepCacheConfig,
    /// Predict-parameter packaging.
    #[serde(default)]
    pub predict_parameters: StepCacheConfig,
    /// Per-task engine tuning keyed by task name.
    #[serde(default)]
    pub hotvect_execution_parameters: BTreeMap<String, ExecutionParameters>,
}

fn default_training_days() -> u32 {
    1
}

fn default_test_lag_days() -> u32 {
    1
}

impl Default for DefinitionLayout {
    fn default() -> Self {
        Self {
            feature_states: BTreeMap::new(),
            train_data_location: None,
            training_days: default_training_days(),
            test_data_location: None,
            test_lag_days: default_test_lag_days(),
            training: None,
            encode_parameters: StepCacheConfig::default(),
            predict_parameters: StepCacheConfig::default(),
            hotvect_execution_parameters: BTreeMap::new(),
        }
    }
}

impl DefinitionLayout {
    /// Returns true if the algorithm declares a training step.
    #[must_use]
    pub const fn has_training(&self) -> bool {
        self.training.is_some()
    }

    /// Where test data lives, if anywhere.
    #[must_use]
    pub fn test_location(&self) -> Option<&str> {
        self.test_data_location
            .as_deref()
            .or(self.train_data_location.as_deref())
    }

    /// Tuning declared for `task`.
    #[must_use]
    pub fn execution_parameters(&self, task: &str) -> ExecutionParameters {
        self.hotvect_execution_parameters
            .get(task)
            .copied()
            .unwrap_or_default()
    }
}
