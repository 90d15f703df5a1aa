//! Per-run options and node requests.

use crate::definition::{AlgorithmDefinition, ParameterVersion};
use crate::errors::ConfigurationError;
use crate::evaluation;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

fn default_evaluation_strategy() -> String {
    evaluation::NOOP.to_string()
}

/// Switches for the optional steps of a run.
///
/// Serializable so it can cross the flat parameter channel to remote workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Registered evaluation strategy run after predict.
    #[serde(default = "default_evaluation_strategy")]
    pub evaluation_strategy: String,
    /// Run the performance test after evaluation.
    #[serde(default)]
    pub run_performance_test: bool,
    /// Encode the test data with the encode parameters.
    #[serde(default)]
    pub run_encode_test: bool,
    /// Run the feature audit.
    #[serde(default)]
    pub run_audit: bool,
    /// Remove existing output and metadata directories before running.
    #[serde(default)]
    pub clean: bool,
    /// Limits the records the engine processes.
    #[serde(default)]
    pub samples: Option<usize>,
    /// Predict-parameter package supplied out of band; skips every training step.
    #[serde(default)]
    pub prebuilt_parameters: Option<PathBuf>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            evaluation_strategy: default_evaluation_strategy(),
            run_performance_test: false,
            run_encode_test: false,
            run_audit: false,
            clean: false,
            samples: None,
            prebuilt_parameters: None,
        }
    }
}

impl RunOptions {
    /// Selects the evaluation strategy.
    #[must_use]
    pub fn with_evaluation_strategy(mut self, name: impl Into<String>) -> Self {
        self.evaluation_strategy = name.into();
        self
    }

    /// Toggles the performance test.
    #[must_use]
    pub const fn with_performance_test(mut self, enabled: bool) -> Self {
        self.run_performance_test = enabled;
        self
    }

    /// Toggles the encode test.
    #[must_use]
    pub const fn with_encode_test(mut self, enabled: bool) -> Self {
        self.run_encode_test = enabled;
        self
    }

    /// Toggles the audit.
    #[must_use]
    pub const fn with_audit(mut self, enabled: bool) -> Self {
        self.run_audit = enabled;
        self
    }

    /// Toggles cleaning.
    #[must_use]
    pub const fn with_clean(mut self, clean: bool) -> Self {
        self.clean = clean;
        self
    }

    /// Sets the sample limit.
    #[must_use]
    pub const fn with_samples(mut self, samples: Option<usize>) -> Self {
        self.samples = samples;
        self
    }

    /// Uses a prebuilt predict-parameter package.
    #[must_use]
    pub fn with_prebuilt_parameters(mut self, path: impl Into<PathBuf>) -> Self {
        self.prebuilt_parameters = Some(path.into());
        self
    }

    /// Checks the options name things that exist.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        evaluation::strategy(&self.evaluation_strategy)?;
        if self.samples == Some(0) {
            return Err(ConfigurationError::new("samples must be at least 1").with_key("samples"));
        }
        Ok(())
    }
}

/// Everything needed to construct one root node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRequest {
    /// Algorithm to run.
    pub algorithm_name: String,
    /// Base definition; read from the context's artifact when absent.
    pub definition: Option<AlgorithmDefinition>,
    /// Override merged into the base definition.
    pub definition_override: Option<Value>,
    /// Training cutoff.
    pub cutoff: Option<NaiveDate>,
    /// Parameter version chosen by the caller instead of one derived from the cutoff.
    pub parameter_version: Option<ParameterVersion>,
    /// Optional steps.
    pub options: RunOptions,
}

impl NodeRequest {
    /// Runs `algorithm_name` for the window ending at `cutoff`.
    #[must_use]
    pub fn for_cutoff(algorithm_name: impl Into<String>, cutoff: NaiveDate) -> Self {
        Self {
            algorithm_name: algorithm_name.into(),
            definition: None,
            definition_override: None,
            cutoff: Some(cutoff),
            parameter_version: None,
            options: RunOptions::default(),
        }
    }

    /// Runs `algorithm_name` under an explicit parameter version.
    #[must_use]
    pub fn for_parameter_version(algorithm_name: impl Into<String>, version: ParameterVersion) -> Self {
        Self {
            algorithm_name: algorithm_name.into(),
            definition: None,
            definition_override: None,
            cutoff: None,
            parameter_version: Some(version),
            options: RunOptions::default(),
        }
    }

    /// Uses `definition` instead of reading it from the artifact.
    #[must_use]
    pub fn with_definition(mut self, definition: AlgorithmDefinition) -> Self {
        self.definition = Some(definition);
        self
    }

    /// Sets the override.
    #[must_use]
    pub fn with_override(mut self, definition_override: Value) -> Self {
        self.definition_override = Some(definition_override);
        self
    }

    /// Adds a cutoff, e.g. to train under an explicit parameter version.
    #[must_use]
    pub const fn with_cutoff(mut self, cutoff: NaiveDate) -> Self {
        self.cutoff = Some(cutoff);
        self
    }

    /// Sets the run options.
    #[must_use]
    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_defaults_from_empty_object() {
        let options: RunOptions = serde_json::from_value(json!({})).unwrap();
        assert_eq!(options, RunOptions::default());
        assert_eq!(options.evaluation_strategy, "noop");
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert!(RunOptions::default().with_evaluation_strategy("nope").validate().is_err());
        assert!(RunOptions::default().with_samples(Some(0)).validate().is_err());
        assert!(RunOptions::default()
            .with_evaluation_strategy("score-summary")
            .with_audit(true)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_request_builders() {
        let cutoff = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let request = NodeRequest::for_parameter_version("a", ParameterVersion::explicit("prod").unwrap())
            .with_cutoff(cutoff)
            .with_override(json!({"hyperparameter_version": "x"}));
        assert_eq!(request.cutoff, Some(cutoff));
        assert!(request.definition.is_none());
        assert_eq!(request.parameter_version.unwrap().as_str(), "prod");
    }
}
