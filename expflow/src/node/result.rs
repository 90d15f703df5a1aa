//! Step and node results.

use super::NodeState;
use crate::definition::{AlgorithmIdentity, ParameterVersion};
use crate::storage::Location;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// How a step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// The step did its work.
    Executed,
    /// The step was skipped, see the skip reason.
    Skipped,
    /// The step failed.
    Error,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Executed => write!(f, "executed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Outcome of one pipeline step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// How the step ended.
    pub status: StepStatus,

    /// Why the step was skipped.
    #[serde(rename = "skipped", default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,

    /// Where a reused artifact came from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Metadata reported by the step.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,

    /// Error message, for failed steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Wall-clock duration.
    #[serde(default)]
    pub duration_ms: f64,
}

impl StepResult {
    /// A step that did its work.
    #[must_use]
    pub fn executed(metadata: Value) -> Self {
        Self {
            status: StepStatus::Executed,
            skip_reason: None,
            source: None,
            metadata,
            error: None,
            duration_ms: 0.0,
        }
    }

    /// A step that was skipped.
    #[must_use]
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Skipped,
            skip_reason: Some(reason.into()),
            source: None,
            metadata: Value::Null,
            error: None,
            duration_ms: 0.0,
        }
    }

    /// A step short-circuited by an existing cache entry.
    #[must_use]
    pub fn from_cache(location: &Location) -> Self {
        Self {
            source: Some(location.to_string()),
            ..Self::skipped("cached")
        }
    }

    /// A step that reused an artifact supplied from outside the run.
    #[must_use]
    pub fn from_prebuilt(path: &Path) -> Self {
        Self {
            source: Some(path.display().to_string()),
            ..Self::skipped("prebuilt parameter package supplied")
        }
    }

    /// A failed step.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Error,
            skip_reason: None,
            source: None,
            metadata: Value::Null,
            error: Some(message.into()),
            duration_ms: 0.0,
        }
    }

    /// Sets the duration.
    #[must_use]
    pub const fn with_duration(mut self, duration_ms: f64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Returns true if the step was skipped.
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        self.status == StepStatus::Skipped
    }

    /// Returns true if the step reused a cached artifact.
    #[must_use]
    pub fn is_cache_hit(&self) -> bool {
        self.is_skipped() && self.skip_reason.as_deref() == Some("cached")
    }
}

/// Feature states produced so far, keyed by logical state name.
///
/// Steps never mutate a map they were handed; [`FeatureStates::with_state`]
/// returns an extended copy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureStates(BTreeMap<String, PathBuf>);

impl FeatureStates {
    /// Returns a copy that also holds `name`.
    #[must_use]
    pub fn with_state(&self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let mut states = self.0.clone();
        states.insert(name.into(), path.into());
        Self(states)
    }

    /// Path of the named state.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Path> {
        self.0.get(name).map(PathBuf::as_path)
    }

    /// States in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_path()))
    }

    /// Number of states.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if no state was generated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The structured outcome of one node and, recursively, its dependencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    /// Algorithm identity.
    pub algorithm: AlgorithmIdentity,
    /// Hyperparameter slug.
    pub hyperparameter_slug: String,
    /// Parameter version of the node.
    pub parameter_version: ParameterVersion,
    /// Last training day, if trained under a cutoff.
    #[serde(default)]
    pub last_training_date: Option<NaiveDate>,
    /// Test day, if the node has a cutoff.
    #[serde(default)]
    pub test_date: Option<NaiveDate>,
    /// When the node started.
    pub ran_at: DateTime<Utc>,
    /// Test-phase outcome.
    pub outcome: NodeState,
    /// Fully resolved definition.
    pub algorithm_definition: Value,
    /// Content hash of the resolved definition.
    pub definition_hash: String,
    /// Step outcomes by step name.
    pub steps: BTreeMap<String, StepResult>,
    /// Step durations in milliseconds.
    pub timings: BTreeMap<String, f64>,
    /// Dependency results by dependency name.
    #[serde(default)]
    pub dependencies: BTreeMap<String, PipelineResult>,
    /// Output directory.
    pub output_dir: PathBuf,
    /// Metadata directory.
    pub metadata_dir: PathBuf,
}

impl PipelineResult {
    /// Outcome of the named step.
    #[must_use]
    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.steps.get(name)
    }

    /// Total time spent in this node's own steps.
    #[must_use]
    pub fn total_duration_ms(&self) -> f64 {
        self.timings.values().sum()
    }

    /// Where the node's predict-parameter package lives.
    #[must_use]
    pub fn predict_parameters_path(&self) -> PathBuf {
        self.output_dir.join(super::PREDICT_PARAMETERS_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_skipped_serializes_reason_under_skipped() {
        let step = StepResult::skipped("disabled").with_duration(1.5);
        let value = serde_json::to_value(&step).unwrap();
        assert_eq!(value["status"], json!("skipped"));
        assert_eq!(value["skipped"], json!("disabled"));
        assert!(value.get("metadata").is_none());
        let back: StepResult = serde_json::from_value(value).unwrap();
        assert_eq!(back, step);
    }

    #[test]
    fn test_cache_hit_records_source() {
        let location = Location::parse("s3://bucket/enc.zip").unwrap();
        let step = StepResult::from_cache(&location);
        assert!(step.is_cache_hit());
        assert_eq!(step.source.as_deref(), Some("s3://bucket/enc.zip"));
        assert!(!StepResult::from_prebuilt(Path::new("/p.zip")).is_cache_hit());
    }

    #[test]
    fn test_error_and_executed() {
        let failed = StepResult::error("exit 1");
        assert_eq!(failed.status, StepStatus::Error);
        assert_eq!(failed.error.as_deref(), Some("exit 1"));
        let done = StepResult::executed(json!({"rows": 3}));
        assert_eq!(done.metadata["rows"], json!(3));
        assert!(!done.is_skipped());
    }

    #[test]
    fn test_feature_states_are_persistent() {
        let empty = FeatureStates::default();
        let one = empty.with_state("popularity", "/o/states/popularity");
        let two = one.with_state("recency", "/o/states/recency");
        assert!(empty.is_empty());
        assert_eq!(one.len(), 1);
        assert_eq!(two.len(), 2);
        assert_eq!(two.get("popularity"), Some(Path::new("/o/states/popularity")));
        assert_eq!(two.iter().map(|(k, _)| k).collect::<Vec<_>>(), vec!["popularity", "recency"]);
    }
}
