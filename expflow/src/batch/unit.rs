//! Per-unit placeholders of a batch.

use crate::errors::ExpflowError;
use crate::node::PipelineResult;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One (reference, override, cutoff) combination and, once run, its outcome.
///
/// Created before anything runs; exactly one of `result` and `error` is
/// filled in afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchUnit {
    /// Position in the batch.
    pub index: usize,
    /// Artifact reference.
    pub reference: String,
    /// Root algorithm.
    pub algorithm_name: String,
    /// Definition override, if any.
    #[serde(default)]
    pub definition_override: Option<Value>,
    /// Training cutoff.
    pub cutoff: NaiveDate,
    /// Remote job name, once submitted.
    #[serde(default)]
    pub job_name: Option<String>,
    /// Result tree on success.
    #[serde(default)]
    pub result: Option<PipelineResult>,
    /// Error message on failure.
    #[serde(default)]
    pub error: Option<String>,
    /// Error category on failure.
    #[serde(default)]
    pub error_type: Option<String>,
}

impl BatchUnit {
    /// Creates a pending unit.
    #[must_use]
    pub fn new(
        index: usize,
        reference: impl Into<String>,
        algorithm_name: impl Into<String>,
        definition_override: Option<Value>,
        cutoff: NaiveDate,
    ) -> Self {
        Self {
            index,
            reference: reference.into(),
            algorithm_name: algorithm_name.into(),
            definition_override,
            cutoff,
            job_name: None,
            result: None,
            error: None,
            error_type: None,
        }
    }

    /// Records a result.
    pub fn succeed(&mut self, result: PipelineResult) {
        self.result = Some(result);
        self.error = None;
        self.error_type = None;
    }

    /// Records an error.
    pub fn fail(&mut self, error: &ExpflowError) {
        self.fail_with(error.category(), error.to_string());
    }

    /// Records an error given as category and message.
    pub fn fail_with(&mut self, category: impl Into<String>, message: impl Into<String>) {
        let message = message.into();
        tracing::error!(unit = self.index, reference = %self.reference, cutoff = %self.cutoff, error = %message, "Unit failed");
        self.result = None;
        self.error = Some(message);
        self.error_type = Some(category.into());
    }

    /// Returns true once the unit has a result.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.result.is_some()
    }

    /// Returns true once the unit has either a result or an error.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        self.result.is_some() || self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ConfigurationError;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_failure_is_recorded_with_category() {
        let cutoff = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let mut unit = BatchUnit::new(1, "v2", "ranker", None, cutoff);
        assert!(!unit.is_settled());

        unit.fail(&ConfigurationError::new("bad override").into());
        assert!(unit.is_settled());
        assert!(!unit.is_success());
        assert_eq!(unit.error_type.as_deref(), Some("configuration_error"));
        assert!(unit.error.as_deref().unwrap().contains("bad override"));
    }
}
