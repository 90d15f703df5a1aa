//! Node lifecycle states.

use crate::errors::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a node is in its linear lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    /// Constructed, nothing executed.
    #[default]
    Init,
    /// Every dependency node has produced its result.
    DependenciesResolved,
    /// Encode parameters are packaged.
    EncodeParamsReady,
    /// Training data is encoded.
    TrainReady,
    /// The training command produced a parameter file.
    Trained,
    /// Predict parameters are packaged.
    PredictParamsReady,
    /// Test-phase steps ran.
    Tested,
    /// No test data exists for the node's test date.
    SkippedNoTestData,
    /// The node runs under an explicit parameter version, which names no test window.
    SkippedExplicitParameter,
    /// Finished.
    Done,
}

impl NodeState {
    /// Returns true if `next` may directly follow this state.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Init, Self::DependenciesResolved)
                | (Self::DependenciesResolved, Self::EncodeParamsReady)
                | (Self::DependenciesResolved, Self::PredictParamsReady)
                | (Self::EncodeParamsReady, Self::TrainReady)
                | (Self::EncodeParamsReady, Self::PredictParamsReady)
                | (Self::TrainReady, Self::Trained)
                | (Self::Trained, Self::PredictParamsReady)
                | (
                    Self::PredictParamsReady,
                    Self::Tested | Self::SkippedNoTestData | Self::SkippedExplicitParameter
                )
                | (Self::Tested | Self::SkippedNoTestData | Self::SkippedExplicitParameter, Self::Done)
        )
    }

    /// Moves to `next`, rejecting any step outside the lifecycle.
    pub fn transition_to(self, next: Self) -> Result<Self, ConfigurationError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(ConfigurationError::new(format!("Invalid node state transition {self} -> {next}")))
        }
    }

    /// Returns true once the node has finished.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::DependenciesResolved => "DEPENDENCIES_RESOLVED",
            Self::EncodeParamsReady => "ENCODE_PARAMS_READY",
            Self::TrainReady => "TRAIN_READY",
            Self::Trained => "TRAINED",
            Self::PredictParamsReady => "PREDICT_PARAMS_READY",
            Self::Tested => "TESTED",
            Self::SkippedNoTestData => "SKIPPED_NO_TEST_DATA",
            Self::SkippedExplicitParameter => "SKIPPED_EXPLICIT_PARAMETER",
            Self::Done => "DONE",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trained_path() {
        let path = [
            NodeState::Init,
            NodeState::DependenciesResolved,
            NodeState::EncodeParamsReady,
            NodeState::TrainReady,
            NodeState::Trained,
            NodeState::PredictParamsReady,
            NodeState::Tested,
            NodeState::Done,
        ];
        assert!(path.windows(2).all(|w| w[0].can_transition_to(w[1])));
        assert!(NodeState::Done.is_terminal());
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!NodeState::Init.can_transition_to(NodeState::Trained));
        assert!(!NodeState::EncodeParamsReady.can_transition_to(NodeState::Trained));
        assert!(!NodeState::Done.can_transition_to(NodeState::Init));
        assert!(!NodeState::PredictParamsReady.can_transition_to(NodeState::Done));
    }

    #[test]
    fn test_transition_to_rejects_skipped_steps() {
        assert_eq!(
            NodeState::TrainReady.transition_to(NodeState::Trained).unwrap(),
            NodeState::Trained
        );
        let err = NodeState::Init.transition_to(NodeState::Done).unwrap_err();
        assert!(err.to_string().contains("INIT -> DONE"), "{err}");
    }

    #[test]
    fn test_serialized_names() {
        assert_eq!(
            serde_json::to_value(NodeState::SkippedNoTestData).unwrap(),
            serde_json::json!("SKIPPED_NO_TEST_DATA")
        );
        assert_eq!(NodeState::PredictParamsReady.to_string(), "PREDICT_PARAMS_READY");
    }
}
