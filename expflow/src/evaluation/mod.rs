//! Named evaluation strategies.
//!
//! Evaluation runs after predict. Strategies form a closed, statically
//! registered set selected by name, so the choice can cross the flat parameter
//! channel to a remote worker as a plain string.

use crate::errors::{ConfigurationError, ExpflowError, ExpflowResult};
use serde_json::{json, Value};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Name of the strategy that records nothing.
pub const NOOP: &str = "noop";
/// Name of the prediction score summary.
pub const SCORE_SUMMARY: &str = "score-summary";

/// What a strategy gets to look at.
#[derive(Debug, Clone, Copy)]
pub struct EvaluationInput<'a> {
    /// Prediction output (file or directory of files).
    pub prediction: &'a Path,
    /// Test data partition that was scored.
    pub test_data: &'a Path,
    /// Metadata the predict step reported.
    pub predict_metadata: &'a Value,
}

/// Turns a prediction into evaluation metadata.
pub trait EvaluationStrategy: Send + Sync {
    /// Registered name.
    fn name(&self) -> &'static str;

    /// Computes the evaluation document.
    fn evaluate(&self, input: &EvaluationInput<'_>) -> ExpflowResult<Value>;
}

/// Records an empty evaluation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEvaluation;

impl EvaluationStrategy for NoopEvaluation {
    fn name(&self) -> &'static str {
        NOOP
    }

    fn evaluate(&self, _input: &EvaluationInput<'_>) -> ExpflowResult<Value> {
        Ok(json!({}))
    }
}

/// Counts scored rows and summarizes their `score` field.
///
/// Predictions are JSON lines; compressed output is not readable here.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreSummary;

impl ScoreSummary {
    fn prediction_files(prediction: &Path) -> ExpflowResult<Vec<PathBuf>> {
        if prediction.is_file() {
            return Ok(vec![prediction.to_path_buf()]);
        }
        let mut files = Vec::new();
        for entry in WalkDir::new(prediction).sort_by_file_name() {
            let entry = entry?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }
        Ok(files)
    }
}

impl EvaluationStrategy for ScoreSummary {
    fn name(&self) -> &'static str {
        SCORE_SUMMARY
    }

    fn evaluate(&self, input: &EvaluationInput<'_>) -> ExpflowResult<Value> {
        let mut rows = 0_u64;
        let mut scored = 0_u64;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;

        for file in Self::prediction_files(input.prediction)? {
            if file.extension().is_some_and(|ext| ext == "gz") {
                return Err(ExpflowError::MalformedResult(format!(
                    "{} is compressed; {SCORE_SUMMARY} reads plain JSON lines",
                    file.display()
                )));
            }
            let reader = BufReader::new(std::fs::File::open(&file)?);
            for (number, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let row: Value = serde_json::from_str(&line).map_err(|e| {
                    ExpflowError::MalformedResult(format!("{}:{}: {e}", file.display(), number + 1))
                })?;
                rows += 1;
                if let Some(score) = row.get("score").and_then(Value::as_f64) {
                    scored += 1;
                    sum += score;
                    min = min.min(score);
                    max = max.max(score);
                }
            }
        }

        let mut summary = json!({ "rows": rows, "scored_rows": scored });
        if scored > 0 {
            #[allow(clippy::cast_precision_loss)]
            let mean = sum / scored as f64;
            summary["mean_score"] = json!({ "mean": mean });
            summary["min_score"] = json!(min);
            summary["max_score"] = json!(max);
        }
        Ok(summary)
    }
}

static REGISTRY: [&dyn EvaluationStrategy; 2] = [&NoopEvaluation, &ScoreSummary];

/// Looks up a strategy by name.
pub fn strategy(name: &str) -> Result<&'static dyn EvaluationStrategy, ConfigurationError> {
    REGISTRY.iter().copied().find(|s| s.name() == name).ok_or_else(|| {
        ConfigurationError::new(format!(
            "Unknown evaluation strategy '{name}', expected one of: {}",
            names().join(", ")
        ))
        .with_key("evaluation_strategy")
    })
}

/// Registered strategy names.
#[must_use]
pub fn names() -> Vec<&'static str> {
    REGISTRY.iter().map(|s| s.name()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn input<'a>(prediction: &'a Path, meta: &'a Value) -> EvaluationInput<'a> {
        EvaluationInput {
            prediction,
            test_data: Path::new("/unused"),
            predict_metadata: meta,
        }
    }

    #[test]
    fn test_registry_lookup() {
        assert_eq!(names(), vec!["noop", "score-summary"]);
        assert_eq!(strategy("score-summary").unwrap().name(), SCORE_SUMMARY);
        let err = strategy("custom").err().unwrap();
        assert_eq!(err.key.as_deref(), Some("evaluation_strategy"));
    }

    #[test]
    fn test_noop_is_empty() {
        let meta = json!({});
        let out = strategy(NOOP).unwrap().evaluate(&input(Path::new("/x"), &meta)).unwrap();
        assert_eq!(out, json!({}));
    }

    #[test]
    fn test_score_summary() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("prediction.jsonl");
        std::fs::write(&file, "{\"id\":1,\"score\":0.5}\n{\"id\":2,\"score\":1.5}\n\n{\"id\":3}\n").unwrap();
        let meta = json!({});
        let out = ScoreSummary.evaluate(&input(&file, &meta)).unwrap();
        assert_eq!(out["rows"], json!(3));
        assert_eq!(out["scored_rows"], json!(2));
        assert_eq!(out["mean_score"]["mean"], json!(1.0));
        assert_eq!(out["max_score"], json!(1.5));
    }

    #[test]
    fn test_score_summary_reads_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("part-0"), "{\"score\":1}\n").unwrap();
        std::fs::write(dir.path().join("part-1"), "{\"score\":3}\n").unwrap();
        let meta = json!({});
        let out = ScoreSummary.evaluate(&input(dir.path(), &meta)).unwrap();
        assert_eq!(out["rows"], json!(2));
        assert_eq!(out["mean_score"]["mean"], json!(2.0));
    }

    #[test]
    fn test_score_summary_rejects_garbage_and_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad.jsonl");
        std::fs::write(&bad, "not json\n").unwrap();
        let meta = json!({});
        assert!(matches!(
            ScoreSummary.evaluate(&input(&bad, &meta)),
            Err(ExpflowError::MalformedResult(_))
        ));
        let gz = dir.path().join("p.jsonl.gz");
        std::fs::write(&gz, "x").unwrap();
        assert!(ScoreSummary.evaluate(&input(&gz, &meta)).is_err());
    }
}
