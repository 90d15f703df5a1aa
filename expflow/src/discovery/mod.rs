//! Finding and summarizing finished runs.
//!
//! Every node leaves its `result.json` at
//! `{metadata_base}/{name}@{version}[-{hyperparameter_version}]/last_train_date_{date|NA}-last_test_date_{date}/`.
//! [`list_result_dirs`] walks a metadata tree for that layout and filters it;
//! [`extract_evaluation`] flattens the metrics of one result into a single row.

use crate::definition::NO_TRAIN_DATE;
use crate::errors::{ConfigurationError, ExpflowError, ExpflowResult};
use crate::node::{steps, RESULT_FILE};
use crate::schedule::{parse_date, DATE_FORMAT};
use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use walkdir::WalkDir;

#[allow(clippy::expect_used)]
static RESULT_DIR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:^|/)([\w-]+)@([\.\w-]+)/last_train_date_(\d{4}-\d{2}-\d{2}|NA)-last_test_date_(\d{4}-\d{2}-\d{2})$",
    )
    .expect("valid result directory pattern")
});

/// Metrics copied as they are.
const PLAIN_METRICS: [&str; 9] = [
    "map_at_10",
    "map_at_50",
    "map_at_all",
    "ndcg_at_10",
    "ndcg_at_50",
    "ndcg_at_all",
    "diversity@5",
    "diversity@10",
    "diversity@30",
];
/// Bootstrapped metrics, reported through their `mean`.
const MEAN_METRICS: [&str; 3] = ["roc_auc", "pr_auc", "mean_score"];
/// Latency percentiles under `response_time_metrics`.
const LATENCY_PERCENTILES: [&str; 5] = ["p50", "p75", "p95", "p99", "p999"];

/// Filters for [`list_result_dirs`]. Patterns must match the whole name or version.
#[derive(Debug, Clone)]
pub struct DiscoveryQuery {
    name: Regex,
    version: Option<Regex>,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
}

fn anchored(pattern: &str, key: &str) -> Result<Regex, ConfigurationError> {
    Regex::new(&format!("^(?:{pattern})$"))
        .map_err(|e| ConfigurationError::new(format!("Invalid {key} '{pattern}': {e}")).with_key(key))
}

impl DiscoveryQuery {
    /// Matches algorithms whose name matches `name_pattern`.
    pub fn new(name_pattern: &str) -> Result<Self, ConfigurationError> {
        Ok(Self {
            name: anchored(name_pattern, "name_pattern")?,
            version: None,
            from: None,
            to: None,
        })
    }

    /// Also requires the version (including any hyperparameter suffix) to match.
    pub fn with_version_pattern(mut self, pattern: &str) -> Result<Self, ConfigurationError> {
        self.version = Some(anchored(pattern, "version_pattern")?);
        Ok(self)
    }

    /// Keeps test dates on or after `from`.
    #[must_use]
    pub const fn with_from(mut self, from: NaiveDate) -> Self {
        self.from = Some(from);
        self
    }

    /// Keeps test dates on or before `to`.
    #[must_use]
    pub const fn with_to(mut self, to: NaiveDate) -> Self {
        self.to = Some(to);
        self
    }

    fn accepts(&self, dir: &ResultDirectory) -> bool {
        self.name.is_match(&dir.algorithm_name)
            && self.version.as_ref().map_or(true, |v| v.is_match(&dir.version))
            && self.from.map_or(true, |from| dir.test_date >= from)
            && self.to.map_or(true, |to| dir.test_date <= to)
    }
}

/// One discovered node directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultDirectory {
    /// Directory holding `result.json`.
    pub path: PathBuf,
    /// Algorithm name.
    pub algorithm_name: String,
    /// Version, with the hyperparameter suffix if any.
    pub version: String,
    /// Last training day; absent for untrained algorithms.
    pub last_training_date: Option<NaiveDate>,
    /// Test day.
    pub test_date: NaiveDate,
}

impl ResultDirectory {
    /// Interprets a directory path relative to the metadata root.
    #[must_use]
    pub fn parse(path: &Path, relative: &str) -> Option<Self> {
        let caps = RESULT_DIR.captures(relative)?;
        let last_training_date = match &caps[3] {
            NO_TRAIN_DATE => None,
            date => Some(NaiveDate::parse_from_str(date, DATE_FORMAT).ok()?),
        };
        Some(Self {
            path: path.to_path_buf(),
            algorithm_name: caps[1].to_string(),
            version: caps[2].to_string(),
            last_training_date,
            test_date: parse_date(&caps[4]).ok()?,
        })
    }

    /// The `result.json` of this directory.
    #[must_use]
    pub fn result_file(&self) -> PathBuf {
        self.path.join(RESULT_FILE)
    }

    /// `name@version`.
    #[must_use]
    pub fn slug(&self) -> String {
        format!("{}@{}", self.algorithm_name, self.version)
    }
}

/// Lists node directories below `root` that hold a `result.json` and match `query`.
///
/// Results are sorted by path.
pub fn list_result_dirs(root: &Path, query: &DiscoveryQuery) -> ExpflowResult<Vec<ResultDirectory>> {
    let mut found = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() || entry.file_name() != std::ffi::OsStr::new(RESULT_FILE) {
            continue;
        }
        let Some(dir) = entry.path().parent() else {
            continue;
        };
        let relative = dir.strip_prefix(root).unwrap_or(dir).to_string_lossy().replace('\\', "/");
        if let Some(found_dir) = ResultDirectory::parse(dir, &relative).filter(|d| query.accepts(d)) {
            found.push(found_dir);
        }
    }
    tracing::debug!(root = %root.display(), found = found.len(), "Listed result directories");
    Ok(found)
}

fn nested<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter()
        .try_fold(value, |node, key| node.get(*key))
        .filter(|v| !v.is_null())
}

fn step_metadata<'a>(result: &'a Value, step: &str) -> Option<&'a Value> {
    nested(result, &["steps", step, "metadata"])
}

fn collect_metrics(source: &Value, prefix: &str, out: &mut Map<String, Value>) {
    for key in PLAIN_METRICS {
        if let Some(value) = nested(source, &[key]) {
            out.insert(format!("{prefix}{key}"), value.clone());
        }
    }
    for key in MEAN_METRICS {
        if let Some(value) = nested(source, &[key, "mean"]) {
            out.insert(format!("{prefix}{key}"), value.clone());
        }
    }
}

/// Flattens the evaluation and performance metrics of one result document.
///
/// Returns `None` when the document carries no metric at all.
#[must_use]
pub fn extract_evaluation(result: &Value) -> Option<Value> {
    let mut metrics = Map::new();

    let performance = step_metadata(result, steps::PERFORMANCE_TEST);
    if let Some(latency) = performance.and_then(|p| p.get("response_time_metrics")) {
        for percentile in LATENCY_PERCENTILES {
            if let Some(value) = nested(latency, &[percentile, "mean"]) {
                metrics.insert(percentile.to_string(), value.clone());
            }
        }
    }

    if let Some(evaluation) = step_metadata(result, steps::EVALUATE) {
        collect_metrics(evaluation, "", &mut metrics);
        if let Some(Value::Object(online)) = evaluation.get("online") {
            for (dimension, source) in online {
                collect_metrics(source, &format!("{dimension}."), &mut metrics);
            }
        }
    }

    if metrics.is_empty() {
        return None;
    }

    let mut row = Map::new();
    row.insert(
        "algorithm_id".to_string(),
        result.get("hyperparameter_slug").cloned().unwrap_or(Value::Null),
    );
    row.insert("test_date".to_string(), result.get("test_date").cloned().unwrap_or(Value::Null));
    for key in ["max_memory_usage", "mean_throughput"] {
        row.insert(
            key.to_string(),
            performance.and_then(|p| nested(p, &[key])).cloned().unwrap_or(Value::Null),
        );
    }
    row.extend(metrics);
    Some(Value::Object(row))
}

/// Reads each directory's `result.json` and extracts its evaluation row.
///
/// Directories whose result has vanished or carries no metrics are skipped.
pub fn extract_evaluation_result(dirs: &[ResultDirectory]) -> ExpflowResult<Vec<Value>> {
    let mut rows = Vec::new();
    for dir in dirs {
        let file = dir.result_file();
        if !file.is_file() {
            tracing::debug!(path = %file.display(), "No result, skipping");
            continue;
        }
        let text = std::fs::read_to_string(&file)?;
        let result: Value = serde_json::from_str(&text)
            .map_err(|e| ExpflowError::MalformedResult(format!("{}: {e}", file.display())))?;
        match extract_evaluation(&result) {
            Some(row) => rows.push(row),
            None => tracing::debug!(path = %file.display(), "Result has no metrics"),
        }
    }
    Ok(rows)
}
