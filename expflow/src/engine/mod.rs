//! External compute-engine invocation.
//!
//! The engine is an opaque executable. Each pipeline step that needs it
//! launches one process with a structured argument list built by
//! [`EngineInvocation`]; the free-form training step goes through
//! [`TrainingCommand`] instead.

mod process;
mod training;

pub use process::{run_command, run_shell, shell_quote, ProcessOutput};
pub use training::{TrainingCommand, TrainingVariables};

use crate::context::PipelineContext;
use crate::definition::ExecutionParameters;
use crate::errors::{ConfigurationError, ExpflowResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Engine tasks launched by pipeline steps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineTask {
    /// Build the named feature state.
    GenerateState(String),
    /// Encode raw data into the training format.
    Encode,
    /// Score test data.
    Predict,
    /// Measure scoring latency.
    PerformanceTest,
    /// Produce an audit of feature values.
    Audit,
}

impl EngineTask {
    /// Task name, also the key under `hotvect_execution_parameters`.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::GenerateState(_) => "generate-state",
            Self::Encode => "encode",
            Self::Predict => "predict",
            Self::PerformanceTest => "performance-test",
            Self::Audit => "audit",
        }
    }

    fn flag_args(&self) -> Vec<String> {
        let flag = format!("--{}", self.name());
        match self {
            Self::GenerateState(state) => vec![flag, state.clone()],
            _ => vec![flag],
        }
    }
}

impl fmt::Display for EngineTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GenerateState(state) => write!(f, "generate-state({state})"),
            other => f.write_str(other.name()),
        }
    }
}

/// One engine launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineInvocation {
    task: EngineTask,
    definition_path: PathBuf,
    metadata_path: PathBuf,
    sources: Vec<PathBuf>,
    dest: Option<PathBuf>,
    dest_schema_description: Option<PathBuf>,
    parameters: Option<PathBuf>,
    tuning: ExecutionParameters,
    samples: Option<usize>,
}

impl EngineInvocation {
    /// Creates an invocation writing engine metadata to `metadata_path`.
    #[must_use]
    pub fn new(task: EngineTask, definition_path: impl Into<PathBuf>, metadata_path: impl Into<PathBuf>) -> Self {
        Self {
            task,
            definition_path: definition_path.into(),
            metadata_path: metadata_path.into(),
            sources: Vec::new(),
            dest: None,
            dest_schema_description: None,
            parameters: None,
            tuning: ExecutionParameters::default(),
            samples: None,
        }
    }

    /// Adds source paths.
    #[must_use]
    pub fn with_sources(mut self, sources: impl IntoIterator<Item = PathBuf>) -> Self {
        self.sources.extend(sources);
        self
    }

    /// Sets the destination.
    #[must_use]
    pub fn with_dest(mut self, dest: impl Into<PathBuf>) -> Self {
        self.dest = Some(dest.into());
        self
    }

    /// Sets the schema-description destination.
    #[must_use]
    pub fn with_dest_schema_description(mut self, path: impl Into<PathBuf>) -> Self {
        self.dest_schema_description = Some(path.into());
        self
    }

    /// Sets the parameter package.
    #[must_use]
    pub fn with_parameters(mut self, path: impl Into<PathBuf>) -> Self {
        self.parameters = Some(path.into());
        self
    }

    /// Sets engine tuning.
    #[must_use]
    pub const fn with_tuning(mut self, tuning: ExecutionParameters) -> Self {
        self.tuning = tuning;
        self
    }

    /// Limits the number of records processed.
    #[must_use]
    pub const fn with_samples(mut self, samples: Option<usize>) -> Self {
        self.samples = samples;
        self
    }

    /// Task of this invocation.
    #[must_use]
    pub const fn task(&self) -> &EngineTask {
        &self.task
    }

    /// Arguments following the engine command prefix.
    #[must_use]
    pub fn args(&self, artifact: &Path) -> Vec<String> {
        let mut args = vec![
            "--algorithm-jar".to_string(),
            artifact.display().to_string(),
            "--algorithm-definition".to_string(),
            self.definition_path.display().to_string(),
        ];
        args.extend(self.task.flag_args());
        args.push("--meta-data".to_string());
        args.push(self.metadata_path.display().to_string());
        if !self.sources.is_empty() {
            let joined = self
                .sources
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(",");
            args.push("--source".to_string());
            args.push(joined);
        }
        let optional_paths = [
            ("--dest", &self.dest),
            ("--dest-schema-description", &self.dest_schema_description),
            ("--parameters", &self.parameters),
        ];
        for (flag, value) in optional_paths {
            if let Some(path) = value {
                args.push(flag.to_string());
                args.push(path.display().to_string());
            }
        }
        let optional_numbers = [
            ("--max-threads", self.tuning.max_threads),
            ("--queue-length", self.tuning.queue_length),
            ("--batch-size", self.tuning.batch_size),
            ("--samples", self.samples),
        ];
        for (flag, value) in optional_numbers {
            if let Some(n) = value {
                args.push(flag.to_string());
                args.push(n.to_string());
            }
        }
        args
    }

    /// Launches the engine and returns the parsed metadata document it wrote.
    pub fn run(&self, ctx: &PipelineContext) -> ExpflowResult<serde_json::Value> {
        let (program, prefix) = ctx
            .engine_command()
            .split_first()
            .ok_or_else(|| ConfigurationError::new("Engine command must not be empty"))?;
        if let Some(parent) = self.metadata_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Some(parent) = self.dest.as_deref().and_then(Path::parent) {
            std::fs::create_dir_all(parent)?;
        }

        let mut args = prefix.to_vec();
        args.extend(self.args(ctx.artifact().path()));
        tracing::info!(task = %self.task, metadata = %self.metadata_path.display(), "Running engine task");
        let output = run_command(program, &args, None)?;
        tracing::debug!(task = %self.task, duration_ms = output.duration_ms, "Engine task finished");

        read_metadata(&self.metadata_path)
    }
}

/// Reads an engine metadata document; a missing file yields an empty object.
pub fn read_metadata(path: &Path) -> ExpflowResult<serde_json::Value> {
    match std::fs::read_to_string(path) {
        Ok(text) => serde_json::from_str(&text).map_err(|e| {
            crate::errors::ExpflowError::MalformedResult(format!("{}: {e}", path.display()))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(serde_json::json!({})),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_predict_args() {
        let inv = EngineInvocation::new(EngineTask::Predict, "/m/def.json", "/m/predict.json")
            .with_sources([PathBuf::from("/d/a"), PathBuf::from("/d/b")])
            .with_dest("/o/prediction.jsonl")
            .with_parameters("/o/predict-parameters.zip")
            .with_tuning(ExecutionParameters {
                max_threads: Some(4),
                queue_length: Some(16),
                batch_size: None,
            });
        assert_eq!(
            inv.args(Path::new("/a/algo.jar")),
            vec![
                "--algorithm-jar",
                "/a/algo.jar",
                "--algorithm-definition",
                "/m/def.json",
                "--predict",
                "--meta-data",
                "/m/predict.json",
                "--source",
                "/d/a,/d/b",
                "--dest",
                "/o/prediction.jsonl",
                "--parameters",
                "/o/predict-parameters.zip",
                "--max-threads",
                "4",
                "--queue-length",
                "16",
            ]
        );
    }

    #[test]
    fn test_generate_state_takes_name() {
        let inv = EngineInvocation::new(EngineTask::GenerateState("popularity".into()), "d", "m").with_samples(Some(10));
        let args = inv.args(Path::new("a"));
        let pos = args.iter().position(|a| a == "--generate-state").unwrap();
        assert_eq!(args[pos + 1], "popularity");
        assert_eq!(&args[args.len() - 2..], ["--samples", "10"]);
        assert_eq!(inv.task().name(), "generate-state");
    }

    #[test]
    fn test_read_metadata() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_metadata(&dir.path().join("missing.json")).unwrap(), serde_json::json!({}));
        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{not json").unwrap();
        assert!(matches!(
            read_metadata(&bad),
            Err(crate::errors::ExpflowError::MalformedResult(_))
        ));
    }
}
