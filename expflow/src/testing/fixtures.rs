//! Workspaces for end-to-end pipeline tests.

use super::engine::{engine_calls, install_fake_engine};
use crate::cache::CacheResolver;
use crate::context::PipelineContext;
use crate::definition::{definition_entry_name, AlgorithmArtifact, AlgorithmDefinition};
use crate::errors::ExpflowResult;
use crate::schedule::DATE_FORMAT;
use chrono::NaiveDate;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A self-contained directory tree: fake engine, artifacts, data and outputs.
///
/// ```text
/// {root}/engine/      fake engine and its call log
/// {root}/artifacts/   one directory per artifact reference
/// {root}/data/        date-partitioned input data
/// {root}/out/         node outputs, metadata and scratch
/// {root}/cache/       default cache root
/// ```
#[derive(Debug, Clone)]
pub struct TestWorkspace {
    root: PathBuf,
    engine_command: Vec<String>,
}

impl TestWorkspace {
    /// Lays out the workspace below `root` and installs the fake engine.
    pub fn new(root: impl Into<PathBuf>) -> ExpflowResult<Self> {
        let root = root.into();
        let engine_command = install_fake_engine(&root.join("engine"))?;
        for dir in ["artifacts", "data", "out"] {
            std::fs::create_dir_all(root.join(dir))?;
        }
        Ok(Self { root, engine_command })
    }

    /// Workspace root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of the artifact named `reference`.
    #[must_use]
    pub fn artifact_dir(&self, reference: &str) -> PathBuf {
        self.root.join("artifacts").join(reference)
    }

    /// Input data root.
    #[must_use]
    pub fn data_base(&self) -> PathBuf {
        self.root.join("data")
    }

    /// Output root.
    #[must_use]
    pub fn output_base(&self) -> PathBuf {
        self.root.join("out")
    }

    /// Default cache root.
    #[must_use]
    pub fn cache_root(&self) -> PathBuf {
        self.root.join("cache")
    }

    /// Publishes `definition` into the artifact `reference`.
    pub fn publish(&self, reference: &str, definition: Value) -> ExpflowResult<AlgorithmDefinition> {
        let definition = AlgorithmDefinition::from_value(definition)?;
        let dir = self.artifact_dir(reference);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(
            dir.join(definition_entry_name(definition.name())),
            definition.to_json_pretty()?,
        )?;
        Ok(definition)
    }

    /// Writes JSON-lines `rows` into the partition of `location` for `date`.
    pub fn write_partition(&self, location: &str, date: NaiveDate, rows: &[Value]) -> ExpflowResult<PathBuf> {
        let dir = self
            .data_base()
            .join(location)
            .join(format!("dt={}", date.format(DATE_FORMAT)));
        std::fs::create_dir_all(&dir)?;
        let mut text = String::new();
        for row in rows {
            text.push_str(&serde_json::to_string(row)?);
            text.push('\n');
        }
        std::fs::write(dir.join("part-00000.jsonl"), text)?;
        Ok(dir)
    }

    /// Context running the fake engine against the artifact `reference`.
    #[must_use]
    pub fn context(&self, reference: &str) -> PipelineContext {
        PipelineContext::new(
            self.engine_command.clone(),
            AlgorithmArtifact::new(self.artifact_dir(reference)),
            self.data_base(),
            self.output_base(),
        )
        .with_cache_root(self.cache_root().display().to_string())
    }

    /// Cache resolver for [`Self::context`].
    #[must_use]
    pub fn cache(&self, ctx: &PipelineContext) -> Arc<CacheResolver> {
        Arc::new(CacheResolver::new(
            ctx.cache_root().map(str::to_string),
            ctx.scratch_dir(),
        ))
    }

    /// Tasks the fake engine ran, as `<task> <state>` lines.
    #[must_use]
    pub fn engine_calls(&self) -> Vec<String> {
        engine_calls(&self.root.join("engine"))
    }

    /// Number of engine runs of `task`.
    #[must_use]
    pub fn count_calls(&self, task: &str) -> usize {
        self.engine_calls()
            .iter()
            .filter(|line| line.split_whitespace().next() == Some(task))
            .count()
    }
}
