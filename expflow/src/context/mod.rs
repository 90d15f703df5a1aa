//! Run-wide pipeline context.
//!
//! A [`PipelineContext`] is assembled once per run with its `with_*` methods,
//! validated, and then shared read-only (behind an `Arc`) by every node of the
//! run. It is serializable so a remote worker can rebuild it from the flat
//! parameter channel.

use crate::definition::{AlgorithmArtifact, ExecutionParameters};
use crate::errors::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Immutable environment shared by all nodes in one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineContext {
    /// Run id, used to name scratch space.
    run_id: Uuid,
    /// Engine launch prefix, e.g. `["java", "-cp", "engine.jar", "Main"]`.
    engine_command: Vec<String>,
    /// Algorithm artifact.
    artifact: AlgorithmArtifact,
    /// Root of the date-partitioned input data.
    data_base: PathBuf,
    /// Root of per-node output directories.
    output_base: PathBuf,
    /// Root of per-node metadata directories.
    metadata_base: PathBuf,
    /// Cache root (local path or remote URI) for default-location caching.
    #[serde(default)]
    cache_root: Option<String>,
    /// Scratch space for downloads and temporary files.
    scratch_base: PathBuf,
    /// Default engine tuning.
    #[serde(default)]
    tuning: ExecutionParameters,
    /// Whether engine outputs are gzip-compressed.
    #[serde(default)]
    enable_gzip: bool,
    /// Executable handed to training commands as `{runtimeExecutablePath}`.
    #[serde(default)]
    runtime_executable: Option<PathBuf>,
}

impl PipelineContext {
    /// Creates a context writing outputs below `output_base`.
    ///
    /// Metadata defaults to `{output_base}/metadata` and scratch space to
    /// `{output_base}/scratch`.
    #[must_use]
    pub fn new(
        engine_command: Vec<String>,
        artifact: AlgorithmArtifact,
        data_base: impl Into<PathBuf>,
        output_base: impl Into<PathBuf>,
    ) -> Self {
        let output_base = output_base.into();
        Self {
            run_id: Uuid::now_v7(),
            engine_command,
            artifact,
            data_base: data_base.into(),
            metadata_base: output_base.join("metadata"),
            scratch_base: output_base.join("scratch"),
            output_base,
            cache_root: None,
            tuning: ExecutionParameters::default(),
            enable_gzip: false,
            runtime_executable: None,
        }
    }

    /// Sets the metadata root.
    #[must_use]
    pub fn with_metadata_base(mut self, path: impl Into<PathBuf>) -> Self {
        self.metadata_base = path.into();
        self
    }

    /// Sets the cache root.
    #[must_use]
    pub fn with_cache_root(mut self, root: impl Into<String>) -> Self {
        self.cache_root = Some(root.into());
        self
    }

    /// Sets the scratch root.
    #[must_use]
    pub fn with_scratch_base(mut self, path: impl Into<PathBuf>) -> Self {
        self.scratch_base = path.into();
        self
    }

    /// Sets the default engine tuning.
    #[must_use]
    pub const fn with_tuning(mut self, tuning: ExecutionParameters) -> Self {
        self.tuning = tuning;
        self
    }

    /// Enables gzip-compressed engine outputs.
    #[must_use]
    pub const fn with_gzip(mut self, enable: bool) -> Self {
        self.enable_gzip = enable;
        self
    }

    /// Sets the runtime executable handed to training commands.
    #[must_use]
    pub fn with_runtime_executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.runtime_executable = Some(path.into());
        self
    }

    /// Replaces the artifact, e.g. after a remote worker downloaded it.
    #[must_use]
    pub fn with_artifact(mut self, artifact: AlgorithmArtifact) -> Self {
        self.artifact = artifact;
        self
    }

    /// Moves input data to `data_base` and every owned directory below `work_base`.
    ///
    /// Used by remote workers, whose filesystem layout differs from the submitter's.
    #[must_use]
    pub fn rebased(mut self, data_base: impl Into<PathBuf>, work_base: &Path) -> Self {
        self.data_base = data_base.into();
        self.output_base = work_base.join("output");
        self.metadata_base = work_base.join("metadata");
        self.scratch_base = work_base.join("scratch");
        self
    }

    /// Checks the context is usable.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.engine_command.is_empty() || self.engine_command[0].trim().is_empty() {
            return Err(ConfigurationError::new("Engine command must not be empty").with_key("engine_command"));
        }
        if self.output_base == self.metadata_base {
            return Err(ConfigurationError::new(
                "Output and metadata roots must differ, their trees are owned by different writers",
            ));
        }
        for (key, value) in [
            ("max_threads", self.tuning.max_threads),
            ("queue_length", self.tuning.queue_length),
            ("batch_size", self.tuning.batch_size),
        ] {
            if value == Some(0) {
                return Err(ConfigurationError::new(format!("{key} must be at least 1")).with_key(key));
            }
        }
        Ok(())
    }

    /// Run id.
    #[must_use]
    pub const fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Engine launch prefix.
    #[must_use]
    pub fn engine_command(&self) -> &[String] {
        &self.engine_command
    }

    /// Algorithm artifact.
    #[must_use]
    pub const fn artifact(&self) -> &AlgorithmArtifact {
        &self.artifact
    }

    /// Input data root.
    #[must_use]
    pub fn data_base(&self) -> &Path {
        &self.data_base
    }

    /// Output root.
    #[must_use]
    pub fn output_base(&self) -> &Path {
        &self.output_base
    }

    /// Metadata root.
    #[must_use]
    pub fn metadata_base(&self) -> &Path {
        &self.metadata_base
    }

    /// Cache root, if configured.
    #[must_use]
    pub fn cache_root(&self) -> Option<&str> {
        self.cache_root.as_deref()
    }

    /// Scratch directory of this run.
    #[must_use]
    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_base.join(self.run_id.to_string())
    }

    /// Default engine tuning.
    #[must_use]
    pub const fn tuning(&self) -> ExecutionParameters {
        self.tuning
    }

    /// Whether engine outputs are gzip-compressed.
    #[must_use]
    pub const fn enable_gzip(&self) -> bool {
        self.enable_gzip
    }

    /// Runtime executable for training commands.
    #[must_use]
    pub fn runtime_executable(&self) -> Option<&Path> {
        self.runtime_executable.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn context() -> PipelineContext {
        PipelineContext::new(
            vec!["engine".to_string()],
            AlgorithmArtifact::new("/artifacts/a.jar"),
            "/data",
            "/out",
        )
    }

    #[test]
    fn test_defaults() {
        let ctx = context();
        assert_eq!(ctx.metadata_base(), Path::new("/out/metadata"));
        assert!(ctx.scratch_dir().starts_with("/out/scratch"));
        assert!(ctx.cache_root().is_none());
        assert!(ctx.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let ctx = PipelineContext::new(Vec::new(), AlgorithmArtifact::new("a"), "/d", "/o");
        assert!(ctx.validate().is_err());

        let ctx = context().with_metadata_base("/out");
        assert!(ctx.validate().is_err());

        let ctx = context().with_tuning(ExecutionParameters {
            max_threads: Some(0),
            ..ExecutionParameters::default()
        });
        assert_eq!(ctx.validate().unwrap_err().key.as_deref(), Some("max_threads"));
    }

    #[test]
    fn test_serde_round_trip_and_rebase() {
        let ctx = context().with_cache_root("s3://cache").with_gzip(true);
        let json = serde_json::to_value(&ctx).unwrap();
        let back: PipelineContext = serde_json::from_value(json).unwrap();
        assert_eq!(back, ctx);

        let rebased = back.rebased("/mnt/data", Path::new("/work"));
        assert_eq!(rebased.metadata_base(), Path::new("/work/metadata"));
        assert_eq!(rebased.run_id(), ctx.run_id());
        assert_eq!(rebased.cache_root(), Some("s3://cache"));
    }
}
