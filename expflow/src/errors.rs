//! Error types for the expflow orchestrator.
//!
//! Every failure the orchestrator can raise falls into one of four categories:
//! configuration problems, external process failures, remote backend failures
//! and (non-fatal) cache failures. Each category is a standalone error struct so
//! callers can match on it, and [`ExpflowError`] wraps them all.

use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result alias used throughout the crate.
pub type ExpflowResult<T> = Result<T, ExpflowError>;

/// The main error type for expflow operations.
#[derive(Debug, Error)]
pub enum ExpflowError {
    /// Invalid configuration. Never retried.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// The engine or the training command exited unsuccessfully.
    #[error("{0}")]
    ExternalProcess(#[from] ExternalProcessError),

    /// A remote job failed or the backend was unreachable.
    #[error("{0}")]
    RemoteBackend(#[from] RemoteBackendError),

    /// Persisting or materializing a cache entry failed.
    #[error("{0}")]
    Cache(#[from] CacheError),

    /// A step's required upstream artifact does not exist.
    #[error("{0}")]
    MissingArtifact(#[from] MissingArtifactError),

    /// A result or metadata document could not be interpreted.
    #[error("Malformed result: {0}")]
    MalformedResult(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Reading or writing a zip archive failed.
    #[error("Archive error: {0}")]
    Archive(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExpflowError {
    /// Short category name, recorded in failure documents.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_error",
            Self::ExternalProcess(_) => "external_process_error",
            Self::RemoteBackend(_) => "remote_backend_error",
            Self::Cache(_) => "cache_error",
            Self::MissingArtifact(_) => "missing_artifact",
            Self::MalformedResult(_) => "malformed_result",
            Self::Serialization(_) => "serialization_error",
            Self::Archive(_) => "archive_error",
            Self::Io(_) => "io_error",
        }
    }

    /// Returns true for errors that only degrade caching.
    #[must_use]
    pub const fn is_non_fatal(&self) -> bool {
        matches!(self, Self::Cache(_))
    }
}

impl From<serde_json::Error> for ExpflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<zip::result::ZipError> for ExpflowError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::Archive(err.to_string())
    }
}

impl From<walkdir::Error> for ExpflowError {
    fn from(err: walkdir::Error) -> Self {
        Self::Io(err.into())
    }
}

/// Invalid identity, illegal override, missing mandatory keys and similar.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Configuration error: {message}")]
pub struct ConfigurationError {
    /// Human-readable message.
    pub message: String,
    /// Offending key or path, if any.
    pub key: Option<String>,
}

impl ConfigurationError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            key: None,
        }
    }

    /// Sets the offending key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// A launched process exited non-zero (or could not be observed to exit).
#[derive(Debug, Clone, Error)]
pub struct ExternalProcessError {
    /// The rendered command line.
    pub command: String,
    /// Exit code, `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl ExternalProcessError {
    /// Creates a new external process error.
    #[must_use]
    pub fn new(command: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self {
            command: command.into(),
            exit_code,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    /// Attaches captured output.
    #[must_use]
    pub fn with_output(mut self, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        self.stdout = stdout.into();
        self.stderr = stderr.into();
        self
    }
}

impl fmt::Display for ExternalProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exit_code {
            Some(code) => write!(f, "Process `{}` exited with code {code}", self.command)?,
            None => write!(f, "Process `{}` terminated by signal", self.command)?,
        }
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            write!(f, "\nstderr:\n{stderr}")?;
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            write!(f, "\nstdout:\n{stdout}")?;
        }
        Ok(())
    }
}

/// A remote job failed, or the backend could not be reached.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Remote backend error{}: {message}", job_suffix(.job_name.as_deref()))]
pub struct RemoteBackendError {
    /// Remote job name, when the failure is tied to a job.
    pub job_name: Option<String>,
    /// Failure reason reported by the backend.
    pub message: String,
}

fn job_suffix(job_name: Option<&str>) -> String {
    job_name.map(|name| format!(" (job {name})")).unwrap_or_default()
}

impl RemoteBackendError {
    /// Creates a new remote backend error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            job_name: None,
            message: message.into(),
        }
    }

    /// Sets the job name.
    #[must_use]
    pub fn with_job(mut self, job_name: impl Into<String>) -> Self {
        self.job_name = Some(job_name.into());
        self
    }
}

/// Persisting or reading a cache entry failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Cache error at '{location}': {message}")]
pub struct CacheError {
    /// The cache location involved.
    pub location: String,
    /// What went wrong.
    pub message: String,
}

impl CacheError {
    /// Creates a new cache error.
    #[must_use]
    pub fn new(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            message: message.into(),
        }
    }
}

/// A step could not find the artifact it depends on.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Step '{step}' requires '{}', which does not exist", .path.display())]
pub struct MissingArtifactError {
    /// Step that needed the artifact.
    pub step: String,
    /// Expected location.
    pub path: PathBuf,
}

impl MissingArtifactError {
    /// Creates a new missing artifact error.
    #[must_use]
    pub fn new(step: impl Into<String>, path: impl AsRef<Path>) -> Self {
        Self {
            step: step.into(),
            path: path.as_ref().to_path_buf(),
        }
    }
}

/// Fails with [`MissingArtifactError`] unless `path` exists.
pub fn require_artifact(step: &str, path: &Path) -> ExpflowResult<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(MissingArtifactError::new(step, path).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error_display() {
        let err = ConfigurationError::new("bad name").with_key("algorithm_name");
        assert_eq!(err.to_string(), "Configuration error: bad name");
        assert_eq!(err.key.as_deref(), Some("algorithm_name"));
    }

    #[test]
    fn test_external_process_error_includes_stderr() {
        let err = ExternalProcessError::new("engine --encode", Some(3)).with_output("", "boom\n");
        let msg = err.to_string();
        assert!(msg.contains("exited with code 3"));
        assert!(msg.contains("boom"));
    }

    #[test]
    fn test_remote_error_job_suffix() {
        let err = RemoteBackendError::new("OOM").with_job("job-1");
        assert_eq!(err.to_string(), "Remote backend error (job job-1): OOM");
        assert_eq!(
            RemoteBackendError::new("down").to_string(),
            "Remote backend error: down"
        );
    }

    #[test]
    fn test_category_and_fatality() {
        let err: ExpflowError = CacheError::new("/tmp/x", "read-only").into();
        assert!(err.is_non_fatal());
        assert_eq!(err.category(), "cache_error");

        let err: ExpflowError = ConfigurationError::new("x").into();
        assert!(!err.is_non_fatal());
    }

    #[test]
    fn test_require_artifact() {
        let dir = tempfile::tempdir().unwrap();
        assert!(require_artifact("train", dir.path()).is_ok());
        let missing = dir.path().join("nope");
        let err = require_artifact("train", &missing).unwrap_err();
        assert!(matches!(err, ExpflowError::MissingArtifact(_)));
    }
}
