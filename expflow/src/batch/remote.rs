//! Remote batch-job dispatch.
//!
//! Every unit becomes one remote job. The job receives a flat string map:
//! the resolved definition under [`ALGO_DEF_PREFIX`], the pipeline context
//! under [`PIPELINE_CONTEXT_PREFIX`], the run parameters under
//! [`PIPELINE_PARAMS_PREFIX`], and the destination URIs under fixed keys.
//! The worker on the other side (see [`crate::worker`]) rebuilds the node from
//! that map and uploads its `result.json` to [`RESULT_FILE_KEY`].

use super::unit::BatchUnit;
use crate::codec::{flatten, FlatParameters};
use crate::errors::{ConfigurationError, ExpflowError, ExpflowResult, RemoteBackendError};
use crate::node::{PipelineNode, PipelineResult, RESULT_FILE};
use crate::schedule::DATE_FORMAT;
use crate::storage::{upload_tree, ObjectStore, RemoteUri};
use crate::worker::WorkerParameters;
use chrono::NaiveDate;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Prefix of the flattened algorithm definition.
pub const ALGO_DEF_PREFIX: &str = "_algo_def_";
/// Prefix of the flattened pipeline context.
pub const PIPELINE_CONTEXT_PREFIX: &str = "_pipeline_context_";
/// Prefix of the flattened [`WorkerParameters`].
pub const PIPELINE_PARAMS_PREFIX: &str = "_pipeline_params_";

/// Where the worker uploads `result.json`.
pub const RESULT_FILE_KEY: &str = "s3_uri_result_file";
/// Where the worker uploads its metadata directory.
pub const METADATA_KEY: &str = "s3_uri_metadata";
/// Where the worker uploads its log.
pub const LOG_FILE_KEY: &str = "s3_uri_log_file";
/// Where the worker downloads the algorithm artifact from.
pub const ALGORITHM_ARTIFACT_KEY: &str = "s3_uri_algorithm_jar";

/// Keys a job cannot run without.
pub const MANDATORY_KEYS: [&str; 4] = [
    RESULT_FILE_KEY,
    ALGORITHM_ARTIFACT_KEY,
    "_algo_def_algorithm_name",
    "_algo_def_algorithm_version",
];

/// File name of the worker log below a job's destination.
pub const LOG_FILE: &str = "worker.log";
/// Longest job name remote backends accept.
pub const MAX_JOB_NAME_LEN: usize = 63;

const DEFAULT_JOB_NAME_PREFIX: &str = "expflow";
const MAX_JOB_NAME_ATTEMPTS: usize = 16;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
const BASE62: &[u8; 62] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Remote job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    /// Running.
    InProgress,
    /// Being stopped.
    Stopping,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Stopped before finishing.
    Stopped,
}

impl JobStatus {
    /// Returns true once the job can no longer change state.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InProgress => "InProgress",
            Self::Stopping => "Stopping",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Stopped => "Stopped",
        };
        f.write_str(s)
    }
}

/// What the backend reports about a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescription {
    /// Current status.
    pub status: JobStatus,
    /// Backend-provided reason for a failed or stopped job.
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl JobDescription {
    /// A description with no failure reason.
    #[must_use]
    pub const fn new(status: JobStatus) -> Self {
        Self {
            status,
            failure_reason: None,
        }
    }

    /// Attaches a failure reason.
    #[must_use]
    pub fn with_failure_reason(mut self, reason: impl Into<String>) -> Self {
        self.failure_reason = Some(reason.into());
        self
    }
}

/// A job ready for submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSubmission {
    /// Unique job name; also the handle for [`RemoteBackend::describe`].
    pub job_name: String,
    /// Caller-supplied backend job specification.
    pub job_spec: Value,
    /// Flat parameter channel.
    pub parameters: FlatParameters,
}

/// A remote batch backend. Submitted jobs cannot be cancelled.
#[cfg_attr(test, mockall::automock)]
pub trait RemoteBackend: Send + Sync {
    /// Submits a job without waiting for it.
    fn submit(&self, job: &JobSubmission) -> Result<(), RemoteBackendError>;

    /// Reports the current state of a submitted job.
    fn describe(&self, job_name: &str) -> Result<JobDescription, RemoteBackendError>;
}

fn default_job_name_prefix() -> String {
    DEFAULT_JOB_NAME_PREFIX.to_string()
}

const fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

/// Remote dispatch settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Leading part of every job name.
    #[serde(default = "default_job_name_prefix")]
    pub job_name_prefix: String,
    /// Object-store prefix below which jobs write their outputs.
    pub remote_output_base: String,
    /// Seconds between status polls.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Backend job specification passed through untouched.
    #[serde(default)]
    pub job_spec: Value,
}

impl RemoteConfig {
    /// Settings writing below `remote_output_base`.
    #[must_use]
    pub fn new(remote_output_base: impl Into<String>) -> Self {
        Self {
            job_name_prefix: default_job_name_prefix(),
            remote_output_base: remote_output_base.into(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            job_spec: Value::Null,
        }
    }

    /// Sets the job name prefix.
    #[must_use]
    pub fn with_job_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.job_name_prefix = prefix.into();
        self
    }

    /// Sets the poll interval.
    #[must_use]
    pub const fn with_poll_interval_secs(mut self, secs: u64) -> Self {
        self.poll_interval_secs = secs;
        self
    }

    /// Sets the backend job specification.
    #[must_use]
    pub fn with_job_spec(mut self, job_spec: Value) -> Self {
        self.job_spec = job_spec;
        self
    }
}

/// Encodes `n` with the alphabet `a-zA-Z0-9`, least significant digit first.
#[must_use]
pub fn base62(mut n: u64) -> String {
    if n == 0 {
        return (BASE62[0] as char).to_string();
    }
    let mut out = String::new();
    while n > 0 {
        #[allow(clippy::cast_possible_truncation)]
        out.push(BASE62[(n % 62) as usize] as char);
        n /= 62;
    }
    out
}

/// Builds a job name from a random `token` and the hyperparameter version.
///
/// The token keeps repeated submissions apart, the hash tells overrides apart
/// at a glance. Only the prefix is shortened to fit [`MAX_JOB_NAME_LEN`].
#[must_use]
pub fn job_name(prefix: &str, hyperparameter_version: &str, test_date: NaiveDate, token: u32) -> String {
    let mut prefix: String = prefix
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();
    if prefix.is_empty() {
        prefix = DEFAULT_JOB_NAME_PREFIX.to_string();
    }
    let digest = Md5::digest(hyperparameter_version.as_bytes());
    // first six hex digits
    let hash = (u64::from(digest[0]) << 16) | (u64::from(digest[1]) << 8) | u64::from(digest[2]);

    let suffix = format!(
        "-{}-{}-{}",
        base62(u64::from(token)),
        base62(hash),
        test_date.format(DATE_FORMAT)
    );
    // the prefix is ASCII, so byte truncation keeps it valid
    prefix.truncate(MAX_JOB_NAME_LEN.saturating_sub(suffix.len()));
    prefix + &suffix
}

/// Draws names from `candidate` until one is not in `taken`.
pub fn unique_job_name(
    taken: &mut HashSet<String>,
    mut candidate: impl FnMut() -> String,
) -> Result<String, ConfigurationError> {
    for _ in 0..MAX_JOB_NAME_ATTEMPTS {
        let name = candidate();
        if taken.insert(name.clone()) {
            return Ok(name);
        }
    }
    Err(ConfigurationError::new(format!(
        "No unique job name after {MAX_JOB_NAME_ATTEMPTS} attempts"
    ))
    .with_key("job_name_prefix"))
}

/// Fails if any of [`MANDATORY_KEYS`] is missing or empty.
pub fn validate_parameters(parameters: &FlatParameters) -> Result<(), ConfigurationError> {
    let missing: Vec<&str> = MANDATORY_KEYS
        .iter()
        .copied()
        .filter(|key| parameters.get(*key).map_or(true, |v| v.trim().is_empty()))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ConfigurationError::new(format!("Remote job is missing mandatory parameters: {}", missing.join(", ")))
            .with_key(missing[0]))
    }
}

struct PreparedJob {
    submission: JobSubmission,
    result_uri: RemoteUri,
    local_result: PathBuf,
}

struct Outstanding {
    index: usize,
    job_name: String,
    result_uri: RemoteUri,
    local_result: PathBuf,
}

/// Submits units as remote jobs and collects their results.
pub struct RemoteDispatcher {
    backend: Arc<dyn RemoteBackend>,
    store: Arc<dyn ObjectStore>,
    config: RemoteConfig,
    output_base: RemoteUri,
}

impl fmt::Debug for RemoteDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteDispatcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RemoteDispatcher {
    /// Creates a dispatcher.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] if the output base is not a remote URI.
    pub fn new(
        backend: Arc<dyn RemoteBackend>,
        store: Arc<dyn ObjectStore>,
        config: RemoteConfig,
    ) -> Result<Self, ConfigurationError> {
        let output_base =
            RemoteUri::parse(&config.remote_output_base).map_err(|e| e.with_key("remote_output_base"))?;
        Ok(Self {
            backend,
            store,
            config,
            output_base,
        })
    }

    /// Dispatch settings.
    #[must_use]
    pub const fn config(&self) -> &RemoteConfig {
        &self.config
    }

    /// Destination prefix of one job's node: `{base}/{job}/{slug}/{parameterVersion}`.
    #[must_use]
    pub fn job_destination(&self, job_name: &str, slug: &str, parameter_version: &str) -> RemoteUri {
        self.output_base.join(job_name).join(slug).join(parameter_version)
    }

    /// Submits every configured unit, then polls until all jobs are terminal.
    ///
    /// Units without a node already carry an error and are left alone.
    pub(crate) fn run(&self, units: &mut [BatchUnit], nodes: Vec<Option<PipelineNode>>) {
        let mut staged: HashMap<String, Result<RemoteUri, (&'static str, String)>> = HashMap::new();
        let mut taken = HashSet::new();
        let mut outstanding = Vec::new();

        for (index, node) in nodes.into_iter().enumerate() {
            let Some(node) = node else {
                continue;
            };
            let unit = &mut units[index];
            let artifact_uri = staged
                .entry(unit.reference.clone())
                .or_insert_with(|| {
                    self.stage_artifact(&unit.reference, &node)
                        .map_err(|e| (e.category(), e.to_string()))
                })
                .clone();
            let artifact_uri = match artifact_uri {
                Ok(uri) => uri,
                Err((category, message)) => {
                    unit.fail_with(category, message);
                    continue;
                }
            };

            let submitted = self.prepare(unit, &node, &artifact_uri, &mut taken).and_then(|job| {
                self.backend.submit(&job.submission)?;
                Ok(job)
            });
            match submitted {
                Ok(job) => {
                    tracing::info!(unit = index, job_name = %job.submission.job_name, "Submitted remote job");
                    unit.job_name = Some(job.submission.job_name.clone());
                    outstanding.push(Outstanding {
                        index,
                        job_name: job.submission.job_name,
                        result_uri: job.result_uri,
                        local_result: job.local_result,
                    });
                }
                Err(e) => unit.fail(&e),
            }
        }

        self.await_jobs(units, outstanding);
    }

    fn stage_artifact(&self, reference: &str, node: &PipelineNode) -> ExpflowResult<RemoteUri> {
        let path = node.context().artifact().path();
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("artifact");
        let uri = self.output_base.join("artifacts").join(reference).join(name);
        if path.is_dir() {
            upload_tree(self.store.as_ref(), path, &uri)?;
        } else {
            self.store.upload(path, &uri)?;
        }
        tracing::info!(reference, %uri, "Staged artifact");
        Ok(uri)
    }

    fn prepare(
        &self,
        unit: &BatchUnit,
        node: &PipelineNode,
        artifact_uri: &RemoteUri,
        taken: &mut HashSet<String>,
    ) -> ExpflowResult<PreparedJob> {
        let root = node.root();
        let test_date = root
            .window
            .map(|w| w.test_date)
            .ok_or_else(|| ConfigurationError::new(format!("{} has no test date to name its job", root.slug())))?;
        let hyperparameter_version = root.identity.hyperparameter_version.as_deref().unwrap_or_default();

        let job_name = unique_job_name(taken, || {
            job_name(
                &self.config.job_name_prefix,
                hyperparameter_version,
                test_date,
                rand::random::<u32>(),
            )
        })?;
        let destination = self.job_destination(&job_name, &root.slug(), root.parameter_version.as_str());

        let params = WorkerParameters {
            algorithm_name: root.identity.name.clone(),
            reference: unit.reference.clone(),
            job_name: job_name.clone(),
            cutoff: root.cutoff,
            parameter_version: root.explicit_version.then(|| root.parameter_version.clone()),
            options: node.options().clone(),
        };

        let mut parameters = flatten(&root.definition.to_value(), ALGO_DEF_PREFIX)?;
        parameters.extend(flatten(&serde_json::to_value(node.context())?, PIPELINE_CONTEXT_PREFIX)?);
        parameters.extend(flatten(&serde_json::to_value(&params)?, PIPELINE_PARAMS_PREFIX)?);

        let result_uri = destination.join(RESULT_FILE);
        parameters.insert(RESULT_FILE_KEY.to_string(), result_uri.to_string());
        parameters.insert(METADATA_KEY.to_string(), destination.join("metadata").to_string());
        parameters.insert(LOG_FILE_KEY.to_string(), destination.join(LOG_FILE).to_string());
        parameters.insert(ALGORITHM_ARTIFACT_KEY.to_string(), artifact_uri.to_string());
        validate_parameters(&parameters)?;

        Ok(PreparedJob {
            local_result: node.context().scratch_dir().join("remote").join(&job_name).join(RESULT_FILE),
            submission: JobSubmission {
                job_name,
                job_spec: self.config.job_spec.clone(),
                parameters,
            },
            result_uri,
        })
    }

    fn await_jobs(&self, units: &mut [BatchUnit], mut outstanding: Vec<Outstanding>) {
        let interval = Duration::from_secs(self.config.poll_interval_secs);
        while !outstanding.is_empty() {
            outstanding.retain(|job| match self.backend.describe(&job.job_name) {
                Ok(description) if !description.status.is_terminal() => true,
                Ok(description) => {
                    tracing::info!(job_name = %job.job_name, status = %description.status, "Remote job finished");
                    match self.collect(job, &description) {
                        Ok(result) => units[job.index].succeed(result),
                        Err(e) => units[job.index].fail(&e),
                    }
                    false
                }
                Err(e) => {
                    units[job.index].fail(&ExpflowError::from(e));
                    false
                }
            });
            if !outstanding.is_empty() {
                tracing::info!(
                    outstanding = outstanding.len(),
                    interval_secs = self.config.poll_interval_secs,
                    "Remote jobs still running"
                );
                std::thread::sleep(interval);
            }
        }
    }

    fn collect(&self, job: &Outstanding, description: &JobDescription) -> ExpflowResult<PipelineResult> {
        if description.status != JobStatus::Completed {
            let reason = description
                .failure_reason
                .as_deref()
                .unwrap_or("no failure reason reported");
            return Err(RemoteBackendError::new(format!("Job ended {}: {reason}", description.status))
                .with_job(job.job_name.as_str())
                .into());
        }
        self.store.download(&job.result_uri, &job.local_result)?;
        let text = std::fs::read_to_string(&job.local_result)?;
        serde_json::from_str(&text).map_err(|e| ExpflowError::MalformedResult(format!("{}: {e}", job.result_uri)))
    }
}
