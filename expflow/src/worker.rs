//! Remote-side execution of one batch unit.
//!
//! A remote job receives the flat parameter map built by
//! [`crate::batch::RemoteDispatcher`]. [`run_worker`] rebuilds the context,
//! definition and run parameters from it, runs the node in a local work
//! directory and uploads the outcome to the URIs named in the map. The job's
//! log is captured in the work directory and uploaded whether it succeeds or
//! fails.

use crate::batch::remote::{
    validate_parameters, ALGORITHM_ARTIFACT_KEY, ALGO_DEF_PREFIX, LOG_FILE, LOG_FILE_KEY, METADATA_KEY,
    PIPELINE_CONTEXT_PREFIX, PIPELINE_PARAMS_PREFIX, RESULT_FILE_KEY,
};
use crate::cache::CacheResolver;
use crate::codec::{unflatten_strings, FlatParameters};
use crate::context::PipelineContext;
use crate::definition::{AlgorithmArtifact, AlgorithmDefinition, ParameterVersion, NAME_KEY, VERSION_KEY};
use crate::errors::{ConfigurationError, ExpflowError, ExpflowResult};
use crate::node::{write_json, NodeRequest, PipelineNode, PipelineResult, RunOptions, FAILURE_FILE, RESULT_FILE};
use crate::observability::with_log_file;
use crate::storage::{upload_tree, ObjectStore, RemoteUri};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

/// Run parameters shipped under the `_pipeline_params_` prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerParameters {
    /// Root algorithm.
    pub algorithm_name: String,
    /// Artifact reference the job was built from.
    pub reference: String,
    /// Remote job name.
    pub job_name: String,
    /// Training cutoff.
    #[serde(default)]
    pub cutoff: Option<NaiveDate>,
    /// Explicit parameter version, if the submitter chose one.
    #[serde(default)]
    pub parameter_version: Option<ParameterVersion>,
    /// Optional steps.
    #[serde(default)]
    pub options: RunOptions,
}

/// Host-specific settings of a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Directory holding outputs, metadata and scratch space.
    pub work_dir: PathBuf,
    /// Input data root on this host; the submitter's root when absent.
    pub data_base: Option<PathBuf>,
    /// Artifact already present on this host; downloaded when absent.
    pub artifact_path: Option<PathBuf>,
}

impl WorkerSettings {
    /// Settings working below `work_dir`.
    #[must_use]
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            data_base: None,
            artifact_path: None,
        }
    }

    /// Sets the input data root.
    #[must_use]
    pub fn with_data_base(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_base = Some(path.into());
        self
    }

    /// Uses a local artifact instead of downloading it.
    #[must_use]
    pub fn with_artifact_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.artifact_path = Some(path.into());
        self
    }
}

/// The decoded parameter map of one job.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerJob {
    /// Run parameters.
    pub params: WorkerParameters,
    /// Submitter's context.
    pub context: PipelineContext,
    /// Shipped definition tree.
    pub definition: Value,
    /// Destination of `result.json`.
    pub result_uri: RemoteUri,
    /// Destination of the metadata directory.
    pub metadata_uri: Option<RemoteUri>,
    /// Destination of the job log.
    pub log_uri: Option<RemoteUri>,
    /// Source of the algorithm artifact.
    pub artifact_uri: RemoteUri,
}

impl WorkerJob {
    /// Decodes a parameter map.
    pub fn decode(flat: &FlatParameters) -> ExpflowResult<Self> {
        validate_parameters(flat)?;
        let uri = |key: &str| -> Result<Option<RemoteUri>, ConfigurationError> {
            flat.get(key)
                .map(|raw| RemoteUri::parse(raw).map_err(|e| e.with_key(key)))
                .transpose()
        };
        let required = |key: &str| -> Result<RemoteUri, ConfigurationError> {
            uri(key)?.ok_or_else(|| ConfigurationError::new(format!("Missing {key}")).with_key(key))
        };

        Ok(Self {
            params: serde_json::from_value(unflatten_strings(flat, PIPELINE_PARAMS_PREFIX)?)?,
            context: serde_json::from_value(unflatten_strings(flat, PIPELINE_CONTEXT_PREFIX)?)?,
            definition: unflatten_strings(flat, ALGO_DEF_PREFIX)?,
            result_uri: required(RESULT_FILE_KEY)?,
            metadata_uri: uri(METADATA_KEY)?,
            log_uri: uri(LOG_FILE_KEY)?,
            artifact_uri: required(ALGORITHM_ARTIFACT_KEY)?,
        })
    }

    /// Where the failure document goes: into the metadata prefix, else beside the result.
    #[must_use]
    pub fn failure_uri(&self) -> RemoteUri {
        self.metadata_uri
            .as_ref()
            .map_or_else(|| self.result_uri.sibling(FAILURE_FILE), |uri| uri.join(FAILURE_FILE))
    }

    /// Returns true if only the identity was shipped, not the full definition.
    #[must_use]
    pub fn ships_identity_only(&self) -> bool {
        self.definition
            .as_object()
            .is_some_and(|map| map.keys().all(|k| k == NAME_KEY || k == VERSION_KEY))
    }

    fn resolve_definition(&self, artifact: &AlgorithmArtifact) -> ExpflowResult<AlgorithmDefinition> {
        if !self.ships_identity_only() {
            return Ok(AlgorithmDefinition::from_value(self.definition.clone())?);
        }
        let published = artifact.read_definition(&self.params.algorithm_name)?;
        let shipped_version = self.definition.get(VERSION_KEY).and_then(Value::as_str);
        if shipped_version.is_some_and(|v| v != published.version()) {
            return Err(ConfigurationError::new(format!(
                "Job expects {} version {}, the artifact publishes {}",
                published.name(),
                shipped_version.unwrap_or_default(),
                published.version()
            ))
            .into());
        }
        Ok(published)
    }

    fn request(&self, definition: AlgorithmDefinition) -> ExpflowResult<NodeRequest> {
        let params = &self.params;
        let request = match (&params.parameter_version, params.cutoff) {
            (Some(version), cutoff) => {
                let request = NodeRequest::for_parameter_version(&params.algorithm_name, version.clone());
                match cutoff {
                    Some(c) => request.with_cutoff(c),
                    None => request,
                }
            }
            (None, Some(cutoff)) => NodeRequest::for_cutoff(&params.algorithm_name, cutoff),
            (None, None) => {
                return Err(ConfigurationError::new("Job carries neither a cutoff nor a parameter version").into())
            }
        };
        let mut options = params.options.clone();
        // submitter-local path, meaningless here
        options.prebuilt_parameters = None;
        Ok(request.with_definition(definition).with_options(options))
    }

    fn fetch_artifact(&self, settings: &WorkerSettings, store: &dyn ObjectStore) -> ExpflowResult<AlgorithmArtifact> {
        if let Some(path) = &settings.artifact_path {
            return Ok(AlgorithmArtifact::new(path));
        }
        let name = match self.artifact_uri.file_name() {
            "" => "artifact",
            name => name,
        };
        let local = settings.work_dir.join("artifact").join(name);
        store.download(&self.artifact_uri, &local)?;
        tracing::info!(uri = %self.artifact_uri, local = %local.display(), "Downloaded artifact");
        Ok(AlgorithmArtifact::new(local))
    }
}

/// Runs one job and uploads its result.
///
/// Events of the job are written to `worker.log` in the work directory and
/// uploaded to the log URI afterwards. On failure a `failure.json` describing
/// the error is uploaded before the error is returned.
pub fn run_worker(
    flat: &FlatParameters,
    settings: &WorkerSettings,
    store: Arc<dyn ObjectStore>,
) -> ExpflowResult<PipelineResult> {
    let job = WorkerJob::decode(flat)?;
    let log_path = settings.work_dir.join(LOG_FILE);
    let outcome = with_log_file(&log_path, || run_job(&job, settings, &store))?;

    if let Some(uri) = &job.log_uri {
        match store.upload(&log_path, uri) {
            Ok(()) => tracing::debug!(%uri, "Uploaded job log"),
            Err(e) => tracing::warn!(error = %e, %uri, "Could not upload job log"),
        }
    }
    outcome
}

fn run_job(job: &WorkerJob, settings: &WorkerSettings, store: &Arc<dyn ObjectStore>) -> ExpflowResult<PipelineResult> {
    let _span = tracing::info_span!("worker", job_name = %job.params.job_name).entered();
    tracing::info!(
        algorithm = %job.params.algorithm_name,
        reference = %job.params.reference,
        "Starting remote job"
    );

    match execute(job, settings, store) {
        Ok(result) => {
            tracing::info!(outcome = %result.outcome, "Remote job finished");
            Ok(result)
        }
        Err(e) => {
            report_failure(job, settings, store.as_ref(), &e);
            Err(e)
        }
    }
}

fn execute(job: &WorkerJob, settings: &WorkerSettings, store: &Arc<dyn ObjectStore>) -> ExpflowResult<PipelineResult> {
    let artifact = job.fetch_artifact(settings, store.as_ref())?;
    let data_base = settings
        .data_base
        .clone()
        .unwrap_or_else(|| job.context.data_base().to_path_buf());
    let ctx = job
        .context
        .clone()
        .with_artifact(artifact)
        .rebased(data_base, &settings.work_dir);
    let request = job.request(job.resolve_definition(ctx.artifact())?)?;

    let ctx = Arc::new(ctx);
    let cache = Arc::new(
        CacheResolver::new(ctx.cache_root().map(str::to_string), ctx.scratch_dir()).with_object_store(Arc::clone(store)),
    );
    let node = PipelineNode::new(Arc::clone(&ctx), cache, request)?;
    let result_file = node.root().metadata_dir.join(RESULT_FILE);
    let result = node.run()?;

    if let Some(uri) = &job.metadata_uri {
        upload_tree(store.as_ref(), ctx.metadata_base(), uri)?;
    }
    store.upload(&result_file, &job.result_uri)?;
    Ok(result)
}

fn report_failure(job: &WorkerJob, settings: &WorkerSettings, store: &dyn ObjectStore, error: &ExpflowError) {
    tracing::error!(error = %error, error_type = error.category(), "Remote job failed");
    let failure = json!({
        "job_name": job.params.job_name,
        "algorithm": job.params.algorithm_name,
        "reference": job.params.reference,
        "error": error.to_string(),
        "error_type": error.category(),
        "failed_at": Utc::now(),
    });
    let path = settings.work_dir.join(FAILURE_FILE);
    let metadata = settings.work_dir.join("metadata");
    let uploaded = write_json(&path, &failure)
        .and_then(|()| store.upload(&path, &job.failure_uri()))
        .and_then(|()| match &job.metadata_uri {
            Some(uri) if metadata.is_dir() => upload_tree(store, &metadata, uri).map(|_| ()),
            _ => Ok(()),
        });
    if let Err(e) = uploaded {
        tracing::warn!(error = %e, "Could not upload failure report");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::flatten;
    use crate::storage::MockObjectStore;
    use pretty_assertions::assert_eq;
    use std::path::Path;

    fn flat_job(definition: &Value) -> FlatParameters {
        let ctx = PipelineContext::new(vec!["engine".into()], AlgorithmArtifact::new("/a/x.jar"), "/data", "/out");
        let params = WorkerParameters {
            algorithm_name: "ranker".into(),
            reference: "v1".into(),
            job_name: "expflow-a-b-2024-03-02".into(),
            cutoff: NaiveDate::from_ymd_opt(2024, 3, 1),
            parameter_version: None,
            options: RunOptions::default().with_prebuilt_parameters("/local/p.zip"),
        };
        let mut flat = flatten(definition, ALGO_DEF_PREFIX).unwrap();
        flat.extend(flatten(&serde_json::to_value(&ctx).unwrap(), PIPELINE_CONTEXT_PREFIX).unwrap());
        flat.extend(flatten(&serde_json::to_value(&params).unwrap(), PIPELINE_PARAMS_PREFIX).unwrap());
        flat.insert(RESULT_FILE_KEY.into(), "s3://b/runs/job/ranker@1/pv/result.json".into());
        flat.insert(ALGORITHM_ARTIFACT_KEY.into(), "s3://b/runs/artifacts/v1/x.jar".into());
        flat
    }

    #[test]
    fn test_decode_round_trip() {
        let definition = json!({"algorithm_name": "ranker", "algorithm_version": "1", "training_days": 3});
        let job = WorkerJob::decode(&flat_job(&definition)).unwrap();
        assert_eq!(job.definition, definition);
        assert_eq!(job.params.reference, "v1");
        assert_eq!(job.context.data_base(), std::path::Path::new("/data"));
        assert_eq!(job.artifact_uri.file_name(), "x.jar");
        assert!(job.metadata_uri.is_none());
        assert!(!job.ships_identity_only());

        let request = job
            .request(AlgorithmDefinition::from_value(definition).unwrap())
            .unwrap();
        assert_eq!(request.cutoff, NaiveDate::from_ymd_opt(2024, 3, 1));
        assert!(request.options.prebuilt_parameters.is_none());
    }

    #[test]
    fn test_missing_mandatory_key_rejected() {
        let definition = json!({"algorithm_name": "ranker", "algorithm_version": "1"});
        let mut flat = flat_job(&definition);
        flat.remove(RESULT_FILE_KEY);
        assert!(matches!(WorkerJob::decode(&flat), Err(ExpflowError::Configuration(_))));
    }

    #[test]
    fn test_identity_only_reads_artifact() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("ranker-algorithm-definition.json"),
            r#"{"algorithm_name": "ranker", "algorithm_version": "1", "training_days": 5}"#,
        )
        .unwrap();
        let artifact = AlgorithmArtifact::new(dir.path());

        let job = WorkerJob::decode(&flat_job(&json!({"algorithm_name": "ranker", "algorithm_version": "1"}))).unwrap();
        assert!(job.ships_identity_only());
        assert_eq!(job.resolve_definition(&artifact).unwrap().get("training_days"), Some(&json!(5)));

        let stale = WorkerJob::decode(&flat_job(&json!({"algorithm_name": "ranker", "algorithm_version": "2"}))).unwrap();
        assert!(stale.resolve_definition(&artifact).is_err());
    }

    #[test]
    fn test_failed_job_uploads_failure_and_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut flat = flat_job(&json!({"algorithm_name": "ranker", "algorithm_version": "1"}));
        flat.insert(LOG_FILE_KEY.into(), "s3://b/runs/job/ranker@1/pv/worker.log".into());

        let mut store = MockObjectStore::new();
        store
            .expect_download()
            .times(1)
            .returning(|_, _| Err(std::io::Error::other("bucket unreachable").into()));
        store
            .expect_upload()
            .withf(|local: &Path, uri: &RemoteUri| {
                uri.to_string() == "s3://b/runs/job/ranker@1/pv/failure.json"
                    && std::fs::read_to_string(local).is_ok_and(|text| text.contains("bucket unreachable"))
            })
            .times(1)
            .returning(|_, _| Ok(()));
        store
            .expect_upload()
            .withf(|local: &Path, uri: &RemoteUri| {
                uri.to_string() == "s3://b/runs/job/ranker@1/pv/worker.log" && local.is_file()
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let err = run_worker(&flat, &WorkerSettings::new(dir.path()), Arc::new(store)).unwrap_err();
        assert_eq!(err.category(), "io_error");
        let log = std::fs::read_to_string(dir.path().join(LOG_FILE)).unwrap();
        assert!(log.contains("Remote job failed"), "{log}");
    }

    #[test]
    fn test_failure_uri_prefers_metadata_prefix() {
        let definition = json!({"algorithm_name": "ranker", "algorithm_version": "1"});
        let job = WorkerJob::decode(&flat_job(&definition)).unwrap();
        assert_eq!(job.failure_uri().to_string(), "s3://b/runs/job/ranker@1/pv/failure.json");

        let mut flat = flat_job(&definition);
        flat.insert(METADATA_KEY.into(), "s3://b/runs/job/ranker@1/pv/metadata".into());
        let job = WorkerJob::decode(&flat).unwrap();
        assert_eq!(
            job.failure_uri().to_string(),
            "s3://b/runs/job/ranker@1/pv/metadata/failure.json"
        );
    }
}
