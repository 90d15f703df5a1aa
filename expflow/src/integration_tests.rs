//! End-to-end runs against the shell engine in [`crate::testing`].

use crate::batch::remote::LOG_FILE;
use crate::batch::{
    BatchConfig, BatchExecutor, BatchRequest, BatchUnit, DirectoryArtifactResolver, JobDescription, JobStatus,
    JobSubmission, RemoteBackend, RemoteConfig, RemoteDispatcher,
};
use crate::definition::ParameterVersion;
use crate::discovery::{extract_evaluation_result, list_result_dirs, DiscoveryQuery};
use crate::errors::RemoteBackendError;
use crate::evaluation;
use crate::node::steps::{AUDIT, ENCODE, ENCODE_PARAMETERS, PERFORMANCE_TEST, PREDICT, TRAIN};
use crate::node::{NodeRequest, NodeState, PipelineNode, RunOptions, StepStatus, FAILURE_FILE};
use crate::sizing::ExecutionMode;
use crate::storage::archive::list_entries;
use crate::storage::{DirectoryObjectStore, ObjectStore};
use crate::testing::TestWorkspace;
use crate::worker::{run_worker, WorkerJob, WorkerSettings};
use chrono::NaiveDate;
use dashmap::DashMap;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
}

const CUTOFF: u32 = 10;

fn ranker(version: &str) -> Value {
    json!({
        "algorithm_name": "ranker",
        "algorithm_version": version,
        "train_data_location": "events",
        "training": {
            "command": "cp {encodedDataPath} {parameterOutputPath}",
            "cache": "default_location"
        },
        "feature_states": {
            "popularity": { "source": "events", "cache": "default_location" }
        }
    })
}

fn workspace() -> (tempfile::TempDir, TestWorkspace) {
    let dir = tempfile::tempdir().unwrap();
    let ws = TestWorkspace::new(dir.path()).unwrap();
    for d in CUTOFF - 2..=CUTOFF + 1 {
        ws.write_partition("events", day(d), &[json!({"id": 1}), json!({"id": 2})])
            .unwrap();
    }
    (dir, ws)
}

fn run_node(ws: &TestWorkspace, reference: &str, request: NodeRequest) -> crate::node::PipelineResult {
    let ctx = ws.context(reference);
    let cache = ws.cache(&ctx);
    PipelineNode::new(Arc::new(ctx), cache, request).unwrap().run().unwrap()
}

#[test]
fn test_dependency_runs_first_and_is_packaged() {
    let (_dir, ws) = workspace();
    ws.publish(
        "v1",
        json!({
            "algorithm_name": "features",
            "algorithm_version": "1",
            "test_data_location": "events",
            "feature_states": { "popularity": { "source": "events" } }
        }),
    )
    .unwrap();
    let mut definition = ranker("1");
    definition["dependencies"] = json!(["features"]);
    ws.publish("v1", definition).unwrap();

    let result = run_node(&ws, "v1", NodeRequest::for_cutoff("ranker", day(CUTOFF)));

    assert_eq!(result.outcome, NodeState::Tested);
    assert_eq!(result.test_date, Some(day(CUTOFF + 1)));
    let dependency = &result.dependencies["features"];
    assert_eq!(dependency.outcome, NodeState::Tested);
    assert!(dependency.predict_parameters_path().is_file());

    let calls = ws.engine_calls();
    let first_encode = calls.iter().position(|c| c == "encode").unwrap();
    let dependency_predict = calls.iter().position(|c| c == "predict").unwrap();
    assert!(dependency_predict < first_encode, "dependency must be tested before the root encodes: {calls:?}");

    let entries = list_entries(&result.output_dir.join(crate::node::ENCODE_PARAMETERS_FILE)).unwrap();
    assert!(entries.contains(&"dependencies/features/predict-parameters.zip".to_string()));
    assert!(entries.contains(&"states/popularity".to_string()));

    let packaged = list_entries(&result.predict_parameters_path()).unwrap();
    assert!(packaged.contains(&crate::node::MODEL_PARAMETERS_FILE.to_string()));
}

#[test]
fn test_cached_state_and_training_skip_engine_work() {
    let (_dir, ws) = workspace();
    ws.publish("v1", ranker("1")).unwrap();

    let first = run_node(&ws, "v1", NodeRequest::for_cutoff("ranker", day(CUTOFF)));
    assert_eq!(first.step(TRAIN).unwrap().status, StepStatus::Executed);
    assert_eq!(ws.count_calls("generate-state"), 1);
    assert_eq!(ws.count_calls("encode"), 1);

    let second = run_node(
        &ws,
        "v1",
        NodeRequest::for_cutoff("ranker", day(CUTOFF)).with_options(RunOptions::default().with_clean(true)),
    );
    assert!(second.step("generate_state:popularity").unwrap().is_cache_hit());
    assert!(second.step(TRAIN).unwrap().is_cache_hit());
    assert!(second.step(ENCODE).unwrap().is_skipped());
    assert_eq!(ws.count_calls("generate-state"), 1);
    assert_eq!(ws.count_calls("encode"), 1);
    assert_eq!(ws.count_calls("predict"), 2);
    assert_eq!(second.outcome, NodeState::Tested);
}

#[test]
fn test_changed_dependency_definition_misses_parent_cache() {
    let (_dir, ws) = workspace();
    let features = json!({
        "algorithm_name": "features",
        "algorithm_version": "1",
        "test_data_location": "events"
    });
    let mut deeper = features.clone();
    deeper["depth"] = json!(2);
    let mut definition = ranker("1");
    definition["dependencies"] = json!(["features"]);
    ws.publish("v1", features).unwrap();
    ws.publish("v1", definition.clone()).unwrap();
    ws.publish("v2", deeper).unwrap();
    ws.publish("v2", definition).unwrap();
    let rerun = || NodeRequest::for_cutoff("ranker", day(CUTOFF)).with_options(RunOptions::default().with_clean(true));

    let first = run_node(&ws, "v1", NodeRequest::for_cutoff("ranker", day(CUTOFF)));
    assert_eq!(first.step(TRAIN).unwrap().status, StepStatus::Executed);
    let unchanged = run_node(&ws, "v1", rerun());
    assert!(unchanged.step(TRAIN).unwrap().is_cache_hit());

    let changed = run_node(&ws, "v2", rerun());
    assert_eq!(changed.definition_hash, first.definition_hash);
    assert_eq!(changed.step(TRAIN).unwrap().status, StepStatus::Executed);
    assert!(!changed.step("generate_state:popularity").unwrap().is_cache_hit());
    assert_eq!(ws.count_calls("encode"), 2);
}

#[test]
fn test_optional_steps_and_discovery() {
    let (_dir, ws) = workspace();
    ws.publish("v1", ranker("1")).unwrap();

    let plain = run_node(&ws, "v1", NodeRequest::for_cutoff("ranker", day(CUTOFF)));
    assert_eq!(plain.step(PERFORMANCE_TEST).unwrap().skip_reason.as_deref(), Some("disabled"));
    assert_eq!(plain.step(AUDIT).unwrap().skip_reason.as_deref(), Some("disabled"));

    let options = RunOptions::default()
        .with_evaluation_strategy(evaluation::SCORE_SUMMARY)
        .with_performance_test(true)
        .with_audit(true);
    let result = run_node(
        &ws,
        "v1",
        NodeRequest::for_cutoff("ranker", day(CUTOFF)).with_options(options),
    );
    assert_eq!(result.step(PERFORMANCE_TEST).unwrap().status, StepStatus::Executed);
    assert_eq!(result.step(AUDIT).unwrap().status, StepStatus::Executed);
    assert_eq!(ws.count_calls("audit"), 1);

    let ctx = ws.context("v1");
    let query = DiscoveryQuery::new("rank.*")
        .unwrap()
        .with_from(day(CUTOFF + 1))
        .with_to(day(CUTOFF + 1));
    let dirs = list_result_dirs(ctx.metadata_base(), &query).unwrap();
    assert_eq!(dirs.len(), 1);
    assert_eq!(dirs[0].last_training_date, Some(day(CUTOFF)));

    let rows = extract_evaluation_result(&dirs).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["algorithm_id"], json!("ranker@1"));
    assert_eq!(rows[0]["p50"], json!(1.5));
    assert_eq!(rows[0]["mean_score"], json!(0.5));
}

#[test]
fn test_prebuilt_package_skips_training() {
    let (dir, ws) = workspace();
    ws.publish("v1", ranker("1")).unwrap();
    let trained = run_node(&ws, "v1", NodeRequest::for_cutoff("ranker", day(CUTOFF)));
    let package = dir.path().join("prebuilt.zip");
    std::fs::copy(trained.predict_parameters_path(), &package).unwrap();
    let encodes = ws.count_calls("encode");

    let result = run_node(
        &ws,
        "v1",
        NodeRequest::for_cutoff("ranker", day(CUTOFF)).with_options(
            RunOptions::default()
                .with_clean(true)
                .with_prebuilt_parameters(&package),
        ),
    );
    assert!(result.step(ENCODE_PARAMETERS).unwrap().is_skipped());
    assert!(result.step(TRAIN).unwrap().is_skipped());
    assert_eq!(result.step(PREDICT).unwrap().status, StepStatus::Executed);
    assert_eq!(ws.count_calls("encode"), encodes);
    assert!(result.predict_parameters_path().is_file());
}

#[test]
fn test_explicit_parameter_version_skips_test_phase() {
    let (_dir, ws) = workspace();
    ws.publish(
        "v1",
        json!({ "algorithm_name": "lookup", "algorithm_version": "2", "test_data_location": "events" }),
    )
    .unwrap();

    let version = ParameterVersion::explicit("release-7").unwrap();
    let result = run_node(&ws, "v1", NodeRequest::for_parameter_version("lookup", version));

    assert_eq!(result.outcome, NodeState::SkippedExplicitParameter);
    assert!(result.step(PREDICT).unwrap().is_skipped());
    assert!(result.predict_parameters_path().is_file());
    assert!(result.output_dir.ends_with("lookup@2/release-7"));
    assert_eq!(ws.count_calls("predict"), 0);
}

#[test]
fn test_missing_test_partition_is_not_an_error() {
    let (_dir, ws) = workspace();
    ws.publish("v1", ranker("1")).unwrap();

    // cutoff + 1 has no partition
    let result = run_node(&ws, "v1", NodeRequest::for_cutoff("ranker", day(CUTOFF + 1)));
    assert_eq!(result.outcome, NodeState::SkippedNoTestData);
    assert!(result.step(PREDICT).unwrap().is_skipped());
    assert!(result.predict_parameters_path().is_file());
}

fn three_reference_workspace() -> (tempfile::TempDir, TestWorkspace, BatchRequest) {
    let (dir, ws) = workspace();
    let mut request = BatchRequest::new("ranker").with_cutoff(day(CUTOFF));
    for (reference, version) in [("good-a", "1.0"), ("broken", "1.1"), ("good-b", "1.2")] {
        ws.publish(reference, ranker(version)).unwrap();
        request = request.with_reference(reference);
    }
    (dir, ws, request)
}

fn executor(ws: &TestWorkspace, config: BatchConfig) -> BatchExecutor {
    let ctx = ws.context("good-a");
    let cache = ws.cache(&ctx);
    let resolver = Arc::new(DirectoryArtifactResolver::new(ws.root().join("artifacts")));
    BatchExecutor::new(ctx, cache, resolver, config)
}

#[test]
fn test_in_process_batch_isolates_failing_unit() {
    let (_dir, ws, request) = three_reference_workspace();
    let config = BatchConfig::default().with_max_parallelism(1);

    let units = executor(&ws, config).run(&request).unwrap();

    assert_eq!(units.len(), 3);
    assert!(units[0].is_success());
    assert!(units[2].is_success());
    assert!(units[1].result.is_none());
    assert_eq!(units[1].error_type.as_deref(), Some("external_process_error"));
    assert_eq!(
        units[2].result.as_ref().unwrap().hyperparameter_slug,
        "ranker@1.2"
    );
}

#[test]
fn test_crashing_worker_process_fails_its_units() {
    let (_dir, ws, request) = three_reference_workspace();
    let crash = vec!["sh".to_string(), "-c".to_string(), "echo worker crashed >&2; exit 3".to_string()];
    let config = BatchConfig::default().with_max_parallelism(3).with_worker_command(crash);

    let units = executor(&ws, config).run(&request).unwrap();

    assert_eq!(units.len(), 3);
    for unit in &units {
        assert!(unit.result.is_none());
        assert_eq!(unit.error_type.as_deref(), Some("external_process_error"));
        assert!(unit.error.as_deref().unwrap().contains("worker crashed"), "{:?}", unit.error);
    }
    assert_eq!(ws.count_calls("predict"), 0);
}

#[test]
fn test_units_sharing_a_dependency_share_a_lane() {
    let (_dir, ws) = workspace();
    ws.publish(
        "v1",
        json!({ "algorithm_name": "features", "algorithm_version": "1", "test_data_location": "events" }),
    )
    .unwrap();
    let mut definition = ranker("1");
    definition["dependencies"] = json!(["features"]);
    ws.publish("v1", definition).unwrap();
    let mut solo = ranker("1");
    solo["algorithm_name"] = json!("solo");
    ws.publish("v1", solo).unwrap();

    let node = |algorithm: &str, hyperparameter_version: &str| {
        let ctx = ws.context("v1");
        let cache = ws.cache(&ctx);
        let request = NodeRequest::for_cutoff(algorithm, day(CUTOFF))
            .with_override(json!({ "hyperparameter_version": hyperparameter_version }));
        PipelineNode::new(Arc::new(ctx), cache, request).unwrap()
    };
    let nodes = vec![(0, node("ranker", "a")), (1, node("solo", "a")), (2, node("ranker", "b"))];

    assert_eq!(crate::batch::local::lanes(&nodes), vec![vec![0, 2], vec![1]]);
}

#[test]
fn test_batch_rejects_colliding_definitions() {
    let (_dir, ws) = workspace();
    ws.publish("a", ranker("1")).unwrap();
    let mut changed = ranker("1");
    changed["training_days"] = json!(2);
    ws.publish("b", changed).unwrap();
    let request = BatchRequest::new("ranker")
        .with_reference("a")
        .with_reference("b")
        .with_cutoff(day(CUTOFF));

    let units = executor(&ws, BatchConfig::default().with_max_parallelism(1))
        .run(&request)
        .unwrap();

    assert!(units[0].is_success());
    assert_eq!(units[1].error_type.as_deref(), Some("configuration_error"));
    assert!(units[1].error.as_deref().unwrap().contains("different definition"));
}

/// Backend that runs each job in-process as soon as it is submitted.
struct InlineWorkerBackend {
    store: Arc<DirectoryObjectStore>,
    work_root: PathBuf,
    jobs: DashMap<String, JobDescription>,
    /// Jobs of this artifact reference are reported stopped without running.
    stopped_reference: Option<&'static str>,
}

impl InlineWorkerBackend {
    fn new(root: &Path, stopped_reference: Option<&'static str>) -> Self {
        Self {
            store: Arc::new(DirectoryObjectStore::new(root.join("store"))),
            work_root: root.join("workers"),
            jobs: DashMap::new(),
            stopped_reference,
        }
    }
}

impl RemoteBackend for InlineWorkerBackend {
    fn submit(&self, job: &JobSubmission) -> Result<(), RemoteBackendError> {
        let reference = WorkerJob::decode(&job.parameters)
            .map_err(|e| RemoteBackendError::new(e.to_string()).with_job(job.job_name.as_str()))?
            .params
            .reference;
        let description = if self.stopped_reference == Some(reference.as_str()) {
            JobDescription::new(JobStatus::Stopped).with_failure_reason("Terminated by operator")
        } else {
            let store: Arc<dyn ObjectStore> = self.store.clone();
            let settings = WorkerSettings::new(self.work_root.join(&job.job_name));
            match run_worker(&job.parameters, &settings, store) {
                Ok(_) => JobDescription::new(JobStatus::Completed),
                Err(e) => JobDescription::new(JobStatus::Failed).with_failure_reason(e.to_string()),
            }
        };
        self.jobs.insert(job.job_name.clone(), description);
        Ok(())
    }

    fn describe(&self, job_name: &str) -> Result<JobDescription, RemoteBackendError> {
        self.jobs
            .get(job_name)
            .map(|d| d.clone())
            .ok_or_else(|| RemoteBackendError::new("unknown job").with_job(job_name))
    }
}

fn run_remote(ws: &TestWorkspace, backend: &Arc<InlineWorkerBackend>, request: &BatchRequest) -> Vec<BatchUnit> {
    let dispatcher = RemoteDispatcher::new(
        backend.clone(),
        backend.store.clone(),
        RemoteConfig::new("s3://experiments/backtests")
            .with_job_name_prefix("nightly")
            .with_poll_interval_secs(0),
    )
    .unwrap();
    let config = BatchConfig::default()
        .with_mode(ExecutionMode::Remote)
        .with_max_parallelism(2);
    executor(ws, config).with_remote(dispatcher).run(request).unwrap()
}

fn stored_files(root: &Path, name: &str) -> usize {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_name() == name)
        .count()
}

#[test]
fn test_remote_batch_round_trip() {
    let (dir, ws, request) = three_reference_workspace();
    let backend = Arc::new(InlineWorkerBackend::new(dir.path(), None));

    let units = run_remote(&ws, &backend, &request);

    assert_eq!(units.len(), 3);
    assert_eq!(backend.jobs.len(), 3);
    let job_name = units[0].job_name.as_deref().unwrap();
    assert!(job_name.starts_with("nightly-"));

    let result = units[0].result.as_ref().unwrap();
    assert_eq!(result.outcome, NodeState::Tested);
    assert_eq!(result.hyperparameter_slug, "ranker@1.0");
    assert!(result.output_dir.starts_with(dir.path().join("workers").join(job_name)));
    assert!(units[2].is_success());

    assert!(units[1].result.is_none());
    assert_eq!(units[1].error_type.as_deref(), Some("remote_backend_error"));
    assert!(units[1].error.as_deref().unwrap().contains("Failed"));

    // one predict per successful job, none for the broken artifact
    assert_eq!(ws.count_calls("predict"), 2);
    // every job ships its log; the broken one also its own and its node's failure document
    let store_root = dir.path().join("store");
    assert_eq!(stored_files(&store_root, LOG_FILE), 3);
    assert_eq!(stored_files(&store_root, FAILURE_FILE), 2);
}

#[test]
fn test_remote_stopped_job_is_isolated() {
    let (dir, ws, request) = three_reference_workspace();
    let backend = Arc::new(InlineWorkerBackend::new(dir.path(), Some("good-b")));

    let units = run_remote(&ws, &backend, &request);

    assert_eq!(units.len(), 3);
    let result = units[0].result.as_ref().unwrap();
    assert_eq!(result.hyperparameter_slug, "ranker@1.0");
    assert_eq!(result.outcome, NodeState::Tested);

    assert_eq!(units[1].error_type.as_deref(), Some("remote_backend_error"));
    assert!(units[1].error.as_deref().unwrap().contains("Failed"));

    assert!(units[2].result.is_none());
    assert_eq!(units[2].error_type.as_deref(), Some("remote_backend_error"));
    let stopped = units[2].error.as_deref().unwrap();
    assert!(stopped.contains("Stopped") && stopped.contains("Terminated by operator"), "{stopped}");
    assert_eq!(ws.count_calls("predict"), 1);
}
