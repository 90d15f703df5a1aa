//! Runs the steps of one configured node.

use super::graph::GraphNode;
use super::result::{FeatureStates, PipelineResult, StepResult};
use super::steps::{
    AUDIT, ENCODE, ENCODE_PARAMETERS, ENCODE_TEST, EVALUATE, GENERATE_STATE, PERFORMANCE_TEST, PREDICT,
    PREDICT_PARAMETERS, TRAIN,
};
use super::{
    write_json, NodeState, RunOptions, ALGORITHM_PARAMETERS_FILE, DEFINITION_FILE, ENCODE_PARAMETERS_FILE,
    FAILURE_FILE, MODEL_PARAMETERS_FILE, PREDICT_PARAMETERS_FILE, RESULT_FILE,
};
use crate::cache::{CacheDescriptor, CacheIdentity, CacheLookup, CacheResolver};
use crate::context::PipelineContext;
use crate::definition::{CachePolicy, TrainingConfig};
use crate::engine::{EngineInvocation, EngineTask, TrainingCommand, TrainingVariables};
use crate::errors::{require_artifact, ConfigurationError, ExpflowResult};
use crate::evaluation::{self, EvaluationInput};
use crate::observability::StepTimer;
use crate::schedule::{training_dates, DATE_FORMAT};
use crate::storage::archive::{write_package, PackageEntry};
use crate::storage::{fs, Location};
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const TEST_STEPS: [&str; 5] = [PREDICT, EVALUATE, PERFORMANCE_TEST, ENCODE_TEST, AUDIT];

pub(super) struct NodeExecutor<'a> {
    ctx: &'a PipelineContext,
    cache: &'a CacheResolver,
    options: &'a RunOptions,
    node: &'a GraphNode,
    dependencies: BTreeMap<String, PipelineResult>,
    state: NodeState,
    steps: BTreeMap<String, StepResult>,
    timings: BTreeMap<String, f64>,
    ran_at: DateTime<Utc>,
}

impl<'a> NodeExecutor<'a> {
    pub(super) fn new(
        ctx: &'a PipelineContext,
        cache: &'a CacheResolver,
        options: &'a RunOptions,
        node: &'a GraphNode,
        dependencies: BTreeMap<String, PipelineResult>,
    ) -> Self {
        Self {
            ctx,
            cache,
            options,
            node,
            dependencies,
            state: NodeState::Init,
            steps: BTreeMap::new(),
            timings: BTreeMap::new(),
            ran_at: Utc::now(),
        }
    }

    /// Executes every step; on failure writes a failure document next to the metadata.
    pub(super) fn run(mut self) -> ExpflowResult<PipelineResult> {
        let node = self.node;
        let span = tracing::info_span!(
            "node",
            algorithm = %node.slug(),
            parameter_version = %node.parameter_version,
        );
        let _entered = span.enter();
        tracing::info!("Running node");

        match self.execute() {
            Ok(outcome) => {
                let result = self.into_result(outcome)?;
                write_json(&node.metadata_dir.join(RESULT_FILE), &result)?;
                tracing::info!(outcome = %outcome, duration_ms = result.total_duration_ms(), "Node finished");
                Ok(result)
            }
            Err(err) => {
                tracing::error!(error = %err, state = %self.state, "Node failed");
                let failure = json!({
                    "algorithm": node.slug(),
                    "parameter_version": node.parameter_version,
                    "state": self.state,
                    "error": err.to_string(),
                    "error_type": err.category(),
                    "failed_at": Utc::now(),
                    "steps": self.steps,
                });
                if let Err(write_err) = write_json(&node.metadata_dir.join(FAILURE_FILE), &failure) {
                    tracing::warn!(error = %write_err, "Could not write failure document");
                }
                Err(err)
            }
        }
    }

    fn execute(&mut self) -> ExpflowResult<NodeState> {
        let node = self.node;
        if self.options.clean {
            tracing::info!(output = %node.output_dir.display(), "Cleaning node directories");
            fs::remove_path(&node.output_dir)?;
            fs::remove_path(&node.metadata_dir)?;
        }
        std::fs::create_dir_all(&node.output_dir)?;
        std::fs::create_dir_all(&node.metadata_dir)?;
        write_json(&self.definition_path(), &node.definition.to_value())?;
        self.advance(NodeState::DependenciesResolved)?;

        let (predict_parameters, encode_parameters) = match self.prebuilt_package() {
            Some(package) => (self.adopt_prebuilt(&package)?, None),
            None => {
                let states = self.generate_states()?;
                let encode_parameters = self.package_encode_parameters(&states)?;
                self.advance(NodeState::EncodeParamsReady)?;
                let trained = match &node.layout.training {
                    Some(training) => Some(self.train(training, &encode_parameters)?),
                    None => None,
                };
                let predict_parameters = self.package_predict_parameters(&encode_parameters, trained.as_deref())?;
                (predict_parameters, Some(encode_parameters))
            }
        };
        self.advance(NodeState::PredictParamsReady)?;

        let outcome = self.test_phase(&predict_parameters, encode_parameters.as_deref())?;
        self.advance(outcome)?;
        Ok(outcome)
    }

    fn into_result(mut self, outcome: NodeState) -> ExpflowResult<PipelineResult> {
        self.advance(NodeState::Done)?;
        let node = self.node;
        Ok(PipelineResult {
            algorithm: node.identity.clone(),
            hyperparameter_slug: node.slug(),
            parameter_version: node.parameter_version.clone(),
            last_training_date: node.window.and_then(|w| w.last_training_date),
            test_date: node.window.map(|w| w.test_date),
            ran_at: self.ran_at,
            outcome,
            algorithm_definition: node.definition.to_value(),
            definition_hash: node.definition_hash.clone(),
            steps: self.steps,
            timings: self.timings,
            dependencies: self.dependencies,
            output_dir: node.output_dir.clone(),
            metadata_dir: node.metadata_dir.clone(),
        })
    }

    fn advance(&mut self, next: NodeState) -> ExpflowResult<()> {
        let from = self.state;
        self.state = from.transition_to(next)?;
        tracing::debug!(from = %from, to = %next, "Node state transition");
        Ok(())
    }

    fn record(&mut self, step: &str, result: StepResult) {
        tracing::info!(
            step,
            status = %result.status,
            duration_ms = result.duration_ms,
            "Step finished"
        );
        self.timings.insert(step.to_string(), result.duration_ms);
        self.steps.insert(step.to_string(), result);
    }

    fn timed(
        &mut self,
        step: &str,
        body: impl FnOnce(&Self) -> ExpflowResult<StepResult>,
    ) -> ExpflowResult<()> {
        let timer = StepTimer::start(step);
        let outcome = body(&*self);
        let duration = timer.finish();
        match outcome {
            Ok(result) => {
                self.record(step, result.with_duration(duration));
                Ok(())
            }
            Err(err) => {
                self.record(step, StepResult::error(err.to_string()).with_duration(duration));
                Err(err)
            }
        }
    }

    // paths

    fn definition_path(&self) -> PathBuf {
        self.node.metadata_dir.join(DEFINITION_FILE)
    }

    fn step_metadata_path(&self, step: &str) -> PathBuf {
        self.node.metadata_dir.join(format!("{}.json", step.replace(':', "-")))
    }

    fn with_compression(&self, name: &str) -> PathBuf {
        let name = if self.ctx.enable_gzip() {
            format!("{name}.gz")
        } else {
            name.to_string()
        };
        self.node.output_dir.join(name)
    }

    fn partition(&self, location: &str, date: NaiveDate) -> PathBuf {
        self.ctx
            .data_base()
            .join(location)
            .join(format!("dt={}", date.format(DATE_FORMAT)))
    }

    fn training_partitions(&self, location: &str, step: &str) -> ExpflowResult<Vec<PathBuf>> {
        let cutoff = self.node.cutoff.ok_or_else(|| {
            ConfigurationError::new(format!("Step '{step}' of {} needs a cutoff", self.node.slug()))
        })?;
        let partitions: Vec<PathBuf> = training_dates(cutoff, self.node.layout.training_days)?
            .into_iter()
            .map(|date| self.partition(location, date))
            .collect();
        for partition in &partitions {
            require_artifact(step, partition)?;
        }
        Ok(partitions)
    }

    // engine and cache plumbing

    fn invocation(&self, task: EngineTask, step: &str) -> EngineInvocation {
        let tuning = self
            .node
            .layout
            .execution_parameters(task.name())
            .or(self.ctx.tuning());
        EngineInvocation::new(task, self.definition_path(), self.step_metadata_path(step))
            .with_tuning(tuning)
            .with_samples(self.options.samples)
    }

    fn cache_lookup(&self, policy: &CachePolicy, logical_path: &str) -> ExpflowResult<CacheLookup> {
        let identity = CacheIdentity {
            hyperparameter_slug: self.node.slug(),
            parameter_version: self.node.parameter_version.to_string(),
            definition_hash: self.node.lineage_hash.clone(),
        };
        self.cache
            .lookup(&CacheDescriptor::new(policy.clone(), logical_path), &identity)
    }

    fn reuse(&self, step: &str, location: &Location, local: &Path, output: &Path) -> ExpflowResult<StepResult> {
        if local != output {
            fs::link_or_copy(local, output)?;
        }
        tracing::info!(step, %location, "Reusing cached output");
        Ok(StepResult::from_cache(location))
    }

    fn store(&self, lookup: &CacheLookup, output: &Path) {
        if let CacheLookup::Miss { location } = lookup {
            self.cache.persist_or_warn(location, output);
        }
    }

    /// Reuses a cache hit, or produces `output` and persists it after a miss.
    fn cached(
        &self,
        step: &str,
        policy: &CachePolicy,
        logical_path: &str,
        output: &Path,
        produce: impl FnOnce() -> ExpflowResult<Value>,
    ) -> ExpflowResult<StepResult> {
        let lookup = self.cache_lookup(policy, logical_path)?;
        if let CacheLookup::Hit { location, local } = &lookup {
            return self.reuse(step, location, local, output);
        }
        let metadata = produce()?;
        require_artifact(step, output)?;
        self.store(&lookup, output);
        Ok(StepResult::executed(metadata))
    }

    // parameter preparation

    fn prebuilt_package(&self) -> Option<PathBuf> {
        if self.node.prebuilt {
            self.options.prebuilt_parameters.clone()
        } else {
            None
        }
    }

    fn adopt_prebuilt(&mut self, package: &Path) -> ExpflowResult<PathBuf> {
        let reason = "prebuilt parameter package supplied";
        self.record(ENCODE_PARAMETERS, StepResult::skipped(reason));
        if self.node.layout.has_training() {
            self.record(ENCODE, StepResult::skipped(reason));
            self.record(TRAIN, StepResult::skipped(reason));
        }
        let target = self.node.output_dir.join(PREDICT_PARAMETERS_FILE);
        self.timed(PREDICT_PARAMETERS, |_| {
            require_artifact(PREDICT_PARAMETERS, package)?;
            if package != target.as_path() {
                fs::link_or_copy(package, &target)?;
            }
            Ok(StepResult::from_prebuilt(package))
        })?;
        Ok(target)
    }

    fn generate_states(&mut self) -> ExpflowResult<FeatureStates> {
        let node = self.node;
        let mut states = FeatureStates::default();
        for (name, config) in &node.layout.feature_states {
            let step = format!("{GENERATE_STATE}:{name}");
            let logical_path = format!("states/{name}");
            let output = node.output_dir.join(&logical_path);
            self.timed(&step, |this| {
                this.cached(&step, &config.cache, &logical_path, &output, || {
                    let sources = this.training_partitions(&config.source, &step)?;
                    this.invocation(EngineTask::GenerateState(name.clone()), &step)
                        .with_sources(sources)
                        .with_dest(&output)
                        .run(this.ctx)
                })
            })?;
            states = states.with_state(name.as_str(), output);
        }
        Ok(states)
    }

    fn package_encode_parameters(&mut self, states: &FeatureStates) -> ExpflowResult<PathBuf> {
        let node = self.node;
        let output = node.output_dir.join(ENCODE_PARAMETERS_FILE);
        let mut entries = vec![PackageEntry::new(DEFINITION_FILE, self.definition_path())];
        for (name, path) in states.iter() {
            entries.push(PackageEntry::new(format!("states/{name}"), path));
        }
        for (name, dependency) in &self.dependencies {
            let package = dependency.predict_parameters_path();
            require_artifact(ENCODE_PARAMETERS, &package)?;
            entries.push(PackageEntry::new(
                format!("dependencies/{name}/{PREDICT_PARAMETERS_FILE}"),
                package,
            ));
        }

        self.timed(ENCODE_PARAMETERS, |this| {
            this.cached(
                ENCODE_PARAMETERS,
                &node.layout.encode_parameters.cache,
                ENCODE_PARAMETERS_FILE,
                &output,
                || {
                    write_package(&output, &entries)?;
                    Ok(json!({ "entries": entries.iter().map(|e| e.name.as_str()).collect::<Vec<_>>() }))
                },
            )
        })?;
        Ok(output)
    }

    fn encode_training_data(&mut self, encode_parameters: &Path) -> ExpflowResult<PathBuf> {
        let node = self.node;
        let location = node.layout.train_data_location.as_deref().ok_or_else(|| {
            ConfigurationError::new(format!("{} declares training but no train_data_location", node.slug()))
                .with_key("train_data_location")
        })?;
        let encoded = node.output_dir.join("encoded");
        self.timed(ENCODE, |this| {
            let sources = this.training_partitions(location, ENCODE)?;
            let metadata = this
                .invocation(EngineTask::Encode, ENCODE)
                .with_sources(sources)
                .with_dest(&encoded)
                .with_dest_schema_description(node.output_dir.join("encoded-schema-description.json"))
                .with_parameters(encode_parameters)
                .run(this.ctx)?;
            require_artifact(ENCODE, &encoded)?;
            Ok(StepResult::executed(metadata))
        })?;
        Ok(encoded)
    }

    fn train(&mut self, training: &TrainingConfig, encode_parameters: &Path) -> ExpflowResult<PathBuf> {
        let node = self.node;
        let parameter_output = node.output_dir.join(MODEL_PARAMETERS_FILE);
        // consult the cache first so a hit also saves the encode step
        let lookup = self.cache_lookup(&training.cache, MODEL_PARAMETERS_FILE)?;
        if let CacheLookup::Hit { location, local } = &lookup {
            self.record(ENCODE, StepResult::skipped("trained parameters cached"));
            self.advance(NodeState::TrainReady)?;
            self.timed(TRAIN, |this| this.reuse(TRAIN, location, local, &parameter_output))?;
            self.advance(NodeState::Trained)?;
            return Ok(parameter_output);
        }

        let encoded = self.encode_training_data(encode_parameters)?;
        self.advance(NodeState::TrainReady)?;

        self.timed(TRAIN, |this| {
            let variables = TrainingVariables {
                algorithm_definition_path: this.definition_path(),
                algorithm_artifact_path: this.ctx.artifact().path().to_path_buf(),
                encoded_data_path: encoded.clone(),
                encoded_schema_description_path: node.output_dir.join("encoded-schema-description.json"),
                parameter_output_path: parameter_output.clone(),
                scratch_dir: this
                    .ctx
                    .scratch_dir()
                    .join(node.slug())
                    .join(node.parameter_version.as_str()),
                runtime_executable_path: this.ctx.runtime_executable().map(Path::to_path_buf),
            };
            let output = TrainingCommand::new(&training.command).run(&variables)?;
            require_artifact(TRAIN, &parameter_output)?;
            this.store(&lookup, &parameter_output);
            Ok(StepResult::executed(json!({ "command_duration_ms": output.duration_ms })))
        })?;
        self.advance(NodeState::Trained)?;
        Ok(parameter_output)
    }

    fn package_predict_parameters(
        &mut self,
        encode_parameters: &Path,
        trained: Option<&Path>,
    ) -> ExpflowResult<PathBuf> {
        let node = self.node;
        let output = node.output_dir.join(PREDICT_PARAMETERS_FILE);
        let algorithm_parameters = node.output_dir.join(ALGORITHM_PARAMETERS_FILE);

        self.timed(PREDICT_PARAMETERS, |this| {
            this.cached(
                PREDICT_PARAMETERS,
                &node.layout.predict_parameters.cache,
                PREDICT_PARAMETERS_FILE,
                &output,
                || {
                    write_json(
                        &algorithm_parameters,
                        &json!({
                            "algorithm_name": node.identity.name,
                            "algorithm_version": node.identity.version,
                            "hyperparameter_version": node.identity.hyperparameter_version,
                            "parameter_version": node.parameter_version,
                            "last_training_date": node.window.and_then(|w| w.last_training_date),
                            "definition_hash": node.definition_hash,
                        }),
                    )?;
                    let mut entries = vec![
                        PackageEntry::new(ALGORITHM_PARAMETERS_FILE, &algorithm_parameters),
                        PackageEntry::new(ENCODE_PARAMETERS_FILE, encode_parameters),
                    ];
                    if let Some(parameters) = trained {
                        entries.push(PackageEntry::new(MODEL_PARAMETERS_FILE, parameters));
                    }
                    write_package(&output, &entries)?;
                    Ok(json!({ "trained": trained.is_some() }))
                },
            )
        })?;
        Ok(output)
    }

    // test phase

    fn skip_test_steps(&mut self, reason: &str) {
        for step in TEST_STEPS {
            self.record(step, StepResult::skipped(reason));
        }
    }

    fn test_phase(&mut self, predict_parameters: &Path, encode_parameters: Option<&Path>) -> ExpflowResult<NodeState> {
        let node = self.node;
        let window = match node.window {
            Some(window) if !node.explicit_version => window,
            _ => {
                self.skip_test_steps("explicit parameter version names no test window");
                return Ok(NodeState::SkippedExplicitParameter);
            }
        };
        let Some(location) = node.layout.test_location() else {
            self.skip_test_steps("no test data location declared");
            return Ok(NodeState::SkippedNoTestData);
        };
        let test_data = self.partition(location, window.test_date);
        if !test_data.exists() {
            tracing::info!(test_data = %test_data.display(), "No test data for cutoff");
            self.skip_test_steps(&format!("no test data for {}", window.test_date.format(DATE_FORMAT)));
            return Ok(NodeState::SkippedNoTestData);
        }

        let prediction = self.with_compression("prediction.jsonl");
        self.timed(PREDICT, |this| {
            let metadata = this
                .invocation(EngineTask::Predict, PREDICT)
                .with_sources([test_data.clone()])
                .with_dest(&prediction)
                .with_parameters(predict_parameters)
                .run(this.ctx)?;
            require_artifact(PREDICT, &prediction)?;
            Ok(StepResult::executed(metadata))
        })?;

        let strategy = evaluation::strategy(&self.options.evaluation_strategy)?;
        self.timed(EVALUATE, |this| {
            let null = Value::Null;
            let predict_metadata = this.steps.get(PREDICT).map_or(&null, |s| &s.metadata);
            let evaluation = strategy.evaluate(&EvaluationInput {
                prediction: &prediction,
                test_data: &test_data,
                predict_metadata,
            })?;
            write_json(&this.step_metadata_path(EVALUATE), &evaluation)?;
            Ok(StepResult::executed(evaluation))
        })?;

        if self.options.run_performance_test {
            self.timed(PERFORMANCE_TEST, |this| {
                let metadata = this
                    .invocation(EngineTask::PerformanceTest, PERFORMANCE_TEST)
                    .with_sources([test_data.clone()])
                    .with_parameters(predict_parameters)
                    .run(this.ctx)?;
                Ok(StepResult::executed(metadata))
            })?;
        } else {
            self.record(PERFORMANCE_TEST, StepResult::skipped("disabled"));
        }

        match (self.options.run_encode_test, encode_parameters) {
            (false, _) => self.record(ENCODE_TEST, StepResult::skipped("disabled")),
            (true, None) => self.record(
                ENCODE_TEST,
                StepResult::skipped("no encode parameters with a prebuilt package"),
            ),
            (true, Some(encode_parameters)) => {
                let encoded = node.output_dir.join("encoded-test");
                self.timed(ENCODE_TEST, |this| {
                    let metadata = this
                        .invocation(EngineTask::Encode, ENCODE_TEST)
                        .with_sources([test_data.clone()])
                        .with_dest(&encoded)
                        .with_dest_schema_description(node.output_dir.join("encoded-test-schema-description.json"))
                        .with_parameters(encode_parameters)
                        .run(this.ctx)?;
                    require_artifact(ENCODE_TEST, &encoded)?;
                    Ok(StepResult::executed(metadata))
                })?;
            }
        }

        if self.options.run_audit {
            let audit = self.with_compression("audit.jsonl");
            self.timed(AUDIT, |this| {
                let metadata = this
                    .invocation(EngineTask::Audit, AUDIT)
                    .with_sources([test_data.clone()])
                    .with_dest(&audit)
                    .with_parameters(predict_parameters)
                    .run(this.ctx)?;
                Ok(StepResult::executed(metadata))
            })?;
        } else {
            self.record(AUDIT, StepResult::skipped("disabled"));
        }

        Ok(NodeState::Tested)
    }
}
