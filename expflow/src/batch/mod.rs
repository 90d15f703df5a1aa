//! Batch execution of many pipeline nodes.
//!
//! A batch is the cross product of artifact references, definition overrides
//! and cutoffs. Every combination becomes a [`BatchUnit`] placeholder before
//! anything runs. Units then run locally or as remote jobs through a
//! [`RemoteDispatcher`]. Locally, a pool of one runs units on the calling
//! thread; a larger [`WorkerPool`] runs them in `expflow-worker` child
//! processes (see [`local`]). A unit's failure is recorded on that unit and
//! never aborts its siblings.

pub mod artifact;
pub mod local;
pub mod pool;
pub mod remote;
mod unit;

pub use artifact::{ArtifactResolver, CommandArtifactResolver, DirectoryArtifactResolver};
pub use pool::WorkerPool;
pub use remote::{JobDescription, JobStatus, JobSubmission, RemoteBackend, RemoteConfig, RemoteDispatcher};
pub use unit::BatchUnit;

use crate::cache::CacheResolver;
use crate::context::PipelineContext;
use crate::definition::{AlgorithmArtifact, ExecutionParameters};
use crate::errors::{ConfigurationError, ExpflowResult};
use crate::node::{ExecutionMemo, PipelineNode, RunOptions};
use crate::schedule::BacktestPlan;
use crate::sizing::{ConcurrencySetting, ExecutionMode, ResourceSizer};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Batch-wide settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Local pool or remote jobs.
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Core budget for local sizing; the host's parallelism when absent.
    #[serde(default)]
    pub max_parallelism: Option<usize>,
    /// Options applied to every unit.
    #[serde(default)]
    pub options: RunOptions,
    /// Command that runs a lane of local units, `--local-lane <file>` appended.
    /// The `expflow-worker` binary when absent.
    #[serde(default)]
    pub worker_command: Option<Vec<String>>,
}

impl BatchConfig {
    /// Sets the execution mode.
    #[must_use]
    pub const fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Caps the core budget.
    #[must_use]
    pub const fn with_max_parallelism(mut self, cores: usize) -> Self {
        self.max_parallelism = Some(cores);
        self
    }

    /// Sets the per-unit run options.
    #[must_use]
    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the command local worker processes are started with.
    #[must_use]
    pub fn with_worker_command(mut self, command: Vec<String>) -> Self {
        self.worker_command = Some(command);
        self
    }

    fn cores(&self) -> usize {
        self.max_parallelism.unwrap_or_else(ResourceSizer::available_cores)
    }
}

/// What to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    /// Root algorithm of every unit.
    pub algorithm_name: String,
    /// Artifact references.
    pub references: Vec<String>,
    /// Definition overrides; empty means the published definition only.
    #[serde(default)]
    pub overrides: Vec<Value>,
    /// Training cutoffs.
    pub cutoffs: Vec<NaiveDate>,
}

impl BatchRequest {
    /// An empty request for `algorithm_name`.
    #[must_use]
    pub fn new(algorithm_name: impl Into<String>) -> Self {
        Self {
            algorithm_name: algorithm_name.into(),
            references: Vec::new(),
            overrides: Vec::new(),
            cutoffs: Vec::new(),
        }
    }

    /// Adds an artifact reference.
    #[must_use]
    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.references.push(reference.into());
        self
    }

    /// Adds a definition override.
    #[must_use]
    pub fn with_override(mut self, definition_override: Value) -> Self {
        self.overrides.push(definition_override);
        self
    }

    /// Adds a cutoff.
    #[must_use]
    pub fn with_cutoff(mut self, cutoff: NaiveDate) -> Self {
        self.cutoffs.push(cutoff);
        self
    }

    /// Adds every cutoff of a backtest plan.
    pub fn with_plan(mut self, plan: &BacktestPlan) -> Result<Self, ConfigurationError> {
        self.cutoffs.extend(plan.cutoffs()?);
        Ok(self)
    }

    fn override_variants(&self) -> Vec<Option<Value>> {
        if self.overrides.is_empty() {
            vec![None]
        } else {
            self.overrides.iter().cloned().map(Some).collect()
        }
    }

    /// Placeholders for every reference × override × cutoff, in that nesting order.
    #[must_use]
    pub fn units(&self) -> Vec<BatchUnit> {
        let mut units = Vec::new();
        for reference in &self.references {
            for definition_override in self.override_variants() {
                for cutoff in &self.cutoffs {
                    units.push(BatchUnit::new(
                        units.len(),
                        reference.clone(),
                        self.algorithm_name.clone(),
                        definition_override.clone(),
                        *cutoff,
                    ));
                }
            }
        }
        units
    }
}

type ResolvedArtifacts = HashMap<String, Result<AlgorithmArtifact, (&'static str, String)>>;

/// Runs batches.
pub struct BatchExecutor {
    ctx: PipelineContext,
    cache: Arc<CacheResolver>,
    resolver: Arc<dyn ArtifactResolver>,
    config: BatchConfig,
    remote: Option<RemoteDispatcher>,
}

impl std::fmt::Debug for BatchExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchExecutor")
            .field("config", &self.config)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl BatchExecutor {
    /// Creates an executor. `ctx` is the template every unit's context derives from.
    #[must_use]
    pub fn new(
        ctx: PipelineContext,
        cache: Arc<CacheResolver>,
        resolver: Arc<dyn ArtifactResolver>,
        config: BatchConfig,
    ) -> Self {
        Self {
            ctx,
            cache,
            resolver,
            config,
            remote: None,
        }
    }

    /// Dispatches units remotely when the mode is [`ExecutionMode::Remote`].
    #[must_use]
    pub fn with_remote(mut self, dispatcher: RemoteDispatcher) -> Self {
        self.remote = Some(dispatcher);
        self
    }

    /// Allocation for `request`: references × overrides are the items, cutoffs the repetitions.
    pub fn concurrency(&self, request: &BatchRequest) -> Result<ConcurrencySetting, ConfigurationError> {
        let items = request.references.len() * request.override_variants().len();
        ResourceSizer::recommend(items, request.cutoffs.len(), self.config.cores(), self.config.mode)
    }

    /// Runs every unit of `request`.
    ///
    /// Returns one unit per combination in request order, each with either a
    /// result or an error.
    ///
    /// # Errors
    ///
    /// Fails only when the request yields no units or the batch itself is
    /// misconfigured; unit failures are reported on the units.
    pub fn run(&self, request: &BatchRequest) -> ExpflowResult<Vec<BatchUnit>> {
        let mut units = request.units();
        if units.is_empty() {
            return Err(ConfigurationError::new("Batch needs at least one reference and one cutoff").into());
        }
        if self.config.mode == ExecutionMode::Remote && self.remote.is_none() {
            return Err(ConfigurationError::new("Remote mode needs a remote dispatcher").with_key("mode").into());
        }
        let setting = self.concurrency(request)?;
        tracing::info!(
            algorithm = %request.algorithm_name,
            units = units.len(),
            mode = ?self.config.mode,
            %setting,
            "Starting batch"
        );

        let artifacts = self.resolve_artifacts(&units);
        let mut nodes = self.configure(&mut units, &artifacts, &setting);
        check_collisions(&mut units, &mut nodes);

        match &self.remote {
            Some(dispatcher) if self.config.mode == ExecutionMode::Remote => dispatcher.run(&mut units, nodes),
            _ => self.run_local(&mut units, nodes, &setting)?,
        }

        let failed = units.iter().filter(|u| !u.is_success()).count();
        tracing::info!(units = units.len(), failed, "Batch finished");
        Ok(units)
    }

    fn resolve_artifacts(&self, units: &[BatchUnit]) -> ResolvedArtifacts {
        let mut artifacts = ResolvedArtifacts::new();
        for unit in units {
            artifacts.entry(unit.reference.clone()).or_insert_with(|| {
                tracing::info!(reference = %unit.reference, "Resolving artifact");
                self.resolver
                    .resolve(&unit.reference)
                    .map_err(|e| (e.category(), e.to_string()))
            });
        }
        artifacts
    }

    fn configure(
        &self,
        units: &mut [BatchUnit],
        artifacts: &ResolvedArtifacts,
        setting: &ConcurrencySetting,
    ) -> Vec<Option<PipelineNode>> {
        let tuning = self.ctx.tuning().or(ExecutionParameters {
            max_threads: setting.engine_threads(),
            queue_length: setting.engine_queue_length(),
            batch_size: None,
        });

        units
            .iter_mut()
            .map(|unit| {
                let artifact = match artifacts.get(&unit.reference) {
                    Some(Ok(artifact)) => artifact.clone(),
                    Some(Err((category, message))) => {
                        unit.fail_with(*category, message.clone());
                        return None;
                    }
                    None => {
                        unit.fail_with("configuration_error", format!("Reference '{}' was not resolved", unit.reference));
                        return None;
                    }
                };
                let ctx = self.ctx.clone().with_artifact(artifact).with_tuning(tuning);
                let request = local::unit_request(unit, &self.config.options);
                match PipelineNode::new(Arc::new(ctx), Arc::clone(&self.cache), request) {
                    Ok(node) => Some(node),
                    Err(e) => {
                        unit.fail(&e);
                        None
                    }
                }
            })
            .collect()
    }

    fn run_local(
        &self,
        units: &mut [BatchUnit],
        nodes: Vec<Option<PipelineNode>>,
        setting: &ConcurrencySetting,
    ) -> ExpflowResult<()> {
        let pool = WorkerPool::new(setting.outer * setting.inner);
        let jobs: Vec<(usize, PipelineNode)> = nodes
            .into_iter()
            .enumerate()
            .filter_map(|(index, node)| node.map(|n| (index, n)))
            .collect();
        if pool.size() == 1 {
            return run_in_process(units, jobs, pool);
        }

        let command = self
            .config
            .worker_command
            .clone()
            .unwrap_or_else(local::default_worker_command);
        let lane_dir = self.ctx.scratch_dir().join("lanes").join(Uuid::new_v4().to_string());
        local::run_processes(units, jobs, pool, &self.config.options, &command, &lane_dir)
    }
}

/// Fails every unit that would write a directory an earlier unit writes with a different definition.
fn check_collisions(units: &mut [BatchUnit], nodes: &mut [Option<PipelineNode>]) {
    let mut owners: HashMap<PathBuf, (usize, String)> = HashMap::new();
    for index in 0..nodes.len() {
        let Some(node) = &nodes[index] else {
            continue;
        };
        let clash = node.graph().directories().find_map(|(dir, hash)| match owners.get(dir) {
            Some((owner, owner_hash)) if owner_hash != hash => Some((dir.to_path_buf(), *owner)),
            _ => None,
        });
        if let Some((dir, owner)) = clash {
            units[index].fail(
                &ConfigurationError::new(format!(
                    "Unit {index} would write {} with a different definition than unit {owner}",
                    dir.display()
                ))
                .into(),
            );
            nodes[index] = None;
            continue;
        }
        for (dir, hash) in node.graph().directories() {
            owners
                .entry(dir.to_path_buf())
                .or_insert_with(|| (index, hash.to_string()));
        }
    }
}

fn run_in_process(units: &mut [BatchUnit], jobs: Vec<(usize, PipelineNode)>, pool: WorkerPool) -> ExpflowResult<()> {
    let memo = ExecutionMemo::new();
    let (indices, jobs): (Vec<usize>, Vec<PipelineNode>) = jobs.into_iter().unzip();
    tracing::debug!(workers = pool.size(), jobs = jobs.len(), "Running units in process");

    let outcomes = pool.map(jobs, |job, node| {
        let _span = tracing::info_span!("unit", unit = indices[job]).entered();
        node.run_with(&memo)
    })?;
    for (index, outcome) in indices.iter().zip(outcomes) {
        match outcome {
            Ok(Ok(result)) => units[*index].succeed(result),
            Ok(Err(e)) => units[*index].fail(&e),
            Err(panic) => units[*index].fail_with("panic", format!("Unit panicked: {panic}")),
        }
    }
    Ok(())
}
