//! Pipeline nodes.
//!
//! A [`PipelineNode`] is one (algorithm, override, cutoff) combination. On
//! construction it resolves its definition and builds the [`PipelineGraph`] of
//! everything it depends on; [`PipelineNode::run`] then executes the graph
//! dependencies-first and returns the root's [`PipelineResult`] with every
//! dependency result nested under its name.
//!
//! Each node runs its steps in a fixed order:
//!
//! 1. generate feature states, then package encode parameters
//! 2. encode and train, if the definition declares training
//! 3. package predict parameters
//! 4. predict, evaluate, and the optional performance test, encode test and audit
//!
//! Any step failure is fatal to the node and to everything depending on it.

mod executor;
mod graph;
mod options;
mod result;
mod state;

pub use graph::{DefinitionSource, GraphNode, NodeId, PipelineGraph};
pub use options::{NodeRequest, RunOptions};
pub use result::{FeatureStates, PipelineResult, StepResult, StepStatus};
pub use state::NodeState;

use crate::cache::CacheResolver;
use crate::context::PipelineContext;
use crate::errors::{ConfigurationError, ExpflowResult};
use dashmap::DashMap;
use executor::NodeExecutor;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Resolved definition, written to the metadata directory.
pub const DEFINITION_FILE: &str = "algorithm_definition.json";
/// Node result, written to the metadata directory.
pub const RESULT_FILE: &str = "result.json";
/// Failure document, written to the metadata directory instead of a result.
pub const FAILURE_FILE: &str = "failure.json";
/// Encode-parameter package in the output directory.
pub const ENCODE_PARAMETERS_FILE: &str = "encode-parameters.zip";
/// Predict-parameter package in the output directory.
pub const PREDICT_PARAMETERS_FILE: &str = "predict-parameters.zip";
/// Identity summary inside the predict-parameter package.
pub const ALGORITHM_PARAMETERS_FILE: &str = "algorithm_parameters.json";
/// Trained parameters written by the training command.
pub const MODEL_PARAMETERS_FILE: &str = "model-parameters";

/// Step names as they appear in [`PipelineResult::steps`].
pub mod steps {
    /// Prefix of the per-state generation steps, `generate_state:<name>`.
    pub const GENERATE_STATE: &str = "generate_state";
    /// Encode-parameter packaging.
    pub const ENCODE_PARAMETERS: &str = "encode_parameters";
    /// Encoding the training data.
    pub const ENCODE: &str = "encode";
    /// Training command.
    pub const TRAIN: &str = "train";
    /// Predict-parameter packaging.
    pub const PREDICT_PARAMETERS: &str = "predict_parameters";
    /// Scoring test data.
    pub const PREDICT: &str = "predict";
    /// Evaluation strategy.
    pub const EVALUATE: &str = "evaluate";
    /// Latency measurement.
    pub const PERFORMANCE_TEST: &str = "performance_test";
    /// Encoding the test data.
    pub const ENCODE_TEST: &str = "encode_test";
    /// Feature audit.
    pub const AUDIT: &str = "audit";
}

pub(crate) fn write_json(path: &Path, value: &impl Serialize) -> ExpflowResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_vec_pretty(value)?)?;
    Ok(())
}

type Slot = Arc<Mutex<Option<PipelineResult>>>;

/// Node results shared by every unit of one batch, keyed by output directory.
///
/// A node reached from several units runs once: the first unit runs it while
/// holding the directory's slot, later units reuse the stored result. Only one
/// slot is ever held at a time, so units cannot deadlock on each other.
#[derive(Debug, Default)]
pub struct ExecutionMemo {
    slots: DashMap<PathBuf, Slot>,
}

impl ExecutionMemo {
    /// Creates an empty memo.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, output_dir: &Path) -> Slot {
        self.slots.entry(output_dir.to_path_buf()).or_default().value().clone()
    }

    /// Number of node directories seen.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if no node ran yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// One configured root node and its dependency graph.
#[derive(Debug)]
pub struct PipelineNode {
    ctx: Arc<PipelineContext>,
    cache: Arc<CacheResolver>,
    options: RunOptions,
    graph: PipelineGraph,
}

impl PipelineNode {
    /// Resolves the definition, applies the override and builds the graph.
    pub fn new(ctx: Arc<PipelineContext>, cache: Arc<CacheResolver>, request: NodeRequest) -> ExpflowResult<Self> {
        ctx.validate()?;
        request.options.validate()?;

        let base = match request.definition {
            Some(definition) => definition,
            None => ctx.artifact().read_definition(&request.algorithm_name)?,
        };
        if base.name() != request.algorithm_name {
            return Err(ConfigurationError::new(format!(
                "Requested algorithm '{}' but the definition is for '{}'",
                request.algorithm_name,
                base.name()
            ))
            .into());
        }
        let definition = match &request.definition_override {
            Some(definition_override) => base.with_override(definition_override)?,
            None => base,
        };

        let graph = PipelineGraph::build(
            &ctx,
            ctx.artifact(),
            definition,
            request.cutoff,
            request.parameter_version.as_ref(),
            request.options.prebuilt_parameters.is_some(),
        )?;
        Ok(Self {
            ctx,
            cache,
            options: request.options,
            graph,
        })
    }

    /// The dependency graph.
    #[must_use]
    pub const fn graph(&self) -> &PipelineGraph {
        &self.graph
    }

    /// The root node.
    #[must_use]
    pub fn root(&self) -> &GraphNode {
        self.graph.root()
    }

    /// Context the node runs in.
    #[must_use]
    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    /// Run options.
    #[must_use]
    pub const fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Runs the graph with a private memo.
    pub fn run(self) -> ExpflowResult<PipelineResult> {
        self.run_with(&ExecutionMemo::new())
    }

    /// Runs the graph, sharing node results through `memo`.
    pub fn run_with(self, memo: &ExecutionMemo) -> ExpflowResult<PipelineResult> {
        let mut results: Vec<Option<PipelineResult>> = vec![None; self.graph.len()];

        for &id in self.graph.execution_order() {
            let node = self.graph.node(id);
            let mut dependencies = BTreeMap::new();
            for (name, child) in self.graph.children(id) {
                let result = results[*child].clone().ok_or_else(|| {
                    ConfigurationError::new(format!("Dependency '{name}' of {} did not run first", node.slug()))
                })?;
                dependencies.insert(name.clone(), result);
            }

            let slot = memo.slot(&node.output_dir);
            let mut done = slot.lock();
            let result = match done.as_ref().filter(|r| r.definition_hash == node.definition_hash) {
                Some(previous) => {
                    tracing::info!(
                        algorithm = %node.slug(),
                        parameter_version = %node.parameter_version,
                        "Reusing node result from this batch"
                    );
                    previous.clone()
                }
                None => {
                    let result = NodeExecutor::new(&self.ctx, &self.cache, &self.options, node, dependencies).run()?;
                    *done = Some(result.clone());
                    result
                }
            };
            drop(done);
            results[id] = Some(result);
        }

        results
            .into_iter()
            .next()
            .flatten()
            .ok_or_else(|| ConfigurationError::new("Root node produced no result").into())
    }
}
