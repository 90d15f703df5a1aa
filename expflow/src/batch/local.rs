//! Local units in child processes.
//!
//! Units are grouped into lanes: units whose graphs share a node directory
//! land in the same lane, so a shared dependency still runs once. Every lane
//! runs in its own `expflow-worker --local-lane <file>` process, at most
//! [`WorkerPool::size`] at a time. The child writes one [`BatchUnit`] per unit
//! next to the lane file; a unit without that file failed with its process.

use super::pool::WorkerPool;
use super::unit::BatchUnit;
use crate::cache::CacheResolver;
use crate::context::PipelineContext;
use crate::engine::run_command;
use crate::errors::{ConfigurationError, ExpflowError, ExpflowResult};
use crate::node::{write_json, ExecutionMemo, NodeRequest, PipelineNode, RunOptions};
use crate::storage::ObjectStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Flag the worker binary recognises for a lane file.
pub const LOCAL_LANE_FLAG: &str = "--local-lane";
/// Name of the worker binary.
pub const WORKER_BINARY: &str = "expflow-worker";

/// One unit as shipped to a child process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneUnit {
    /// The pending unit; the child fills in its outcome.
    pub unit: BatchUnit,
    /// Context with the unit's artifact and tuning applied.
    pub context: PipelineContext,
    /// Options of the batch.
    pub options: RunOptions,
    /// Where the child writes the finished unit.
    pub outcome_file: PathBuf,
}

impl LaneUnit {
    /// The node request this unit stands for.
    #[must_use]
    pub fn request(&self) -> NodeRequest {
        unit_request(&self.unit, &self.options)
    }
}

/// Units one child process runs in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lane {
    /// Units in batch order.
    pub units: Vec<LaneUnit>,
}

pub(super) fn unit_request(unit: &BatchUnit, options: &RunOptions) -> NodeRequest {
    let request = NodeRequest::for_cutoff(&unit.algorithm_name, unit.cutoff).with_options(options.clone());
    match &unit.definition_override {
        Some(definition_override) => request.with_override(definition_override.clone()),
        None => request,
    }
}

/// The worker binary next to the running executable, else the one on `PATH`.
#[must_use]
pub fn default_worker_command() -> Vec<String> {
    let name = format!("{WORKER_BINARY}{}", std::env::consts::EXE_SUFFIX);
    let beside = std::env::current_exe().ok().and_then(|exe| {
        exe.ancestors()
            .skip(1)
            .take(2)
            .map(|dir| dir.join(&name))
            .find(|candidate| candidate.is_file())
    });
    vec![beside.map_or(name, |path| path.display().to_string())]
}

/// Groups node indices so that nodes sharing an output directory share a lane.
pub(crate) fn lanes(nodes: &[(usize, PipelineNode)]) -> Vec<Vec<usize>> {
    fn root(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    let mut parent: Vec<usize> = (0..nodes.len()).collect();
    let mut owner: HashMap<&Path, usize> = HashMap::new();
    for (position, (_, node)) in nodes.iter().enumerate() {
        for (dir, _) in node.graph().directories() {
            match owner.get(dir) {
                Some(&other) => {
                    let (a, b) = (root(&mut parent, position), root(&mut parent, other));
                    // keep the earliest unit as the lane root
                    parent[a.max(b)] = a.min(b);
                }
                None => {
                    owner.insert(dir, position);
                }
            }
        }
    }

    let mut grouped: Vec<Vec<usize>> = Vec::new();
    let mut slot: HashMap<usize, usize> = HashMap::new();
    for position in 0..nodes.len() {
        let lane_root = root(&mut parent, position);
        let lane = *slot.entry(lane_root).or_insert_with(|| {
            grouped.push(Vec::new());
            grouped.len() - 1
        });
        grouped[lane].push(position);
    }
    grouped
}

/// Runs `nodes` in child processes and records every outcome on `units`.
pub(super) fn run_processes(
    units: &mut [BatchUnit],
    nodes: Vec<(usize, PipelineNode)>,
    pool: WorkerPool,
    options: &RunOptions,
    command: &[String],
    lane_dir: &Path,
) -> ExpflowResult<()> {
    let Some((program, base_args)) = command.split_first() else {
        return Err(ConfigurationError::new("Worker command must not be empty")
            .with_key("worker_command")
            .into());
    };
    std::fs::create_dir_all(lane_dir)?;

    let mut lane_files = Vec::new();
    for members in lanes(&nodes) {
        let lane = Lane {
            units: members
                .iter()
                .map(|&position| {
                    let (index, node) = &nodes[position];
                    LaneUnit {
                        unit: units[*index].clone(),
                        context: node.context().clone(),
                        options: options.clone(),
                        outcome_file: lane_dir.join(format!("unit-{index}.json")),
                    }
                })
                .collect(),
        };
        let path = lane_dir.join(format!("lane-{}.json", lane.units[0].unit.index));
        write_json(&path, &lane)?;
        lane_files.push((path, lane));
    }
    tracing::info!(
        workers = pool.size(),
        lanes = lane_files.len(),
        units = nodes.len(),
        "Running units in worker processes"
    );

    let spawned = pool.map(lane_files, |_, (path, lane)| {
        let mut args = base_args.to_vec();
        args.push(LOCAL_LANE_FLAG.to_string());
        args.push(path.display().to_string());
        let outcome = run_command(program, &args, None);
        (lane, outcome)
    })?;

    for (position, joined) in spawned.into_iter().enumerate() {
        let (lane, process) = match joined {
            Ok(done) => done,
            Err(panic) => {
                tracing::error!(lane = position, panic = %panic, "Lane supervisor panicked");
                continue;
            }
        };
        let process_error = process.err();
        for member in lane.units {
            let index = member.unit.index;
            match read_outcome(&member.outcome_file) {
                Ok(finished) => units[index] = finished,
                Err(e) => units[index].fail(process_error.as_ref().unwrap_or(&e)),
            }
        }
    }
    // units of a panicked supervisor have neither result nor error yet
    for (index, _) in &nodes {
        let unit = &mut units[*index];
        if unit.result.is_none() && unit.error.is_none() {
            unit.fail_with("panic", "Lane supervisor panicked before the unit reported");
        }
    }
    Ok(())
}

fn read_outcome(path: &Path) -> ExpflowResult<BatchUnit> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        ExpflowError::MalformedResult(format!("unit process left no outcome at {}: {e}", path.display()))
    })?;
    serde_json::from_str(&text).map_err(|e| ExpflowError::MalformedResult(format!("{}: {e}", path.display())))
}

/// Runs every unit of the lane at `path` in this process.
///
/// Unit failures are written to the outcome files; only an unreadable lane
/// file or an unwritable outcome is an error.
pub fn run_lane(path: &Path, store: Option<Arc<dyn ObjectStore>>) -> ExpflowResult<()> {
    let text = std::fs::read_to_string(path)?;
    let lane: Lane =
        serde_json::from_str(&text).map_err(|e| ExpflowError::MalformedResult(format!("{}: {e}", path.display())))?;
    let memo = ExecutionMemo::new();

    for member in lane.units {
        let mut unit = member.unit.clone();
        let _span = tracing::info_span!("unit", unit = unit.index).entered();
        let ctx = Arc::new(member.context.clone());
        let mut cache = CacheResolver::new(ctx.cache_root().map(str::to_string), ctx.scratch_dir());
        if let Some(store) = &store {
            cache = cache.with_object_store(Arc::clone(store));
        }

        match PipelineNode::new(ctx, Arc::new(cache), member.request()).and_then(|node| node.run_with(&memo)) {
            Ok(result) => unit.succeed(result),
            Err(e) => unit.fail(&e),
        }
        write_json(&member.outcome_file, &unit)?;
    }
    Ok(())
}
