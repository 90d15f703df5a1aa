//! # Expflow
//!
//! Orchestration of multi-stage experiment pipelines around an external
//! compute engine.
//!
//! Expflow provides:
//!
//! - **Pipeline nodes**: one (algorithm, override, cutoff) combination, run
//!   dependencies-first with per-step caching
//! - **Batches**: the cross product of artifact references, overrides and
//!   cutoffs, run on a local worker pool or as remote jobs with per-unit
//!   failure isolation
//! - **A flat parameter codec**: nested configuration across string-only
//!   transports
//! - **Resource sizing**: splitting a core budget across nested fan-out levels
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use expflow::prelude::*;
//!
//! let ctx = PipelineContext::new(engine_command, AlgorithmArtifact::new("algo.jar"), "/data", "/out");
//! let cache = Arc::new(CacheResolver::new(ctx.cache_root().map(String::from), ctx.scratch_dir()));
//! let request = NodeRequest::for_cutoff("ranker", cutoff);
//! let result = PipelineNode::new(Arc::new(ctx), cache, request)?.run()?;
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, missing_docs, rust_2018_idioms)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod batch;
pub mod cache;
pub mod codec;
pub mod context;
pub mod definition;
pub mod discovery;
pub mod engine;
pub mod errors;
pub mod evaluation;
pub mod node;
pub mod observability;
pub mod schedule;
pub mod sizing;
pub mod storage;
pub mod testing;
pub mod worker;

#[cfg(all(test, unix))]
mod integration_tests;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::batch::{
        ArtifactResolver, BatchConfig, BatchExecutor, BatchRequest, BatchUnit, DirectoryArtifactResolver,
        RemoteBackend, RemoteConfig, RemoteDispatcher,
    };
    pub use crate::cache::{CacheDescriptor, CacheLookup, CacheResolver};
    pub use crate::codec::{flatten, unflatten, unflatten_strings, FlatParameters};
    pub use crate::context::PipelineContext;
    pub use crate::definition::{AlgorithmArtifact, AlgorithmDefinition, AlgorithmIdentity, ParameterVersion};
    pub use crate::errors::{ExpflowError, ExpflowResult};
    pub use crate::node::{NodeRequest, NodeState, PipelineNode, PipelineResult, RunOptions, StepResult};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::schedule::BacktestPlan;
    pub use crate::sizing::{ConcurrencySetting, ExecutionMode, ResourceSizer};
    pub use crate::storage::{DirectoryObjectStore, ObjectStore};
}
