//! Testing utilities for expflow pipelines.
//!
//! This module provides:
//! - a fake engine script that honours the engine's flags
//! - workspaces with artifacts, partitioned data and output roots

mod engine;
mod fixtures;

pub use engine::{engine_calls, install_fake_engine, CALL_LOG, FAKE_ENGINE_SCRIPT};
pub use fixtures::TestWorkspace;
