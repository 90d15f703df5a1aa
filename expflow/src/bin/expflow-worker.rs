//! Worker entry point for remote jobs and local unit processes.
//!
//! ```text
//! expflow-worker <parameters.json> [work-dir]
//! expflow-worker --local-lane <lane.json>
//! ```
//!
//! `parameters.json` holds the flat string map a dispatcher submits with a job.
//! A lane file lists local batch units; each unit's outcome is written to the
//! path the lane names for it.
//!
//! Environment:
//!
//! - `EXPFLOW_STORE_ROOT`: directory backing the object store (required for jobs)
//! - `EXPFLOW_ARTIFACT`: local artifact to use instead of downloading it
//! - `EXPFLOW_DATA_BASE`: data root on this host, if it differs from the submitter's
//! - `EXPFLOW_LOG_FORMAT`: `json` for JSON lines, text otherwise

#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use uuid::Uuid;

use expflow::batch::local::{run_lane, LOCAL_LANE_FLAG};
use expflow::codec::FlatParameters;
use expflow::observability::{init_tracing, LogFormat};
use expflow::storage::{DirectoryObjectStore, ObjectStore};
use expflow::worker::{run_worker, WorkerSettings};

const USAGE: &str = "usage: expflow-worker <parameters.json> [work-dir] | expflow-worker --local-lane <lane.json>";

fn log_format() -> LogFormat {
    match std::env::var("EXPFLOW_LOG_FORMAT") {
        Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
        _ => LogFormat::Text,
    }
}

fn store_from_env() -> Option<Arc<dyn ObjectStore>> {
    let root = std::env::var("EXPFLOW_STORE_ROOT").ok()?;
    Some(Arc::new(DirectoryObjectStore::new(root)))
}

fn main() -> Result<()> {
    init_tracing(log_format());

    let mut args = std::env::args().skip(1);
    let Some(first) = args.next() else {
        bail!(USAGE);
    };
    if first == LOCAL_LANE_FLAG {
        let Some(lane) = args.next().map(PathBuf::from) else {
            bail!(USAGE);
        };
        return run_lane(&lane, store_from_env()).with_context(|| format!("running lane {}", lane.display()));
    }

    let parameters_path = PathBuf::from(first);
    let work_dir = args.next().map_or_else(
        || std::env::temp_dir().join(format!("expflow-worker-{}", Uuid::new_v4())),
        PathBuf::from,
    );

    let text = std::fs::read_to_string(&parameters_path)
        .with_context(|| format!("reading {}", parameters_path.display()))?;
    let parameters: FlatParameters =
        serde_json::from_str(&text).context("job parameters must be a JSON object of strings")?;

    let store = store_from_env().context("EXPFLOW_STORE_ROOT is not set")?;

    let mut settings = WorkerSettings::new(&work_dir);
    if let Ok(path) = std::env::var("EXPFLOW_ARTIFACT") {
        settings = settings.with_artifact_path(path);
    }
    if let Ok(path) = std::env::var("EXPFLOW_DATA_BASE") {
        settings = settings.with_data_base(path);
    }

    let result = run_worker(&parameters, &settings, store)?;
    println!("outcome: {}", result.outcome);
    println!("output_dir: {}", result.output_dir.display());
    Ok(())
}
