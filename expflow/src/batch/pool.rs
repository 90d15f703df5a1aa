//! Bounded worker pool for batch units.

use crate::errors::ExpflowResult;
use rayon::prelude::*;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// A rayon thread pool of fixed size, built per batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPool {
    size: usize,
}

impl WorkerPool {
    /// Creates a pool of `size` workers (at least one).
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self { size: size.max(1) }
    }

    /// Number of workers.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Runs `job` on every item and returns the outcomes in item order.
    ///
    /// A panicking job yields `Err` with the panic message; the other jobs
    /// keep running. A pool of one runs everything on the calling thread.
    pub fn map<I, T, F>(&self, items: Vec<I>, job: F) -> ExpflowResult<Vec<Result<T, String>>>
    where
        I: Send,
        T: Send,
        F: Fn(usize, I) -> T + Sync,
    {
        if self.size == 1 || items.len() <= 1 {
            return Ok(items
                .into_iter()
                .enumerate()
                .map(|(index, item)| run_caught(|| job(index, item)))
                .collect());
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.size.min(items.len()))
            .thread_name(|index| format!("expflow-unit-{index}"))
            .build()
            .map_err(std::io::Error::other)?;

        Ok(pool.install(|| {
            items
                .into_par_iter()
                .enumerate()
                .map(|(index, item)| {
                    tracing::debug!(item = index, "Worker picked up item");
                    run_caught(|| job(index, item))
                })
                .collect()
        }))
    }
}

fn run_caught<T>(f: impl FnOnce() -> T) -> Result<T, String> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| panic_message(payload.as_ref()))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
