//! Nested-parallelism sizing.
//!
//! Work fans out at two levels (units, then repetitions inside a unit) and
//! every leaf engine process runs its own thread pool. [`ResourceSizer`]
//! splits a core budget across the three levels without oversubscribing.

use crate::errors::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper bound on concurrently running units.
pub const MAX_OUTER: usize = 6;
/// Upper bound on concurrent repetitions inside a unit.
pub const MAX_INNER: usize = 6;
/// Upper bound on engine threads per leaf process.
pub const MAX_LEAF: usize = 6;
/// Queue slots per leaf thread.
pub const QUEUE_MULTIPLIER: usize = 4;

/// A concurrency allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConcurrencySetting {
    /// Concurrent units.
    pub outer: usize,
    /// Concurrent repetitions per unit.
    pub inner: usize,
    /// Engine threads per leaf process. Zero means "let the worker decide".
    pub leaf_threads: usize,
    /// Engine queue depth. Zero when `leaf_threads` is zero.
    pub queue_depth: usize,
}

impl ConcurrencySetting {
    /// Total leaf threads the allocation may run at once.
    #[must_use]
    pub const fn total_threads(&self) -> usize {
        self.outer * self.inner * self.leaf_threads
    }

    /// Leaf thread count as an engine launch parameter, if self-tuning is not deferred.
    #[must_use]
    pub const fn engine_threads(&self) -> Option<usize> {
        if self.leaf_threads == 0 {
            None
        } else {
            Some(self.leaf_threads)
        }
    }

    /// Queue depth as an engine launch parameter, if self-tuning is not deferred.
    #[must_use]
    pub const fn engine_queue_length(&self) -> Option<usize> {
        if self.queue_depth == 0 {
            None
        } else {
            Some(self.queue_depth)
        }
    }
}

impl fmt::Display for ConcurrencySetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "outer={} inner={} leaf_threads={} queue_depth={}",
            self.outer, self.inner, self.leaf_threads, self.queue_depth
        )
    }
}

/// Where the work will run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Local worker pool.
    #[default]
    Local,
    /// Remote batch backend; each job sizes itself.
    Remote,
}

/// Computes [`ConcurrencySetting`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceSizer;

impl ResourceSizer {
    /// Recommends an allocation for `items` units of `repetitions` each on `cores` cores.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] when there are no items, no
    /// repetitions, or (locally) no cores.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn recommend(
        items: usize,
        repetitions: usize,
        cores: usize,
        mode: ExecutionMode,
    ) -> Result<ConcurrencySetting, ConfigurationError> {
        if items == 0 || repetitions == 0 {
            return Err(ConfigurationError::new(format!(
                "Cannot size zero work (items={items}, repetitions={repetitions})"
            )));
        }

        if mode == ExecutionMode::Remote {
            return Ok(ConcurrencySetting {
                outer: items,
                inner: repetitions,
                leaf_threads: 0,
                queue_depth: 0,
            });
        }

        if cores == 0 {
            return Err(ConfigurationError::new("Core budget must be at least 1"));
        }

        let outer = MAX_OUTER.min(items.min(cores)) as f64;
        let cores_per_outer = cores as f64 / outer;
        let leaf = (MAX_LEAF as f64).min(cores_per_outer.max(1.0));
        let inner = (MAX_INNER as f64).min((repetitions as f64).min((cores_per_outer / leaf).max(1.0)));

        let round = |x: f64| (x.round() as usize).max(1);
        let leaf_threads = round(leaf);

        Ok(ConcurrencySetting {
            outer: round(outer),
            inner: round(inner),
            leaf_threads,
            queue_depth: leaf_threads * QUEUE_MULTIPLIER,
        })
    }

    /// Host parallelism, or 1 when it cannot be determined.
    #[must_use]
    pub fn available_cores() -> usize {
        std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
    }
}
