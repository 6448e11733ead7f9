pub mod assembler;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod events;
pub mod jobs;
pub mod lifecycle;
pub mod model;
pub mod planner;
pub mod pool;
pub mod recorder;
pub mod retry;
pub mod store;
pub mod units;

#[cfg(test)]
pub mod test_support;

use std::sync::{Mutex, MutexGuard};

/// Locks a std mutex, recovering the guard if a panicking holder poisoned it.
pub(crate) fn sync_lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
