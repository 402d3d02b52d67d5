//! Background execution for callers that must not block.
//!
//! Repository and cache calls are synchronous; the workers here move them
//! onto tokio's blocking pool so a UI or async caller only awaits a future.
//! Long-running iterations take a [`CancelFlag`] and stop at the next batch
//! boundary once it is raised.

pub mod workers;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use workers::{BatchImport, CacheWorker, RepositoryWorker, SearchOutcome};

/// Shared cancellation request. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
