//! Serializes asynchronous operations through a single consumer loop.
//!
//! Many tasks may submit work to a [`Synchronizer`] at the same time. Submissions are queued in a
//! bounded queue and executed one at a time by the consumer loop, while each submitter awaits
//! only the outcome of its own operation. Useful to guard a resource that must not be used
//! concurrently, such as a stateful connection, without blocking threads or holding locks across
//! awaits.

use std::num::NonZeroUsize;

mod error;
mod handler;
mod job;
mod queue;
mod synchronizer;
#[cfg(test)]
mod test;

// region:    --- Exports
pub use error::{Cancelled, LoopError, SyncError};
pub use handler::{Handler, Synchronized};
pub use synchronizer::{LoopState, Synchronizer};
pub use tokio_util::sync::CancellationToken;
// endregion: --- Exports

/// Construction parameters of a [`Synchronizer`].
#[derive(Debug, Clone, Copy)]
pub struct Cfg {
    /// Number of submitted items the queue holds before submitters have to wait for a free slot.
    pub capacity: NonZeroUsize,
}

impl Default for Cfg {
    fn default() -> Self {
        Self {
            capacity: NonZeroUsize::MIN,
        }
    }
}
