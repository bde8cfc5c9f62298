use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Error an operation returns when it stops early because its [`CancellationToken`] fired.
///
/// The consumer loop reports an item as [`SyncError::Cancelled`] only if the operation failed
/// with this error (anywhere in the error chain) *and* the item's own token is cancelled.
/// Any other failure, or this error while the token is still live, counts as a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

impl Cancelled {
    /// Fails with [`Cancelled`] if `token` has fired. Meant for operations that check for
    /// cancellation between steps: `Cancelled::check(&token)?;`
    pub fn check(token: &CancellationToken) -> Result<(), Cancelled> {
        if token.is_cancelled() {
            return Err(Cancelled);
        }
        Ok(())
    }
}

/// Outcome of a submission that did not produce a value.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The submission was cancelled, either while waiting for a queue slot or by the operation
    /// itself observing its token.
    #[error("submission cancelled")]
    Cancelled,
    /// The operation failed or panicked. Carries the operation's own error.
    #[error("operation faulted: {0:#}")]
    Faulted(#[source] anyhow::Error),
    /// The queue was closed before the item could be submitted.
    #[error("synchronizer is closed")]
    Closed,
    /// The item was dropped without being settled, e.g. because the consumer loop was aborted
    /// while executing it.
    #[error("work item was dropped before it was settled")]
    Abandoned,
}

impl SyncError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Converts the outcome back into a plain operation error.
    ///
    /// A fault yields the operation's original error unchanged and a cancellation yields
    /// [`Cancelled`], so a synchronized handler nested inside another synchronizer is classified
    /// the same way as the handler it wraps.
    pub fn into_anyhow(self) -> anyhow::Error {
        match self {
            Self::Faulted(e) => e,
            Self::Cancelled => anyhow::Error::new(Cancelled),
            other => anyhow::Error::new(other),
        }
    }

    /// Label used for log fields and statistics.
    pub(crate) fn label(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Faulted(_) => "faulted",
            Self::Closed => "closed",
            Self::Abandoned => "abandoned",
        }
    }
}

/// Reasons for the consumer loop to stop with an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LoopError {
    /// Another consumer loop already owns the read side of the queue.
    #[error("a consumer loop is already running for this synchronizer")]
    AlreadyRunning,
    /// The queue was closed and every remaining item has been executed.
    #[error("synchronizer queue is closed")]
    QueueClosed,
}
