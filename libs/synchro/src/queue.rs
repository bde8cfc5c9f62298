use std::num::NonZeroUsize;

use tokio::sync::{Mutex, MutexGuard, mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{LoopError, SyncError},
    job::BoxedJob,
};

/// Bounded FIFO of pending work items.
///
/// Writers share the sending half. The receiving half sits behind a mutex that the consumer loop
/// holds for as long as it runs, so there is never more than one reader.
///
/// # Note
/// Items are handed out in the order writers were granted a slot. Writers waiting for a slot are
/// served in the order they started waiting, since tokio's bounded channel queues them fairly.
#[derive(Debug)]
pub(crate) struct Queue {
    source: mpsc::Sender<BoxedJob>,
    sink: Mutex<mpsc::Receiver<BoxedJob>>,
    /// Fired by [`Queue::close`]. Rejects writers, lets the reader drain what is left.
    closed: CancellationToken,
}

/// Exclusive read access to the [`Queue`], held by the running consumer loop.
pub(crate) struct Reader<'a> {
    sink: MutexGuard<'a, mpsc::Receiver<BoxedJob>>,
    closed: &'a CancellationToken,
}

impl Queue {
    pub(crate) fn new(capacity: NonZeroUsize) -> Self {
        let (source, sink) = mpsc::channel(capacity.get());
        Self {
            source,
            sink: Mutex::new(sink),
            closed: CancellationToken::new(),
        }
    }

    /// Waits for a free slot and puts `job` into it.
    ///
    /// Gives up with [`SyncError::Cancelled`] if `token` fires first, in which case `job` is
    /// dropped without ever being queued. An already cancelled `token` always wins, even if a
    /// slot is free.
    pub(crate) async fn enqueue(
        &self,
        job: BoxedJob,
        token: &CancellationToken,
    ) -> Result<(), SyncError> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(SyncError::Cancelled),
            _ = self.closed.cancelled() => Err(SyncError::Closed),
            permit = self.source.reserve() => {
                let permit = permit.map_err(|_| SyncError::Closed)?;
                permit.send(job);
                Ok(())
            }
        }
    }

    /// Claims the read side of the queue. Fails if another reader holds it.
    pub(crate) fn reader(&self) -> Result<Reader<'_>, LoopError> {
        let sink = self
            .sink
            .try_lock()
            .map_err(|_| LoopError::AlreadyRunning)?;
        Ok(Reader {
            sink,
            closed: &self.closed,
        })
    }

    pub(crate) fn close(&self) {
        self.closed.cancel();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Number of items currently waiting in the queue.
    pub(crate) fn len(&self) -> usize {
        self.source.max_capacity() - self.source.capacity()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.source.max_capacity()
    }
}

impl Reader<'_> {
    /// Waits for the next item.
    ///
    /// After the queue has been closed, the items still buffered, and those of writers that
    /// already hold a slot, are handed out before this reports [`LoopError::QueueClosed`].
    /// Cancel safe: dropping the future loses no item.
    pub(crate) async fn dequeue(&mut self) -> Result<BoxedJob, LoopError> {
        tokio::select! {
            biased;
            job = self.sink.recv() => job.ok_or(LoopError::QueueClosed),
            _ = self.closed.cancelled() => {
                // Refuses new slots; `recv` still waits for slots handed out before.
                self.sink.close();
                self.sink.recv().await.ok_or(LoopError::QueueClosed)
            }
        }
    }
}
