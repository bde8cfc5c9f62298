use std::{
    fmt,
    future::Future,
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    Cfg,
    error::{LoopError, SyncError},
    handler::{Handler, Synchronized},
    job::{BoxedJob, Call, ResultSlot, Settlement},
    queue::Queue,
};

/// Lifecycle of a [`Synchronizer`]'s consumer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    /// No loop has been started yet.
    NotStarted = 0,
    Running = 1,
    /// The last loop stopped, cleanly or faulted. A new one may be started.
    Stopped = 2,
}

impl LoopState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::NotStarted,
            1 => Self::Running,
            _ => Self::Stopped,
        }
    }
}

/// Executes submitted operations one at a time, in a single consumer loop, while every submitter
/// awaits only its own outcome.
///
/// Cloning is cheap and every clone submits to the same queue. Nothing runs until a consumer loop
/// is started with [`Synchronizer::run`] or [`Synchronizer::start`]; until then submissions pile
/// up in the queue and, once it is full, wait for a free slot.
#[derive(Clone)]
pub struct Synchronizer {
    inner: Arc<Inner>,
}

struct Inner {
    queue: Queue,
    state: AtomicU8,
}

impl Default for Synchronizer {
    fn default() -> Self {
        Self::new(Cfg::default())
    }
}

impl fmt::Debug for Synchronizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Synchronizer")
            .field("state", &self.state())
            .field("queued", &self.queued())
            .field("capacity", &self.inner.queue.capacity())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Synchronizer {
    pub fn new(cfg: Cfg) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Queue::new(cfg.capacity),
                state: AtomicU8::new(LoopState::NotStarted as u8),
            }),
        }
    }

    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self::new(Cfg { capacity })
    }

    // region:    --- Submission

    /// Queues `operation` and waits for its outcome.
    ///
    /// `token` bounds the wait for a queue slot: if it fires first, the operation is never
    /// queued and the call returns [`SyncError::Cancelled`]. Once the operation runs, it receives
    /// the same token and may stop early by returning [`crate::Cancelled`].
    pub async fn submit<F, Fut, T>(
        &self,
        operation: F,
        token: CancellationToken,
    ) -> Result<T, SyncError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (slot, settlement) = ResultSlot::new(token.clone());
        self.dispatch(Box::new(Call::new(operation, slot)), &token, settlement)
            .await
    }

    /// Wraps `handler` so that every call to the returned [`Synchronized`] handler is queued here.
    pub fn wrap<H, Req, Resp>(&self, handler: H) -> Synchronized<H, Req, Resp>
    where
        H: Handler<Req, Resp>,
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        Synchronized::new(self.clone(), handler)
    }

    pub(crate) async fn dispatch<T>(
        &self,
        job: BoxedJob,
        token: &CancellationToken,
        settlement: Settlement<T>,
    ) -> Result<T, SyncError> {
        self.inner.queue.enqueue(job, token).await?;
        // The slot only goes away unsettled if the item is dropped, e.g. with an aborted loop.
        settlement.await.unwrap_or(Err(SyncError::Abandoned))
    }

    // endregion: --- Submission

    // region:    --- Consumer loop

    /// Runs the consumer loop until `token` fires or the queue faults.
    ///
    /// Items are executed strictly one after another; each runs to completion before the next is
    /// dequeued. `token` is only checked between items, it never interrupts a running operation.
    ///
    /// # Errors
    /// - [`LoopError::AlreadyRunning`] if another loop is active for this synchronizer.
    /// - [`LoopError::QueueClosed`] once the queue has been closed and drained.
    pub async fn run(&self, token: CancellationToken) -> Result<(), LoopError> {
        let mut reader = self.inner.queue.reader()?;
        let _running = Running::enter(&self.inner.state);
        tracing::info!(
            capacity = self.inner.queue.capacity(),
            "consumer loop started"
        );

        let res = loop {
            let job = tokio::select! {
                biased;
                _ = token.cancelled() => break Ok(()),
                job = reader.dequeue() => job,
            };

            match job {
                Ok(job) => job.execute().await,
                Err(e) => break Err(e),
            }
        };

        match &res {
            Ok(()) => tracing::info!("consumer loop stopped"),
            Err(e) => tracing::error!(error = %e, "consumer loop faulted"),
        }
        res
    }

    /// Spawns [`Synchronizer::run`] on the current tokio runtime.
    pub fn start(&self, token: CancellationToken) -> JoinHandle<Result<(), LoopError>> {
        let synchronizer = self.clone();
        tokio::spawn(async move { synchronizer.run(token).await })
    }

    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    // endregion: --- Consumer loop

    /// Stops accepting submissions.
    ///
    /// Pending and later submissions fail with [`SyncError::Closed`]. Items already in the queue
    /// are still executed, after which the loop stops with [`LoopError::QueueClosed`].
    pub fn close(&self) {
        if !self.inner.queue.is_closed() {
            tracing::info!(queued = self.queued(), "closing synchronizer");
        }
        self.inner.queue.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.queue.is_closed()
    }

    /// Number of items waiting in the queue, not counting the one being executed.
    pub fn queued(&self) -> usize {
        self.inner.queue.len()
    }
}

/// Marks the loop as running for as long as it lives, including when the loop's future is
/// dropped mid-flight.
struct Running<'a>(&'a AtomicU8);

impl<'a> Running<'a> {
    fn enter(state: &'a AtomicU8) -> Self {
        state.store(LoopState::Running as u8, Ordering::Release);
        Self(state)
    }
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.store(LoopState::Stopped as u8, Ordering::Release);
    }
}
