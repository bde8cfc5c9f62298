//! Work items: one submitted operation together with its cancellation token and the private slot
//! its submitter waits on.

use std::{any::Any, future::Future, panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Cancelled, SyncError},
    handler::Handler,
};

pub(crate) type BoxedJob = Box<dyn Job>;

/// Receiving half of a [`ResultSlot`], awaited by the submitter.
pub(crate) type Settlement<T> = oneshot::Receiver<Result<T, SyncError>>;

/// A queued unit of work, type-erased so the queue can hold items of any result type.
#[async_trait::async_trait]
pub(crate) trait Job: Send + 'static {
    /// Runs the operation to a terminal state and settles the item's result slot.
    /// Never fails and never panics: every outcome ends up in the slot.
    async fn execute(self: Box<Self>);
}

/// Single-assignment result slot of a work item.
///
/// Settling consumes the slot, so an item can be settled at most once.
pub(crate) struct ResultSlot<T> {
    send_back: oneshot::Sender<Result<T, SyncError>>,
    token: CancellationToken,
}

impl<T: Send + 'static> ResultSlot<T> {
    pub(crate) fn new(token: CancellationToken) -> (Self, Settlement<T>) {
        let (send_back, settlement) = oneshot::channel();
        (Self { send_back, token }, settlement)
    }

    /// Starts `operation` with the item's token and settles the slot with whatever it produces.
    ///
    /// The operation is started even if the token fired while the item was queued; it sees the
    /// fired token and decides for itself whether to stop.
    pub(crate) async fn run<F, Fut>(self, operation: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send,
        Fut: Future<Output = anyhow::Result<T>> + Send,
    {
        let token = self.token.clone();
        let outcome = match AssertUnwindSafe(async move { operation(token).await })
            .catch_unwind()
            .await
        {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(classify(&self.token, e)),
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                tracing::warn!(panic = msg, "operation panicked");
                Err(SyncError::Faulted(anyhow::anyhow!(
                    "operation panicked: {msg}"
                )))
            }
        };

        self.settle(outcome);
    }

    pub(crate) fn settle(self, outcome: Result<T, SyncError>) {
        let label = match &outcome {
            Ok(_) => "completed",
            Err(e) => e.label(),
        };
        tracing::trace!(outcome = label, "work item settled");

        if self.send_back.send(outcome).is_err() {
            tracing::warn!(
                outcome = label,
                "work item settled but its submitter has hung up, result is thrown away"
            );
        }
    }
}

/// An error counts as a cancellation only if it says so and the item's token agrees.
fn classify(token: &CancellationToken, err: anyhow::Error) -> SyncError {
    let reports_cancel = err.chain().any(|cause| cause.is::<Cancelled>());
    if reports_cancel && token.is_cancelled() {
        return SyncError::Cancelled;
    }
    tracing::debug!(error = ?err, "operation faulted");
    SyncError::Faulted(err)
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

// region:    --- Work item kinds

/// Item created by [`crate::Synchronizer::submit`]: an operation without a request payload.
pub(crate) struct Call<F, T> {
    operation: F,
    slot: ResultSlot<T>,
}

impl<F, T> Call<F, T> {
    pub(crate) fn new(operation: F, slot: ResultSlot<T>) -> Self {
        Self { operation, slot }
    }
}

#[async_trait::async_trait]
impl<F, Fut, T> Job for Call<F, T>
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    async fn execute(self: Box<Self>) {
        let Self { operation, slot } = *self;
        slot.run(operation).await;
    }
}

/// Item created by a [`crate::Synchronized`] handler: a shared handler plus the request it was
/// called with.
pub(crate) struct Request<H, Req, Resp> {
    handler: Arc<H>,
    request: Req,
    slot: ResultSlot<Resp>,
}

impl<H, Req, Resp> Request<H, Req, Resp> {
    pub(crate) fn new(handler: Arc<H>, request: Req, slot: ResultSlot<Resp>) -> Self {
        Self {
            handler,
            request,
            slot,
        }
    }
}

#[async_trait::async_trait]
impl<H, Req, Resp> Job for Request<H, Req, Resp>
where
    H: Handler<Req, Resp>,
    Req: Send + 'static,
    Resp: Send + 'static,
{
    async fn execute(self: Box<Self>) {
        let Self {
            handler,
            request,
            slot,
        } = *self;
        slot.run(move |token| async move { handler.handle(request, token).await })
            .await;
    }
}

// endregion: --- Work item kinds

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::{BoxedJob, Call, ResultSlot};
    use crate::error::{Cancelled, SyncError};

    async fn execute<T: Send + 'static, F, Fut>(
        token: CancellationToken,
        operation: F,
    ) -> Result<T, SyncError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let (slot, settlement) = ResultSlot::new(token);
        let job: BoxedJob = Box::new(Call::new(operation, slot));
        job.execute().await;
        settlement.await.expect("slot is always settled")
    }

    fn poisoned() -> anyhow::Result<()> {
        panic!("handle is poisoned")
    }

    #[tokio::test]
    async fn value_is_passed_through() {
        let res = execute(CancellationToken::new(), |_| async { Ok(vec![1, 2, 3]) }).await;
        assert_eq!(res.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn error_is_passed_through() {
        let res: Result<(), _> = execute(CancellationToken::new(), |_| async {
            anyhow::bail!("connection reset")
        })
        .await;

        match res {
            Err(SyncError::Faulted(e)) => assert_eq!(e.to_string(), "connection reset"),
            other => panic!("expected fault, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancelled_error_with_fired_token_is_cancellation() {
        let token = CancellationToken::new();
        let res: Result<(), _> = execute(token.clone(), |token| async move {
            token.cancel();
            Cancelled::check(&token)?;
            Ok::<(), anyhow::Error>(())
        })
        .await;

        assert!(matches!(res, Err(SyncError::Cancelled)));
    }

    /// Reporting `Cancelled` while the token is live is a fault, and so is any other error after
    /// the token fired.
    #[tokio::test]
    async fn cancellation_needs_marker_and_token() {
        let res: Result<(), _> = execute(CancellationToken::new(), |_| async {
            Err(anyhow::Error::new(Cancelled))
        })
        .await;
        assert!(matches!(res, Err(SyncError::Faulted(_))));

        let res: Result<(), _> = execute(CancellationToken::new(), |token| async move {
            token.cancel();
            anyhow::bail!("gave up")
        })
        .await;
        assert!(matches!(res, Err(SyncError::Faulted(_))));
    }

    #[tokio::test]
    async fn panic_is_contained() {
        let res = execute(CancellationToken::new(), |_| async { poisoned() }).await;

        match res {
            Err(SyncError::Faulted(e)) => {
                assert_eq!(e.to_string(), "operation panicked: handle is poisoned")
            }
            other => panic!("expected fault, got {other:?}"),
        }
    }

    /// A token that fired before execution is handed to the operation, which still runs and
    /// may finish its work.
    #[tokio::test]
    async fn operation_runs_with_already_fired_token() {
        let token = CancellationToken::new();
        token.cancel();

        let res = execute(token, |token| async move {
            assert!(token.is_cancelled());
            Ok("wrote")
        })
        .await;

        assert_eq!(res.unwrap(), "wrote");
    }
}
