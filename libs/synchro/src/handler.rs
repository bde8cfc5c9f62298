use std::{future::Future, marker::PhantomData, sync::Arc};

use tokio_util::sync::CancellationToken;

use crate::{
    Synchronizer,
    error::SyncError,
    job::{Request, ResultSlot},
};

/// An asynchronous operation taking a request and a cancellation token.
///
/// Implemented for every `Fn(Req, CancellationToken) -> impl Future<Output = anyhow::Result<Resp>>`
/// closure, and by [`Synchronized`], so a call site written against `Handler` can be handed a
/// synchronized handler without changing its shape.
#[async_trait::async_trait]
pub trait Handler<Req, Resp>: Send + Sync + 'static {
    async fn handle(&self, request: Req, token: CancellationToken) -> anyhow::Result<Resp>;
}

#[async_trait::async_trait]
impl<F, Fut, Req, Resp> Handler<Req, Resp> for F
where
    F: Fn(Req, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Resp>> + Send,
    Req: Send + 'static,
    Resp: Send + 'static,
{
    async fn handle(&self, request: Req, token: CancellationToken) -> anyhow::Result<Resp> {
        (self)(request, token).await
    }
}

/// A [`Handler`] whose calls are executed one at a time by a [`Synchronizer`]'s consumer loop.
///
/// Created by [`Synchronizer::wrap`]. Cheap to clone; clones share the handler and the queue.
pub struct Synchronized<H, Req, Resp> {
    synchronizer: Synchronizer,
    handler: Arc<H>,
    _shape: PhantomData<fn(Req) -> Resp>,
}

impl<H, Req, Resp> Synchronized<H, Req, Resp>
where
    H: Handler<Req, Resp>,
    Req: Send + 'static,
    Resp: Send + 'static,
{
    pub(crate) fn new(synchronizer: Synchronizer, handler: H) -> Self {
        Self {
            synchronizer,
            handler: Arc::new(handler),
            _shape: PhantomData,
        }
    }

    /// Queues `request` for the wrapped handler and waits for its outcome.
    ///
    /// `token` bounds the wait for a queue slot and is passed on to the handler once the
    /// request is executed.
    pub async fn call(&self, request: Req, token: CancellationToken) -> Result<Resp, SyncError> {
        let (slot, settlement) = ResultSlot::new(token.clone());
        let job = Request::new(Arc::clone(&self.handler), request, slot);
        self.synchronizer
            .dispatch(Box::new(job), &token, settlement)
            .await
    }

    pub fn synchronizer(&self) -> &Synchronizer {
        &self.synchronizer
    }
}

impl<H, Req, Resp> Clone for Synchronized<H, Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            synchronizer: self.synchronizer.clone(),
            handler: Arc::clone(&self.handler),
            _shape: PhantomData,
        }
    }
}

#[async_trait::async_trait]
impl<H, Req, Resp> Handler<Req, Resp> for Synchronized<H, Req, Resp>
where
    H: Handler<Req, Resp>,
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Same as [`Synchronized::call`], with the outcome folded back into a plain error:
    /// faults yield the handler's own error, cancellations yield [`crate::Cancelled`].
    async fn handle(&self, request: Req, token: CancellationToken) -> anyhow::Result<Resp> {
        self.call(request, token)
            .await
            .map_err(SyncError::into_anyhow)
    }
}
