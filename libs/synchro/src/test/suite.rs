//! Scenarios shared by the direct and the wrapped submission paths.

use std::{
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use futures::future::{BoxFuture, join_all};
use tokio_util::sync::CancellationToken;

use crate::{Cfg, SyncError, Synchronizer};

/// Request value that makes [`increment`] fail before touching the counter.
pub const FAILING_REQUEST: u64 = u64::MAX;

/// Submits a request to a synchronized [`increment`] and resolves to its outcome.
pub type Caller =
    Arc<dyn Fn(u64, CancellationToken) -> BoxFuture<'static, Result<u64, SyncError>> + Send + Sync>;

pub trait Tester {
    /// Builds a [`Caller`] that routes through `synchronizer` and counts into `counter`.
    fn create_caller(&self, synchronizer: &Synchronizer, counter: Arc<AtomicUsize>) -> Caller;
}

/// Unguarded read-yield-write on `counter`. Overlapping executions lose updates.
///
/// Echoes `request` back so callers can check they got their own result.
pub async fn increment(
    counter: Arc<AtomicUsize>,
    request: u64,
    _token: CancellationToken,
) -> anyhow::Result<u64> {
    anyhow::ensure!(request != FAILING_REQUEST, "request {request} rejected");

    let seen = counter.load(Ordering::Relaxed);
    tokio::task::yield_now().await;
    counter.store(seen + 1, Ordering::Relaxed);

    Ok(request)
}

/// `n` concurrent calls leave the counter at exactly `n`, and each caller gets its own request
/// echoed back.
pub async fn test_mutual_exclusion(tester: impl Tester, n: u64, capacity: NonZeroUsize) {
    let synchronizer = Synchronizer::new(Cfg { capacity });
    let loop_token = CancellationToken::new();
    let runner = synchronizer.start(loop_token.clone());

    let counter = Arc::new(AtomicUsize::new(0));
    let caller = tester.create_caller(&synchronizer, Arc::clone(&counter));

    let handles = (0..n).map(|i| {
        let caller = Arc::clone(&caller);
        tokio::spawn(async move { (i, caller(i, CancellationToken::new()).await) })
    });

    for joined in join_all(handles).await {
        let (request, res) = joined.expect("caller task does not panic");
        assert_eq!(res.expect("call succeeds"), request);
    }

    assert_eq!(counter.load(Ordering::Relaxed), n as usize);

    loop_token.cancel();
    runner
        .await
        .expect("loop task does not panic")
        .expect("loop stops cleanly");
}

/// Failing calls settle with their own error and every other call still runs.
pub async fn test_fault_containment(tester: impl Tester) {
    let synchronizer = Synchronizer::new(Cfg {
        capacity: NonZeroUsize::new(4).unwrap(),
    });
    let runner = synchronizer.start(CancellationToken::new());

    let counter = Arc::new(AtomicUsize::new(0));
    let caller = tester.create_caller(&synchronizer, Arc::clone(&counter));

    let handles = (0..100u64).map(|i| {
        let caller = Arc::clone(&caller);
        let request = if i % 10 == 0 { FAILING_REQUEST } else { i };
        tokio::spawn(async move { (request, caller(request, CancellationToken::new()).await) })
    });

    let mut faulted = 0;
    for joined in join_all(handles).await {
        match joined.expect("caller task does not panic") {
            (FAILING_REQUEST, Err(SyncError::Faulted(e))) => {
                assert_eq!(e.to_string(), format!("request {FAILING_REQUEST} rejected"));
                faulted += 1;
            }
            (request, Ok(echo)) => assert_eq!(echo, request),
            (request, other) => panic!("unexpected outcome for {request}: {other:?}"),
        }
    }

    assert_eq!(faulted, 10);
    assert_eq!(counter.load(Ordering::Relaxed), 90);
    runner.abort();
}

/// A call whose token fired before it got a queue slot settles as cancelled without running,
/// even with no consumer loop around.
pub async fn test_pre_cancelled(tester: impl Tester) {
    let synchronizer = Synchronizer::default();
    let counter = Arc::new(AtomicUsize::new(0));
    let caller = tester.create_caller(&synchronizer, Arc::clone(&counter));

    let token = CancellationToken::new();
    token.cancel();

    let res = caller(1, token).await;
    assert!(matches!(res, Err(SyncError::Cancelled)));
    assert_eq!(synchronizer.queued(), 0);
    assert_eq!(counter.load(Ordering::Relaxed), 0);
}
