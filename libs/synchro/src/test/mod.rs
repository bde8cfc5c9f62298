pub(crate) mod suite;

#[cfg(test)]
mod test_suite {
    use std::{
        num::NonZeroUsize,
        sync::{Arc, atomic::AtomicUsize},
    };

    use futures::FutureExt;
    use tokio_util::sync::CancellationToken;

    use super::suite::{self, Caller, Tester};
    use crate::Synchronizer;

    /// Drives the suite through [`Synchronizer::submit`].
    struct SubmitTester;

    impl Tester for SubmitTester {
        fn create_caller(
            &self,
            synchronizer: &Synchronizer,
            counter: Arc<AtomicUsize>,
        ) -> Caller {
            let synchronizer = synchronizer.clone();
            Arc::new(move |request: u64, token: CancellationToken| {
                let synchronizer = synchronizer.clone();
                let counter = Arc::clone(&counter);
                async move {
                    synchronizer
                        .submit(
                            move |token| suite::increment(counter, request, token),
                            token,
                        )
                        .await
                }
                .boxed()
            })
        }
    }

    /// Drives the suite through a handler wrapped with [`Synchronizer::wrap`].
    struct WrapTester;

    impl Tester for WrapTester {
        fn create_caller(
            &self,
            synchronizer: &Synchronizer,
            counter: Arc<AtomicUsize>,
        ) -> Caller {
            let wrapped = synchronizer.wrap(move |request: u64, token: CancellationToken| {
                suite::increment(Arc::clone(&counter), request, token)
            });
            Arc::new(move |request: u64, token: CancellationToken| {
                let wrapped = wrapped.clone();
                async move { wrapped.call(request, token).await }.boxed()
            })
        }
    }

    fn capacity(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn submit_no_lost_updates_with_1000_calls() {
        suite::test_mutual_exclusion(SubmitTester, 1_000, capacity(1)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn wrap_no_lost_updates_with_1000_calls() {
        suite::test_mutual_exclusion(WrapTester, 1_000, capacity(1)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn no_lost_updates_with_larger_queue() {
        suite::test_mutual_exclusion(SubmitTester, 500, capacity(64)).await;
        suite::test_mutual_exclusion(WrapTester, 500, capacity(64)).await;
    }

    #[tokio::test]
    async fn single_call() {
        suite::test_mutual_exclusion(SubmitTester, 1, capacity(1)).await;
        suite::test_mutual_exclusion(WrapTester, 1, capacity(1)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn faults_do_not_leak_into_neighbours() {
        suite::test_fault_containment(SubmitTester).await;
        suite::test_fault_containment(WrapTester).await;
    }

    #[tokio::test]
    async fn pre_cancelled_calls_never_run() {
        suite::test_pre_cancelled(SubmitTester).await;
        suite::test_pre_cancelled(WrapTester).await;
    }
}
