use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use hdrhistogram::Histogram;
use num_format::{SystemLocale, ToFormattedString};
use rand::Rng;
use synchro::{CancellationToken, Cancelled, Handler, SyncError, Synchronized, Synchronizer};
use tokio::{sync::Barrier, time};

use crate::cfg::Mode;

#[derive(Debug, Clone)]
pub struct StressTestCfg {
    pub num_producers: usize,
    /// Operations per producer
    pub num_operations: usize,
    pub yields: usize,
    pub fault_rate: f64,
    pub cancel_rate: f64,
    pub run_duration_seconds: u64,
    /// How often to print stats
    pub print_stats_interval_ms: u64,
    /// Percentiles to track (e.g. [50.0, 90.0, 99.0, 99.9])
    pub latency_percentiles: Vec<f64>,
}

// region:    --- Guarded resource

/// Payload of a single stress operation.
#[derive(Debug, Clone, Copy)]
pub struct Operation {
    pub id: u64,
    pub yields: usize,
    pub fail: bool,
}

/// The resource under protection: a counter that only stays correct if updates never overlap.
#[derive(Debug, Clone, Default)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl Handler<Operation, u64> for Counter {
    /// Reads the counter, yields `op.yields` times and writes it back incremented.
    async fn handle(&self, op: Operation, token: CancellationToken) -> anyhow::Result<u64> {
        anyhow::ensure!(!op.fail, "operation {} failed on purpose", op.id);

        let seen = self.0.load(Ordering::Relaxed);
        for _ in 0..op.yields {
            Cancelled::check(&token)?;
            tokio::task::yield_now().await;
        }
        self.0.store(seen + 1, Ordering::Relaxed);

        Ok(seen + 1)
    }
}

/// Routes operations to the [`Counter`] through one of the two submission paths.
#[derive(Clone)]
pub enum Target {
    Submit {
        synchronizer: Synchronizer,
        counter: Counter,
    },
    Wrap(Synchronized<Counter, Operation, u64>),
}

impl Target {
    pub fn new(mode: Mode, synchronizer: &Synchronizer, counter: Counter) -> Self {
        match mode {
            Mode::Submit => Self::Submit {
                synchronizer: synchronizer.clone(),
                counter,
            },
            Mode::Wrap => Self::Wrap(synchronizer.wrap(counter)),
        }
    }

    async fn call(&self, op: Operation, token: CancellationToken) -> Result<u64, SyncError> {
        match self {
            Self::Submit {
                synchronizer,
                counter,
            } => {
                let counter = counter.clone();
                synchronizer
                    .submit(
                        move |token| async move { counter.handle(op, token).await },
                        token,
                    )
                    .await
            }
            Self::Wrap(wrapped) => wrapped.call(op, token).await,
        }
    }
}

// endregion: --- Guarded resource

// region:    --- Stats

struct TestStats {
    submitted_ops: AtomicU64,
    completed_ops: AtomicU64,
    faulted_ops: AtomicU64,
    cancelled_ops: AtomicU64,
    other_errors: AtomicU64,
    // Submit-to-settle latency of completed operations
    latency_hist: Mutex<Histogram<u64>>,
    locale: SystemLocale,
}

impl TestStats {
    fn new() -> anyhow::Result<Self> {
        Ok(Self {
            submitted_ops: AtomicU64::new(0),
            completed_ops: AtomicU64::new(0),
            faulted_ops: AtomicU64::new(0),
            cancelled_ops: AtomicU64::new(0),
            other_errors: AtomicU64::new(0),
            latency_hist: Mutex::new(
                Histogram::new_with_max(60_000_000, 3).context("could not create histogram")?,
            ),
            locale: SystemLocale::default().context("could not read system locale")?,
        })
    }

    fn record_submission(&self) {
        self.submitted_ops.fetch_add(1, Ordering::Relaxed);
    }

    fn record_outcome(&self, outcome: &Result<u64, SyncError>, latency_us: u64) {
        match outcome {
            Ok(_) => {
                self.completed_ops.fetch_add(1, Ordering::Relaxed);
                self.record_latency(latency_us);
            }
            Err(SyncError::Faulted(_)) => {
                self.faulted_ops.fetch_add(1, Ordering::Relaxed);
            }
            Err(SyncError::Cancelled) => {
                self.cancelled_ops.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.other_errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn record_latency(&self, latency_us: u64) {
        if let Ok(mut hist) = self.latency_hist.lock() {
            let lat = latency_us.min(hist.high());
            hist.record(lat).ok();
        }
    }

    fn completed(&self) -> u64 {
        self.completed_ops.load(Ordering::Relaxed)
    }

    fn calculate_percentile(&self, percentile: f64) -> Option<u64> {
        let hist = self.latency_hist.lock().ok()?;
        if hist.is_empty() {
            return None;
        }
        Some(hist.value_at_quantile(percentile / 100.0))
    }

    fn print_stats(&self, elapsed_seconds: f64, percentiles: &[f64]) {
        let submitted = self.submitted_ops.load(Ordering::Relaxed);
        let completed = self.completed();
        let faulted = self.faulted_ops.load(Ordering::Relaxed);
        let cancelled = self.cancelled_ops.load(Ordering::Relaxed);
        let other = self.other_errors.load(Ordering::Relaxed);
        let settled = completed + faulted + cancelled + other;

        let settle_rate = settled as f64 / elapsed_seconds;

        let avg_latency = { self.latency_hist.lock().map(|h| h.mean()) }.unwrap_or_default();
        let max_latency = { self.latency_hist.lock().map(|h| h.max()) }.unwrap_or_default();

        println!("--- SYNCHRONIZER STATS [{:.2}s] ---", elapsed_seconds);
        println!(
            "Submitted: {} ops, settled: {} ops ({:.2} ops/sec)",
            submitted.to_formatted_string(&self.locale),
            settled.to_formatted_string(&self.locale),
            settle_rate
        );
        println!(
            "Completed: {}, faulted: {}, cancelled: {}, other errors: {}",
            completed, faulted, cancelled, other
        );
        println!("In flight: ~{} ops", submitted.saturating_sub(settled));
        println!(
            "Latency: avg {} μs, max {} μs.",
            ((avg_latency * 10.0) as u64 / 10).to_formatted_string(&self.locale),
            max_latency.to_formatted_string(&self.locale)
        );

        print!("Percentiles: ");
        for &p in percentiles {
            if let Some(latency) = self.calculate_percentile(p) {
                print!(
                    "P{:.1}: {} μs, ",
                    p,
                    latency.to_formatted_string(&self.locale)
                );
            }
        }
        println!();

        println!("---------------------------");
    }
}

// endregion: --- Stats

async fn run_producer(
    producer_id: usize,
    target: Target,
    cfg: StressTestCfg,
    stats: Arc<TestStats>,
    start_barrier: Arc<Barrier>,
    stop_signal: Arc<AtomicU64>,
) {
    // Wait for all producers to be ready
    start_barrier.wait().await;

    let mut op_counter = 0;

    while stop_signal.load(Ordering::Relaxed) == 0 && op_counter < cfg.num_operations {
        let (fail, cancel) = {
            let mut rng = rand::rng();
            (
                rng.random_bool(cfg.fault_rate),
                rng.random_bool(cfg.cancel_rate),
            )
        };

        let op = Operation {
            id: (producer_id * cfg.num_operations + op_counter) as u64,
            yields: cfg.yields,
            fail,
        };
        let token = CancellationToken::new();
        if cancel {
            token.cancel();
        }

        stats.record_submission();
        let start = Instant::now();
        let outcome = target.call(op, token).await;
        let latency_us = start.elapsed().as_micros().try_into().unwrap_or(u64::MAX);
        stats.record_outcome(&outcome, latency_us);
        op_counter += 1;

        if let Err(e @ (SyncError::Closed | SyncError::Abandoned)) = outcome {
            tracing::warn!(producer_id, error = %e, "synchronizer unusable, stopping producer");
            break;
        }
    }

    tracing::debug!(producer_id, submitted = op_counter, "producer completed");
}

/// Puts `synchronizer` under load through `target` and checks afterwards that no update of
/// `counter` was lost.
pub async fn run_stress_test(
    config: StressTestCfg,
    synchronizer: Synchronizer,
    target: Target,
    counter: Counter,
) -> anyhow::Result<()> {
    println!("Starting synchronizer stress test with config: {:?}", config);

    let stats = Arc::new(TestStats::new()?);

    let loop_token = CancellationToken::new();
    let runner = synchronizer.start(loop_token.clone());

    // Start barrier ensures all producers start simultaneously
    let start_barrier = Arc::new(Barrier::new(config.num_producers + 1));

    // Stop signal to coordinate shutdown
    let stop_signal = Arc::new(AtomicU64::new(0));

    let mut producer_handles = Vec::with_capacity(config.num_producers);
    for producer_id in 0..config.num_producers {
        let handle = tokio::spawn(run_producer(
            producer_id,
            target.clone(),
            config.clone(),
            Arc::clone(&stats),
            Arc::clone(&start_barrier),
            Arc::clone(&stop_signal),
        ));

        producer_handles.push(handle);
    }

    let stats_printer = {
        let stats_clone = Arc::clone(&stats);
        let printer_stop = Arc::clone(&stop_signal);
        let percentiles = config.latency_percentiles.clone();
        let interval_ms = config.print_stats_interval_ms;

        tokio::spawn(async move {
            let start_time = Instant::now();
            let mut interval = time::interval(Duration::from_millis(interval_ms));

            while printer_stop.load(Ordering::Relaxed) == 0 {
                interval.tick().await;
                let elapsed = start_time.elapsed().as_secs_f64();
                stats_clone.print_stats(elapsed, &percentiles);
            }

            let elapsed = start_time.elapsed().as_secs_f64();
            stats_clone.print_stats(elapsed, &percentiles);
        })
    };

    tracing::info!("waiting for all producers to be ready");
    start_barrier.wait().await;
    tracing::info!("test started");

    // Producers stop on their own once done, the duration is only a cap
    let producers = async {
        for handle in producer_handles {
            handle.await.context("producer task panicked")?;
        }
        anyhow::Ok(())
    };
    tokio::pin!(producers);
    let cap = time::sleep(Duration::from_secs(config.run_duration_seconds));
    tokio::select! {
        res = &mut producers => res?,
        _ = cap => {
            tracing::info!("test duration completed, shutting down");
            stop_signal.store(1, Ordering::SeqCst);
            producers.await?;
        }
    }
    stop_signal.store(1, Ordering::SeqCst);

    loop_token.cancel();
    runner
        .await
        .context("consumer loop task panicked")?
        .context("consumer loop faulted")?;
    stats_printer.await.ok();

    let completed = stats.completed();
    let observed = counter.get();
    anyhow::ensure!(
        observed == completed,
        "lost updates: counter is at {observed} after {completed} completed operations"
    );
    println!("No lost updates: counter matches {completed} completed operations.");

    Ok(())
}
