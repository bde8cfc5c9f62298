use cfg::Cfg;
use clap::Parser;
use stress::{Counter, StressTestCfg, Target, run_stress_test};
use synchro::Synchronizer;
use tracing_subscriber::EnvFilter;

pub mod cfg;
mod stress;

fn main() {
    let cfg = cfg::Cfg::parse();
    init_tracing();
    println!("Running configuration:\n{cfg:#?}");

    if let Err(e) = run(cfg) {
        eprintln!("Error: {e:?}");
        std::process::exit(1);
    }
}

/// Logs at `info` unless `RUST_LOG` says otherwise.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run(cfg: Cfg) -> anyhow::Result<()> {
    anyhow::ensure!(
        (0.0..=1.0).contains(&cfg.fault_rate),
        "fault rate must be between 0 and 1, got {}",
        cfg.fault_rate
    );
    anyhow::ensure!(
        (0.0..=1.0).contains(&cfg.cancel_rate),
        "cancel rate must be between 0 and 1, got {}",
        cfg.cancel_rate
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(async {
        let stress_cfg = StressTestCfg {
            num_producers: cfg.producer_num,
            num_operations: cfg.operation_num,
            yields: cfg.yields,
            fault_rate: cfg.fault_rate,
            cancel_rate: cfg.cancel_rate,
            run_duration_seconds: cfg.run_duration_seconds,
            print_stats_interval_ms: cfg.print_stats_interval_ms,
            latency_percentiles: vec![50.0, 90.0, 99.0, 99.9],
        };

        let synchronizer = Synchronizer::with_capacity(cfg.capacity);
        let counter = Counter::default();
        let target = Target::new(cfg.mode, &synchronizer, counter.clone());
        tracing::info!(mode = %cfg.mode, capacity = cfg.capacity.get(), "synchronizer ready");

        run_stress_test(stress_cfg, synchronizer, target, counter).await
    })
}
