use std::num::NonZeroUsize;

#[derive(Debug, Clone, clap::Parser)]
pub struct Cfg {
    /// The submission path to put under load.
    pub mode: Mode,
    /// Number of producers that submit operations concurrently.
    #[arg(short, long, default_value_t = 8)]
    pub producer_num: usize,
    /// Number of operations each producer submits during the test.
    #[arg(short, long, default_value_t = 10_000)]
    pub operation_num: usize,
    /// Number of operations the synchronizer queues before producers have to wait for a slot.
    #[arg(short, long, default_value = "1")]
    pub capacity: NonZeroUsize,
    /// Times each operation yields to the runtime between reading and writing the counter.
    #[arg(short, long, default_value_t = 1)]
    pub yields: usize,
    /// Share of operations (0.0 to 1.0) that fail on purpose.
    #[arg(long, default_value_t = 0.0)]
    pub fault_rate: f64,
    /// Share of operations (0.0 to 1.0) submitted with an already cancelled token.
    #[arg(long, default_value_t = 0.0)]
    pub cancel_rate: f64,
    /// How often to print stats.
    #[arg(long, default_value_t = 1_000)]
    pub print_stats_interval_ms: u64,
    // Hard cap on the test's execution time
    #[arg(long, default_value_t = 30)]
    pub run_duration_seconds: u64,
}

#[derive(Debug, Clone, Copy, strum::EnumString, strum::Display, clap::ValueEnum)]
pub enum Mode {
    /// Every operation goes through `Synchronizer::submit`.
    #[strum(ascii_case_insensitive)]
    Submit,
    /// Every operation goes through a handler wrapped with `Synchronizer::wrap`.
    #[strum(ascii_case_insensitive)]
    Wrap,
}
