//! BankLock Simulator
//!
//! Drives concurrent two-account transfers from many tellers against a
//! running coordinator and reports how the lock service behaved.

use std::time::Duration;

use chrono::Duration as ChronoDuration;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use banklock_crypto::{fingerprint, TokenSigner};
use banklock_worker::WorkerConfig;

mod controller;
mod metrics;
mod teller;

use controller::{SimulationController, SimulationSettings};

/// BankLock Simulator CLI
#[derive(Parser, Debug)]
#[command(name = "simulator")]
#[command(about = "BankLock contention simulator")]
struct Args {
    /// Coordinator WebSocket URL
    #[arg(long, env = "COORDINATOR_URL", default_value = "ws://127.0.0.1:3000/ws")]
    coordinator_url: String,

    /// Coordinator token secret, used to mint teller tokens
    #[arg(long, env = "COORDINATOR_SECRET")]
    secret: String,

    /// Number of simulated tellers
    #[arg(short, long, default_value = "4")]
    tellers: usize,

    /// Number of accounts transfers pick from
    #[arg(short, long, default_value = "10")]
    accounts: usize,

    /// Transfers per second per teller
    #[arg(long, default_value = "5.0")]
    rate: f64,

    /// Milliseconds spent inside each critical section
    #[arg(long, default_value = "20")]
    hold_ms: u64,

    /// Milliseconds a teller waits for a grant
    #[arg(long, default_value = "5000")]
    acquire_timeout_ms: u64,

    /// Share of transfers sent at high priority
    #[arg(long, default_value = "0.1")]
    high_priority_share: f64,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Run duration in seconds (0 = until Ctrl+C)
    #[arg(long, default_value = "30")]
    duration: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    if args.accounts < 2 {
        anyhow::bail!("at least two accounts are required");
    }

    info!(
        coordinator_url = %args.coordinator_url,
        tellers = args.tellers,
        accounts = args.accounts,
        rate = args.rate,
        "Starting BankLock simulator"
    );

    let signer = TokenSigner::new(&args.secret, ChronoDuration::hours(1))?;
    info!(
        secret_fingerprint = %fingerprint(args.secret.as_bytes()),
        "Minting teller tokens"
    );
    let base = WorkerConfig {
        coordinator_url: args.coordinator_url.clone(),
        acquire_timeout: Duration::from_millis(args.acquire_timeout_ms),
        ..WorkerConfig::default()
    };

    let mut controller = SimulationController::new(SimulationSettings {
        tellers: args.tellers,
        accounts: args.accounts,
        initial_balance: 1_000_000,
        rate: args.rate,
        hold: Duration::from_millis(args.hold_ms),
        high_priority_share: args.high_priority_share.clamp(0.0, 1.0),
        seed: args.seed,
    });
    controller.initialize(&base, &signer).await?;

    let duration = (args.duration > 0).then(|| Duration::from_secs(args.duration));
    if duration.is_none() {
        info!("Press Ctrl+C to stop");
    }
    let elapsed = controller.run(duration).await?;

    let metrics = controller.get_metrics().await;
    info!("Simulation complete");
    info!("Transfers attempted: {}", metrics.total_transfers);
    info!("Completed: {}", metrics.completed_transfers);
    info!("Denied: {}", metrics.denied());
    for (reason, count) in &metrics.denials {
        info!("  {}: {}", reason, count);
    }
    info!("Timed out: {}", metrics.timeouts);
    info!("Insufficient funds: {}", metrics.insufficient_funds);
    info!("Errors: {}", metrics.errors);
    info!(
        "Latency avg/p50/p99: {}/{}/{} ms",
        metrics.average_latency_ms(),
        metrics.p50_latency_ms(),
        metrics.p99_latency_ms()
    );
    info!("Success rate: {:.1}%", metrics.success_rate() * 100.0);
    info!("Throughput: {:.1} transfers/s", metrics.throughput(elapsed.as_secs_f64()));

    if metrics.exclusion_violations > 0 {
        warn!(violations = metrics.exclusion_violations, "Mutual exclusion was violated");
        anyhow::bail!("{} overlapping critical sections observed", metrics.exclusion_violations);
    }

    Ok(())
}
