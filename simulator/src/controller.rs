//! Simulation controller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use banklock_common::Priority;
use banklock_crypto::TokenSigner;
use banklock_worker::WorkerConfig;

use crate::metrics::SimulationMetrics;
use crate::teller::{account_id, AccountBook, SimulatedTeller, TellerFactory, TransferError};

/// Parameters for one run.
#[derive(Debug, Clone)]
pub struct SimulationSettings {
    pub tellers: usize,
    pub accounts: usize,
    pub initial_balance: i64,
    /// Transfers per second per teller.
    pub rate: f64,
    /// Time spent inside each critical section.
    pub hold: Duration,
    /// Share of transfers sent at high priority.
    pub high_priority_share: f64,
    pub seed: Option<u64>,
}

/// Controls the simulation.
pub struct SimulationController {
    settings: SimulationSettings,
    /// Random number generator.
    rng: Arc<Mutex<StdRng>>,
    /// Connected tellers.
    tellers: Vec<Arc<SimulatedTeller>>,
    /// Shared balances.
    book: Arc<AccountBook>,
    /// Simulation metrics.
    metrics: Arc<RwLock<SimulationMetrics>>,
}

impl SimulationController {
    /// Create a new simulation controller.
    pub fn new(settings: SimulationSettings) -> Self {
        let rng = match settings.seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        let book = AccountBook::new(settings.accounts, settings.initial_balance);

        Self {
            settings,
            rng: Arc::new(Mutex::new(rng)),
            tellers: Vec::new(),
            book: Arc::new(book),
            metrics: Arc::new(RwLock::new(SimulationMetrics::new())),
        }
    }

    /// Create the tellers and register them with the coordinator.
    pub async fn initialize(&mut self, base: &WorkerConfig, signer: &TokenSigner) -> anyhow::Result<()> {
        info!(
            tellers = self.settings.tellers,
            accounts = self.book.len().await,
            "Initializing simulation"
        );

        let tellers = TellerFactory::create_tellers(self.settings.tellers, base, signer, self.settings.hold)?;
        for teller in &tellers {
            teller.connect().await?;
            info!(worker_id = %teller.id, "Teller connected");
        }
        self.tellers = tellers;

        Ok(())
    }

    /// Generate transfers until `duration` elapses or Ctrl+C.
    pub async fn run(&self, duration: Option<Duration>) -> anyhow::Result<Duration> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let started = Instant::now();
        let initial_total = self.book.total().await;

        let mut handles = Vec::with_capacity(self.tellers.len());
        for teller in &self.tellers {
            handles.push(tokio::spawn(teller_loop(
                teller.clone(),
                self.book.clone(),
                self.metrics.clone(),
                self.rng.clone(),
                self.settings.clone(),
                stop_rx.clone(),
            )));
        }

        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => tokio::signal::ctrl_c().await?,
        }
        let _ = stop_tx.send(true);
        for handle in handles {
            handle.await?;
        }
        let elapsed = started.elapsed();

        for teller in &self.tellers {
            if let Err(e) = teller.disconnect().await {
                warn!(worker_id = %teller.id, error = %e, "Disconnect failed");
            }
        }

        let final_total = self.book.total().await;
        if final_total != initial_total {
            error!(initial_total, final_total, "Account totals diverged");
        }

        Ok(elapsed)
    }

    /// Get simulation metrics.
    pub async fn get_metrics(&self) -> SimulationMetrics {
        self.metrics.read().await.clone()
    }
}

async fn teller_loop(
    teller: Arc<SimulatedTeller>,
    book: Arc<AccountBook>,
    metrics: Arc<RwLock<SimulationMetrics>>,
    rng: Arc<Mutex<StdRng>>,
    settings: SimulationSettings,
    mut stop: watch::Receiver<bool>,
) {
    let pause = Duration::from_secs_f64(1.0 / settings.rate.max(0.001));

    while !*stop.borrow() {
        let (from, to, amount, priority) = {
            let mut rng = rng.lock().await;
            let from = rng.gen_range(0..settings.accounts);
            let mut to = rng.gen_range(0..settings.accounts);
            while to == from {
                to = rng.gen_range(0..settings.accounts);
            }
            let priority = if rng.gen_bool(settings.high_priority_share) {
                Priority::High
            } else {
                Priority::Normal
            };
            (account_id(from), account_id(to), rng.gen_range(1..500), priority)
        };

        let started = Instant::now();
        let outcome = teller.transfer(&book, &from, &to, amount, priority).await;
        let latency = started.elapsed().as_millis() as u64;

        let mut metrics = metrics.write().await;
        match outcome {
            Ok(()) => {
                debug!(worker_id = %teller.id, from = %from, to = %to, amount, latency, "Transfer complete");
                metrics.record_success(latency);
            }
            Err(TransferError::Denied(reason)) => {
                info!(worker_id = %teller.id, reason = %reason, "Transfer denied");
                metrics.record_denial(&reason);
            }
            Err(TransferError::TimedOut) => metrics.record_timeout(),
            Err(TransferError::InsufficientFunds) => metrics.record_insufficient_funds(),
            Err(TransferError::ExclusionViolated) => {
                error!(worker_id = %teller.id, from = %from, to = %to, "Overlapping critical sections");
                metrics.record_violation();
            }
            Err(e) => {
                warn!(worker_id = %teller.id, error = ?e, "Transfer failed");
                metrics.record_error();
            }
        }
        drop(metrics);

        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = stop.changed() => {}
        }
    }
}
