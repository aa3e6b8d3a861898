//! Simulate command - synthetic workload
//!
//! Spawns concurrent workers that borrow, use and release connections from an
//! in-memory factory, then prints pool statistics as JSON. Useful for seeing
//! how a configuration behaves under contention before deploying it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use connpool::testing::MemoryFactory;
use connpool::{ConnectionPool, PoolError, PoolStats, ShutdownReport};

use super::load_config;

/// Arguments for the simulate command
#[derive(Parser, Debug, Clone)]
pub struct SimulateArgs {
    /// Pool configuration file (defaults plus environment overrides if omitted)
    #[arg(short = 'c', long, env = "CONNPOOL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Number of concurrent workers
    #[arg(short = 'w', long, default_value = "8")]
    pub workers: usize,

    /// Borrows performed by each worker
    #[arg(short = 'n', long, default_value = "100")]
    pub iterations: usize,

    /// How long each borrow holds its connection, in milliseconds
    #[arg(long, default_value = "5")]
    pub hold_ms: u64,

    /// Probability that a validation fails (enables test-on-borrow when > 0)
    #[arg(long, default_value = "0.0")]
    pub fail_validation_rate: f64,
}

/// Outcome of one worker
#[derive(Debug, Default, Clone, Copy)]
struct WorkerTally {
    completed: usize,
    exhausted: usize,
    failed: usize,
}

/// Printed result of a simulation run
#[derive(Debug, Serialize)]
struct SimulationSummary {
    workers: usize,
    iterations: usize,
    completed: usize,
    exhausted: usize,
    failed: usize,
    elapsed_ms: u128,
    stats: PoolStats,
    idle_closed: usize,
    drained: bool,
}

impl SimulateArgs {
    /// Execute the simulate command
    pub async fn execute(&self) -> Result<i32> {
        let mut config = load_config(self.config.as_deref())?;
        let factory = MemoryFactory::new();
        if self.fail_validation_rate > 0.0 {
            factory.set_validation_failure_rate(self.fail_validation_rate);
            if !config.test_on_borrow {
                info!("Enabling test_on_borrow for validation failure simulation");
                config.test_on_borrow = true;
            }
        }

        let pool = Arc::new(ConnectionPool::new(factory, config)?);
        pool.init().await?;
        info!(
            workers = self.workers,
            iterations = self.iterations,
            "Starting simulation"
        );

        let started = Instant::now();
        let hold = Duration::from_millis(self.hold_ms);
        let handles = (0..self.workers).map(|worker| {
            let pool = Arc::clone(&pool);
            let iterations = self.iterations;
            tokio::spawn(async move { run_worker(worker, &pool, iterations, hold).await })
        });

        let mut total = WorkerTally::default();
        for result in join_all(handles).await {
            match result {
                Ok(tally) => {
                    total.completed += tally.completed;
                    total.exhausted += tally.exhausted;
                    total.failed += tally.failed;
                }
                Err(e) => warn!(error = %e, "Worker task failed"),
            }
        }
        let elapsed = started.elapsed();

        let stats = pool.stats();
        let ShutdownReport {
            idle_closed,
            drained,
            ..
        } = pool.close().await;

        let summary = SimulationSummary {
            workers: self.workers,
            iterations: self.iterations,
            completed: total.completed,
            exhausted: total.exhausted,
            failed: total.failed,
            elapsed_ms: elapsed.as_millis(),
            stats,
            idle_closed,
            drained,
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);

        Ok(i32::from(total.failed > 0))
    }
}

async fn run_worker(
    worker: usize,
    pool: &ConnectionPool<MemoryFactory>,
    iterations: usize,
    hold: Duration,
) -> WorkerTally {
    let mut tally = WorkerTally::default();

    for iteration in 0..iterations {
        let mut conn = match pool.get_connection().await {
            Ok(conn) => conn,
            Err(PoolError::PoolExhausted { waited }) => {
                debug!(worker, iteration, waited = ?waited, "Borrow timed out");
                tally.exhausted += 1;
                continue;
            }
            Err(e) => {
                warn!(worker, iteration, error = %e, "Borrow failed");
                tally.failed += 1;
                continue;
            }
        };

        let statement = format!("SELECT {worker}, {iteration}");
        match conn.passthrough(|c| c.query(&statement)).await {
            Ok(_) => tally.completed += 1,
            Err(e) => {
                warn!(worker, iteration, error = %e, "Query failed");
                tally.failed += 1;
            }
        }
        if !hold.is_zero() {
            tokio::time::sleep(hold).await;
        }
        conn.release().await;
    }
    tally
}
