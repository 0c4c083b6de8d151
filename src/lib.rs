use std::sync::Arc;
use tokio::task::JoinError;
use tracing::{Instrument, error, info, warn};

use st0x_ledger::{DryRunLedger, LedgerGateway, SolanaLedger, load_keypair};

pub mod config;
pub mod error;
pub mod rebalancing;
pub mod scheduler;
mod telemetry;

pub use error::{ActionFailure, InvalidPoolState, RebalanceError};
pub use rebalancing::{Rebalance, RebalanceReport, Rebalancer, SkipReason, ValidatorOutcome};
pub use scheduler::{EpochScheduler, EpochState, SchedulerConfig, SchedulerPhase, TickOutcome};
pub use telemetry::{HyperDxConfig, TelemetryError, TelemetryGuard};

#[cfg(test)]
pub(crate) mod test_utils;

use crate::config::Ctx;
use crate::scheduler::connect_with_backoff;

/// Connects to the network and either rebalances once or, in service mode,
/// follows epochs until interrupted.
#[tracing::instrument(skip_all, fields(pool = %ctx.pool), level = tracing::Level::INFO)]
pub async fn launch(ctx: Ctx) -> anyhow::Result<()> {
    let staker = load_keypair(&ctx.staker_keypair)?;
    let endpoint = ctx.endpoint.as_str();

    // Service mode retries connectivity failures indefinitely.
    let solana = if ctx.service {
        connect_with_backoff(ctx.scheduler.error_backoff, || {
            SolanaLedger::connect(endpoint, staker.insecure_clone(), ctx.connect_retry)
        })
        .await?
    } else {
        SolanaLedger::connect(endpoint, staker, ctx.connect_retry).await?
    };

    let ledger: Arc<dyn LedgerGateway> = if ctx.dry_run {
        Arc::new(DryRunLedger::new(solana))
    } else {
        Arc::new(solana)
    };

    let rebalancer = Arc::new(Rebalancer::new(
        ledger.clone(),
        ctx.pool,
        ctx.reserve_lamports,
    ));

    if !ctx.service {
        let report = rebalancer.rebalance().await?;
        info!(
            epoch = report.epoch,
            lamports_per_validator = report.lamports_per_validator,
            submitted = report.submitted(),
            skipped = report.skipped(),
            "One-shot rebalance finished"
        );
        return Ok(());
    }

    let scheduler = EpochScheduler::new(ledger, rebalancer, ctx.pool, ctx.scheduler);
    let scheduler_task = tokio::spawn(scheduler.run().in_current_span());

    await_shutdown(scheduler_task).await;

    info!("Shutdown complete");
    Ok(())
}

async fn await_shutdown(scheduler_task: tokio::task::JoinHandle<()>) {
    let scheduler_abort = scheduler_task.abort_handle();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, shutting down gracefully...");
            info!("Aborting scheduler task");
            scheduler_abort.abort();
        }
        result = scheduler_task => {
            log_scheduler_result(result);
        }
    }
}

fn log_scheduler_result(result: Result<(), JoinError>) {
    match result {
        Ok(()) => warn!("Scheduler task exited unexpectedly"),
        Err(e) => error!("Scheduler task panicked: {e}"),
    }
}
