//! Fetches a consistent view of the pool for the current epoch.

use tracing::{debug, info};

use st0x_ledger::{LedgerError, LedgerGateway, Pubkey, StakePool, ValidatorList};

use crate::error::RebalanceError;

/// Pool state read after any pending epoch update has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PoolSnapshot {
    pub(crate) stake_pool: StakePool,
    pub(crate) validator_list: ValidatorList,
    pub(crate) epoch: u64,
}

#[tracing::instrument(skip(ledger), level = tracing::Level::DEBUG)]
pub(crate) async fn reconcile(
    ledger: &dyn LedgerGateway,
    pool: &Pubkey,
) -> Result<PoolSnapshot, RebalanceError> {
    let epoch = ledger.epoch_info().await?.epoch;

    let mut stake_pool = fetch_stake_pool(ledger, pool).await?;

    if stake_pool.last_update_epoch != epoch {
        info!(
            last_update_epoch = stake_pool.last_update_epoch,
            epoch, "Stake pool is stale, updating before rebalancing"
        );

        ledger.update_pool(pool).await.map_err(pool_update_error)?;
        stake_pool = fetch_stake_pool(ledger, pool).await?;
    }

    let data = ledger
        .account_data(&stake_pool.validator_list)
        .await?
        .ok_or(RebalanceError::StateFetch {
            address: stake_pool.validator_list,
        })?;
    let validator_list = ledger.decode_validator_list(&data)?;

    debug!(
        epoch,
        total_lamports = stake_pool.total_lamports,
        validators = validator_list.validators.len(),
        "Pool state reconciled"
    );

    Ok(PoolSnapshot {
        stake_pool,
        validator_list,
        epoch,
    })
}

async fn fetch_stake_pool(
    ledger: &dyn LedgerGateway,
    pool: &Pubkey,
) -> Result<StakePool, RebalanceError> {
    let data = ledger
        .account_data(pool)
        .await?
        .ok_or(RebalanceError::StateFetch { address: *pool })?;

    Ok(ledger.decode_stake_pool(&data)?)
}

/// Connectivity loss keeps its own class so the scheduler can tell it apart.
pub(crate) fn pool_update_error(error: LedgerError) -> RebalanceError {
    match error {
        LedgerError::Connectivity { .. } => RebalanceError::Connectivity(error),
        other => RebalanceError::PoolUpdate(other),
    }
}
