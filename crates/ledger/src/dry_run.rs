//! Read-through gateway that never submits transactions.

use async_trait::async_trait;
use tracing::warn;

use crate::{EpochInfo, LedgerError, LedgerGateway, Pubkey, StakePool, ValidatorList};

/// Wraps another gateway, forwarding every read and logging every write
/// action instead of submitting it.
#[derive(Debug)]
pub struct DryRunLedger<L> {
    inner: L,
}

impl<L: LedgerGateway> DryRunLedger<L> {
    pub fn new(inner: L) -> Self {
        warn!("[DRY RUN] Stake pool actions will be logged but not submitted");
        Self { inner }
    }

    pub fn into_inner(self) -> L {
        self.inner
    }
}

#[async_trait]
impl<L: LedgerGateway> LedgerGateway for DryRunLedger<L> {
    async fn epoch_info(&self) -> Result<EpochInfo, LedgerError> {
        self.inner.epoch_info().await
    }

    async fn account_data(&self, address: &Pubkey) -> Result<Option<Vec<u8>>, LedgerError> {
        self.inner.account_data(address).await
    }

    async fn minimum_rent_exemption(&self, data_len: usize) -> Result<u64, LedgerError> {
        self.inner.minimum_rent_exemption(data_len).await
    }

    async fn update_pool(&self, pool: &Pubkey) -> Result<(), LedgerError> {
        warn!("[DRY RUN] Would update stake pool {pool}");
        Ok(())
    }

    async fn increase_stake(
        &self,
        pool: &Pubkey,
        vote_account: &Pubkey,
        lamports: u64,
    ) -> Result<(), LedgerError> {
        warn!("[DRY RUN] Would increase stake on {vote_account} by {lamports} lamports in {pool}");
        Ok(())
    }

    async fn decrease_stake(
        &self,
        pool: &Pubkey,
        vote_account: &Pubkey,
        lamports: u64,
    ) -> Result<(), LedgerError> {
        warn!("[DRY RUN] Would decrease stake on {vote_account} by {lamports} lamports in {pool}");
        Ok(())
    }

    fn decode_stake_pool(&self, data: &[u8]) -> Result<StakePool, LedgerError> {
        self.inner.decode_stake_pool(data)
    }

    fn decode_validator_list(&self, data: &[u8]) -> Result<ValidatorList, LedgerError> {
        self.inner.decode_validator_list(data)
    }
}
