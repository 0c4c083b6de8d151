use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};

pub mod dry_run;
pub mod error;
pub mod mock;
pub mod solana;

pub use dry_run::DryRunLedger;
pub use error::LedgerError;
pub use mock::{MockLedger, StakeCall};
pub use solana::{ConnectRetry, SolanaLedger, load_keypair};

pub use solana_sdk::native_token::LAMPORTS_PER_SOL;
pub use solana_sdk::pubkey::Pubkey;
pub use solana_sdk::signature::Keypair;
pub use spl_stake_pool::MINIMUM_ACTIVE_STAKE;

/// Size in bytes of a delegated stake account (`StakeStateV2`), used as the
/// size hint when asking the ledger for the rent-exempt minimum.
pub const STAKE_ACCOUNT_LEN: usize = 200;

/// Read and write access to the ledger that hosts a stake pool.
///
/// Write methods are signed by the staker credential held by the
/// implementation, so callers only name the pool they act on.
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// Current epoch and how far the cluster has progressed through it
    async fn epoch_info(&self) -> Result<EpochInfo, LedgerError>;

    /// Raw account data, or `None` when the account does not exist
    async fn account_data(&self, address: &Pubkey) -> Result<Option<Vec<u8>>, LedgerError>;

    /// Minimum balance an account of `data_len` bytes needs to be rent exempt
    async fn minimum_rent_exemption(&self, data_len: usize) -> Result<u64, LedgerError>;

    /// Bring the pool's validator balances and totals up to the current epoch
    async fn update_pool(&self, pool: &Pubkey) -> Result<(), LedgerError>;

    /// Move `lamports` from the pool reserve onto the validator's stake
    async fn increase_stake(
        &self,
        pool: &Pubkey,
        vote_account: &Pubkey,
        lamports: u64,
    ) -> Result<(), LedgerError>;

    /// Move `lamports` off the validator's stake back towards the reserve
    async fn decrease_stake(
        &self,
        pool: &Pubkey,
        vote_account: &Pubkey,
        lamports: u64,
    ) -> Result<(), LedgerError>;

    fn decode_stake_pool(&self, data: &[u8]) -> Result<StakePool, LedgerError>;

    fn decode_validator_list(&self, data: &[u8]) -> Result<ValidatorList, LedgerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochInfo {
    pub epoch: u64,
    pub slot_index: u64,
    pub slots_in_epoch: u64,
}

impl EpochInfo {
    /// Fraction of the epoch's slots already elapsed, in `[0, 1)`.
    #[allow(clippy::cast_precision_loss)]
    pub fn progress(&self) -> f64 {
        if self.slots_in_epoch == 0 {
            return 0.0;
        }

        self.slot_index as f64 / self.slots_in_epoch as f64
    }
}

/// The parts of a stake pool account the rebalancer reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakePool {
    pub total_lamports: u64,
    pub last_update_epoch: u64,
    pub validator_list: Pubkey,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorList {
    pub validators: Vec<Validator>,
}

/// One validator's stake position inside the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub vote_account: Pubkey,
    pub active_stake_lamports: u64,
    pub transient_stake_lamports: u64,
}

impl Validator {
    pub fn is_transient(&self) -> bool {
        self.transient_stake_lamports != 0
    }
}

/// Direction of a stake movement submitted for a single validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StakeDirection {
    Increase,
    Decrease,
}

impl Display for StakeDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Increase => write!(f, "increase"),
            Self::Decrease => write!(f, "decrease"),
        }
    }
}
