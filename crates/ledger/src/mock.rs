//! In-memory ledger for tests and local experimentation.
//!
//! Accounts are stored as JSON so the decode path is exercised the same way
//! a real gateway decodes raw bytes. Stake movements are recorded and applied
//! as transient stake, mimicking how the real pool reports them until the
//! next epoch.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::warn;

use crate::error::LedgerAction;
use crate::{
    EpochInfo, LedgerError, LedgerGateway, Pubkey, StakeDirection, StakePool, Validator,
    ValidatorList,
};

/// Parameters captured from an `increase_stake` or `decrease_stake` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StakeCall {
    pub pool: Pubkey,
    pub vote_account: Pubkey,
    pub lamports: u64,
    pub direction: StakeDirection,
}

#[derive(Debug)]
struct MockState {
    epoch: EpochInfo,
    pool: Option<StakePool>,
    validators: Vec<Validator>,
    total_after_update: Option<u64>,
    stake_calls: Vec<StakeCall>,
}

#[derive(Debug)]
pub struct MockLedger {
    pool_address: Pubkey,
    rent_exemption: u64,
    state: Mutex<MockState>,
    epoch_info_count: AtomicUsize,
    pool_update_count: AtomicUsize,
    fail_epoch_info: AtomicBool,
    fail_pool_update: AtomicBool,
    failing_validators: Mutex<HashSet<Pubkey>>,
}

impl MockLedger {
    /// Creates a ledger holding `pool` at `pool_address` whose validator list
    /// contains `validators`. The pool starts up to date with epoch 0.
    pub fn new(pool_address: Pubkey, pool: StakePool, validators: Vec<Validator>) -> Self {
        let epoch = EpochInfo {
            epoch: pool.last_update_epoch,
            slot_index: 0,
            slots_in_epoch: 432_000,
        };

        Self {
            pool_address,
            rent_exemption: 2_282_880,
            state: Mutex::new(MockState {
                epoch,
                pool: Some(pool),
                validators,
                total_after_update: None,
                stake_calls: Vec::new(),
            }),
            epoch_info_count: AtomicUsize::new(0),
            pool_update_count: AtomicUsize::new(0),
            fail_epoch_info: AtomicBool::new(false),
            fail_pool_update: AtomicBool::new(false),
            failing_validators: Mutex::new(HashSet::new()),
        }
    }

    /// Creates a ledger on which the pool account does not exist.
    pub fn without_pool(pool_address: Pubkey) -> Self {
        let ledger = Self::new(
            pool_address,
            StakePool {
                total_lamports: 0,
                last_update_epoch: 0,
                validator_list: Pubkey::new_unique(),
            },
            Vec::new(),
        );
        ledger.lock().pool = None;
        ledger
    }

    #[must_use]
    pub fn with_rent_exemption(mut self, lamports: u64) -> Self {
        self.rent_exemption = lamports;
        self
    }

    #[must_use]
    pub fn with_epoch(self, epoch: u64, slot_index: u64, slots_in_epoch: u64) -> Self {
        self.set_epoch(epoch, slot_index, slots_in_epoch);
        self
    }

    /// Total lamports the pool reports once an update has been applied.
    #[must_use]
    pub fn with_total_after_update(self, total_lamports: u64) -> Self {
        self.lock().total_after_update = Some(total_lamports);
        self
    }

    /// Makes every stake movement targeting `vote_account` fail.
    #[must_use]
    pub fn failing_validator(self, vote_account: Pubkey) -> Self {
        self.failing().insert(vote_account);
        self
    }

    #[must_use]
    pub fn failing_pool_update(self) -> Self {
        self.fail_pool_update.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_epoch(&self, epoch: u64, slot_index: u64, slots_in_epoch: u64) {
        self.lock().epoch = EpochInfo {
            epoch,
            slot_index,
            slots_in_epoch,
        };
    }

    pub fn set_epoch_info_failure(&self, fail: bool) {
        self.fail_epoch_info.store(fail, Ordering::SeqCst);
    }

    pub fn set_pool_update_failure(&self, fail: bool) {
        self.fail_pool_update.store(fail, Ordering::SeqCst);
    }

    pub fn epoch_info_calls(&self) -> usize {
        self.epoch_info_count.load(Ordering::SeqCst)
    }

    pub fn pool_update_calls(&self) -> usize {
        self.pool_update_count.load(Ordering::SeqCst)
    }

    /// Every stake movement submitted so far, including rejected ones.
    pub fn stake_calls(&self) -> Vec<StakeCall> {
        self.lock().stake_calls.clone()
    }

    pub fn stake_pool(&self) -> Option<StakePool> {
        self.lock().pool.clone()
    }

    pub fn validators(&self) -> Vec<Validator> {
        self.lock().validators.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        }
    }

    fn failing(&self) -> std::sync::MutexGuard<'_, HashSet<Pubkey>> {
        match self.failing_validators.lock() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        }
    }

    fn record_stake(
        &self,
        pool: &Pubkey,
        vote_account: &Pubkey,
        lamports: u64,
        direction: StakeDirection,
    ) -> Result<(), LedgerError> {
        let mut state = self.lock();

        state.stake_calls.push(StakeCall {
            pool: *pool,
            vote_account: *vote_account,
            lamports,
            direction,
        });

        if self.failing().contains(vote_account) {
            return Err(LedgerError::Rejected {
                action: LedgerAction::Stake(direction),
                reason: "mock_failure".to_string(),
            });
        }

        let validator = state
            .validators
            .iter_mut()
            .find(|validator| validator.vote_account == *vote_account)
            .ok_or(LedgerError::ValidatorNotFound {
                pool: *pool,
                vote_account: *vote_account,
            })?;

        match direction {
            StakeDirection::Increase => {
                validator.transient_stake_lamports += lamports;
            }
            StakeDirection::Decrease => {
                validator.active_stake_lamports -= lamports.min(validator.active_stake_lamports);
                validator.transient_stake_lamports += lamports;
            }
        }

        warn!(
            "[MOCK] {direction} of {lamports} lamports on {vote_account} recorded as transient"
        );
        Ok(())
    }
}

#[async_trait]
impl LedgerGateway for MockLedger {
    async fn epoch_info(&self) -> Result<EpochInfo, LedgerError> {
        self.epoch_info_count.fetch_add(1, Ordering::SeqCst);

        if self.fail_epoch_info.load(Ordering::SeqCst) {
            return Err(LedgerError::Connectivity {
                endpoint: "mock".to_string(),
                reason: "injected epoch info failure".to_string(),
            });
        }

        Ok(self.lock().epoch)
    }

    async fn account_data(&self, address: &Pubkey) -> Result<Option<Vec<u8>>, LedgerError> {
        let state = self.lock();

        let Some(pool) = &state.pool else {
            return Ok(None);
        };

        let encoded = if *address == self.pool_address {
            serde_json::to_vec(pool)
        } else if *address == pool.validator_list {
            serde_json::to_vec(&ValidatorList {
                validators: state.validators.clone(),
            })
        } else {
            return Ok(None);
        };

        encoded.map(Some).map_err(|error| LedgerError::Decode {
            kind: "mock account",
            reason: error.to_string(),
        })
    }

    async fn minimum_rent_exemption(&self, _data_len: usize) -> Result<u64, LedgerError> {
        Ok(self.rent_exemption)
    }

    async fn update_pool(&self, pool: &Pubkey) -> Result<(), LedgerError> {
        self.pool_update_count.fetch_add(1, Ordering::SeqCst);

        if self.fail_pool_update.load(Ordering::SeqCst) {
            return Err(LedgerError::Rejected {
                action: LedgerAction::UpdatePool,
                reason: "mock_failure".to_string(),
            });
        }

        let mut state = self.lock();
        let epoch = state.epoch.epoch;
        let total_after_update = state.total_after_update;

        let Some(stake_pool) = state.pool.as_mut() else {
            return Err(LedgerError::Rejected {
                action: LedgerAction::UpdatePool,
                reason: format!("stake pool {pool} does not exist"),
            });
        };

        stake_pool.last_update_epoch = epoch;
        if let Some(total) = total_after_update {
            stake_pool.total_lamports = total;
        }

        warn!("[MOCK] Stake pool {pool} updated to epoch {epoch}");
        Ok(())
    }

    async fn increase_stake(
        &self,
        pool: &Pubkey,
        vote_account: &Pubkey,
        lamports: u64,
    ) -> Result<(), LedgerError> {
        self.record_stake(pool, vote_account, lamports, StakeDirection::Increase)
    }

    async fn decrease_stake(
        &self,
        pool: &Pubkey,
        vote_account: &Pubkey,
        lamports: u64,
    ) -> Result<(), LedgerError> {
        self.record_stake(pool, vote_account, lamports, StakeDirection::Decrease)
    }

    fn decode_stake_pool(&self, data: &[u8]) -> Result<StakePool, LedgerError> {
        serde_json::from_slice(data).map_err(|error| LedgerError::Decode {
            kind: "stake pool",
            reason: error.to_string(),
        })
    }

    fn decode_validator_list(&self, data: &[u8]) -> Result<ValidatorList, LedgerError> {
        serde_json::from_slice(data).map_err(|error| LedgerError::Decode {
            kind: "validator list",
            reason: error.to_string(),
        })
    }
}
