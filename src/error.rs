//! Failure classes of a rebalance run.
//!
//! Ledger failures are classified at the boundary so callers (and the
//! epoch scheduler) can tell a missing account from a malformed one or from
//! a rejected transaction.

use st0x_ledger::{LedgerError, Pubkey, StakeDirection};

use crate::rebalancing::RebalanceReport;

#[derive(Debug, thiserror::Error)]
pub enum RebalanceError {
    #[error("ledger unreachable: {0}")]
    Connectivity(#[source] LedgerError),
    #[error("account {address} does not exist")]
    StateFetch { address: Pubkey },
    #[error("malformed account data: {0}")]
    Decode(#[source] LedgerError),
    #[error(transparent)]
    InvalidPoolState(#[from] InvalidPoolState),
    #[error("stake pool update failed: {0}")]
    PoolUpdate(#[source] LedgerError),
    #[error(
        "{} of {attempted} stake actions failed, first: {}",
        .failures.len(),
        first_failure(.failures)
    )]
    ActionSubmission {
        attempted: usize,
        failures: Vec<ActionFailure>,
        /// Skipped validators and the movements that did go through.
        report: RebalanceReport,
    },
    #[error("ledger request failed: {0}")]
    Ledger(#[source] LedgerError),
}

impl From<LedgerError> for RebalanceError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Connectivity { .. } => Self::Connectivity(err),
            LedgerError::Decode { .. } => Self::Decode(err),
            other => Self::Ledger(other),
        }
    }
}

/// The pool's numbers cannot produce a meaningful target.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidPoolState {
    #[error("validator list {validator_list} is empty")]
    EmptyValidatorList { validator_list: Pubkey },
    #[error("reserve of {reserve_lamports} lamports exceeds pool total of {total_lamports}")]
    ReserveExceedsTotal {
        total_lamports: u64,
        reserve_lamports: u64,
    },
    #[error(
        "rent for {new_accounts} new stake accounts ({rent_lamports} lamports) \
         exceeds the {distributable_lamports} distributable lamports"
    )]
    RentExceedsDistributable {
        new_accounts: usize,
        rent_lamports: u64,
        distributable_lamports: u64,
    },
}

/// A stake movement the ledger refused, keyed by the validator it targeted.
#[derive(Debug, thiserror::Error)]
#[error("{direction} of {lamports} lamports on {vote_account}: {source}")]
pub struct ActionFailure {
    pub vote_account: Pubkey,
    pub direction: StakeDirection,
    pub lamports: u64,
    #[source]
    pub source: LedgerError,
}

fn first_failure(failures: &[ActionFailure]) -> String {
    failures
        .first()
        .map_or_else(|| "none".to_string(), ToString::to_string)
}
