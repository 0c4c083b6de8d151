//! Stake pool rebalancing.
//!
//! A pass reads the pool (updating it first if it lags the current epoch),
//! derives one lamport target shared by every validator, decides per
//! validator whether to increase, decrease or leave its stake alone, and
//! submits every movement concurrently. The decision steps are pure; only
//! [`Rebalancer`] talks to the ledger.

mod classify;
mod rebalancer;
mod reconcile;
mod target;

pub use classify::SkipReason;
pub use rebalancer::{Rebalance, RebalanceReport, Rebalancer, ValidatorOutcome};
pub(crate) use reconcile::pool_update_error;
