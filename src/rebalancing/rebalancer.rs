//! Runs one rebalance pass: reconcile pool state, compute the shared target,
//! classify every validator and submit all stake movements concurrently.

use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use st0x_ledger::{
    LedgerGateway, MINIMUM_ACTIVE_STAKE, Pubkey, STAKE_ACCOUNT_LEN, StakeDirection,
};

use super::classify::{Action, ActionFloors, RebalancePlan, SkipReason};
use super::reconcile::reconcile;
use super::target::compute_target;
use crate::error::{ActionFailure, RebalanceError};

/// A single rebalance attempt, as seen by the epoch scheduler.
#[async_trait]
pub trait Rebalance: Send + Sync {
    async fn rebalance(&self) -> Result<RebalanceReport, RebalanceError>;
}

/// What happened to one validator during a successful pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidatorOutcome {
    Skipped(SkipReason),
    Submitted {
        direction: StakeDirection,
        lamports: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebalanceReport {
    pub epoch: u64,
    pub lamports_per_validator: u64,
    pub outcomes: BTreeMap<Pubkey, ValidatorOutcome>,
}

impl RebalanceReport {
    pub fn submitted(&self) -> usize {
        self.outcomes
            .values()
            .filter(|outcome| matches!(outcome, ValidatorOutcome::Submitted { .. }))
            .count()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes.len() - self.submitted()
    }
}

/// Rebalances one stake pool through a shared ledger gateway.
pub struct Rebalancer {
    ledger: Arc<dyn LedgerGateway>,
    pool: Pubkey,
    reserve_lamports: u64,
    minimum_active_stake: u64,
}

impl Rebalancer {
    pub fn new(ledger: Arc<dyn LedgerGateway>, pool: Pubkey, reserve_lamports: u64) -> Self {
        Self {
            ledger,
            pool,
            reserve_lamports,
            minimum_active_stake: MINIMUM_ACTIVE_STAKE,
        }
    }

    #[must_use]
    pub fn with_minimum_active_stake(mut self, lamports: u64) -> Self {
        self.minimum_active_stake = lamports;
        self
    }

    async fn submit(
        &self,
        vote_account: Pubkey,
        direction: StakeDirection,
        lamports: u64,
    ) -> Result<(), ActionFailure> {
        let result = match direction {
            StakeDirection::Increase => {
                self.ledger
                    .increase_stake(&self.pool, &vote_account, lamports)
                    .await
            }
            StakeDirection::Decrease => {
                self.ledger
                    .decrease_stake(&self.pool, &vote_account, lamports)
                    .await
            }
        };

        match result {
            Ok(()) => {
                info!(%vote_account, lamports, "Submitted stake {direction}");
                Ok(())
            }
            Err(source) => {
                error!(%vote_account, lamports, "Stake {direction} rejected: {source}");
                Err(ActionFailure {
                    vote_account,
                    direction,
                    lamports,
                    source,
                })
            }
        }
    }
}

#[async_trait]
impl Rebalance for Rebalancer {
    #[tracing::instrument(skip(self), fields(pool = %self.pool), level = tracing::Level::INFO)]
    async fn rebalance(&self) -> Result<RebalanceReport, RebalanceError> {
        let snapshot = reconcile(self.ledger.as_ref(), &self.pool).await?;

        let rent_exemption_lamports = self
            .ledger
            .minimum_rent_exemption(STAKE_ACCOUNT_LEN)
            .await?;

        let validators = &snapshot.validator_list.validators;

        let allocation = compute_target(
            snapshot.stake_pool.total_lamports,
            self.reserve_lamports,
            rent_exemption_lamports,
            &snapshot.stake_pool.validator_list,
            validators,
        )?;

        info!(
            epoch = snapshot.epoch,
            total_lamports = snapshot.stake_pool.total_lamports,
            reserve_lamports = self.reserve_lamports,
            first_pass_lamports = allocation.first_pass_lamports,
            new_accounts = allocation.new_accounts,
            usable_lamports = allocation.usable_lamports,
            lamports_per_validator = allocation.lamports_per_validator,
            "Computed per-validator target"
        );

        let plan = RebalancePlan::new(
            validators,
            allocation.lamports_per_validator,
            ActionFloors {
                rent_exemption_lamports,
                minimum_active_stake: self.minimum_active_stake,
            },
        );

        let mut outcomes = BTreeMap::new();
        for planned in &plan.actions {
            if let Action::Skip(reason) = planned.action {
                log_skip(&planned.vote_account, reason);
                outcomes.insert(planned.vote_account, ValidatorOutcome::Skipped(reason));
            }
        }

        let movements: Vec<_> = plan.movements().collect();
        let attempted = movements.len();

        let results = join_all(
            movements
                .iter()
                .map(|&(vote_account, direction, lamports)| {
                    self.submit(vote_account, direction, lamports)
                }),
        )
        .await;

        let mut failures = Vec::new();
        for (&(vote_account, direction, lamports), result) in movements.iter().zip(results) {
            match result {
                Ok(()) => {
                    outcomes.insert(
                        vote_account,
                        ValidatorOutcome::Submitted {
                            direction,
                            lamports,
                        },
                    );
                }
                Err(failure) => failures.push(failure),
            }
        }

        let report = RebalanceReport {
            epoch: snapshot.epoch,
            lamports_per_validator: plan.lamports_per_validator,
            outcomes,
        };

        if !failures.is_empty() {
            warn!(
                epoch = report.epoch,
                submitted = report.submitted(),
                failed = failures.len(),
                "Rebalance partially applied"
            );
            return Err(RebalanceError::ActionSubmission {
                attempted,
                failures,
                report,
            });
        }

        info!(
            epoch = report.epoch,
            submitted = report.submitted(),
            skipped = report.skipped(),
            "Rebalance complete"
        );

        Ok(report)
    }
}

fn log_skip(vote_account: &Pubkey, reason: SkipReason) {
    match reason {
        SkipReason::Transient { transient_lamports } => {
            info!(%vote_account, transient_lamports, "Skipping validator mid-transition");
        }
        SkipReason::BelowRentExemption { excess_lamports } => {
            warn!(
                %vote_account,
                excess_lamports, "Skipping decrease below the rent-exempt minimum"
            );
        }
        SkipReason::BelowMinimumStake { shortfall_lamports } => {
            warn!(
                %vote_account,
                shortfall_lamports, "Skipping increase below the minimum active stake"
            );
        }
        SkipReason::Balanced => {
            debug!(%vote_account, "Validator already at target");
        }
    }
}
