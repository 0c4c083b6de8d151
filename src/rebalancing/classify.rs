//! Per-validator rebalance decisions.

use st0x_ledger::{Pubkey, StakeDirection, Validator};

/// Why a validator is left untouched this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Stake is still activating or deactivating.
    Transient { transient_lamports: u64 },
    /// Decrease would not exceed the rent-exempt minimum of a stake account.
    BelowRentExemption { excess_lamports: u64 },
    /// Increase would be smaller than the protocol's minimum active stake.
    BelowMinimumStake { shortfall_lamports: u64 },
    /// Active stake already equals the target.
    Balanced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Skip(SkipReason),
    Increase { lamports: u64 },
    Decrease { lamports: u64 },
}

impl Action {
    /// Direction and amount for actions that move stake.
    pub fn movement(&self) -> Option<(StakeDirection, u64)> {
        match *self {
            Self::Skip(_) => None,
            Self::Increase { lamports } => Some((StakeDirection::Increase, lamports)),
            Self::Decrease { lamports } => Some((StakeDirection::Decrease, lamports)),
        }
    }
}

/// Floors an individual stake movement must clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ActionFloors {
    pub(crate) rent_exemption_lamports: u64,
    pub(crate) minimum_active_stake: u64,
}

pub(crate) fn classify(validator: &Validator, target: u64, floors: ActionFloors) -> Action {
    if validator.is_transient() {
        return Action::Skip(SkipReason::Transient {
            transient_lamports: validator.transient_stake_lamports,
        });
    }

    let active = validator.active_stake_lamports;

    if active > target {
        let excess_lamports = active - target;

        if excess_lamports <= floors.rent_exemption_lamports {
            return Action::Skip(SkipReason::BelowRentExemption { excess_lamports });
        }

        return Action::Decrease {
            lamports: excess_lamports,
        };
    }

    if active < target {
        let shortfall_lamports = target - active;

        if shortfall_lamports < floors.minimum_active_stake {
            return Action::Skip(SkipReason::BelowMinimumStake { shortfall_lamports });
        }

        return Action::Increase {
            lamports: shortfall_lamports,
        };
    }

    Action::Skip(SkipReason::Balanced)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PlannedAction {
    pub(crate) vote_account: Pubkey,
    pub(crate) action: Action,
}

/// Decisions for every validator in list order, against one shared target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RebalancePlan {
    pub(crate) lamports_per_validator: u64,
    pub(crate) actions: Vec<PlannedAction>,
}

impl RebalancePlan {
    pub(crate) fn new(validators: &[Validator], target: u64, floors: ActionFloors) -> Self {
        let actions = validators
            .iter()
            .map(|validator| PlannedAction {
                vote_account: validator.vote_account,
                action: classify(validator, target, floors),
            })
            .collect();

        Self {
            lamports_per_validator: target,
            actions,
        }
    }

    /// Actions that move stake, paired with their validator.
    pub(crate) fn movements(&self) -> impl Iterator<Item = (Pubkey, StakeDirection, u64)> + '_ {
        self.actions.iter().filter_map(|planned| {
            planned
                .action
                .movement()
                .map(|(direction, lamports)| (planned.vote_account, direction, lamports))
        })
    }
}
