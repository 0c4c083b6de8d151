//! Per-validator stake target.
//!
//! The target is computed in two passes: a first pass splits the
//! distributable lamports evenly, then every validator that would need to
//! grow under that first-pass target is charged the rent for a new stake
//! account before the final split.
//!
//! The set of growing validators is estimated from the first-pass target,
//! not the final one. This is a known approximation and is kept as is,
//! since iterating to a fixed point would change the amounts moved.

use st0x_ledger::{Pubkey, Validator};

use crate::error::InvalidPoolState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TargetAllocation {
    pub(crate) first_pass_lamports: u64,
    pub(crate) new_accounts: usize,
    pub(crate) usable_lamports: u64,
    pub(crate) lamports_per_validator: u64,
}

pub(crate) fn compute_target(
    total_lamports: u64,
    reserve_lamports: u64,
    rent_exemption_lamports: u64,
    validator_list: &Pubkey,
    validators: &[Validator],
) -> Result<TargetAllocation, InvalidPoolState> {
    if validators.is_empty() {
        return Err(InvalidPoolState::EmptyValidatorList {
            validator_list: *validator_list,
        });
    }

    let validator_count = validators.len() as u64;

    let distributable_lamports = total_lamports.checked_sub(reserve_lamports).ok_or(
        InvalidPoolState::ReserveExceedsTotal {
            total_lamports,
            reserve_lamports,
        },
    )?;

    let first_pass_lamports = distributable_lamports / validator_count;

    let new_accounts = validators
        .iter()
        .filter(|validator| {
            !validator.is_transient() && validator.active_stake_lamports < first_pass_lamports
        })
        .count();

    let rent_lamports = rent_exemption_lamports.saturating_mul(new_accounts as u64);

    let usable_lamports = distributable_lamports.checked_sub(rent_lamports).ok_or(
        InvalidPoolState::RentExceedsDistributable {
            new_accounts,
            rent_lamports,
            distributable_lamports,
        },
    )?;

    Ok(TargetAllocation {
        first_pass_lamports,
        new_accounts,
        usable_lamports,
        lamports_per_validator: usable_lamports / validator_count,
    })
}
