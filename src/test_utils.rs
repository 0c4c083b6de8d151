//! Shared test fixtures: validator builders and mock-backed pools.

use st0x_ledger::{MockLedger, Pubkey, StakePool, Validator};

pub(crate) const TEST_RENT_EXEMPTION: u64 = 100;
pub(crate) const TEST_MINIMUM_ACTIVE_STAKE: u64 = 1_000;

pub(crate) fn validator(active: u64, transient: u64) -> Validator {
    Validator {
        vote_account: Pubkey::new_unique(),
        active_stake_lamports: active,
        transient_stake_lamports: transient,
    }
}

/// Pool up to date with `epoch`, holding `total_lamports` over `validators`.
pub(crate) fn mock_pool(
    epoch: u64,
    total_lamports: u64,
    validators: Vec<Validator>,
) -> (Pubkey, MockLedger) {
    let address = Pubkey::new_unique();
    let ledger = MockLedger::new(
        address,
        StakePool {
            total_lamports,
            last_update_epoch: epoch,
            validator_list: Pubkey::new_unique(),
        },
        validators,
    )
    .with_rent_exemption(TEST_RENT_EXEMPTION);

    (address, ledger)
}
