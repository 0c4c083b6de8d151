//! End-to-end scenarios driving the public rebalancer and scheduler against
//! an in-memory ledger.

use std::sync::Arc;

use st0x_ledger::{
    DryRunLedger, LedgerGateway, MockLedger, Pubkey, StakeDirection, StakePool, Validator,
};
use st0x_rebalancer::{
    EpochScheduler, Rebalance, RebalanceError, Rebalancer, SchedulerConfig, SkipReason,
    TickOutcome, ValidatorOutcome,
};

const SLOTS_PER_EPOCH: u64 = 432_000;

fn validator(active: u64, transient: u64) -> Validator {
    Validator {
        vote_account: Pubkey::new_unique(),
        active_stake_lamports: active,
        transient_stake_lamports: transient,
    }
}

fn pool_ledger(
    last_update_epoch: u64,
    total_lamports: u64,
    validators: Vec<Validator>,
) -> (Pubkey, MockLedger) {
    let pool = Pubkey::new_unique();
    let ledger = MockLedger::new(
        pool,
        StakePool {
            total_lamports,
            last_update_epoch,
            validator_list: Pubkey::new_unique(),
        },
        validators,
    )
    .with_rent_exemption(100);

    (pool, ledger)
}

#[tokio::test]
async fn one_shot_rebalance_funds_empty_validators() {
    let (pool, ledger) = pool_ledger(10, 1_000_000, vec![validator(0, 0), validator(0, 0)]);
    let ledger = Arc::new(ledger);
    let rebalancer = Rebalancer::new(ledger.clone(), pool, 0).with_minimum_active_stake(1_000);

    let report = rebalancer.rebalance().await.unwrap();

    assert_eq!(report.lamports_per_validator, 499_900);
    assert_eq!(report.submitted(), 2);
    assert!(ledger.stake_calls().iter().all(|call| {
        call.direction == StakeDirection::Increase && call.lamports == 499_900
    }));
}

#[tokio::test]
async fn default_minimum_active_stake_holds_back_small_increases() {
    let validators = vec![validator(10_000_000_000, 0), validator(9_999_000_000, 0)];
    let (pool, ledger) = pool_ledger(10, 19_999_000_000, validators.clone());
    let ledger = Arc::new(ledger.with_rent_exemption(0));
    let rebalancer = Rebalancer::new(ledger.clone(), pool, 0);

    let report = rebalancer.rebalance().await.unwrap();

    assert_eq!(report.lamports_per_validator, 9_999_500_000);
    assert_eq!(
        report.outcomes[&validators[0].vote_account],
        ValidatorOutcome::Submitted {
            direction: StakeDirection::Decrease,
            lamports: 500_000,
        }
    );
    assert_eq!(
        report.outcomes[&validators[1].vote_account],
        ValidatorOutcome::Skipped(SkipReason::BelowMinimumStake {
            shortfall_lamports: 500_000
        })
    );
}

#[tokio::test]
async fn stale_pool_is_updated_exactly_once_before_planning() {
    let (pool, ledger) = pool_ledger(10, 1_000_000, vec![validator(0, 0), validator(0, 0)]);
    let ledger = Arc::new(
        ledger
            .with_epoch(11, 0, SLOTS_PER_EPOCH)
            .with_total_after_update(1_000_200),
    );
    let rebalancer = Rebalancer::new(ledger.clone(), pool, 0).with_minimum_active_stake(1_000);

    let report = rebalancer.rebalance().await.unwrap();

    assert_eq!(ledger.pool_update_calls(), 1);
    assert_eq!(report.epoch, 11);
    assert_eq!(report.lamports_per_validator, 500_000);
}

#[tokio::test]
async fn scheduler_rebalances_once_near_end_of_each_epoch() {
    let validators = vec![validator(700_000, 0), validator(300_000, 0)];
    let (pool, ledger) = pool_ledger(10, 1_000_000, validators);
    let ledger = Arc::new(ledger.with_epoch(10, 414_720, SLOTS_PER_EPOCH));
    let rebalancer =
        Arc::new(Rebalancer::new(ledger.clone(), pool, 0).with_minimum_active_stake(1_000));
    let mut scheduler =
        EpochScheduler::new(ledger.clone(), rebalancer, pool, SchedulerConfig::default());

    let first = scheduler.tick().await.unwrap();
    let TickOutcome::Rebalanced(report) = first else {
        panic!("Expected a rebalance at 96% progress, got {first:?}");
    };
    assert_eq!(report.submitted(), 2);

    ledger.set_epoch(10, 419_040, SLOTS_PER_EPOCH);
    let second = scheduler.tick().await.unwrap();

    assert_eq!(second, TickOutcome::AlreadyRebalanced { epoch: 10 });
    assert_eq!(ledger.stake_calls().len(), 2);
}

#[tokio::test]
async fn in_flight_stake_is_left_for_the_next_epoch() {
    let validators = vec![validator(700_000, 0), validator(300_000, 0)];
    let (pool, ledger) = pool_ledger(10, 1_000_000, validators.clone());
    let ledger = Arc::new(ledger.with_epoch(10, 414_720, SLOTS_PER_EPOCH));
    let rebalancer =
        Arc::new(Rebalancer::new(ledger.clone(), pool, 0).with_minimum_active_stake(1_000));
    let mut scheduler = EpochScheduler::new(
        ledger.clone(),
        rebalancer.clone(),
        pool,
        SchedulerConfig::default(),
    );
    scheduler.tick().await.unwrap();

    // The movements from the previous pass are still transient.
    let report = rebalancer.rebalance().await.unwrap();

    assert_eq!(report.submitted(), 0);
    assert!(matches!(
        report.outcomes[&validators[0].vote_account],
        ValidatorOutcome::Skipped(SkipReason::Transient { .. })
    ));
}

#[tokio::test]
async fn partial_failure_reports_every_rejected_validator() {
    let validators = vec![validator(0, 0), validator(0, 0), validator(0, 0)];
    let (pool, ledger) = pool_ledger(10, 3_000_000, validators.clone());
    let ledger = Arc::new(
        ledger
            .failing_validator(validators[0].vote_account)
            .failing_validator(validators[2].vote_account),
    );
    let rebalancer = Rebalancer::new(ledger.clone(), pool, 0).with_minimum_active_stake(1_000);

    let error = rebalancer.rebalance().await.unwrap_err();

    let RebalanceError::ActionSubmission {
        attempted,
        failures,
        report,
    } = error
    else {
        panic!("Expected ActionSubmission, got {error:?}");
    };
    assert_eq!(attempted, 3);

    let failed: Vec<_> = failures.iter().map(|failure| failure.vote_account).collect();
    assert_eq!(
        failed,
        vec![validators[0].vote_account, validators[2].vote_account]
    );
    assert!(ledger.validators()[1].is_transient());
    assert_eq!(
        report.outcomes.get(&validators[1].vote_account),
        Some(&ValidatorOutcome::Submitted {
            direction: StakeDirection::Increase,
            lamports: 999_900,
        })
    );
    assert_eq!(report.submitted(), 1);
}

#[tokio::test]
async fn dry_run_plans_without_submitting() {
    let validators = vec![validator(700_000, 0), validator(300_000, 0)];
    let (pool, mock) = pool_ledger(10, 1_000_000, validators);
    let ledger: Arc<dyn LedgerGateway> = Arc::new(DryRunLedger::new(mock));
    let rebalancer = Rebalancer::new(ledger, pool, 0).with_minimum_active_stake(1_000);

    let report = rebalancer.rebalance().await.unwrap();

    assert_eq!(report.submitted(), 2);
}

#[tokio::test]
async fn missing_pool_fails_without_moving_stake() {
    let pool = Pubkey::new_unique();
    let ledger = Arc::new(MockLedger::without_pool(pool));
    let rebalancer = Rebalancer::new(ledger.clone(), pool, 0);

    let error = rebalancer.rebalance().await.unwrap_err();

    assert!(matches!(error, RebalanceError::StateFetch { address } if address == pool));
    assert!(ledger.stake_calls().is_empty());
}
