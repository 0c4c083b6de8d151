//! Service mode: follows epochs and rebalances once near the end of each.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use st0x_ledger::{LedgerError, LedgerGateway, Pubkey};

use crate::error::RebalanceError;
use crate::rebalancing::{Rebalance, RebalanceReport, pool_update_error};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub error_backoff: Duration,
    /// Epoch progress at or above which the pass for that epoch runs.
    pub rebalance_threshold: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            error_backoff: Duration::from_secs(60),
            rebalance_threshold: 0.95,
        }
    }
}

/// What the scheduler knows about the epoch it is in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EpochState {
    pub current_epoch: Option<u64>,
    pub rebalanced_in_current_epoch: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPhase {
    Idle,
    Monitoring,
    Updating,
    Rebalancing,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Epoch has not progressed far enough yet.
    Waiting { epoch: u64, progress: f64 },
    /// This epoch's pass already succeeded.
    AlreadyRebalanced { epoch: u64 },
    Rebalanced(RebalanceReport),
}

pub struct EpochScheduler {
    ledger: Arc<dyn LedgerGateway>,
    rebalancer: Arc<dyn Rebalance>,
    pool: Pubkey,
    config: SchedulerConfig,
    state: EpochState,
    phase: SchedulerPhase,
}

impl EpochScheduler {
    pub fn new(
        ledger: Arc<dyn LedgerGateway>,
        rebalancer: Arc<dyn Rebalance>,
        pool: Pubkey,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            ledger,
            rebalancer,
            pool,
            config,
            state: EpochState::default(),
            phase: SchedulerPhase::Idle,
        }
    }

    pub fn state(&self) -> EpochState {
        self.state
    }

    pub fn phase(&self) -> SchedulerPhase {
        self.phase
    }

    /// Polls forever. Failed iterations are logged and retried after the
    /// error backoff; nothing short of cancellation stops the loop.
    pub async fn run(mut self) {
        info!(
            pool = %self.pool,
            "Starting epoch scheduler with poll interval {:?}, error backoff {:?}, threshold {}",
            self.config.poll_interval,
            self.config.error_backoff,
            self.config.rebalance_threshold
        );

        loop {
            let delay = match self.tick().await {
                Ok(outcome) => {
                    debug!(?outcome, "Scheduler iteration complete");
                    self.config.poll_interval
                }
                Err(error) => {
                    log_iteration_error(&error, self.config.error_backoff);
                    self.config.error_backoff
                }
            };

            tokio::time::sleep(delay).await;
        }
    }

    /// One iteration of the loop body.
    pub async fn tick(&mut self) -> Result<TickOutcome, RebalanceError> {
        self.phase = SchedulerPhase::Monitoring;
        let result = self.advance().await;
        self.phase = SchedulerPhase::Monitoring;
        result
    }

    async fn advance(&mut self) -> Result<TickOutcome, RebalanceError> {
        let info = self.ledger.epoch_info().await?;
        let epoch = info.epoch;
        let progress = info.progress();

        if self.state.current_epoch != Some(epoch) {
            info!(
                epoch,
                previous_epoch = ?self.state.current_epoch,
                "New epoch detected, updating stake pool"
            );

            self.phase = SchedulerPhase::Updating;
            self.ledger
                .update_pool(&self.pool)
                .await
                .map_err(pool_update_error)?;

            self.state = EpochState {
                current_epoch: Some(epoch),
                rebalanced_in_current_epoch: false,
            };
        }

        if progress < self.config.rebalance_threshold {
            debug!(epoch, progress, "Waiting for end of epoch");
            return Ok(TickOutcome::Waiting { epoch, progress });
        }

        if self.state.rebalanced_in_current_epoch {
            debug!(epoch, progress, "Already rebalanced this epoch");
            return Ok(TickOutcome::AlreadyRebalanced { epoch });
        }

        info!(epoch, progress, "Epoch nearly complete, rebalancing");
        self.phase = SchedulerPhase::Rebalancing;
        let report = self.rebalancer.rebalance().await?;
        self.state.rebalanced_in_current_epoch = true;

        Ok(TickOutcome::Rebalanced(report))
    }
}

/// Keeps calling `connect` until it succeeds. Connectivity failures are
/// treated like a failed loop iteration and retried after `error_backoff`;
/// any other failure is returned.
pub(crate) async fn connect_with_backoff<T, F, Fut>(
    error_backoff: Duration,
    mut connect: F,
) -> Result<T, LedgerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LedgerError>>,
{
    loop {
        match connect().await {
            Ok(connected) => return Ok(connected),
            Err(error @ LedgerError::Connectivity { .. }) => {
                log_iteration_error(&RebalanceError::from(error), error_backoff);
                tokio::time::sleep(error_backoff).await;
            }
            Err(error) => return Err(error),
        }
    }
}

fn log_iteration_error(error: &RebalanceError, backoff: Duration) {
    match error {
        RebalanceError::Connectivity(_) | RebalanceError::Ledger(_) => {
            warn!("Scheduler iteration failed, retrying in {backoff:?}: {error}");
        }
        RebalanceError::StateFetch { .. }
        | RebalanceError::Decode(_)
        | RebalanceError::InvalidPoolState(_)
        | RebalanceError::PoolUpdate(_)
        | RebalanceError::ActionSubmission { .. } => {
            error!("Scheduler iteration failed, retrying in {backoff:?}: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tracing::Instrument;
    use tracing_test::traced_test;

    use st0x_ledger::{ConnectRetry, Keypair, MockLedger, SolanaLedger};
    use std::path::PathBuf;

    use super::*;
    use crate::test_utils::{mock_pool, validator};

    const SLOTS: u64 = 432_000;

    /// Counts rebalance calls and optionally fails them.
    #[derive(Default)]
    struct CountingRebalancer {
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    impl CountingRebalancer {
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn set_failure(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Rebalance for CountingRebalancer {
        async fn rebalance(&self) -> Result<RebalanceReport, RebalanceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);

            if self.fail.load(Ordering::SeqCst) {
                return Err(RebalanceError::StateFetch {
                    address: Pubkey::new_unique(),
                });
            }

            Ok(RebalanceReport {
                epoch: 0,
                lamports_per_validator: 0,
                outcomes: BTreeMap::new(),
            })
        }
    }

    fn scheduler(
        epoch: u64,
        slot_index: u64,
    ) -> (EpochScheduler, Arc<MockLedger>, Arc<CountingRebalancer>) {
        let (pool, ledger) = mock_pool(epoch, 1_000_000, vec![validator(0, 0)]);
        let ledger = Arc::new(ledger.with_epoch(epoch, slot_index, SLOTS));
        let rebalancer = Arc::new(CountingRebalancer::default());

        let scheduler = EpochScheduler::new(
            ledger.clone(),
            rebalancer.clone(),
            pool,
            SchedulerConfig::default(),
        );

        (scheduler, ledger, rebalancer)
    }

    #[tokio::test]
    async fn rebalances_exactly_once_per_epoch() {
        let (mut scheduler, ledger, rebalancer) = scheduler(5, 414_720);

        let first = scheduler.tick().await.unwrap();
        assert!(matches!(first, TickOutcome::Rebalanced(_)));
        assert_eq!(rebalancer.calls(), 1);

        ledger.set_epoch(5, 419_040, SLOTS);
        let second = scheduler.tick().await.unwrap();

        assert_eq!(second, TickOutcome::AlreadyRebalanced { epoch: 5 });
        assert_eq!(rebalancer.calls(), 1);
        assert_eq!(ledger.pool_update_calls(), 1);
    }

    #[tokio::test]
    async fn waits_until_threshold() {
        let (mut scheduler, _ledger, rebalancer) = scheduler(5, 200_000);

        let outcome = scheduler.tick().await.unwrap();

        assert!(matches!(outcome, TickOutcome::Waiting { epoch: 5, .. }));
        assert_eq!(rebalancer.calls(), 0);
        assert_eq!(
            scheduler.state(),
            EpochState {
                current_epoch: Some(5),
                rebalanced_in_current_epoch: false,
            }
        );
    }

    #[tokio::test]
    async fn threshold_is_inclusive() {
        let (mut scheduler, _ledger, rebalancer) = scheduler(5, 410_400);

        let outcome = scheduler.tick().await.unwrap();

        assert!(matches!(outcome, TickOutcome::Rebalanced(_)));
        assert_eq!(rebalancer.calls(), 1);
    }

    #[tokio::test]
    async fn new_epoch_updates_pool_and_rearms_rebalance() {
        let (mut scheduler, ledger, rebalancer) = scheduler(5, 414_720);
        scheduler.tick().await.unwrap();

        ledger.set_epoch(6, 10, SLOTS);
        let outcome = scheduler.tick().await.unwrap();

        assert!(matches!(outcome, TickOutcome::Waiting { epoch: 6, .. }));
        assert_eq!(ledger.pool_update_calls(), 2);
        assert_eq!(
            scheduler.state(),
            EpochState {
                current_epoch: Some(6),
                rebalanced_in_current_epoch: false,
            }
        );

        ledger.set_epoch(6, 420_000, SLOTS);
        scheduler.tick().await.unwrap();

        assert_eq!(rebalancer.calls(), 2);
        assert!(scheduler.state().rebalanced_in_current_epoch);
    }

    #[tokio::test]
    async fn failed_rebalance_is_retried_in_same_epoch() {
        let (mut scheduler, _ledger, rebalancer) = scheduler(5, 414_720);
        rebalancer.set_failure(true);

        let error = scheduler.tick().await.unwrap_err();
        assert!(matches!(error, RebalanceError::StateFetch { .. }));
        assert!(!scheduler.state().rebalanced_in_current_epoch);
        assert_eq!(scheduler.phase(), SchedulerPhase::Monitoring);

        rebalancer.set_failure(false);
        let outcome = scheduler.tick().await.unwrap();

        assert!(matches!(outcome, TickOutcome::Rebalanced(_)));
        assert_eq!(rebalancer.calls(), 2);
    }

    #[tokio::test]
    async fn failed_pool_update_leaves_epoch_unrecorded() {
        let (mut scheduler, ledger, rebalancer) = scheduler(5, 414_720);
        ledger.set_pool_update_failure(true);

        let error = scheduler.tick().await.unwrap_err();

        assert!(matches!(error, RebalanceError::PoolUpdate(_)));
        assert_eq!(scheduler.state().current_epoch, None);
        assert_eq!(rebalancer.calls(), 0);

        ledger.set_pool_update_failure(false);
        scheduler.tick().await.unwrap();

        assert_eq!(ledger.pool_update_calls(), 2);
        assert_eq!(scheduler.state().current_epoch, Some(5));
        assert_eq!(rebalancer.calls(), 1);
    }

    #[tokio::test]
    async fn scheduler_starts_idle() {
        let (scheduler, _ledger, _rebalancer) = scheduler(5, 0);

        assert_eq!(scheduler.phase(), SchedulerPhase::Idle);
        assert_eq!(scheduler.state(), EpochState::default());
    }

    fn unreachable(attempt: usize) -> LedgerError {
        LedgerError::Connectivity {
            endpoint: "http://127.0.0.1:1".to_string(),
            reason: format!("connection refused on attempt {attempt}"),
        }
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn connect_waits_out_connectivity_failures() {
        let attempts = &AtomicUsize::new(0);
        let start = tokio::time::Instant::now();

        let connected = connect_with_backoff(Duration::from_secs(60), || async move {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt < 3 {
                Err(unreachable(attempt))
            } else {
                Ok(attempt)
            }
        })
        .await
        .unwrap();

        assert_eq!(connected, 3);
        assert!(start.elapsed() >= Duration::from_secs(120));
        assert!(logs_contain("connection refused on attempt 2"));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_gives_up_on_other_failures() {
        let attempts = &AtomicUsize::new(0);

        let error = connect_with_backoff(Duration::from_secs(60), || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(LedgerError::Keypair {
                path: PathBuf::from("/missing/staker.json"),
                reason: "not found".to_string(),
            })
        })
        .await
        .unwrap_err();

        assert!(matches!(error, LedgerError::Keypair { .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connect_keeps_retrying_an_unreachable_endpoint() {
        let attempts = AtomicUsize::new(0);
        let retry = ConnectRetry {
            max_attempts: 1,
            delay: Duration::ZERO,
        };

        let result = tokio::time::timeout(
            Duration::from_millis(500),
            connect_with_backoff(Duration::from_millis(20), || {
                attempts.fetch_add(1, Ordering::SeqCst);
                SolanaLedger::connect("http://127.0.0.1:1", Keypair::new(), retry)
            }),
        )
        .await;

        assert!(result.is_err(), "connect loop exited early");
        assert!(attempts.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn loop_backs_off_after_errors_and_keeps_running() {
        let (scheduler, ledger, rebalancer) = scheduler(5, 414_720);
        ledger.set_epoch_info_failure(true);

        let handle = tokio::spawn(scheduler.run().in_current_span());

        // Failed ticks at 0s and 60s.
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(ledger.epoch_info_calls(), 2);
        assert_eq!(rebalancer.calls(), 0);
        assert!(logs_contain("Scheduler iteration failed"));

        // Recovers at 120s, then polls again at 150s.
        ledger.set_epoch_info_failure(false);
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(ledger.epoch_info_calls(), 4);
        assert_eq!(rebalancer.calls(), 1);
        assert!(!handle.is_finished());

        handle.abort();
    }
}
