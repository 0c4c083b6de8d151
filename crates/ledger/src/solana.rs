//! Production gateway backed by a Solana JSON-RPC endpoint.
//!
//! Account data is decoded with the `spl-stake-pool` account layouts and
//! every write action is built with the `spl-stake-pool` instruction
//! helpers, then signed by the staker keypair which also pays the fees.

use async_trait::async_trait;
use backon::{ConstantBuilder, Retryable};
use borsh::BorshDeserialize;
use solana_client::client_error::ClientError;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::instruction::Instruction;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature, Signer};
use solana_sdk::signer::keypair::read_keypair_file;
use solana_sdk::transaction::Transaction;
use spl_stake_pool::instruction::{
    decrease_validator_stake_with_vote, increase_validator_stake_with_vote, update_stake_pool,
};
use spl_stake_pool::state::{
    AccountType, StakePool as PoolAccount, ValidatorList as ValidatorListAccount,
};
use std::num::NonZeroU32;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::LedgerAction;
use crate::{
    EpochInfo, LedgerError, LedgerGateway, StakeDirection, StakePool, Validator, ValidatorList,
};

/// Bounded retry applied while waiting for the endpoint to report healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRetry {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl Default for ConnectRetry {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay: Duration::from_secs(1),
        }
    }
}

pub struct SolanaLedger {
    client: RpcClient,
    staker: Keypair,
}

impl std::fmt::Debug for SolanaLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SolanaLedger")
            .field("endpoint", &self.client.url())
            .field("staker", &self.staker.pubkey())
            .finish()
    }
}

impl SolanaLedger {
    /// Opens a client against `endpoint` and waits until the node reports
    /// healthy, giving up after `retry.max_attempts` health checks.
    pub async fn connect(
        endpoint: &str,
        staker: Keypair,
        retry: ConnectRetry,
    ) -> Result<Self, LedgerError> {
        info!(%endpoint, staker = %staker.pubkey(), "Connecting to network");

        let client =
            RpcClient::new_with_commitment(endpoint.to_string(), CommitmentConfig::confirmed());

        let backoff = ConstantBuilder::default()
            .with_delay(retry.delay)
            .with_max_times(retry.max_attempts.saturating_sub(1));

        let check_health = || async { client.get_health().await };

        check_health
            .retry(backoff)
            .notify(|error, delay| {
                warn!(%error, ?delay, "Endpoint not healthy yet, retrying");
            })
            .await
            .map_err(|error| {
                warn!(%error, "Giving up on endpoint");
                LedgerError::Connectivity {
                    endpoint: endpoint.to_string(),
                    reason: format!("not healthy after {} attempts: {error}", retry.max_attempts),
                }
            })?;

        Ok(Self { client, staker })
    }

    fn rpc_error(&self, error: ClientError) -> LedgerError {
        LedgerError::from_client(&self.client.url(), error)
    }

    /// Loads the pool and its validator list in their on-chain layout,
    /// together with the program that owns the pool.
    async fn load_pool_accounts(
        &self,
        pool: &Pubkey,
    ) -> Result<(Pubkey, PoolAccount, ValidatorListAccount), LedgerError> {
        let account = self
            .client
            .get_account_with_commitment(pool, CommitmentConfig::confirmed())
            .await
            .map_err(|error| self.rpc_error(error))?
            .value
            .ok_or_else(|| LedgerError::Decode {
                kind: "stake pool",
                reason: format!("account {pool} does not exist"),
            })?;

        let pool_account = decode_pool_account(&account.data)?;
        let list_data = self
            .client
            .get_account_data(&pool_account.validator_list)
            .await
            .map_err(|error| self.rpc_error(error))?;
        let list_account = decode_validator_list_account(&list_data)?;

        Ok((account.owner, pool_account, list_account))
    }

    async fn send(
        &self,
        instructions: &[Instruction],
        action: LedgerAction,
    ) -> Result<Signature, LedgerError> {
        let blockhash = self
            .client
            .get_latest_blockhash()
            .await
            .map_err(|error| self.rpc_error(error))?;
        let transaction = Transaction::new_signed_with_payer(
            instructions,
            Some(&self.staker.pubkey()),
            &[&self.staker],
            blockhash,
        );

        let signature = self
            .client
            .send_and_confirm_transaction(&transaction)
            .await
            .map_err(|error| match self.rpc_error(error) {
                LedgerError::Rpc(error) => LedgerError::Rejected {
                    action,
                    reason: error.to_string(),
                },
                other => other,
            })?;

        debug!(%signature, %action, "Transaction confirmed");
        Ok(signature)
    }

    async fn move_stake(
        &self,
        pool: &Pubkey,
        vote_account: &Pubkey,
        lamports: u64,
        direction: StakeDirection,
    ) -> Result<(), LedgerError> {
        let (program_id, pool_account, list_account) = self.load_pool_accounts(pool).await?;

        let info =
            list_account
                .find(vote_account)
                .ok_or_else(|| LedgerError::ValidatorNotFound {
                    pool: *pool,
                    vote_account: *vote_account,
                })?;

        let validator_seed = NonZeroU32::new(u32::from(info.validator_seed_suffix));
        let transient_seed = u64::from(info.transient_seed_suffix);

        let build = match direction {
            StakeDirection::Increase => increase_validator_stake_with_vote,
            StakeDirection::Decrease => decrease_validator_stake_with_vote,
        };
        let instruction = build(
            &program_id,
            &pool_account,
            pool,
            vote_account,
            lamports,
            validator_seed,
            transient_seed,
        );

        let signature = self
            .send(&[instruction], LedgerAction::Stake(direction))
            .await?;

        info!(%vote_account, lamports, %direction, %signature, "Stake movement submitted");
        Ok(())
    }
}

#[async_trait]
impl LedgerGateway for SolanaLedger {
    async fn epoch_info(&self) -> Result<EpochInfo, LedgerError> {
        let info = self
            .client
            .get_epoch_info()
            .await
            .map_err(|error| self.rpc_error(error))?;

        Ok(EpochInfo {
            epoch: info.epoch,
            slot_index: info.slot_index,
            slots_in_epoch: info.slots_in_epoch,
        })
    }

    async fn account_data(&self, address: &Pubkey) -> Result<Option<Vec<u8>>, LedgerError> {
        let response = self
            .client
            .get_account_with_commitment(address, CommitmentConfig::confirmed())
            .await
            .map_err(|error| self.rpc_error(error))?;

        Ok(response.value.map(|account| account.data))
    }

    async fn minimum_rent_exemption(&self, data_len: usize) -> Result<u64, LedgerError> {
        self.client
            .get_minimum_balance_for_rent_exemption(data_len)
            .await
            .map_err(|error| self.rpc_error(error))
    }

    async fn update_pool(&self, pool: &Pubkey) -> Result<(), LedgerError> {
        let (program_id, pool_account, list_account) = self.load_pool_accounts(pool).await?;

        let (list_instructions, final_instructions) =
            update_stake_pool(&program_id, &pool_account, &list_account, pool, false);

        debug!(
            chunks = list_instructions.len(),
            "Updating validator list balances"
        );

        for instruction in list_instructions {
            self.send(&[instruction], LedgerAction::UpdatePool).await?;
        }

        let signature = self
            .send(&final_instructions, LedgerAction::UpdatePool)
            .await?;

        info!(%pool, %signature, "Stake pool updated");
        Ok(())
    }

    async fn increase_stake(
        &self,
        pool: &Pubkey,
        vote_account: &Pubkey,
        lamports: u64,
    ) -> Result<(), LedgerError> {
        self.move_stake(pool, vote_account, lamports, StakeDirection::Increase)
            .await
    }

    async fn decrease_stake(
        &self,
        pool: &Pubkey,
        vote_account: &Pubkey,
        lamports: u64,
    ) -> Result<(), LedgerError> {
        self.move_stake(pool, vote_account, lamports, StakeDirection::Decrease)
            .await
    }

    fn decode_stake_pool(&self, data: &[u8]) -> Result<StakePool, LedgerError> {
        decode_pool_account(data).map(|pool| StakePool {
            total_lamports: pool.total_lamports,
            last_update_epoch: pool.last_update_epoch,
            validator_list: pool.validator_list,
        })
    }

    fn decode_validator_list(&self, data: &[u8]) -> Result<ValidatorList, LedgerError> {
        let list = decode_validator_list_account(data)?;

        let validators = list
            .validators
            .iter()
            .map(|info| Validator {
                vote_account: info.vote_account_address,
                active_stake_lamports: u64::from(info.active_stake_lamports),
                transient_stake_lamports: u64::from(info.transient_stake_lamports),
            })
            .collect();

        Ok(ValidatorList { validators })
    }
}

/// Reads a JSON keypair file as written by `solana-keygen`.
pub fn load_keypair(path: &Path) -> Result<Keypair, LedgerError> {
    read_keypair_file(path).map_err(|error| LedgerError::Keypair {
        path: path.to_path_buf(),
        reason: error.to_string(),
    })
}

// Accounts are allocated larger than their serialized contents, so decoding
// reads a prefix and ignores trailing bytes.
fn decode_pool_account(data: &[u8]) -> Result<PoolAccount, LedgerError> {
    let pool = PoolAccount::deserialize(&mut &data[..]).map_err(|error| LedgerError::Decode {
        kind: "stake pool",
        reason: error.to_string(),
    })?;

    if pool.account_type != AccountType::StakePool {
        return Err(LedgerError::Decode {
            kind: "stake pool",
            reason: "account is not an initialized stake pool".to_string(),
        });
    }

    Ok(pool)
}

fn decode_validator_list_account(data: &[u8]) -> Result<ValidatorListAccount, LedgerError> {
    let list =
        ValidatorListAccount::deserialize(&mut &data[..]).map_err(|error| LedgerError::Decode {
            kind: "validator list",
            reason: error.to_string(),
        })?;

    if list.header.account_type != AccountType::ValidatorList {
        return Err(LedgerError::Decode {
            kind: "validator list",
            reason: "account is not an initialized validator list".to_string(),
        });
    }

    Ok(list)
}
