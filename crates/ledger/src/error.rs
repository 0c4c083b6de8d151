use solana_client::client_error::{ClientError, ClientErrorKind};
use solana_sdk::pubkey::Pubkey;
use std::path::PathBuf;

use crate::StakeDirection;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("cannot reach {endpoint}: {reason}")]
    Connectivity { endpoint: String, reason: String },
    #[error("RPC error: {0}")]
    Rpc(#[source] Box<ClientError>),
    #[error("invalid {kind} account data: {reason}")]
    Decode { kind: &'static str, reason: String },
    #[error("validator {vote_account} is not part of stake pool {pool}")]
    ValidatorNotFound { pool: Pubkey, vote_account: Pubkey },
    #[error("{action} rejected: {reason}")]
    Rejected { action: LedgerAction, reason: String },
    #[error("failed to read keypair from {path}: {reason}")]
    Keypair { path: PathBuf, reason: String },
}

impl LedgerError {
    /// Transport failures (socket or HTTP) mean the endpoint is unreachable;
    /// anything the node itself answered stays an RPC error.
    pub(crate) fn from_client(endpoint: &str, err: ClientError) -> Self {
        match err.kind() {
            ClientErrorKind::Io(_) | ClientErrorKind::Reqwest(_) => Self::Connectivity {
                endpoint: endpoint.to_string(),
                reason: err.to_string(),
            },
            _ => Self::Rpc(Box::new(err)),
        }
    }
}

/// Write action named in a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerAction {
    UpdatePool,
    Stake(StakeDirection),
}

impl std::fmt::Display for LedgerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UpdatePool => write!(f, "stake pool update"),
            Self::Stake(direction) => write!(f, "stake {direction}"),
        }
    }
}
