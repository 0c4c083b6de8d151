use clap::Parser;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;
use url::Url;

use st0x_ledger::{ConnectRetry, LAMPORTS_PER_SOL, Pubkey};

use crate::scheduler::SchedulerConfig;
use crate::telemetry::HyperDxConfig;

const DEFAULT_ENDPOINT: &str = "https://api.mainnet-beta.solana.com";
const DEFAULT_SERVICE_NAME: &str = "st0x-rebalancer";
const DEFAULT_ENVIRONMENT: &str = "production";

/// Rebalance stake across the validators of a stake pool.
#[derive(Parser, Debug)]
#[command(name = "rebalancer", version)]
pub struct Env {
    /// Stake pool account address
    #[clap(env = "STAKE_POOL_ADDRESS")]
    pub pool: Pubkey,
    /// Path to the staker keypair file
    #[clap(env = "STAKER_KEYPAIR")]
    pub staker_keypair: PathBuf,
    /// SOL to leave undistributed in the pool reserve
    #[clap(env = "RESERVE_AMOUNT")]
    pub reserve_amount: Decimal,
    /// JSON-RPC endpoint of the network
    #[clap(long, env = "RPC_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    pub endpoint: Url,
    /// Keep running and rebalance once near the end of every epoch
    #[clap(long)]
    pub service: bool,
    /// Log stake actions instead of submitting them
    #[clap(long)]
    pub dry_run: bool,
    /// Path to an optional TOML file with service tunables
    #[clap(long)]
    pub config: Option<PathBuf>,
    #[clap(long, env)]
    pub log_level: Option<LogLevel>,
    /// HyperDX API key for trace export (optional)
    #[clap(long, env)]
    pub hyperdx_api_key: Option<String>,
}

#[derive(Parser, Debug)]
#[command(name = "validate-config")]
pub struct ValidateEnv {
    /// Path to TOML configuration file
    #[clap(long)]
    pub config_file: PathBuf,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(log_level: LogLevel) -> Self {
        match log_level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// Tunables deserialized from the optional TOML file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    log_level: Option<LogLevel>,
    service: Option<ServiceSection>,
    connection: Option<ConnectionSection>,
    hyperdx: Option<HyperDxSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServiceSection {
    poll_interval_secs: Option<u64>,
    error_backoff_secs: Option<u64>,
    rebalance_threshold: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConnectionSection {
    max_attempts: Option<usize>,
    retry_delay_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct HyperDxSection {
    service_name: Option<String>,
    environment: Option<String>,
}

/// Validated file settings with defaults applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub log_level: Option<LogLevel>,
    pub scheduler: SchedulerConfig,
    pub connect_retry: ConnectRetry,
    pub service_name: String,
    /// Reported to HyperDX as `deployment.environment`.
    pub environment: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: None,
            scheduler: SchedulerConfig::default(),
            connect_retry: ConnectRetry::default(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            environment: DEFAULT_ENVIRONMENT.to_string(),
        }
    }
}

impl Settings {
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let file: FileConfig = toml::from_str(contents)?;
        let defaults = Self::default();

        let service = file.service.unwrap_or_default();
        let scheduler = SchedulerConfig {
            poll_interval: non_zero_secs(
                "poll_interval_secs",
                service.poll_interval_secs,
                defaults.scheduler.poll_interval,
            )?,
            error_backoff: non_zero_secs(
                "error_backoff_secs",
                service.error_backoff_secs,
                defaults.scheduler.error_backoff,
            )?,
            rebalance_threshold: validate_threshold(
                service
                    .rebalance_threshold
                    .unwrap_or(defaults.scheduler.rebalance_threshold),
            )?,
        };

        let connection = file.connection.unwrap_or_default();
        let max_attempts = connection
            .max_attempts
            .unwrap_or(defaults.connect_retry.max_attempts);
        if max_attempts == 0 {
            return Err(ConfigError::ZeroValue {
                field: "max_attempts",
            });
        }
        let connect_retry = ConnectRetry {
            max_attempts,
            delay: connection
                .retry_delay_secs
                .map_or(defaults.connect_retry.delay, Duration::from_secs),
        };

        let hyperdx = file.hyperdx.unwrap_or_default();

        Ok(Self {
            log_level: file.log_level,
            scheduler,
            connect_retry,
            service_name: hyperdx.service_name.unwrap_or(defaults.service_name),
            environment: hyperdx.environment.unwrap_or(defaults.environment),
        })
    }
}

fn non_zero_secs(
    field: &'static str,
    secs: Option<u64>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match secs {
        None => Ok(default),
        Some(0) => Err(ConfigError::ZeroValue { field }),
        Some(secs) => Ok(Duration::from_secs(secs)),
    }
}

fn validate_threshold(threshold: f64) -> Result<f64, ConfigError> {
    if threshold > 0.0 && threshold <= 1.0 {
        Ok(threshold)
    } else {
        Err(ConfigError::InvalidThreshold { threshold })
    }
}

/// Converts a SOL amount into lamports, truncating any fractional lamport.
pub fn reserve_lamports(amount: Decimal) -> Result<u64, ConfigError> {
    if amount < Decimal::ZERO {
        return Err(ConfigError::InvalidReserve { amount });
    }

    amount
        .checked_mul(Decimal::from(LAMPORTS_PER_SOL))
        .and_then(|lamports| lamports.trunc().to_u64())
        .ok_or(ConfigError::InvalidReserve { amount })
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML")]
    Toml(#[from] toml::de::Error),
    #[error("reserve amount {amount} is not a valid lamport amount")]
    InvalidReserve { amount: Decimal },
    #[error("rebalance threshold {threshold} must be in (0, 1]")]
    InvalidThreshold { threshold: f64 },
    #[error("{field} must be greater than zero")]
    ZeroValue { field: &'static str },
}

/// Everything the rebalancer needs to run, assembled from the command line,
/// the environment and the optional config file.
#[derive(Debug, Clone)]
pub struct Ctx {
    pub pool: Pubkey,
    pub staker_keypair: PathBuf,
    pub reserve_lamports: u64,
    pub endpoint: Url,
    pub service: bool,
    pub dry_run: bool,
    pub log_level: LogLevel,
    pub scheduler: SchedulerConfig,
    pub connect_retry: ConnectRetry,
    pub hyperdx: Option<HyperDxConfig>,
}

impl Env {
    pub fn into_ctx(self) -> Result<Ctx, ConfigError> {
        let settings = match &self.config {
            Some(path) => Settings::load_file(path)?,
            None => Settings::default(),
        };

        let reserve_lamports = reserve_lamports(self.reserve_amount)?;

        let log_level = self
            .log_level
            .or(settings.log_level)
            .unwrap_or(LogLevel::Info);

        let hyperdx = self.hyperdx_api_key.map(|api_key| HyperDxConfig {
            api_key,
            service_name: settings.service_name,
            environment: settings.environment,
            pool: self.pool,
            log_level: log_level.into(),
        });

        Ok(Ctx {
            pool: self.pool,
            staker_keypair: self.staker_keypair,
            reserve_lamports,
            endpoint: self.endpoint,
            service: self.service,
            dry_run: self.dry_run,
            log_level,
            scheduler: settings.scheduler,
            connect_retry: settings.connect_retry,
            hyperdx,
        })
    }
}

pub(crate) fn default_filter(level: Level) -> String {
    format!("st0x_rebalancer={level},st0x_ledger={level}")
}

pub fn setup_tracing(log_level: LogLevel) {
    let default_filter = default_filter(log_level.into());

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}
