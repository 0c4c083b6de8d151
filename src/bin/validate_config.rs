use clap::Parser;
use std::process::ExitCode;

use st0x_rebalancer::config::{ConfigError, Settings, ValidateEnv};

fn main() -> ExitCode {
    let env = ValidateEnv::parse();
    match Settings::load_file(&env.config_file) {
        Ok(_) => {
            eprintln!("Config validation passed");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Config validation failed: {}: {e}", error_kind(&e));
            ExitCode::FAILURE
        }
    }
}

fn error_kind(e: &ConfigError) -> &'static str {
    match e {
        ConfigError::Io(_) => "failed to read config file",
        ConfigError::Toml(_) => "failed to parse config file",
        ConfigError::InvalidReserve { .. } => "invalid reserve amount",
        ConfigError::InvalidThreshold { .. } => "invalid rebalance threshold",
        ConfigError::ZeroValue { .. } => "zero interval or attempt count",
    }
}
