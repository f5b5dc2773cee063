use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::path::Path;
use std::{env, fs, io};

use crate::token::amount::AmountError;
use crate::token::ledger::{
    DEFAULT_DECIMALS, DEFAULT_EVENT_BUFFER, DEFAULT_EVENT_LOG_LIMIT, DEFAULT_NAME, DEFAULT_SYMBOL,
};
use crate::token::TokenAmount;

/// Environment variable naming an optional JSON config file
pub const CONFIG_PATH_VAR: &str = "TOKEN_CONFIG";

/// Errors that can occur while loading the configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },

    #[error("Invalid initial supply: {0}")]
    Amount(#[from] AmountError),
}

/// Service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
    pub initial_supply: TokenAmount,
    pub host: String,
    pub port: u16,
    /// Hex-encoded ed25519 secret key of the deploying account
    pub owner_secret_key: Option<String>,
    pub event_buffer: usize,
    /// Number of recent transfer events kept in memory
    pub event_log_limit: usize,
}

impl Default for TokenConfig {
    fn default() -> Self {
        TokenConfig {
            name: DEFAULT_NAME.to_string(),
            symbol: DEFAULT_SYMBOL.to_string(),
            decimals: DEFAULT_DECIMALS,
            // 1000 whole tokens at 18 decimals
            initial_supply: TokenAmount::new(1_000_000_000_000_000_000_000),
            host: "127.0.0.1".to_string(),
            port: 8080,
            owner_secret_key: None,
            event_buffer: DEFAULT_EVENT_BUFFER,
            event_log_limit: DEFAULT_EVENT_LOG_LIMIT,
        }
    }
}

impl TokenConfig {
    /// Defaults, then the file named by `TOKEN_CONFIG`, then `TOKEN_*` variables
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match env::var(CONFIG_PATH_VAR) {
            Ok(path) => TokenConfig::load_from_file(path)?,
            Err(_) => TokenConfig::default(),
        };
        config.apply_overrides(|name| env::var(name).ok())?;
        Ok(config)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Applies `TOKEN_*` overrides looked up through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("TOKEN_NAME") {
            self.name = name;
        }
        if let Some(symbol) = lookup("TOKEN_SYMBOL") {
            self.symbol = symbol;
        }
        if let Some(decimals) = lookup("TOKEN_DECIMALS") {
            self.decimals = parse_number("TOKEN_DECIMALS", &decimals)?;
        }
        if let Some(supply) = lookup("TOKEN_INITIAL_SUPPLY") {
            self.initial_supply = supply.parse()?;
        }
        if let Some(host) = lookup("TOKEN_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("TOKEN_PORT") {
            self.port = parse_number("TOKEN_PORT", &port)?;
        }
        if let Some(key) = lookup("TOKEN_OWNER_KEY") {
            self.owner_secret_key = Some(key);
        }
        if let Some(limit) = lookup("TOKEN_EVENT_LOG_LIMIT") {
            self.event_log_limit = parse_number("TOKEN_EVENT_LOG_LIMIT", &limit)?;
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        name,
        reason: e.to_string(),
    })
}
