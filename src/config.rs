//! Deployment parameters, read from a JSON file.
//!
//! Every field has a default matching the reference deployment (`Nir Coin`,
//! 18 decimals, one million tokens, 10% exchange fee), so an empty `{}` is a
//! valid configuration.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    address::{Address, AddressError},
    ledger::Amount,
    units::{self, DEFAULT_DECIMALS},
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed config {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid token supply {supply:?} for {decimals} decimals")]
    Supply { supply: String, decimals: u8 },
    #[error("invalid account {account:?}: {source}")]
    Account {
        account: String,
        #[source]
        source: AddressError,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub state_path: PathBuf,
    pub deployer: String,
    pub token: TokenConfig,
    pub exchange: ExchangeConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TokenConfig {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
    /// Whole tokens, e.g. `"1000000"`; fractions allowed up to `decimals`.
    pub supply: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Label or `0x` address.
    pub fee_account: String,
    pub fee_percent: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("nirx.state.json"),
            deployer: "deployer".into(),
            token: TokenConfig::default(),
            exchange: ExchangeConfig::default(),
        }
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            name: "Nir Coin".into(),
            symbol: "NIR".into(),
            decimals: DEFAULT_DECIMALS,
            supply: "1000000".into(),
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            fee_account: "feeAccount".into(),
            fee_percent: 10,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads `path` when given, otherwise the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn deployer(&self) -> Result<Address, ConfigError> {
        resolve(&self.deployer)
    }

    pub fn fee_account(&self) -> Result<Address, ConfigError> {
        resolve(&self.exchange.fee_account)
    }

    pub fn total_supply(&self) -> Result<Amount, ConfigError> {
        units::parse_units(&self.token.supply, self.token.decimals).ok_or_else(|| {
            ConfigError::Supply {
                supply: self.token.supply.clone(),
                decimals: self.token.decimals,
            }
        })
    }
}

fn resolve(account: &str) -> Result<Address, ConfigError> {
    Address::resolve(account).map_err(|source| ConfigError::Account {
        account: account.to_string(),
        source,
    })
}
