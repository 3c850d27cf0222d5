//! Engine configuration module.
//!
//! This module provides configuration loading for the index engine from
//! environment variables.
//!
//! # Environment Variables
//!
//! - `ENGINE_NODE_SIZE`: Bytes per tree node (default: `512`)
//! - `ENGINE_SPLIT_PERCENT`: Fill percentage at which a node splits (default: `100`)
//! - `ENGINE_MERGE_PERCENT`: Fill percentage at which a node merges (default: `40`)
//! - `ENGINE_SWMR_WRITE`: Keep old node images readable for concurrent readers (default: `false`)
//! - `ENGINE_ADDRESS_WIDTH`: Bytes used to encode a file address (default: `8`)
//! - `ENGINE_LENGTH_WIDTH`: Bytes used to encode a file length (default: `8`)
//!
//! # Invariants
//!
//! - Both widths are always in `2..=8`
//! - Both percentages are always in `1..=100`
//!
//! Whether a node size and the percentages fit together is only known once a
//! record class is chosen; [`CreateParams::validate`] checks that.

use crate::btree2::CreateParams;
use crate::storage::FileOptions;

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Size of every tree node image in bytes.
    pub node_size: u32,
    /// A node holding this percentage of its capacity is split before insertion.
    pub split_percent: u8,
    /// A node at this percentage of its capacity is merged before removal.
    pub merge_percent: u8,
    /// Relocate nodes instead of overwriting them in place.
    pub swmr_write: bool,
    /// Bytes used to encode a file address.
    pub address_width: u8,
    /// Bytes used to encode a file length or record count.
    pub length_width: u8,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_size: Self::DEFAULT_NODE_SIZE,
            split_percent: Self::DEFAULT_SPLIT_PERCENT,
            merge_percent: Self::DEFAULT_MERGE_PERCENT,
            swmr_write: false,
            address_width: Self::DEFAULT_WIDTH,
            length_width: Self::DEFAULT_WIDTH,
        }
    }
}

impl EngineConfig {
    /// Default node size in bytes.
    pub const DEFAULT_NODE_SIZE: u32 = 512;
    /// Default split percentage.
    pub const DEFAULT_SPLIT_PERCENT: u8 = 100;
    /// Default merge percentage.
    pub const DEFAULT_MERGE_PERCENT: u8 = 40;
    /// Default address and length width.
    pub const DEFAULT_WIDTH: u8 = 8;

    /// Load configuration from environment variables.
    ///
    /// Every variable is optional; unset variables take their default.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set but does not parse or is out of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let node_size = load_number(&lookup, "ENGINE_NODE_SIZE", Self::DEFAULT_NODE_SIZE)?;
        if node_size == 0 {
            return Err(invalid("ENGINE_NODE_SIZE", "must be greater than zero"));
        }

        let split_percent = load_percent(&lookup, "ENGINE_SPLIT_PERCENT", Self::DEFAULT_SPLIT_PERCENT)?;
        let merge_percent = load_percent(&lookup, "ENGINE_MERGE_PERCENT", Self::DEFAULT_MERGE_PERCENT)?;
        let swmr_write = load_bool(&lookup, "ENGINE_SWMR_WRITE")?;
        let address_width = load_width(&lookup, "ENGINE_ADDRESS_WIDTH")?;
        let length_width = load_width(&lookup, "ENGINE_LENGTH_WIDTH")?;

        Ok(Self {
            node_size,
            split_percent,
            merge_percent,
            swmr_write,
            address_width,
            length_width,
        })
    }

    /// Tree creation parameters.
    #[must_use]
    pub const fn create_params(&self) -> CreateParams {
        CreateParams {
            node_size: self.node_size,
            split_percent: self.split_percent,
            merge_percent: self.merge_percent,
        }
    }

    /// Options for creating or opening an index file.
    #[must_use]
    pub const fn file_options(&self) -> FileOptions {
        FileOptions {
            address_width: self.address_width,
            length_width: self.length_width,
            swmr_write: self.swmr_write,
        }
    }
}

fn invalid(name: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        message: message.to_string(),
    }
}

fn load_number<F, T>(lookup: &F, name: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map_err(|_| invalid(name, &format!("'{value}' is not a valid number"))),
        None => Ok(default),
    }
}

fn load_percent<F>(lookup: &F, name: &str, default: u8) -> Result<u8, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = load_number(lookup, name, default)?;
    if !(1..=100).contains(&value) {
        return Err(invalid(name, &format!("{value} is not a percentage in 1..=100")));
    }
    Ok(value)
}

fn load_width<F>(lookup: &F, name: &str) -> Result<u8, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = load_number(lookup, name, EngineConfig::DEFAULT_WIDTH)?;
    if !(2..=8).contains(&value) {
        return Err(invalid(name, &format!("{value} is not a width in 2..=8")));
    }
    Ok(value)
}

fn load_bool<F>(lookup: &F, name: &str) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name).as_deref().map(str::trim) {
        None => Ok(false),
        Some("1" | "true" | "TRUE" | "yes") => Ok(true),
        Some("0" | "false" | "FALSE" | "no") => Ok(false),
        Some(other) => Err(invalid(name, &format!("'{other}' is not a boolean"))),
    }
}
