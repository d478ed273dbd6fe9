//! Arena configuration parameters.

use std::env;
use std::error::Error;
use std::fmt;

use crate::chunk::CHUNK_BYTES;

/// Configuration for the tenant arena.
///
/// Controls the size of the reserved address range, the physical-memory
/// soft limit, and the large-pool split policy. Validated at construction;
/// all values are immutable after creation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArenaConfig {
    /// Bytes of virtual address space reserved up front.
    ///
    /// Default: 32 TiB. The lower half backs the small pool (4 MiB
    /// chunks), the upper half backs large blocks. Must be a non-zero
    /// multiple of `2 * CHUNK_BYTES`.
    pub reserve_bytes: u64,

    /// Estimate of available physical memory.
    ///
    /// Default: 8 GiB. Committing past it logs a warning once per
    /// crossing; allocation still proceeds.
    pub soft_limit_bytes: u64,

    /// Smallest remainder worth splitting off a reused large span.
    ///
    /// Default: 64 KiB. A free span whose leftover would be smaller is
    /// handed out whole. Must be a non-zero multiple of 16.
    pub large_min_split: u32,
}

impl ArenaConfig {
    /// Default reservation: 32 TiB.
    pub const DEFAULT_RESERVE_BYTES: u64 = 32 << 40;

    /// Default soft limit: 8 GiB.
    pub const DEFAULT_SOFT_LIMIT_BYTES: u64 = 8 << 30;

    /// Default large-span split threshold: 64 KiB.
    pub const DEFAULT_LARGE_MIN_SPLIT: u32 = 64 * 1024;

    /// Environment override for [`ArenaConfig::reserve_bytes`].
    pub const ENV_RESERVE_BYTES: &'static str = "STRATA_RESERVE_BYTES";

    /// Environment override for [`ArenaConfig::soft_limit_bytes`].
    pub const ENV_SOFT_LIMIT_BYTES: &'static str = "STRATA_SOFT_LIMIT_BYTES";

    /// Environment override for [`ArenaConfig::large_min_split`].
    pub const ENV_LARGE_MIN_SPLIT: &'static str = "STRATA_LARGE_MIN_SPLIT";

    /// Create a config with default values.
    pub fn new() -> Self {
        Self {
            reserve_bytes: Self::DEFAULT_RESERVE_BYTES,
            soft_limit_bytes: Self::DEFAULT_SOFT_LIMIT_BYTES,
            large_min_split: Self::DEFAULT_LARGE_MIN_SPLIT,
        }
    }

    /// Set the reservation size.
    pub fn with_reserve_bytes(mut self, bytes: u64) -> Self {
        self.reserve_bytes = bytes;
        self
    }

    /// Set the soft limit.
    pub fn with_soft_limit_bytes(mut self, bytes: u64) -> Self {
        self.soft_limit_bytes = bytes;
        self
    }

    /// Set the large-span split threshold.
    pub fn with_large_min_split(mut self, bytes: u32) -> Self {
        self.large_min_split = bytes;
        self
    }

    /// Defaults overridden by any `STRATA_*` environment variables present.
    ///
    /// Values are plain decimal byte counts. The result is validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Like [`ArenaConfig::from_env`] but reading through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::new();
        if let Some(v) = parse_var(&lookup, Self::ENV_RESERVE_BYTES)? {
            config.reserve_bytes = v;
        }
        if let Some(v) = parse_var(&lookup, Self::ENV_SOFT_LIMIT_BYTES)? {
            config.soft_limit_bytes = v;
        }
        if let Some(v) = parse_var(&lookup, Self::ENV_LARGE_MIN_SPLIT)? {
            config.large_min_split = u32::try_from(v).map_err(|_| ConfigError::InvalidEnv {
                key: Self::ENV_LARGE_MIN_SPLIT,
                value: v.to_string(),
            })?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Check that the parameters describe a usable arena.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let pair = 2 * CHUNK_BYTES as u64;
        if self.reserve_bytes == 0 || self.reserve_bytes % pair != 0 {
            return Err(ConfigError::ReserveSize {
                bytes: self.reserve_bytes,
                multiple_of: pair,
            });
        }
        if self.large_min_split == 0 || self.large_min_split % 16 != 0 {
            return Err(ConfigError::SplitThreshold {
                bytes: self.large_min_split,
            });
        }
        Ok(())
    }

    /// Bytes of the reservation given to the small pool.
    pub fn small_region_bytes(&self) -> u64 {
        self.reserve_bytes / 2
    }

    /// Number of chunks the small region holds.
    pub fn max_chunks(&self) -> u64 {
        self.small_region_bytes() / CHUNK_BYTES as u64
    }
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_var(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<u64>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { key, value: raw }),
    }
}

/// Rejected arena configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// The reservation is empty or not a multiple of two chunks.
    ReserveSize {
        /// Configured reservation.
        bytes: u64,
        /// Required granularity.
        multiple_of: u64,
    },
    /// The large-span split threshold is zero or not 16-byte aligned.
    SplitThreshold {
        /// Configured threshold.
        bytes: u32,
    },
    /// An environment override could not be parsed.
    InvalidEnv {
        /// Variable name.
        key: &'static str,
        /// Raw value found.
        value: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReserveSize { bytes, multiple_of } => write!(
                f,
                "reserve size {bytes} must be a non-zero multiple of {multiple_of}"
            ),
            Self::SplitThreshold { bytes } => write!(
                f,
                "large split threshold {bytes} must be a non-zero multiple of 16"
            ),
            Self::InvalidEnv { key, value } => {
                write!(f, "invalid value for {key}: {value:?}")
            }
        }
    }
}

impl Error for ConfigError {}
