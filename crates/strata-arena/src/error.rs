//! Arena construction errors.

use std::error::Error;
use std::fmt;

use strata_core::AllocError;

use crate::config::ConfigError;

/// Errors that can occur while constructing a [`TenantArena`](crate::TenantArena).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArenaError {
    /// The configuration was rejected.
    Config(ConfigError),
    /// The address range could not be reserved.
    Reserve(AllocError),
}

impl fmt::Display for ArenaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "invalid arena config: {e}"),
            Self::Reserve(e) => write!(f, "arena reservation failed: {e}"),
        }
    }
}

impl Error for ArenaError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            Self::Reserve(e) => Some(e),
        }
    }
}

impl From<ConfigError> for ArenaError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<AllocError> for ArenaError {
    fn from(e: AllocError) -> Self {
        Self::Reserve(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_wraps_source() {
        let e = ArenaError::from(ConfigError::SplitThreshold { bytes: 3 });
        assert_eq!(
            e.to_string(),
            "invalid arena config: large split threshold 3 must be a non-zero multiple of 16"
        );
        assert!(e.source().is_some());
    }
}
