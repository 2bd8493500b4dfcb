//! Errors raised while setting the pool layer up.
//!
//! Running out of memory is never an error here: it is reported through
//! `NULLPOOL` or `None`. These types only cover construction.

use core::fmt;

use crate::pool::SpaceType;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    ZeroSize {
        what: &'static str,
    },
    Misaligned {
        what: &'static str,
        size: usize,
        align: usize,
    },
    TooLarge {
        what: &'static str,
        size: usize,
        max: usize,
    },
    BadPercentage {
        what: &'static str,
        value: u32,
    },
    InvertedBounds {
        lower: &'static str,
        upper: &'static str,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ZeroSize { what } => write!(f, "{} must not be zero", what),
            ConfigError::Misaligned { what, size, align } => {
                write!(f, "{} ({}) is not a multiple of {}", what, size, align)
            }
            ConfigError::TooLarge { what, size, max } => {
                write!(f, "{} ({}) exceeds the supported maximum {}", what, size, max)
            }
            ConfigError::BadPercentage { what, value } => {
                write!(f, "{} ({}) is not a percentage", what, value)
            }
            ConfigError::InvertedBounds { lower, upper } => {
                write!(f, "{} must not exceed {}", lower, upper)
            }
        }
    }
}

/// Failure to build a pool manager.
#[derive(Debug)]
pub enum MemPoolError<E> {
    InvalidConfig(ConfigError),
    /// The OS refused to map the memory for a space.
    Reserve {
        space: SpaceType,
        size: usize,
        source: E,
    },
}

impl<E> From<ConfigError> for MemPoolError<E> {
    fn from(err: ConfigError) -> Self {
        MemPoolError::InvalidConfig(err)
    }
}

impl<E: fmt::Debug> fmt::Display for MemPoolError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemPoolError::InvalidConfig(err) => write!(f, "invalid memory configuration: {}", err),
            MemPoolError::Reserve {
                space,
                size,
                source,
            } => write!(
                f,
                "could not reserve {} bytes for the {:?} space: {:?}",
                size, space, source
            ),
        }
    }
}
