//! Configuration error types.

use thiserror::Error;

/// Errors raised while validating or loading configuration.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum ConfigError {
    #[error("{name} fraction {value} outside {min}..={max}")]
    InvalidFraction {
        name: &'static str,
        value: f32,
        min: f32,
        max: f32,
    },

    #[error("{name} budget must be greater than zero")]
    ZeroBudget { name: &'static str },

    #[error("{pool} pool size must be greater than zero")]
    ZeroPoolSize { pool: &'static str },

    #[error("{pool} pool has a fixed size")]
    FixedPool { pool: &'static str },

    #[error("failed to determine config directory")]
    ConfigDirNotFound,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("toml serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("toml deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
}

impl ConfigError {
    /// Checks that `value` lies within `min..=max`.
    ///
    /// # Errors
    /// Returns `InvalidFraction` when out of range or not a number.
    pub fn check_fraction(name: &'static str, value: f32, min: f32, max: f32) -> Result<f32, Self> {
        if (min..=max).contains(&value) {
            Ok(value)
        } else {
            Err(Self::InvalidFraction {
                name,
                value,
                min,
                max,
            })
        }
    }
}
