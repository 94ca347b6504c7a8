//! Service configuration.

use std::ops::RangeInclusive;

use chatseal_crypto::{DEFAULT_COMPRESSION_LEVEL, MAX_PAYLOAD_SIZE};
use thiserror::Error;

/// Levels accepted by zstd
pub const COMPRESSION_LEVELS: RangeInclusive<i32> = 1..=22;

/// Unusable [`ServiceConfig`] limit.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Batches must hold at least one token
    #[error("max_append_batch must be at least 1")]
    EmptyAppendBatch,

    /// Content limit is zero or cannot fit in one token payload
    #[error("max_content_bytes {value} must be in 1..={max}", max = MAX_PAYLOAD_SIZE)]
    ContentLimit {
        /// Rejected limit
        value: usize,
    },

    /// Not a zstd level
    #[error("compression_level {value} must be in 1..=22")]
    CompressionLevel {
        /// Rejected level
        value: i32,
    },
}

/// Limits and tuning for [`ConversationService`](crate::ConversationService).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Most tokens or drafts accepted by one append
    pub max_append_batch: usize,
    /// Largest message content in bytes
    pub max_content_bytes: usize,
    /// zstd level used when packing
    pub compression_level: i32,
}

impl ServiceConfig {
    /// Check limits are usable.
    ///
    /// # Errors
    ///
    /// Returns the first unusable limit.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_append_batch == 0 {
            return Err(ConfigError::EmptyAppendBatch);
        }
        if self.max_content_bytes == 0 || self.max_content_bytes > MAX_PAYLOAD_SIZE {
            return Err(ConfigError::ContentLimit { value: self.max_content_bytes });
        }
        if !COMPRESSION_LEVELS.contains(&self.compression_level) {
            return Err(ConfigError::CompressionLevel { value: self.compression_level });
        }
        Ok(())
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_append_batch: 64,
            max_content_bytes: 256 * 1024,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(ServiceConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_unusable_limits() {
        let config = ServiceConfig { max_append_batch: 0, ..ServiceConfig::default() };
        assert_eq!(config.validate(), Err(ConfigError::EmptyAppendBatch));

        let config =
            ServiceConfig { max_content_bytes: MAX_PAYLOAD_SIZE + 1, ..ServiceConfig::default() };
        assert_eq!(
            config.validate(),
            Err(ConfigError::ContentLimit { value: MAX_PAYLOAD_SIZE + 1 })
        );

        let config = ServiceConfig { compression_level: 0, ..ServiceConfig::default() };
        assert_eq!(config.validate(), Err(ConfigError::CompressionLevel { value: 0 }));
        assert_eq!(
            config.validate().unwrap_err().to_string(),
            "compression_level 0 must be in 1..=22"
        );
    }
}
