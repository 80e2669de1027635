//! Database configuration.

use std::time::Duration;

use crate::error::{LowkeyError, Result};
use crate::recovery::CheckpointConfig;
use crate::storage::wal::WalConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// Number of page frames in the buffer pool.
    pub buffer_pool_capacity: usize,
    /// Hash buckets of a new data file. Ignored by `open`, which uses the
    /// count stored in the meta page.
    pub bucket_count: u32,
    /// How long a fetch waits for a frame while every frame is pinned.
    pub pin_wait_timeout: Duration,
    pub wal: WalConfig,
    pub checkpoint: CheckpointConfig,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            buffer_pool_capacity: 256,
            bucket_count: 64,
            pin_wait_timeout: Duration::from_secs(5),
            wal: WalConfig::default(),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

impl DatabaseConfig {
    pub fn validate(&self) -> Result<()> {
        // An insert that grows a chain pins two pages at once
        if self.buffer_pool_capacity < 2 {
            return Err(LowkeyError::InvalidParam(format!(
                "buffer pool needs at least 2 frames, got {}",
                self.buffer_pool_capacity
            )));
        }
        if self.bucket_count == 0 {
            return Err(LowkeyError::InvalidParam(
                "bucket count must be positive".to_string(),
            ));
        }
        if self.wal.buffer_size == 0 {
            return Err(LowkeyError::InvalidParam(
                "WAL buffer size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = DatabaseConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.checkpoint.max_archived_wals, 4);
        assert!(config.wal.sync_on_commit);
    }

    #[test]
    fn test_rejects_degenerate_config() {
        let config = DatabaseConfig {
            buffer_pool_capacity: 1,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(LowkeyError::InvalidParam(_))
        ));

        let config = DatabaseConfig {
            bucket_count: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
