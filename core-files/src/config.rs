//! File manager configuration.

use std::time::Duration;

use crate::error::{FileError, Result};

/// Highest priority an application may assign to a transfer.
pub const MAX_PRIORITY: i8 = 31;

/// File manager configuration
#[derive(Debug, Clone)]
pub struct FileManagerConfig {
    /// Attempts for one durable-store flush before giving up (the node stays
    /// dirty and is retried at the next dirty transition).
    pub flush_retry_attempts: u32,

    /// Base delay between flush retries; doubles per attempt.
    pub flush_retry_base_delay: Duration,

    /// Upper bound on the negative cache of unreadable local paths.
    pub bad_path_cache_limit: usize,

    /// Buffer size of the file-event broadcast channel.
    pub event_buffer_size: usize,
}

impl Default for FileManagerConfig {
    fn default() -> Self {
        Self {
            flush_retry_attempts: 3,
            flush_retry_base_delay: Duration::from_millis(100),
            bad_path_cache_limit: 4096,
            event_buffer_size: 100,
        }
    }
}

impl FileManagerConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.flush_retry_attempts == 0 {
            return Err(FileError::Config(
                "Flush retry attempts must be greater than 0".to_string(),
            ));
        }

        if self.flush_retry_base_delay > Duration::from_secs(60) {
            return Err(FileError::Config(
                "Flush retry base delay exceeds maximum of 60 seconds".to_string(),
            ));
        }

        if self.event_buffer_size == 0 {
            return Err(FileError::Config(
                "Event buffer size must be greater than 0".to_string(),
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
        assert!(FileManagerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_retry_attempts_rejected() {
        let config = FileManagerConfig {
            flush_retry_attempts: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_excessive_retry_delay_rejected() {
        let config = FileManagerConfig {
            flush_retry_base_delay: Duration::from_secs(120),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
