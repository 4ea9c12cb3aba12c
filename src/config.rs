//! Merge configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MergeError, Result};

const MB: u64 = 1024 * 1024;

/// Configuration shared by merge meta creation and merge execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Number of worker threads of the resource controlled pool.
    pub merge_thread_count: usize,

    /// Memory budget for concurrently running work items (in MB).
    pub max_memory_use_mb: u64,

    /// Estimated cost above which a task item is split into parallel instances.
    pub parallel_threshold_bytes: u64,

    /// Upper bound of parallel instances for one task item.
    pub max_parallel_count: u32,

    /// Write a checkpoint file for each finished task item.
    pub enable_check_point: bool,

    /// Sleep between scheduling attempts when no pending item fits (in ms).
    pub starvation_sleep_ms: u64,

    /// Emit one task item per target segment when a plan splits its output.
    pub split_segment_items: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        MergeConfig {
            merge_thread_count: num_cpus::get().clamp(1, 8),
            max_memory_use_mb: 1024,
            parallel_threshold_bytes: 256 * MB,
            max_parallel_count: 8,
            enable_check_point: true,
            starvation_sleep_ms: 10,
            split_segment_items: true,
        }
    }
}

impl MergeConfig {
    pub fn builder() -> MergeConfigBuilder {
        MergeConfigBuilder::default()
    }

    /// Check the configuration for values the merge cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.merge_thread_count == 0 {
            return Err(MergeError::invalid_config(
                "merge_thread_count must be greater than 0",
            ));
        }
        if self.max_memory_use_mb == 0 {
            return Err(MergeError::invalid_config(
                "max_memory_use_mb must be greater than 0",
            ));
        }
        if self.max_parallel_count == 0 {
            return Err(MergeError::invalid_config(
                "max_parallel_count must be greater than 0",
            ));
        }
        if self.parallel_threshold_bytes == 0 {
            return Err(MergeError::invalid_config(
                "parallel_threshold_bytes must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Resource limit of the thread pool in bytes.
    pub fn resource_limit(&self) -> i64 {
        (self.max_memory_use_mb.saturating_mul(MB)).min(i64::MAX as u64) as i64
    }

    pub fn thread_pool_config(&self) -> ThreadPoolConfig {
        ThreadPoolConfig {
            thread_num: self.merge_thread_count,
            resource_limit: self.resource_limit(),
            starvation_sleep: Duration::from_millis(self.starvation_sleep_ms),
        }
    }
}

#[derive(Debug, Default)]
pub struct MergeConfigBuilder {
    config: MergeConfig,
}

impl MergeConfigBuilder {
    pub fn merge_thread_count(mut self, count: usize) -> Self {
        self.config.merge_thread_count = count;
        self
    }

    pub fn max_memory_use_mb(mut self, mb: u64) -> Self {
        self.config.max_memory_use_mb = mb;
        self
    }

    pub fn parallel_threshold_bytes(mut self, bytes: u64) -> Self {
        self.config.parallel_threshold_bytes = bytes;
        self
    }

    pub fn max_parallel_count(mut self, count: u32) -> Self {
        self.config.max_parallel_count = count;
        self
    }

    pub fn enable_check_point(mut self, enable: bool) -> Self {
        self.config.enable_check_point = enable;
        self
    }

    pub fn starvation_sleep_ms(mut self, ms: u64) -> Self {
        self.config.starvation_sleep_ms = ms;
        self
    }

    pub fn split_segment_items(mut self, split: bool) -> Self {
        self.config.split_segment_items = split;
        self
    }

    pub fn build(self) -> Result<MergeConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Parameters of a [`ResourceControlThreadPool`](crate::pool::ResourceControlThreadPool).
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadPoolConfig {
    pub thread_num: usize,

    /// Total resource (bytes of memory) available to running items.
    pub resource_limit: i64,

    pub starvation_sleep: Duration,
}

impl ThreadPoolConfig {
    pub fn new(thread_num: usize, resource_limit: i64) -> Self {
        ThreadPoolConfig {
            thread_num,
            resource_limit,
            starvation_sleep: Duration::from_millis(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = MergeConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.merge_thread_count >= 1);
        assert_eq!(config.resource_limit(), 1024 * 1024 * 1024);
    }

    #[test]
    fn test_builder_rejects_zero_threads() {
        let result = MergeConfig::builder().merge_thread_count(0).build();
        assert!(matches!(result, Err(MergeError::InvalidConfig(_))));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: MergeConfig =
            serde_json::from_str(r#"{"max_parallel_count": 2}"#).unwrap();
        assert_eq!(config.max_parallel_count, 2);
        assert_eq!(config.max_memory_use_mb, 1024);
        assert!(config.enable_check_point);
    }

    #[test]
    fn test_thread_pool_config() {
        let config = MergeConfig::builder()
            .merge_thread_count(3)
            .max_memory_use_mb(2)
            .starvation_sleep_ms(1)
            .build()
            .unwrap();
        let pool = config.thread_pool_config();
        assert_eq!(pool.thread_num, 3);
        assert_eq!(pool.resource_limit, 2 * 1024 * 1024);
        assert_eq!(pool.starvation_sleep, Duration::from_millis(1));
    }
}
