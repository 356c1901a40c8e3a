//! Engine configuration
//!
//! The knobs the coordinator and committer consume: worker-pool sizing,
//! idle keep-alive, and the per-table commit batch size.

use std::time::Duration;

/// Configuration for a [`crate::Database`]
#[derive(Debug, Clone)]
pub struct Config {
    /// Worker threads kept alive permanently
    pub core_pool_size: usize,
    /// Upper bound on worker threads under load
    pub max_pool_size: usize,
    /// How long a surplus worker idles before exiting
    pub keep_alive: Duration,
    /// How many queued commits one table worker applies before yielding
    pub commit_batch_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Config {
            core_pool_size: cores,
            max_pool_size: cores * 2,
            keep_alive: Duration::from_secs(60),
            commit_batch_size: 100,
        }
    }
}

impl Config {
    /// Start building a configuration from the defaults
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder {
            config: Config::default(),
        }
    }
}

/// Builder for [`Config`]
#[derive(Debug)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the permanent worker-thread count (clamped to at least 1)
    pub fn core_pool_size(mut self, size: usize) -> Self {
        self.config.core_pool_size = size.max(1);
        self
    }

    /// Set the maximum worker-thread count
    pub fn max_pool_size(mut self, size: usize) -> Self {
        self.config.max_pool_size = size.max(1);
        self
    }

    /// Set the surplus-worker idle keep-alive
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.config.keep_alive = keep_alive;
        self
    }

    /// Set the per-table commit batch size (clamped to at least 1)
    pub fn commit_batch_size(mut self, size: usize) -> Self {
        self.config.commit_batch_size = size.max(1);
        self
    }

    /// Finish, enforcing `max_pool_size >= core_pool_size`
    pub fn build(mut self) -> Config {
        if self.config.max_pool_size < self.config.core_pool_size {
            self.config.max_pool_size = self.config.core_pool_size;
        }
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = Config::default();
        assert!(config.core_pool_size >= 1);
        assert!(config.max_pool_size >= config.core_pool_size);
        assert_eq!(config.commit_batch_size, 100);
    }

    #[test]
    fn test_builder_clamps() {
        let config = Config::builder()
            .core_pool_size(8)
            .max_pool_size(2)
            .commit_batch_size(0)
            .build();
        assert_eq!(config.core_pool_size, 8);
        assert_eq!(config.max_pool_size, 8);
        assert_eq!(config.commit_batch_size, 1);
    }
}
