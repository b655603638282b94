use serde::{Deserialize, Serialize};

/// Tuning knobs for the engine's consumer pool and timers.
///
/// The defaults suit an embedded engine running a handful of background
/// jobs; hosts with heavier workloads raise `max_consumers` and the load
/// factor together.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Consumers kept alive even when idle.
    pub min_consumers: usize,
    /// Hard ceiling on concurrent consumers.
    pub max_consumers: usize,
    /// Ready-plus-running jobs each consumer is expected to absorb before
    /// another one is spawned.
    pub consumer_load_factor: usize,
    /// How long an idle consumer above the minimum lingers before
    /// retiring, in milliseconds.
    pub consumer_keep_alive_ms: u64,
    /// Coalescing window for platform wake-up requests, in milliseconds.
    pub wake_batch_window_ms: u64,
    /// Poll interval for network monitors without change notifications,
    /// in milliseconds.
    pub network_poll_interval_ms: u64,
    /// Buffered lifecycle events per subscriber.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_consumers: 0,
            max_consumers: 5,
            consumer_load_factor: 3,
            consumer_keep_alive_ms: 10_000,
            wake_batch_window_ms: 1_000,
            network_poll_interval_ms: 10_000,
            event_capacity: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_consistent() {
        let config = EngineConfig::default();
        assert!(config.min_consumers <= config.max_consumers);
        assert!(config.consumer_load_factor > 0);
        assert!(config.consumer_keep_alive_ms > 0);
    }
}
