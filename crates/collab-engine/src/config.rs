/// Engine configuration
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Merge engine and per-document write path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Out-of-order operations buffered per branch before the oldest is dropped
    pub max_pending_per_branch: usize,

    /// How long a buffered operation may wait for its dependencies
    pub pending_ttl: Duration,

    /// Largest number of operations a client base clock may lag behind
    pub max_rebase_distance: u64,

    /// Recent log entries examined for conflicts on the live edit path
    pub conflict_window: usize,

    /// Largest batch accepted in one submission
    pub max_batch_size: usize,

    /// Wait for the per-document write token before giving up
    pub lock_timeout: Duration,

    /// Extra attempts a branch merge makes when the target keeps moving
    pub merge_retries: u32,

    /// Sustained operation rate allowed per actor
    pub ops_per_second: f64,

    /// Operations an actor may submit in a burst
    pub burst: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_pending_per_branch: 1024,
            pending_ttl: Duration::from_secs(30),
            max_rebase_distance: 10_000,
            conflict_window: 1_000,
            max_batch_size: 1_000,
            lock_timeout: Duration::from_secs(5),
            merge_retries: 1,
            ops_per_second: 200.0,
            burst: 400,
        }
    }
}

impl EngineConfig {
    pub fn for_testing() -> Self {
        Self {
            max_pending_per_branch: 16,
            pending_ttl: Duration::from_millis(200),
            max_rebase_distance: 100,
            lock_timeout: Duration::from_millis(500),
            ..Default::default()
        }
    }
}

/// Presence lifecycle timings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// No cursor, selection or viewport change for this long moves Active to Away
    pub idle_threshold: Duration,

    /// A session without heartbeats for this long is closed
    pub heartbeat_timeout: Duration,

    /// Away sessions are pruned once idle for `idle_threshold + away_grace`
    pub away_grace: Duration,

    /// Period of the background sweeper
    pub sweep_interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            idle_threshold: Duration::from_secs(5 * 60),
            heartbeat_timeout: Duration::from_secs(90),
            away_grace: Duration::from_secs(10 * 60),
            sweep_interval: Duration::from_secs(15),
        }
    }
}

impl PresenceConfig {
    pub fn for_testing() -> Self {
        Self {
            sweep_interval: Duration::from_millis(20),
            ..Default::default()
        }
    }
}

/// Event delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Events queued per subscriber before it is evicted as lagged
    pub subscriber_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: 256,
        }
    }
}

impl BroadcastConfig {
    pub fn for_testing() -> Self {
        Self {
            subscriber_capacity: 8,
        }
    }
}

/// Persistence write behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Attempts per write, including the first
    pub max_attempts: u32,

    /// Backoff before the second attempt; doubles after each failure
    pub base_backoff: Duration,

    pub max_backoff: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl PersistenceConfig {
    pub fn for_testing() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    /// Delay before attempt `attempt` (1-based); zero for the first
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 2);
        self.base_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// Aggregate configuration for [`crate::CollabService`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollabConfig {
    pub engine: EngineConfig,
    pub presence: PresenceConfig,
    pub broadcast: BroadcastConfig,
    pub persistence: PersistenceConfig,
}

impl CollabConfig {
    pub fn for_testing() -> Self {
        Self {
            engine: EngineConfig::for_testing(),
            presence: PresenceConfig::for_testing(),
            broadcast: BroadcastConfig::for_testing(),
            persistence: PersistenceConfig::for_testing(),
        }
    }
}
