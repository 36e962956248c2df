//! Configuration types.

use std::time::Duration;

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of jobs processed concurrently.
    pub max_concurrency: usize,
    /// Fallback dispatch tick when no enqueue/release wake-up arrives.
    pub dispatch_interval: Duration,
    /// Default per-job execution attempt ceiling.
    pub max_attempts: u32,
    /// Grace period for in-flight jobs during shutdown.
    pub shutdown_grace: Duration,
    /// Version of the enrichment result schema. Bumping it forces full
    /// regeneration for every session on its next run.
    pub schema_version: u32,
    pub worker: WorkerPoolConfig,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub cache: CacheConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 2,
            dispatch_interval: Duration::from_secs(1),
            max_attempts: 3,
            shutdown_grace: Duration::from_secs(30),
            schema_version: 1,
            worker: WorkerPoolConfig::default(),
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of logical worker slots.
    pub pool_size: usize,
    /// How long an acquire call waits for a free worker before failing.
    pub acquire_timeout: Duration,
    /// Consecutive-error count that flips a worker into error state.
    pub error_threshold: u32,
    /// Interval between health-check passes.
    pub health_check_interval: Duration,
    /// Downtime applied while a worker is being replaced.
    pub restart_delay: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 2,
            acquire_timeout: Duration::from_secs(30),
            error_threshold: 3,
            health_check_interval: Duration::from_secs(60),
            restart_delay: Duration::from_millis(100),
        }
    }
}

/// Retry/backoff configuration for transient failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Base delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling on any computed delay.
    pub max_delay: Duration,
    /// Exponential multiplier for generic transient errors.
    pub backoff_multiplier: f64,
    /// Steeper multiplier for rate-limit errors.
    pub rate_limit_multiplier: f64,
    /// Jitter fraction applied to every delay (0.2 = ±20%).
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(120),
            backoff_multiplier: 2.0,
            rate_limit_multiplier: 3.0,
            jitter: 0.2,
        }
    }
}

/// Circuit-breaker configuration (per operation class).
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long an open circuit waits before allowing a probe.
    pub cooldown: Duration,
    /// Consecutive half-open successes required to close again.
    pub close_after_successes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
            close_after_successes: 2,
        }
    }
}

/// Cache configuration (artifact cache L1 bounds + memoizer).
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum entry count in the in-memory tier.
    pub l1_max_entries: usize,
    /// Maximum total value bytes in the in-memory tier.
    pub l1_max_bytes: usize,
    /// Time-to-live for cached artifacts.
    pub ttl: Duration,
    /// Maximum entry count in the memoization cache.
    pub memo_max_entries: usize,
    /// Time-to-live for memoized sub-computations.
    pub memo_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_max_entries: 256,
            l1_max_bytes: 32 * 1024 * 1024,
            ttl: Duration::from_secs(30 * 24 * 60 * 60), // 30 days
            memo_max_entries: 1024,
            memo_ttl: Duration::from_secs(60 * 60),
        }
    }
}
