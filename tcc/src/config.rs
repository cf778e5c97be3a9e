//! Coordinator configuration and defaults.

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Runtime settings of a [`Coordinator`](crate::Coordinator).
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Upper bound of a single Try/Confirm/Cancel call.
    pub call_timeout: Duration,

    /// How long a transaction may stay `prepared` before recovery fails it.
    pub prepare_timeout: Duration,

    /// Interval between two recovery passes when nothing wakes the sweeper.
    pub sweep_interval: Duration,

    /// How long a claimed transaction stays reserved for one coordinator.
    pub lease: Duration,

    /// Maximum number of transactions claimed per recovery pass.
    pub batch_size: u16,

    /// Transactions driven concurrently within one pass.
    pub workers: usize,

    /// Confirm/Cancel backoff and retry window.
    pub retry: RetryPolicy,

    /// Next look at a transaction whose pending branches are all stalled.
    pub stalled_recheck: Duration,

    /// Finished transactions older than this are deleted. `None` keeps them.
    pub retention: Option<Duration>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            call_timeout: CALL_TIMEOUT,
            prepare_timeout: PREPARE_TIMEOUT,
            sweep_interval: SWEEP_INTERVAL,
            lease: LEASE,
            batch_size: BATCH_SIZE,
            workers: WORKERS,
            retry: RetryPolicy::default(),
            stalled_recheck: STALLED_RECHECK,
            retention: None,
        }
    }
}

pub const CALL_TIMEOUT: Duration = Duration::from_secs(3);

/// Also bounds how long an abandoned transaction keeps resources reserved.
pub const PREPARE_TIMEOUT: Duration = Duration::from_secs(30);

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Must exceed the time needed to drive one transaction, otherwise another
/// coordinator may claim it while it is still being driven.
pub const LEASE: Duration = Duration::from_secs(60);

pub const BATCH_SIZE: u16 = 100;

pub const WORKERS: usize = 8;

pub const STALLED_RECHECK: Duration = Duration::from_secs(3600);

#[derive(Debug)]
pub struct ConfigBuilder {
    config: CoordinatorConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: CoordinatorConfig::default(),
        }
    }

    pub fn call_timeout(mut self, value: Duration) -> Self {
        self.config.call_timeout = value;
        self
    }

    pub fn prepare_timeout(mut self, value: Duration) -> Self {
        self.config.prepare_timeout = value;
        self
    }

    pub fn sweep_interval(mut self, value: Duration) -> Self {
        self.config.sweep_interval = value;
        self
    }

    pub fn lease(mut self, value: Duration) -> Self {
        self.config.lease = value;
        self
    }

    pub fn batch_size(mut self, value: u16) -> Self {
        self.config.batch_size = value.max(1);
        self
    }

    pub fn workers(mut self, value: usize) -> Self {
        self.config.workers = value.max(1);
        self
    }

    pub fn retry(mut self, value: RetryPolicy) -> Self {
        self.config.retry = value;
        self
    }

    pub fn stalled_recheck(mut self, value: Duration) -> Self {
        self.config.stalled_recheck = value;
        self
    }

    pub fn retention(mut self, value: Duration) -> Self {
        self.config.retention = Some(value);
        self
    }

    pub fn build(self) -> CoordinatorConfig {
        self.config
    }
}

pub(crate) fn to_chrono(value: Duration) -> chrono::Duration {
    chrono::Duration::from_std(value).unwrap_or_else(|_| chrono::Duration::days(36500))
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
