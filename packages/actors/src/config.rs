//! Runtime configuration for supervisors, the bus, jobs and the scheduler.

use std::time::Duration;

/// Configuration shared by everything on one bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// How long `start()` waits for a context to signal readiness.
    pub ready_timeout: Duration,
    /// How long `stop()` waits for a context to tear down.
    pub stop_timeout: Duration,
    /// How long a correlated request waits for its response.
    pub request_timeout: Duration,
    /// Restarts allowed per service before it is marked failed.
    pub restart_budget: u32,
    /// Delay between scheduler passes. Never zero.
    pub scheduler_tick: Duration,
    /// Scheduler ticks between automatic backups.
    pub backup_every_ticks: u32,
    /// Longest a single periodic trigger may run.
    pub trigger_timeout: Option<Duration>,
    /// After this long a job's cancellation token is signalled.
    pub job_timeout: Option<Duration>,
    /// Buffer size of the lifecycle event channel.
    pub event_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            restart_budget: 3,
            scheduler_tick: Duration::from_secs(10),
            backup_every_ticks: 360,
            trigger_timeout: None,
            job_timeout: None,
            event_capacity: 1024,
        }
    }
}

impl RuntimeConfig {
    /// Read overrides from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through `lookup`, which maps a variable name to its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = parse::<u64>(&lookup, "SERVICE_READY_TIMEOUT_MS")? {
            config.ready_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&lookup, "SERVICE_STOP_TIMEOUT_MS")? {
            config.stop_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&lookup, "BUS_REQUEST_TIMEOUT_MS")? {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(budget) = parse::<u32>(&lookup, "SERVICE_RESTART_BUDGET")? {
            config.restart_budget = budget;
        }
        if let Some(ms) = parse::<u64>(&lookup, "SCHEDULER_TICK_MS")? {
            if ms == 0 {
                return Err(ConfigError::Invalid {
                    key: "SCHEDULER_TICK_MS",
                    value: ms.to_string(),
                });
            }
            config.scheduler_tick = Duration::from_millis(ms);
        }
        if let Some(ticks) = parse::<u32>(&lookup, "BACKUP_EVERY_TICKS")? {
            config.backup_every_ticks = ticks;
        }
        if let Some(ms) = parse::<u64>(&lookup, "SCHEDULER_TRIGGER_TIMEOUT_MS")? {
            config.trigger_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = parse::<u64>(&lookup, "JOB_TIMEOUT_MS")? {
            config.job_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(capacity) = parse::<usize>(&lookup, "BUS_EVENT_CAPACITY")? {
            config.event_capacity = capacity.max(1);
        }

        Ok(config)
    }

    /// Set the readiness timeout.
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Set the teardown timeout.
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Set the request/response timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the default restart budget.
    pub fn with_restart_budget(mut self, budget: u32) -> Self {
        self.restart_budget = budget;
        self
    }

    /// Set the scheduler tick, at least one millisecond.
    pub fn with_scheduler_tick(mut self, tick: Duration) -> Self {
        self.scheduler_tick = tick.max(Duration::from_millis(1));
        self
    }

    /// Set how many ticks pass between automatic backups.
    pub fn with_backup_every_ticks(mut self, ticks: u32) -> Self {
        self.backup_every_ticks = ticks;
        self
    }

    /// Bound each periodic trigger.
    pub fn with_trigger_timeout(mut self, timeout: Duration) -> Self {
        self.trigger_timeout = Some(timeout);
        self
    }

    /// Bound each job before its token is signalled.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}
