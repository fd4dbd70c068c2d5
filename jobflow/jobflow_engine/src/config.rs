use std::time::Duration;

/// Configuration for the jobflow engine. Constructed once at startup and
/// passed by reference into each component's constructor.
#[derive(Debug, Clone)]
pub struct Config {
    /// Floor applied to every step timeout in the compiled definition, so
    /// short-running steps are not failed prematurely by the external
    /// engine
    pub min_step_timeout: Duration,

    /// Heartbeat timeout for asynchronous steps waiting on a completion
    /// token
    pub async_heartbeat_timeout: Duration,

    /// Overall execution timeout of a compiled state machine
    pub state_machine_timeout: Duration,

    /// How often the pending-job sweep runs
    pub pending_sweep_period: Duration,

    /// Jobs whose status changed within this window are skipped by the
    /// sweep to avoid double-start races
    pub pending_start_debounce: Duration,

    /// How often the cancellation monitor runs
    pub cancellation_monitor_period: Duration,

    /// How long a CANCELLING job may take to converge before its
    /// remaining steps are forced to a non-retryable failure
    pub cancellation_timeout: Duration,

    /// Period of the recurring state-check trigger for asynchronous steps
    pub state_check_period: Duration,

    /// Whether the deployment supports parallel execution at all; when
    /// false every graph is fully sequenced before admission
    pub parallelism_supported: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            min_step_timeout: Duration::from_secs(300),
            async_heartbeat_timeout: Duration::from_secs(180),
            state_machine_timeout: Duration::from_secs(36 * 3600),
            pending_sweep_period: Duration::from_secs(60),
            pending_start_debounce: Duration::from_secs(10),
            cancellation_monitor_period: Duration::from_secs(10),
            cancellation_timeout: Duration::from_secs(600),
            state_check_period: Duration::from_secs(60),
            parallelism_supported: true,
        }
    }
}
