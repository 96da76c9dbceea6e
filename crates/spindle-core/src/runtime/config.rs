//! Runtime configuration

use crate::stack::{DEFAULT_STACK_SIZE, MIN_STACK_SIZE};
use std::time::Duration;

/// Configuration for a [`Runtime`](crate::Runtime)
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Worker threads; 0 runs a single scheduler on the thread calling `run()`
    pub threads: usize,

    /// Usable stack bytes per fiber (rounded up to whole pages)
    pub stack_size: usize,

    /// How often `run()` trims the pools of exited fibers
    pub reclaim_interval: Duration,

    /// Sleep of an idle worker once spinning gave up
    pub idle_sleep: Duration,

    /// Worker thread names are `{prefix}-{index}`
    pub thread_name_prefix: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            threads: num_cpus::get(),
            stack_size: DEFAULT_STACK_SIZE,
            reclaim_interval: Duration::from_secs(5),
            idle_sleep: Duration::from_micros(100),
            thread_name_prefix: "spindle-worker".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Config that runs one scheduler on the calling thread
    pub fn current_thread() -> Self {
        Self {
            threads: 0,
            ..Self::default()
        }
    }

    /// Set the worker thread count
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Set the usable stack size per fiber
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    /// Set the reclaim interval
    pub fn with_reclaim_interval(mut self, interval: Duration) -> Self {
        self.reclaim_interval = interval;
        self
    }

    /// Set the idle sleep
    pub fn with_idle_sleep(mut self, idle_sleep: Duration) -> Self {
        self.idle_sleep = idle_sleep;
        self
    }

    /// Set the worker thread name prefix
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Number of schedulers to create
    pub fn schedulers(&self) -> usize {
        self.threads.max(1)
    }

    /// Clamp values that cannot work, logging each change
    pub(crate) fn normalized(mut self) -> Self {
        if self.stack_size < MIN_STACK_SIZE {
            tracing::warn!(
                requested = self.stack_size,
                used = MIN_STACK_SIZE,
                "fiber stack size too small, raising it"
            );
            self.stack_size = MIN_STACK_SIZE;
        }
        if self.reclaim_interval.is_zero() {
            let fallback = Self::default().reclaim_interval;
            tracing::warn!(?fallback, "zero reclaim interval, using the default");
            self.reclaim_interval = fallback;
        }
        self
    }
}
