use serde::Deserialize;
use std::time::Duration;

/// Configuration snapshot consumed by the execution core.
///
/// The core does not own configuration loading; an external loader hands it
/// a fixed snapshot at startup. Every field maps to one of the recognized
/// options from the deployment surface:
///
/// - `pool_size` - number of execution contexts
/// - `request_timeout_ms` - default deadline applied when a dispatch
///   carries none
/// - `reload_parallelism` - maximum contexts draining at once during a
///   rolling reload
/// - `fault_threshold` - handler faults within the window before a context
///   is evicted
/// - `fault_window_ms` - sliding window for fault counting
/// - `drain_grace_ms` - how long a reload waits for a context to drain and
///   swap before reporting it as a straggler
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub pool_size: usize,
    pub request_timeout_ms: u64,
    pub reload_parallelism: usize,
    pub fault_threshold: u32,
    pub fault_window_ms: u64,
    pub drain_grace_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            request_timeout_ms: 30_000,
            reload_parallelism: 1,
            fault_threshold: 3,
            fault_window_ms: 10_000,
            drain_grace_ms: 5_000,
        }
    }
}

impl RuntimeConfig {
    /// Default per-request deadline.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Sliding window for per-context fault counting.
    pub fn fault_window(&self) -> Duration {
        Duration::from_millis(self.fault_window_ms)
    }

    /// Grace period for drain-and-swap during a rolling reload.
    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }
}
