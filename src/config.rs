//! Configuration for vloop
//!
//! Centralized engine configuration with sensible defaults. Per-device
//! parameters passed to `configure` live in [`crate::device::LoopConfig`].

use std::time::Duration;

/// Main configuration for a vloop [`crate::Engine`]
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Worker Pool Configuration
    // -------------------------------------------------------------------------
    /// Executor threads started for every bound device
    pub worker_threads: usize,

    /// How long a tenant worker may sit idle before the reaper frees it
    pub idle_worker_timeout: Duration,

    /// Tenant workers per device before new tenants degrade to the root queue
    pub max_tenant_workers: usize,

    // -------------------------------------------------------------------------
    // Direct I/O Configuration
    // -------------------------------------------------------------------------
    /// Submission threads for the asynchronous direct path
    pub aio_threads: usize,

    /// Submissions that may wait for an aio thread; beyond this the
    /// submission completes inline
    pub aio_queue_depth: usize,

    // -------------------------------------------------------------------------
    // Registry Configuration
    // -------------------------------------------------------------------------
    /// Device identities must be below this value
    pub max_devices: u32,

    /// Unbound devices created when the engine starts
    pub initial_devices: u32,

    /// Force partition scanning on every configure
    pub partition_scan_by_default: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            idle_worker_timeout: Duration::from_secs(60),
            max_tenant_workers: 1024,
            aio_threads: 2,
            aio_queue_depth: 128,
            max_devices: 1 << 20,
            initial_devices: 8,
            partition_scan_by_default: false,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the number of executor threads per bound device (minimum 1)
    pub fn worker_threads(mut self, count: usize) -> Self {
        self.config.worker_threads = count.max(1);
        self
    }

    /// Set the idle tenant worker timeout
    pub fn idle_worker_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_worker_timeout = timeout;
        self
    }

    /// Set the tenant worker cap
    pub fn max_tenant_workers(mut self, count: usize) -> Self {
        self.config.max_tenant_workers = count;
        self
    }

    /// Set the number of asynchronous submission threads (minimum 1)
    pub fn aio_threads(mut self, count: usize) -> Self {
        self.config.aio_threads = count.max(1);
        self
    }

    /// Set the asynchronous submission queue depth
    pub fn aio_queue_depth(mut self, depth: usize) -> Self {
        self.config.aio_queue_depth = depth;
        self
    }

    /// Set the device identity ceiling
    pub fn max_devices(mut self, count: u32) -> Self {
        self.config.max_devices = count;
        self
    }

    /// Set how many devices are created at startup
    pub fn initial_devices(mut self, count: u32) -> Self {
        self.config.initial_devices = count;
        self
    }

    /// Force partition scanning on configure
    pub fn partition_scan_by_default(mut self, enabled: bool) -> Self {
        self.config.partition_scan_by_default = enabled;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
