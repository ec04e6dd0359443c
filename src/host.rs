//! Host disk adapter
//!
//! The boundary to whatever presents devices to the host: capacity and
//! read-only publication and partition rescans. The engine only calls
//! out through this trait.

use std::fmt;

use crate::device::DeviceId;
use crate::error::Result;

/// Host-side registration of a device
pub trait HostDisk: Send + Sync + fmt::Debug {
    /// Publish the exposed size in bytes (0 when unbound)
    fn set_capacity(&self, id: DeviceId, bytes: u64);

    /// Publish whether the device accepts writes
    fn set_read_only(&self, id: DeviceId, read_only: bool);

    /// Ask the host to rescan the partition table. Failures are logged by
    /// the caller and otherwise ignored.
    fn rescan_partitions(&self, id: DeviceId) -> Result<()>;
}

/// Host adapter that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHost;

impl HostDisk for LogHost {
    fn set_capacity(&self, id: DeviceId, bytes: u64) {
        tracing::debug!(device = id, bytes, "capacity published");
    }

    fn set_read_only(&self, id: DeviceId, read_only: bool) {
        tracing::debug!(device = id, read_only, "read-only state published");
    }

    fn rescan_partitions(&self, id: DeviceId) -> Result<()> {
        tracing::debug!(device = id, "partition rescan requested");
        Ok(())
    }
}
