//! Device flags

use bitflags::bitflags;

use crate::error::{LoopError, Result};

bitflags! {
    /// Per-device behaviour flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DeviceFlags: u32 {
        /// Writes are rejected
        const READ_ONLY = 1;
        /// Tear the device down when its last handle closes
        const AUTOCLEAR = 4;
        /// Ask the host to scan the device for partitions
        const PARTSCAN = 8;
        /// Use the asynchronous direct path for reads and writes
        const DIRECT_IO = 16;
    }
}

impl DeviceFlags {
    /// Flags accepted by `configure`
    pub const CONFIGURE_SETTABLE: Self = Self::READ_ONLY
        .union(Self::AUTOCLEAR)
        .union(Self::PARTSCAN)
        .union(Self::DIRECT_IO);

    /// Flags `set_status` may change
    pub const SET_STATUS_SETTABLE: Self = Self::AUTOCLEAR.union(Self::PARTSCAN);

    /// Flags `set_status` may turn off again. PARTSCAN is sticky.
    pub const SET_STATUS_CLEARABLE: Self = Self::AUTOCLEAR;

    /// Parse raw flag bits, rejecting unknown ones
    pub fn from_raw(bits: u32) -> Result<Self> {
        Self::from_bits(bits)
            .ok_or_else(|| LoopError::invalid(format!("unsupported flag bits {:#x}", bits)))
    }

    /// Merge a status update into the current flags: only settable flags
    /// follow the request, and clearing is limited to clearable ones.
    pub fn merge_status(prev: Self, requested: Self) -> Self {
        let mut flags = requested & Self::SET_STATUS_SETTABLE;
        flags |= prev - Self::SET_STATUS_SETTABLE;
        flags |= prev - Self::SET_STATUS_CLEARABLE;
        flags
    }
}
