//! Open handles
//!
//! A `DeviceHandle` is one counted reference to a device. Control
//! operations go through a handle so they know who is asking and whether
//! the handle may write.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::backing::BackingRef;
use crate::error::{LoopError, Result};

use super::{Caller, Device, DeviceState, DeviceStatus, LoopConfig, StatusUpdate};

/// What `clear` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearOutcome {
    /// The device is Unbound again
    Cleared,
    /// Other handles are open; AutoClear was set and the last close will
    /// tear the device down
    Deferred,
}

/// Counted reference to a device
pub struct DeviceHandle {
    device: Arc<Device>,
    writable: bool,
    caller: Caller,
}

impl DeviceHandle {
    pub(crate) fn open(device: Arc<Device>, writable: bool, caller: Caller) -> Result<Self> {
        {
            let _inner = device.inner.lock();
            if device.state() == DeviceState::Deleting {
                return Err(LoopError::NoSuchDevice(device.id()));
            }
            device.open_count.fetch_add(1, Ordering::SeqCst);
        }
        Ok(Self {
            device,
            writable,
            caller,
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Whether this handle was opened for writing
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn caller(&self) -> Caller {
        self.caller
    }

    /// Bind the device to a backing store
    pub fn configure(&self, config: LoopConfig) -> Result<()> {
        self.device.configure(config, self.writable, self.caller)
    }

    /// Swap the backing store of a read-only device for one of equal size
    pub fn change_backing(&self, backing: BackingRef) -> Result<()> {
        self.device.change_backing(backing)
    }

    /// Unbind now, or defer to the last close while other handles are open
    pub fn clear(&self) -> Result<ClearOutcome> {
        self.device.clear()
    }

    pub fn get_status(&self) -> Result<DeviceStatus> {
        self.device.get_status(self.caller)
    }

    pub fn set_status(&self, update: &StatusUpdate) -> Result<()> {
        self.device.set_status(update, self.caller)
    }

    /// Re-read the backing store size and republish the capacity
    pub fn set_capacity(&self) -> Result<u64> {
        self.device.set_capacity()
    }

    pub fn set_direct_io(&self, enable: bool) -> Result<()> {
        self.device.set_direct_io(enable)
    }

    pub fn set_block_size(&self, size: u32) -> Result<()> {
        self.device.set_block_size(size)
    }
}

impl Deref for DeviceHandle {
    type Target = Device;

    fn deref(&self) -> &Device {
        &self.device
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.device.release();
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("device", &self.device.id())
            .field("writable", &self.writable)
            .field("caller", &self.caller)
            .finish()
    }
}
