//! Device registry
//!
//! Allocates device identities and tracks which devices are visible.
//!
//! ## Concurrency:
//! - `devices`: RwLock over an ordered map (lookups share, add/remove exclude)
//! - The map lock is never held while a device's own lock is taken

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::device::{Device, DeviceEnv, DeviceId, DeviceState};
use crate::error::{LoopError, Result};

struct Slot {
    device: Arc<Device>,
    /// Hidden while a removal is deciding
    visible: bool,
}

pub(crate) struct Registry {
    devices: RwLock<BTreeMap<DeviceId, Slot>>,
    max_devices: u32,
}

impl Registry {
    pub fn new(max_devices: u32) -> Self {
        Self {
            devices: RwLock::new(BTreeMap::new()),
            max_devices,
        }
    }

    /// Create an Unbound device, at `id` or at the lowest free identity
    pub fn add(&self, env: &Arc<DeviceEnv>, id: Option<DeviceId>) -> Result<Arc<Device>> {
        let mut devices = self.devices.write();
        let id = match id {
            Some(id) if id >= self.max_devices => {
                return Err(LoopError::invalid(format!(
                    "device id {} is beyond the limit of {}",
                    id, self.max_devices
                )))
            }
            Some(id) if devices.contains_key(&id) => return Err(LoopError::DeviceExists(id)),
            Some(id) => id,
            None => {
                // Keys are sorted: the first gap is the lowest free id
                let mut candidate = 0;
                for &used in devices.keys() {
                    if used != candidate {
                        break;
                    }
                    candidate += 1;
                }
                if candidate >= self.max_devices {
                    return Err(LoopError::Busy);
                }
                candidate
            }
        };

        let device = Device::new(id, env.clone());
        devices.insert(
            id,
            Slot {
                device: device.clone(),
                visible: true,
            },
        );
        tracing::debug!(device = id, "device added");
        Ok(device)
    }

    /// Withdraw an Unbound, unopened device
    pub fn remove(&self, id: DeviceId) -> Result<()> {
        let device = {
            let mut devices = self.devices.write();
            let slot = devices
                .get_mut(&id)
                .filter(|s| s.visible)
                .ok_or(LoopError::NoSuchDevice(id))?;
            slot.visible = false;
            slot.device.clone()
        };

        {
            let inner = device.inner.lock();
            if device.state() != DeviceState::Unbound || device.open_count() > 0 {
                drop(inner);
                if let Some(slot) = self.devices.write().get_mut(&id) {
                    slot.visible = true;
                }
                return Err(LoopError::Busy);
            }
            device.set_state(DeviceState::Deleting);
        }

        self.devices.write().remove(&id);
        tracing::debug!(device = id, "device removed");
        Ok(())
    }

    /// Look up a visible device
    pub fn get(&self, id: DeviceId) -> Option<Arc<Device>> {
        self.devices
            .read()
            .get(&id)
            .filter(|s| s.visible)
            .map(|s| s.device.clone())
    }

    /// First visible Unbound device
    pub fn find_free(&self) -> Option<Arc<Device>> {
        self.devices
            .read()
            .values()
            .filter(|s| s.visible)
            .find(|s| s.device.state() == DeviceState::Unbound)
            .map(|s| s.device.clone())
    }

    pub fn ids(&self) -> Vec<DeviceId> {
        self.devices
            .read()
            .iter()
            .filter(|(_, s)| s.visible)
            .map(|(&id, _)| id)
            .collect()
    }

    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices
            .read()
            .values()
            .map(|s| s.device.clone())
            .collect()
    }
}
