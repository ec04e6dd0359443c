//! Engine Module
//!
//! The control surface that owns every device.
//!
//! ## Responsibilities
//! - Allocate, look up and withdraw device identities (Add/Remove/GetFree)
//! - Open counted handles on devices
//! - Run the janitor thread that finishes deferred (AutoClear) teardowns
//! - Id-based conveniences for the per-device control operations

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver};
use parking_lot::Mutex;

use crate::backing::BackingRef;
use crate::config::Config;
use crate::device::{
    Caller, ClearOutcome, Device, DeviceEnv, DeviceHandle, DeviceId, DeviceStatus, JanitorMsg,
    LoopConfig, StatusUpdate,
};
use crate::error::{LoopError, Result};
use crate::host::{HostDisk, LogHost};
use crate::registry::Registry;
use crate::transform::TransformRegistry;

/// The virtual block device engine
///
/// ## Concurrency Model:
/// - All methods take `&self`; the engine is shared freely across threads
/// - Each device serializes its own transitions behind its own lock
/// - One engine-wide lock serializes validation of stacked devices
/// - Last-close handling (AutoClear) runs on the janitor thread, never
///   inline in the dropping thread
pub struct Engine {
    env: Arc<DeviceEnv>,
    registry: Arc<Registry>,
    janitor: Option<JoinHandle<()>>,
}

impl Engine {
    /// Start an engine that publishes to a logging host adapter
    pub fn new(config: Config) -> Result<Self> {
        Self::with_host(config, Arc::new(LogHost))
    }

    /// Start an engine over a custom host adapter
    ///
    /// On startup:
    /// 1. Start the janitor thread
    /// 2. Create `initial_devices` Unbound devices
    pub fn with_host(config: Config, host: Arc<dyn HostDisk>) -> Result<Self> {
        let registry = Arc::new(Registry::new(config.max_devices));
        let (janitor_tx, janitor_rx) = channel::unbounded();

        let initial = config.initial_devices;
        let env = Arc::new(DeviceEnv {
            config,
            transforms: TransformRegistry::new(),
            host,
            validate_lock: Mutex::new(()),
            janitor: janitor_tx,
            registry: Arc::downgrade(&registry),
        });

        let janitor = thread::Builder::new()
            .name("vloop-janitor".to_string())
            .spawn(move || janitor_loop(janitor_rx))?;

        let engine = Self {
            env,
            registry,
            janitor: Some(janitor),
        };
        for _ in 0..initial {
            engine.registry.add(&engine.env, None)?;
        }

        tracing::info!(devices = initial, "engine started");
        Ok(engine)
    }

    pub fn config(&self) -> &Config {
        &self.env.config
    }

    /// Transform table shared by every device
    pub fn transforms(&self) -> &TransformRegistry {
        &self.env.transforms
    }

    // -------------------------------------------------------------------------
    // Registry
    // -------------------------------------------------------------------------

    /// Create a device at `id`, or at the lowest free identity
    pub fn add(&self, id: Option<DeviceId>) -> Result<DeviceId> {
        Ok(self.registry.add(&self.env, id)?.id())
    }

    /// Withdraw an Unbound device nobody has open
    pub fn remove(&self, id: DeviceId) -> Result<()> {
        self.registry.remove(id)
    }

    /// An Unbound device, created if none is free
    pub fn get_free(&self) -> Result<DeviceId> {
        match self.registry.find_free() {
            Some(device) => Ok(device.id()),
            None => self.add(None),
        }
    }

    pub fn device(&self, id: DeviceId) -> Result<Arc<Device>> {
        self.registry.get(id).ok_or(LoopError::NoSuchDevice(id))
    }

    /// Visible device identities, ascending
    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.registry.ids()
    }

    /// Open a handle as the administrator
    pub fn open(&self, id: DeviceId, writable: bool) -> Result<DeviceHandle> {
        self.open_as(id, writable, Caller::admin())
    }

    /// Open a handle on behalf of `caller`
    pub fn open_as(&self, id: DeviceId, writable: bool, caller: Caller) -> Result<DeviceHandle> {
        DeviceHandle::open(self.device(id)?, writable, caller)
    }

    // -------------------------------------------------------------------------
    // Id-based control operations (transient writable admin handle)
    // -------------------------------------------------------------------------

    /// Bind device `id`. With AutoClear set, keep a handle open or the
    /// device clears as soon as this call's handle closes.
    pub fn configure(&self, id: DeviceId, config: LoopConfig) -> Result<()> {
        self.open(id, true)?.configure(config)
    }

    pub fn change_backing(&self, id: DeviceId, backing: BackingRef) -> Result<()> {
        self.open(id, true)?.change_backing(backing)
    }

    pub fn clear(&self, id: DeviceId) -> Result<ClearOutcome> {
        self.open(id, true)?.clear()
    }

    pub fn get_status(&self, id: DeviceId) -> Result<DeviceStatus> {
        self.open(id, false)?.get_status()
    }

    pub fn set_status(&self, id: DeviceId, update: &StatusUpdate) -> Result<()> {
        self.open(id, true)?.set_status(update)
    }

    pub fn set_capacity(&self, id: DeviceId) -> Result<u64> {
        self.open(id, true)?.set_capacity()
    }

    pub fn set_direct_io(&self, id: DeviceId, enable: bool) -> Result<()> {
        self.open(id, true)?.set_direct_io(enable)
    }

    pub fn set_block_size(&self, id: DeviceId, size: u32) -> Result<()> {
        self.open(id, true)?.set_block_size(size)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.env.janitor.send(JanitorMsg::Stop);
        if let Some(handle) = self.janitor.take() {
            let _ = handle.join();
        }
        // Unbind what is still bound so workers and stores go away in order,
        // upper devices before the ones they sit on
        let mut devices = self.registry.devices();
        devices.sort_by_key(|d| std::cmp::Reverse(d.lower_device().is_some()));
        for device in devices {
            if let Ok(handle) = DeviceHandle::open(device, true, Caller::admin()) {
                match handle.clear() {
                    Ok(_) | Err(LoopError::NotConfigured) => {}
                    Err(e) => tracing::warn!(device = handle.id(), "clear on shutdown failed: {}", e),
                }
            }
        }
        tracing::info!("engine stopped");
    }
}

fn janitor_loop(rx: Receiver<JanitorMsg>) {
    while let Ok(msg) = rx.recv() {
        match msg {
            JanitorMsg::LastClose(device) => device.finish_last_close(),
            JanitorMsg::Stop => break,
        }
    }
    // Closes that raced the stop request
    while let Ok(msg) = rx.try_recv() {
        if let JanitorMsg::LastClose(device) = msg {
            device.finish_last_close();
        }
    }
}
