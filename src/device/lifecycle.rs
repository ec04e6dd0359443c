//! Lifecycle transitions and control operations
//!
//! Every transition follows the same shape: resolve external resources
//! first, then take `validate_lock` (chained stores only) and `inner`,
//! stage the change on a `Layout` copy, quiesce if in-flight commands could
//! observe it, commit it together with the republished command snapshot,
//! and drop released resources only after the locks are gone. A failure
//! before the commit leaves the device as it was.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use crate::backing::geometry::{exposed_size, validate_block_size, validate_range};
use crate::backing::{self, BackingRef, BackingStore, DiscardLimits};
use crate::error::{LoopError, Result};
use crate::io::aio::AioEngine;
use crate::io::{engine, IoContext};
use crate::transform::{ActiveTransform, TRANSFORM_NONE};
use crate::worker::WorkerPool;

use super::gate::FreezeGuard;
use super::status::truncate_label;
use super::{
    Caller, ClearOutcome, Device, DeviceFlags, DeviceHandle, DeviceInner, DeviceState, DeviceStatus,
    JanitorMsg, LoopConfig, StatusUpdate,
};

/// Block size used when neither the caller nor the store picks one
const DEFAULT_BLOCK_SIZE: u32 = 512;

fn dio_eligible(
    requested: bool,
    store: &BackingStore,
    block_size: u32,
    offset: u64,
    transformed: bool,
) -> bool {
    if !requested || transformed || !store.supports_direct_io() {
        return false;
    }
    let lbs = store.logical_block_size();
    block_size >= lbs && offset % u64::from(lbs) == 0
}

/// Everything the command snapshot is built from. Changes are made on a
/// copy and committed only once nothing else can fail.
#[derive(Clone)]
struct Layout {
    backing: Arc<BackingStore>,
    transform: Option<Arc<ActiveTransform>>,
    flags: DeviceFlags,
    offset: u64,
    size_limit: Option<u64>,
    block_size: u32,
    capacity: u64,
    use_dio: bool,
    discard: Option<DiscardLimits>,
}

impl Layout {
    fn of(inner: &DeviceInner) -> Result<Self> {
        Ok(Self {
            backing: inner.backing.clone().ok_or(LoopError::NotConfigured)?,
            transform: inner.transform.clone(),
            flags: inner.flags,
            offset: inner.offset,
            size_limit: inner.size_limit,
            block_size: inner.block_size,
            capacity: inner.capacity,
            use_dio: inner.use_dio,
            discard: inner.discard,
        })
    }

    /// Recompute capacity, direct-I/O eligibility and discard limits
    fn refresh(&mut self) -> Result<()> {
        let transformed = self.transform.is_some();
        let store_size = self.backing.size()?;
        self.capacity = exposed_size(store_size, self.offset, self.size_limit, self.block_size);
        self.use_dio = dio_eligible(
            self.flags.contains(DeviceFlags::DIRECT_IO),
            &self.backing,
            self.block_size,
            self.offset,
            transformed,
        );
        self.flags.set(DeviceFlags::DIRECT_IO, self.use_dio);
        self.discard = if transformed {
            None
        } else {
            self.backing.discard_limits()
        };
        Ok(())
    }

    fn commit(self, inner: &mut DeviceInner) -> Replaced {
        inner.flags = self.flags;
        inner.offset = self.offset;
        inner.size_limit = self.size_limit;
        inner.block_size = self.block_size;
        inner.capacity = self.capacity;
        inner.use_dio = self.use_dio;
        inner.discard = self.discard;
        Replaced {
            backing: inner.backing.replace(self.backing),
            transform: std::mem::replace(&mut inner.transform, self.transform),
        }
    }
}

/// What a commit displaced; dropped once `inner` is released
#[derive(Default)]
struct Replaced {
    backing: Option<Arc<BackingStore>>,
    transform: Option<Arc<ActiveTransform>>,
}

impl Device {
    fn name(&self) -> String {
        format!("vloop{}", self.id())
    }

    /// Open whatever `backing` refers to. Never called with a lock held.
    fn open_backing(&self, backing: BackingRef) -> Result<BackingStore> {
        match backing {
            BackingRef::Device(id) => {
                let registry = self
                    .env
                    .registry
                    .upgrade()
                    .ok_or(LoopError::NoSuchDevice(id))?;
                let lower = registry.get(id).ok_or(LoopError::NoSuchDevice(id))?;
                Ok(BackingStore::Device(DeviceHandle::open(lower, true, Caller::admin())?))
            }
            other => backing::open_file(other),
        }
    }

    /// Walk the chain of vloop devices under `store`. The chain must not
    /// come back to this device and every link must be bound.
    ///
    /// Caller holds `validate_lock`.
    fn validate_chain(&self, store: &BackingStore) -> Result<()> {
        let registry = match self.env.registry.upgrade() {
            Some(registry) => registry,
            None => return Ok(()),
        };
        let mut next = store.lower_device();
        while let Some(id) = next {
            if id == self.id() {
                return Err(LoopError::invalid(format!(
                    "backing chain of {} loops back to itself",
                    self.name()
                )));
            }
            let lower = registry.get(id).ok_or(LoopError::NoSuchDevice(id))?;
            if lower.state() != DeviceState::Bound {
                return Err(LoopError::invalid(format!("backing device vloop{} is not bound", id)));
            }
            next = lower.lower_device();
        }
        Ok(())
    }

    /// Build the command snapshot for `layout`
    fn snapshot(&self, inner: &DeviceInner, layout: &Layout) -> Result<IoContext> {
        let dispatcher = inner
            .workers
            .as_ref()
            .map(|w| w.dispatcher())
            .ok_or(LoopError::NotConfigured)?;
        Ok(IoContext {
            backing: layout.backing.clone(),
            transform: layout.transform.clone(),
            offset: layout.offset,
            capacity: layout.capacity,
            block_size: layout.block_size,
            read_only: layout.flags.contains(DeviceFlags::READ_ONLY),
            use_dio: layout.use_dio,
            discard: layout.discard,
            dispatcher,
            aio: inner.aio.as_ref().map(|a| a.submitter()),
        })
    }

    /// Start the async engine if `layout` needs it, then commit `layout`
    /// and publish its snapshot. Callers hold the freeze.
    fn apply(&self, inner: &mut DeviceInner, layout: Layout) -> Result<Replaced> {
        if layout.use_dio && inner.aio.is_none() {
            let config = &self.env.config;
            inner.aio = Some(AioEngine::start(
                &self.name(),
                config.aio_threads,
                config.aio_queue_depth,
            )?);
        }
        let ctx = self.snapshot(inner, &layout)?;
        let replaced = layout.commit(inner);
        self.publish(Some(ctx));
        Ok(replaced)
    }

    fn rescan(&self) {
        if let Err(e) = self.env.host.rescan_partitions(self.id()) {
            tracing::warn!(device = self.id(), "partition rescan failed: {}", e);
        }
    }

    // -------------------------------------------------------------------------
    // Configure
    // -------------------------------------------------------------------------

    pub(crate) fn configure(&self, config: LoopConfig, writable: bool, caller: Caller) -> Result<()> {
        let LoopConfig {
            backing,
            block_size,
            info,
        } = config;

        if !DeviceFlags::CONFIGURE_SETTABLE.contains(info.flags) {
            return Err(LoopError::invalid(format!(
                "flags {:#x} cannot be set at configure",
                info.flags.bits()
            )));
        }
        validate_range(info.offset, info.size_limit)?;
        if block_size != 0 {
            validate_block_size(block_size)?;
        }

        let label = if info.file_name.is_empty() {
            backing.label()
        } else {
            info.file_name.clone()
        };
        let store = Arc::new(self.open_backing(backing)?);
        let chained = store.lower_device().is_some();
        let store_writable = store.writable();

        let partscan = {
            let _validate = chained.then(|| self.env.validate_lock.lock());
            let mut inner = self.inner.lock();
            let writable = writable && store_writable;
            let result = self.bind(&mut inner, &store, block_size, &info, writable, caller);
            if let Err(e) = &result {
                tracing::warn!(device = self.id(), "configure failed: {}", e);
                if self.state() == DeviceState::Unbound {
                    self.publish(None);
                    *inner = DeviceInner::new();
                }
            } else {
                inner.file_name = truncate_label(&label);
            }
            result
        };
        // On failure this is the last reference and the store closes here
        drop(store);

        if partscan? {
            self.rescan();
        }
        Ok(())
    }

    /// Returns whether partitions should be scanned
    fn bind(
        &self,
        inner: &mut DeviceInner,
        store: &Arc<BackingStore>,
        block_size: u32,
        info: &StatusUpdate,
        writable: bool,
        caller: Caller,
    ) -> Result<bool> {
        if self.state() != DeviceState::Unbound {
            return Err(LoopError::AlreadyConfigured);
        }
        if store.lower_device().is_some() {
            self.validate_chain(store)?;
        }

        let mut flags = info.flags;
        if !writable {
            flags |= DeviceFlags::READ_ONLY;
        }
        if self.env.config.partition_scan_by_default {
            flags |= DeviceFlags::PARTSCAN;
        }
        if store.direct_requested() {
            flags |= DeviceFlags::DIRECT_IO;
        }

        let block_size = match block_size {
            0 if store.direct_requested() && store.is_block_device() => store.logical_block_size(),
            0 => DEFAULT_BLOCK_SIZE,
            size => size,
        };
        if store.lower_device().is_some() {
            let lower_bs = store.logical_block_size();
            if info.offset % u64::from(lower_bs) != 0 || block_size < lower_bs {
                return Err(LoopError::invalid(format!(
                    "offset and block size must align to the lower device's {} byte blocks",
                    lower_bs
                )));
            }
        }

        let transform = self.env.transforms.create(info.transform, &info.key)?;
        let transform_id = transform.as_ref().map_or(TRANSFORM_NONE, |t| t.id());
        let mut layout = Layout {
            backing: store.clone(),
            transform: transform.map(Arc::new),
            flags,
            offset: info.offset,
            size_limit: info.size_limit,
            block_size,
            capacity: 0,
            use_dio: false,
            discard: None,
        };
        layout.refresh()?;

        let config = &self.env.config;
        inner.workers = Some(WorkerPool::start(
            &self.name(),
            config.worker_threads,
            config.idle_worker_timeout,
            config.max_tenant_workers,
            engine::handle_command,
        )?);
        self.apply(inner, layout)?;
        inner.transform_id = transform_id;
        inner.key = info.key.clone();
        inner.key_owner = (!info.key.is_empty()).then_some(caller.uid);
        inner.crypt_name = truncate_label(&info.crypt_name);

        let read_only = inner.flags.contains(DeviceFlags::READ_ONLY);
        self.env.host.set_read_only(self.id(), read_only);
        self.env.host.set_capacity(self.id(), inner.capacity);
        self.set_state(DeviceState::Bound);

        tracing::info!(
            device = self.id(),
            capacity = inner.capacity,
            block_size,
            read_only,
            direct_io = inner.use_dio,
            transform = inner.transform_id,
            "device bound"
        );
        Ok(inner.flags.contains(DeviceFlags::PARTSCAN))
    }

    // -------------------------------------------------------------------------
    // Change backing store
    // -------------------------------------------------------------------------

    pub(crate) fn change_backing(&self, backing: BackingRef) -> Result<()> {
        let label = backing.label();
        let store = Arc::new(self.open_backing(backing)?);
        let chained = store.lower_device().is_some();

        let old = {
            let _validate = chained.then(|| self.env.validate_lock.lock());
            let mut inner = self.inner.lock();
            self.swap_backing(&mut inner, &store).map(|old| {
                inner.file_name = truncate_label(&label);
                old
            })
        };
        drop(store);
        let old = old?;

        if !chained {
            // Let any validator still walking the old chain finish first
            drop(self.env.validate_lock.lock());
        }
        drop(old);
        tracing::info!(device = self.id(), "backing store replaced");
        Ok(())
    }

    fn swap_backing(
        &self,
        inner: &mut DeviceInner,
        store: &Arc<BackingStore>,
    ) -> Result<Option<Arc<BackingStore>>> {
        if self.state() != DeviceState::Bound {
            return Err(LoopError::NotConfigured);
        }
        if !inner.flags.contains(DeviceFlags::READ_ONLY) {
            return Err(LoopError::invalid("backing store can only change on a read-only device"));
        }
        if store.lower_device().is_some() {
            self.validate_chain(store)?;
        }
        let mut layout = Layout::of(inner)?;
        layout.backing = store.clone();
        layout.refresh()?;
        if layout.capacity != inner.capacity {
            return Err(LoopError::invalid(format!(
                "replacement exposes {} bytes, device exposes {}",
                layout.capacity, inner.capacity
            )));
        }

        let _frozen = self.gate().freeze();
        Ok(self.apply(inner, layout)?.backing)
    }

    // -------------------------------------------------------------------------
    // Clear / release / teardown
    // -------------------------------------------------------------------------

    pub(crate) fn clear(&self) -> Result<ClearOutcome> {
        {
            let mut inner = self.inner.lock();
            if self.state() != DeviceState::Bound {
                return Err(LoopError::NotConfigured);
            }
            if self.open_count() > 1 {
                inner.flags |= DeviceFlags::AUTOCLEAR;
                tracing::info!(device = self.id(), "clear deferred until last close");
                return Ok(ClearOutcome::Deferred);
            }
            self.set_state(DeviceState::Rundown);
        }
        self.teardown()?;
        Ok(ClearOutcome::Cleared)
    }

    /// Drop one open reference. Never takes a lock: a release may run
    /// inside a completion callback while a control operation holds
    /// `inner` and waits for that callback. The last release of a bound
    /// device is handed to the janitor, which checks AutoClear.
    pub(crate) fn release(self: &Arc<Self>) {
        if self.open_count.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        if self.state() != DeviceState::Bound {
            return;
        }

        if let Err(err) = self.env.janitor.send(JanitorMsg::LastClose(self.clone())) {
            // Janitor already gone: finish on a thread of our own
            let device = match err.into_inner() {
                JanitorMsg::LastClose(device) => device,
                JanitorMsg::Stop => return,
            };
            let spawned = thread::Builder::new()
                .name(format!("{}-close", self.name()))
                .spawn(move || device.finish_last_close());
            if let Err(e) = spawned {
                tracing::warn!(device = self.id(), "could not hand off last close: {}", e);
            }
        }
    }

    /// Clear the device if AutoClear is set and nobody reopened it since
    /// the last release
    pub(crate) fn finish_last_close(&self) {
        {
            let inner = self.inner.lock();
            if self.open_count() != 0
                || self.state() != DeviceState::Bound
                || !inner.flags.contains(DeviceFlags::AUTOCLEAR)
            {
                return;
            }
            self.set_state(DeviceState::Rundown);
        }

        tracing::info!(device = self.id(), "last handle closed, autoclearing");
        if let Err(e) = self.teardown() {
            tracing::warn!(device = self.id(), "autoclear failed: {}", e);
        }
    }

    /// Rundown → Unbound: drain, release everything, reset the record
    pub(crate) fn teardown(&self) -> Result<()> {
        drop(self.env.validate_lock.lock());

        let mut inner = self.inner.lock();
        if self.state() != DeviceState::Rundown {
            return Err(LoopError::NotConfigured);
        }

        let frozen = self.gate().freeze();
        self.publish(None);
        let workers = inner.workers.take();
        let aio = inner.aio.take();
        let backing = inner.backing.take();
        let transform = inner.transform.take();
        let partscan = inner.flags.contains(DeviceFlags::PARTSCAN);

        let flags = inner.flags;
        inner.key.fill(0);
        *inner = DeviceInner::new();
        // Flags are reset only after the rescan below
        inner.flags = flags;
        self.env.host.set_capacity(self.id(), 0);
        drop(frozen);
        drop(inner);

        if partscan {
            self.rescan();
        }

        {
            let mut inner = self.inner.lock();
            inner.flags = DeviceFlags::empty();
            self.set_state(DeviceState::Unbound);
        }

        drop(workers);
        drop(aio);
        drop(transform);
        drop(backing);
        tracing::info!(device = self.id(), "device cleared");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Status
    // -------------------------------------------------------------------------

    pub(crate) fn get_status(&self, caller: Caller) -> Result<DeviceStatus> {
        let inner = self.inner.lock();
        if self.state() != DeviceState::Bound {
            return Err(LoopError::NotConfigured);
        }
        let backing = inner.backing.as_ref().ok_or(LoopError::NotConfigured)?;
        Ok(DeviceStatus {
            number: self.id(),
            offset: inner.offset,
            size_limit: inner.size_limit,
            flags: inner.flags,
            transform: inner.transform_id,
            key_size: inner.key.len(),
            key: caller.privileged.then(|| inner.key.clone()),
            file_name: inner.file_name.clone(),
            crypt_name: inner.crypt_name.clone(),
            block_size: inner.block_size,
            capacity: inner.capacity,
            backing: backing.identity(),
        })
    }

    pub(crate) fn set_status(&self, update: &StatusUpdate, caller: Caller) -> Result<()> {
        validate_range(update.offset, update.size_limit)?;

        let mut inner = self.inner.lock();
        if self.state() != DeviceState::Bound {
            return Err(LoopError::NotConfigured);
        }
        if let Some(owner) = inner.key_owner {
            if owner != caller.uid && !caller.privileged {
                return Err(LoopError::PermissionDenied);
            }
        }

        let size_changed = update.offset != inner.offset || update.size_limit != inner.size_limit;
        let transform_changed = update.transform != inner.transform_id || update.key != inner.key;
        let prev_flags = inner.flags;
        let flags = DeviceFlags::merge_status(prev_flags, update.flags);

        let mut replaced = Replaced::default();
        if size_changed || transform_changed {
            let mut layout = Layout::of(&inner)?;
            layout.offset = update.offset;
            layout.size_limit = update.size_limit;
            layout.flags = flags;
            if transform_changed {
                layout.transform = self
                    .env
                    .transforms
                    .create(update.transform, &update.key)?
                    .map(Arc::new);
            }
            layout.refresh()?;

            let frozen = if size_changed {
                self.quiesce_clean(&inner)?
            } else {
                self.gate().freeze()
            };
            replaced = self.apply(&mut inner, layout)?;
            drop(frozen);
        } else {
            inner.flags = flags;
        }

        if transform_changed {
            inner.key.fill(0);
            inner.key = update.key.clone();
            inner.key_owner = (!update.key.is_empty()).then_some(caller.uid);
            inner.transform_id = inner.transform.as_ref().map_or(TRANSFORM_NONE, |t| t.id());
        }
        inner.file_name = truncate_label(&update.file_name);
        inner.crypt_name = truncate_label(&update.crypt_name);

        if size_changed {
            self.env.host.set_capacity(self.id(), inner.capacity);
        }
        let rescan = !prev_flags.contains(DeviceFlags::PARTSCAN)
            && inner.flags.contains(DeviceFlags::PARTSCAN);
        drop(inner);

        drop(replaced);
        if rescan {
            self.rescan();
        }
        tracing::info!(device = self.id(), size_changed, transform_changed, "status updated");
        Ok(())
    }

    /// Flush the store, then freeze. Writes that raced the flush left
    /// unsynced data behind and the caller has to retry.
    fn quiesce_clean(&self, inner: &DeviceInner) -> Result<FreezeGuard<'_>> {
        let backing = inner.backing.clone();
        let result = self.gate().freeze_clean(|| match &backing {
            Some(store) => Ok(store.sync()?),
            None => Ok(()),
        });
        if let Err(LoopError::Retryable) = &result {
            tracing::warn!(device = self.id(), "writes raced the resize, asking caller to retry");
        }
        result
    }

    // -------------------------------------------------------------------------
    // Capacity, direct I/O, block size
    // -------------------------------------------------------------------------

    pub(crate) fn set_capacity(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        if self.state() != DeviceState::Bound {
            return Err(LoopError::NotConfigured);
        }
        let mut layout = Layout::of(&inner)?;
        layout.refresh()?;

        let frozen = self.gate().freeze();
        let replaced = self.apply(&mut inner, layout)?;
        drop(frozen);
        self.env.host.set_capacity(self.id(), inner.capacity);
        let capacity = inner.capacity;
        drop(inner);

        drop(replaced);
        tracing::info!(device = self.id(), capacity, "capacity republished");
        Ok(capacity)
    }

    pub(crate) fn set_direct_io(&self, enable: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        if self.state() != DeviceState::Bound {
            return Err(LoopError::NotConfigured);
        }
        if inner.use_dio == enable {
            return Ok(());
        }

        let mut layout = Layout::of(&inner)?;
        layout.flags.set(DeviceFlags::DIRECT_IO, enable);
        layout.refresh()?;
        if layout.use_dio != enable {
            return Err(LoopError::invalid(
                "direct I/O needs an aligned, untransformed file backing store",
            ));
        }

        let frozen = self.gate().freeze();
        let replaced = self.apply(&mut inner, layout)?;
        drop(frozen);
        drop(inner);

        drop(replaced);
        tracing::info!(device = self.id(), enable, "direct I/O switched");
        Ok(())
    }

    pub(crate) fn set_block_size(&self, size: u32) -> Result<()> {
        validate_block_size(size)?;

        let mut inner = self.inner.lock();
        if self.state() != DeviceState::Bound {
            return Err(LoopError::NotConfigured);
        }
        if inner.block_size == size {
            return Ok(());
        }
        let lower = inner
            .backing
            .as_ref()
            .filter(|b| b.lower_device().is_some())
            .map(|b| b.logical_block_size());
        if let Some(lower_bs) = lower {
            if size < lower_bs {
                return Err(LoopError::invalid(format!(
                    "block size {} is below the lower device's {}",
                    size, lower_bs
                )));
            }
        }

        let mut layout = Layout::of(&inner)?;
        layout.block_size = size;
        layout.refresh()?;

        let frozen = self.quiesce_clean(&inner)?;
        let replaced = self.apply(&mut inner, layout)?;
        drop(frozen);
        self.env.host.set_capacity(self.id(), inner.capacity);
        drop(inner);

        drop(replaced);
        tracing::info!(device = self.id(), block_size = size, "block size changed");
        Ok(())
    }
}
