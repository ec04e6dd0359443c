//! Device Module
//!
//! A single virtual block device: its lifecycle state machine, its
//! configuration record and its I/O admission path.
//!
//! ## Responsibilities
//! - Track state (Unbound → Bound → Rundown → Unbound, or Deleting)
//! - Own the backing store, transform, worker pool and async engine while bound
//! - Admit commands through the gate and hand them to the worker pool
//! - Quiesce (freeze, drain, mutate, unfreeze) around reconfiguration
//!
//! ## Locking
//! ```text
//!   env.validate_lock  (only when a vloop device backs another)
//!        └── device.inner   (state transitions, configuration fields)
//!                └── gate.freeze()   (drains admitted commands)
//! ```
//! Backing stores are always dropped after `inner` is released.

mod config;
mod flags;
mod gate;
mod handle;
mod lifecycle;
mod status;

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use crossbeam::channel::{self, Sender};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::backing::{BackingStore, DiscardLimits};
use crate::config::Config;
use crate::error::{LoopError, Result};
use crate::host::HostDisk;
use crate::io::aio::AioEngine;
use crate::io::{Command, IoContext, IoOutcome, IoRequest, Op};
use crate::registry::Registry;
use crate::transform::{ActiveTransform, TransformId, TransformRegistry, TRANSFORM_NONE};
use crate::worker::{TenantKey, WorkerPool, WorkerStats};

pub use config::{LoopConfig, LoopConfigBuilder};
pub use flags::DeviceFlags;
pub(crate) use gate::GateToken;
use gate::IoGate;
pub use handle::{ClearOutcome, DeviceHandle};
pub use status::{Caller, DeviceStatus, StatusUpdate, NAME_SIZE};

/// Stable device identity
pub type DeviceId = u32;

/// Lifecycle state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceState {
    /// Idle, no backing store
    Unbound = 0,
    /// Serving I/O
    Bound = 1,
    /// Teardown in progress, no new I/O admitted
    Rundown = 2,
    /// Withdrawn from the registry for good
    Deleting = 3,
}

impl DeviceState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Bound,
            2 => Self::Rundown,
            3 => Self::Deleting,
            _ => Self::Unbound,
        }
    }
}

/// Work for the engine's janitor thread
pub(crate) enum JanitorMsg {
    /// The last handle on a bound device was dropped
    LastClose(Arc<Device>),
    Stop,
}

/// Engine-wide state every device shares
pub(crate) struct DeviceEnv {
    pub config: Config,
    pub transforms: TransformRegistry,
    pub host: Arc<dyn HostDisk>,
    /// Serializes validation of chained backing stores
    pub validate_lock: Mutex<()>,
    pub janitor: Sender<JanitorMsg>,
    pub registry: Weak<Registry>,
}

/// Configuration fields, guarded by `Device::inner`
pub(crate) struct DeviceInner {
    pub flags: DeviceFlags,
    pub offset: u64,
    pub size_limit: Option<u64>,
    pub block_size: u32,
    pub transform_id: TransformId,
    pub key: Vec<u8>,
    /// Uid that installed the key
    pub key_owner: Option<u32>,
    pub file_name: String,
    pub crypt_name: String,
    pub backing: Option<Arc<BackingStore>>,
    pub transform: Option<Arc<ActiveTransform>>,
    pub use_dio: bool,
    pub capacity: u64,
    pub discard: Option<DiscardLimits>,
    pub workers: Option<WorkerPool<Command>>,
    pub aio: Option<AioEngine>,
}

impl DeviceInner {
    fn new() -> Self {
        Self {
            flags: DeviceFlags::empty(),
            offset: 0,
            size_limit: None,
            block_size: 512,
            transform_id: TRANSFORM_NONE,
            key: Vec::new(),
            key_owner: None,
            file_name: String::new(),
            crypt_name: String::new(),
            backing: None,
            transform: None,
            use_dio: false,
            capacity: 0,
            discard: None,
            workers: None,
            aio: None,
        }
    }
}

/// A virtual block device
pub struct Device {
    id: DeviceId,
    state: AtomicU8,
    pub(crate) inner: Mutex<DeviceInner>,
    state_changed: Condvar,
    /// Snapshot commands run against; `None` unless bound
    io: RwLock<Option<Arc<IoContext>>>,
    gate: Arc<IoGate>,
    open_count: AtomicUsize,
    pub(crate) env: Arc<DeviceEnv>,
}

impl Device {
    pub(crate) fn new(id: DeviceId, env: Arc<DeviceEnv>) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: AtomicU8::new(DeviceState::Unbound as u8),
            inner: Mutex::new(DeviceInner::new()),
            state_changed: Condvar::new(),
            io: RwLock::new(None),
            gate: IoGate::new(),
            open_count: AtomicUsize::new(0),
            env,
        })
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn state(&self) -> DeviceState {
        DeviceState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Called with `inner` held
    pub(crate) fn set_state(&self, state: DeviceState) {
        self.state.store(state as u8, Ordering::Release);
        self.state_changed.notify_all();
    }

    /// Block until the device reaches `state`. Returns false on timeout.
    pub fn wait_for_state(&self, state: DeviceState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while self.state() != state {
            if self.state_changed.wait_until(&mut inner, deadline).timed_out() {
                return self.state() == state;
            }
        }
        true
    }

    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::SeqCst)
    }

    pub fn flags(&self) -> DeviceFlags {
        self.inner.lock().flags
    }

    pub fn is_read_only(&self) -> bool {
        self.flags().contains(DeviceFlags::READ_ONLY)
    }

    /// Exposed size in bytes, 0 unless bound
    pub fn capacity(&self) -> u64 {
        self.io_snapshot().map_or(0, |ctx| ctx.capacity)
    }

    pub fn block_size(&self) -> u32 {
        match self.io_snapshot() {
            Some(ctx) => ctx.block_size,
            None => self.inner.lock().block_size,
        }
    }

    /// Whether reads and writes currently take the async direct path
    pub fn uses_direct_io(&self) -> bool {
        self.io_snapshot().map_or(false, |ctx| ctx.use_dio)
    }

    pub fn discard_limits(&self) -> Option<DiscardLimits> {
        self.io_snapshot().and_then(|ctx| ctx.discard)
    }

    /// Vloop device this one is stacked on
    pub fn lower_device(&self) -> Option<DeviceId> {
        self.inner
            .lock()
            .backing
            .as_ref()
            .and_then(|b| b.lower_device())
    }

    pub fn worker_stats(&self) -> Option<WorkerStats> {
        self.inner.lock().workers.as_ref().map(|w| w.stats())
    }

    /// Whether a dedicated worker currently exists for `tenant`
    pub fn has_tenant_worker(&self, tenant: TenantKey) -> bool {
        self.inner
            .lock()
            .workers
            .as_ref()
            .map_or(false, |w| w.has_worker(tenant))
    }

    /// Commands admitted and not yet completed
    pub fn in_flight(&self) -> usize {
        self.gate.in_flight()
    }

    pub(crate) fn io_snapshot(&self) -> Option<Arc<IoContext>> {
        self.io.read().clone()
    }

    pub(crate) fn gate(&self) -> &IoGate {
        &self.gate
    }

    /// Swap the command snapshot. Only while frozen.
    pub(crate) fn publish(&self, ctx: Option<IoContext>) {
        *self.io.write() = ctx.map(Arc::new);
    }

    /// Submit a command; `done` runs exactly once with the outcome.
    ///
    /// Blocks while the device is frozen for reconfiguration, unless called
    /// from inside one of this device's completion callbacks.
    pub fn submit<F>(&self, req: IoRequest, done: F)
    where
        F: FnOnce(IoOutcome) + Send + 'static,
    {
        let token = self.gate.enter(req.op().is_write());

        let ctx = match self.io_snapshot() {
            Some(ctx) if self.state() == DeviceState::Bound => ctx,
            _ => {
                let outcome = IoOutcome {
                    result: Err(LoopError::NotConfigured),
                    buffers: req.into_buffers(),
                };
                token.complete_with(|| done(outcome));
                return;
            }
        };

        if let Err(e) = check_request(&ctx, &req) {
            tracing::debug!(device = self.id, op = ?req.op(), "rejected request: {}", e);
            let outcome = IoOutcome {
                result: Err(e.into_completion_error()),
                buffers: req.into_buffers(),
            };
            token.complete_with(|| done(outcome));
            return;
        }

        let dispatcher = ctx.dispatcher.clone();
        dispatcher.queue(Command::new(ctx, req, Box::new(done), token));
    }

    /// Submit and wait for the outcome
    pub fn execute(&self, req: IoRequest) -> IoOutcome {
        let (tx, rx) = channel::bounded(1);
        self.submit(req, move |outcome| {
            let _ = tx.send(outcome);
        });
        rx.recv().unwrap_or_else(|_| IoOutcome {
            result: Err(LoopError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "completion lost",
            ))),
            buffers: Vec::new(),
        })
    }

    /// Read `len` bytes at `offset`
    pub fn read(&self, offset: u64, len: usize) -> Result<BytesMut> {
        self.execute(IoRequest::read(offset, len)).into_bytes()
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.execute(IoRequest::write_from(offset, data)).result?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.execute(IoRequest::flush()).result?;
        Ok(())
    }

    pub fn discard(&self, offset: u64, len: u64) -> Result<()> {
        self.execute(IoRequest::discard(offset, len)).result?;
        Ok(())
    }

    pub fn write_zeroes(&self, offset: u64, len: u64, no_unmap: bool) -> Result<()> {
        self.execute(IoRequest::write_zeroes(offset, len, no_unmap)).result?;
        Ok(())
    }
}

/// Admission checks against the configuration the command will run under
fn check_request(ctx: &IoContext, req: &IoRequest) -> Result<()> {
    if req.op().is_write() && ctx.read_only {
        return Err(LoopError::ReadOnly);
    }
    if req.op() == Op::Flush {
        return Ok(());
    }

    let bs = u64::from(ctx.block_size);
    if req.offset() % bs != 0 || req.len() % bs != 0 {
        return Err(LoopError::invalid(format!(
            "range {}+{} is not aligned to {} byte blocks",
            req.offset(),
            req.len(),
            bs
        )));
    }
    if req.buffers.iter().any(|b| b.len() as u64 % bs != 0) {
        return Err(LoopError::invalid("segment length is not block aligned"));
    }
    match req.offset().checked_add(req.len()) {
        Some(end) if end <= ctx.capacity => Ok(()),
        _ => Err(LoopError::invalid(format!(
            "range {}+{} exceeds capacity {}",
            req.offset(),
            req.len(),
            ctx.capacity
        ))),
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("open_count", &self.open_count())
            .finish()
    }
}
