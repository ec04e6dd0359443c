//! I/O Execution Module
//!
//! Executes commands against the backing store.
//!
//! ## Responsibilities
//! - Pick a dispatch mode per command (simple, double-buffered, direct async)
//! - Scatter/gather reads and writes, staging through a scratch page when a
//!   transform is active
//! - Zero-fill short reads, requeue partially completed async transfers
//! - Flush, discard and write-zeroes against the store
//!
//! ## Data Flow
//! ```text
//!   Device::submit ──▶ Command ──▶ WorkerPool ──▶ handle_command
//!                                                     │
//!                      ┌──────────────────────────────┼─────────────────┐
//!                      ▼                              ▼                 ▼
//!                   Simple                    DoubleBuffered       DirectAsync
//!              (read_at/write_at)          (scratch + transform)   (aio threads)
//!                      │                              │                 │
//!                      └──────────── complete() ◀─────┘◀────────────────┘
//! ```

pub(crate) mod aio;
mod command;
pub(crate) mod engine;

use std::sync::Arc;

use crate::backing::{BackingStore, DiscardLimits};
use crate::transform::ActiveTransform;
use crate::worker::Dispatcher;

pub use command::{select_mode, DispatchMode, IoOutcome, IoRequest, Op};
pub(crate) use command::{Command, Completion};

/// Everything a command needs from its device, captured once per
/// configuration. Swapped only while the device is frozen.
pub(crate) struct IoContext {
    pub backing: Arc<BackingStore>,
    pub transform: Option<Arc<ActiveTransform>>,
    /// Byte offset into the backing store
    pub offset: u64,
    /// Exposed size
    pub capacity: u64,
    pub block_size: u32,
    pub read_only: bool,
    pub use_dio: bool,
    pub discard: Option<DiscardLimits>,
    pub dispatcher: Dispatcher<Command>,
    pub aio: Option<aio::AioSubmitter>,
}
