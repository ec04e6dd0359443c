//! # vloop
//!
//! A virtual block device engine: fixed-size, randomly addressable devices
//! backed by ordinary files (or by other vloop devices), with:
//! - A quiesced attach/detach lifecycle (Unbound → Bound → Rundown → Unbound)
//! - Per-tenant FIFO worker queues with lazy creation and idle eviction
//! - Simple, double-buffered and async direct I/O paths with short-read recovery
//! - Pluggable reversible transforms (identity, XOR)
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Engine (control surface)                │
//! │          add / remove / get_free / open → DeviceHandle      │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                         Device                              │
//! │     lifecycle state machine · IoGate (freeze / drain)       │
//! └──────────┬──────────────────────────────────┬───────────────┘
//!            │ submit                           │ owns while bound
//!            ▼                                  ▼
//!   ┌─────────────────┐               ┌───────────────────┐
//!   │   WorkerPool    │               │  BackingStore     │
//!   │ tenant → queue  │               │  + Transform      │
//!   └────────┬────────┘               └─────────▲─────────┘
//!            │                                  │
//!            ▼                                  │
//!   ┌─────────────────┐                         │
//!   │  I/O execution  │─────────────────────────┘
//!   │ simple · staged │
//!   │  · async direct │
//!   └─────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;

pub mod backing;
pub mod device;
pub mod engine;
pub mod host;
pub mod io;
mod registry;
pub mod transform;
pub mod worker;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use backing::{BackingIdentity, BackingRef, DeallocMode, DiscardLimits};
pub use config::{Config, ConfigBuilder};
pub use device::{
    Caller, ClearOutcome, Device, DeviceFlags, DeviceHandle, DeviceId, DeviceState, DeviceStatus,
    LoopConfig, StatusUpdate,
};
pub use engine::Engine;
pub use error::{ErrorKind, LoopError, Result};
pub use host::{HostDisk, LogHost};
pub use io::{DispatchMode, IoOutcome, IoRequest, Op};
pub use transform::{Transform, TransformId, TRANSFORM_NONE, TRANSFORM_XOR};
pub use worker::{TenantKey, WorkerStats};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of vloop
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
