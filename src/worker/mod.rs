//! Worker Pool Module
//!
//! Routes commands to per-tenant FIFO queues and runs them on a fixed set
//! of executor threads.
//!
//! ## Responsibilities
//! - One FIFO queue per tenant key, plus an always-present root queue
//! - Lazily create tenant workers, degrade to the root queue under pressure
//! - A queue is drained by at most one executor at a time (FIFO per tenant)
//! - Reap tenant workers that stayed idle past the timeout
//!
//! ## Structure
//! ```text
//!             queue(item)
//!                 │
//!     ┌───────────┴────────────┐
//!     ▼                        ▼
//!  root queue         workers: HashMap<TenantKey, Worker>
//!     │                        │            ▲
//!     └──── Job::Run(key) ─────┘            │ evict (oldest first)
//!                 │                         │
//!                 ▼                  idle: VecDeque<TenantKey>
//!        executor threads (N)               ▲
//!                 │                         │
//!                 └── drained & empty ──────┘  (+ arm reaper timer)
//! ```

mod pool;
mod reaper;

pub use pool::{Dispatcher, WorkerPool, WorkerStats};

/// Opaque grouping key derived from the submitting context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TenantKey(u64);

impl TenantKey {
    /// The default grouping; routed to the root queue
    pub const ROOT: TenantKey = TenantKey(0);

    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn is_root(&self) -> bool {
        *self == Self::ROOT
    }
}

/// Something the pool can route by tenant
pub trait Routable: Send + 'static {
    /// Tenant the item was submitted under
    fn tenant(&self) -> Option<TenantKey>;

    /// Re-tag the item to the root queue
    fn clear_tenant(&mut self);
}
