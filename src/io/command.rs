//! Requests, commands and completions

use std::fmt;
use std::io;
use std::sync::Arc;

use bytes::BytesMut;

use crate::device::GateToken;
use crate::error::{LoopError, Result};
use crate::worker::{Routable, TenantKey};

use super::IoContext;

/// Operation carried by a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Read,
    Write,
    Flush,
    Discard,
    WriteZeroes,
}

impl Op {
    /// True for anything that changes stored bytes
    pub fn is_write(&self) -> bool {
        matches!(self, Op::Write | Op::Discard | Op::WriteZeroes)
    }

    /// True when the command carries data segments
    pub fn has_data(&self) -> bool {
        matches!(self, Op::Read | Op::Write)
    }
}

/// Execution strategy for one command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Positional I/O straight into the caller's segments
    Simple,
    /// Staged through a scratch page so a transform can run
    DoubleBuffered,
    /// Whole segment list handed to the async submission threads
    DirectAsync,
}

/// Pick the strategy for `op`.
///
/// The async path only serves untransformed reads and writes on a device
/// configured for direct I/O.
pub fn select_mode(op: Op, use_dio: bool, has_transform: bool) -> DispatchMode {
    match op {
        Op::Read | Op::Write if use_dio && !has_transform => DispatchMode::DirectAsync,
        Op::Read | Op::Write if has_transform => DispatchMode::DoubleBuffered,
        _ => DispatchMode::Simple,
    }
}

/// A request as submitted to a device.
///
/// Offsets are device-relative; the device adds its backing offset.
#[derive(Debug)]
pub struct IoRequest {
    pub(crate) op: Op,
    pub(crate) offset: u64,
    pub(crate) len: u64,
    pub(crate) buffers: Vec<BytesMut>,
    pub(crate) tenant: Option<TenantKey>,
    pub(crate) no_unmap: bool,
}

impl IoRequest {
    fn new(op: Op, offset: u64, len: u64, buffers: Vec<BytesMut>) -> Self {
        Self {
            op,
            offset,
            len,
            buffers,
            tenant: None,
            no_unmap: false,
        }
    }

    /// Read `len` bytes into a fresh buffer
    pub fn read(offset: u64, len: usize) -> Self {
        Self::read_into(offset, vec![BytesMut::zeroed(len)])
    }

    /// Read into caller segments; each segment is filled to its length
    pub fn read_into(offset: u64, buffers: Vec<BytesMut>) -> Self {
        let len = buffers.iter().map(|b| b.len() as u64).sum();
        Self::new(Op::Read, offset, len, buffers)
    }

    /// Write the given segments back to back
    pub fn write(offset: u64, buffers: Vec<BytesMut>) -> Self {
        let len = buffers.iter().map(|b| b.len() as u64).sum();
        Self::new(Op::Write, offset, len, buffers)
    }

    /// Write a copy of `data`
    pub fn write_from(offset: u64, data: &[u8]) -> Self {
        Self::write(offset, vec![BytesMut::from(data)])
    }

    pub fn flush() -> Self {
        Self::new(Op::Flush, 0, 0, Vec::new())
    }

    /// Release the range; it reads back as zeros
    pub fn discard(offset: u64, len: u64) -> Self {
        Self::new(Op::Discard, offset, len, Vec::new())
    }

    /// Zero the range. With `no_unmap` the blocks stay allocated.
    pub fn write_zeroes(offset: u64, len: u64, no_unmap: bool) -> Self {
        let mut req = Self::new(Op::WriteZeroes, offset, len, Vec::new());
        req.no_unmap = no_unmap;
        req
    }

    /// Route the request through `tenant`'s worker
    pub fn tenant(mut self, tenant: TenantKey) -> Self {
        self.tenant = Some(tenant);
        self
    }

    pub fn op(&self) -> Op {
        self.op
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Give the segments back, e.g. after a rejected submission
    pub fn into_buffers(self) -> Vec<BytesMut> {
        self.buffers
    }
}

/// What a completion callback receives
#[derive(Debug)]
pub struct IoOutcome {
    /// Bytes transferred, or why the command failed
    pub result: Result<usize>,
    /// The request's segments, filled in for reads
    pub buffers: Vec<BytesMut>,
}

impl IoOutcome {
    /// Merge the segments of a successful read into one buffer
    pub fn into_bytes(self) -> Result<BytesMut> {
        self.result?;
        let mut buffers = self.buffers.into_iter();
        let mut out = buffers.next().unwrap_or_default();
        for buf in buffers {
            out.unsplit(buf);
        }
        Ok(out)
    }
}

pub(crate) type Completion = Box<dyn FnOnce(IoOutcome) + Send>;

/// An admitted request, bound to the configuration it was admitted under
pub(crate) struct Command {
    pub ctx: Arc<IoContext>,
    pub op: Op,
    /// Absolute backing-store position of the first byte
    pub pos: u64,
    pub len: u64,
    /// Bytes already transferred by earlier async passes
    pub done: u64,
    pub buffers: Vec<BytesMut>,
    pub tenant: Option<TenantKey>,
    pub mode: DispatchMode,
    pub no_unmap: bool,
    completion: Option<Completion>,
    token: Option<GateToken>,
}

impl Command {
    pub fn new(ctx: Arc<IoContext>, req: IoRequest, completion: Completion, token: GateToken) -> Self {
        let mode = select_mode(req.op, ctx.use_dio, ctx.transform.is_some());
        Self {
            pos: ctx.offset + req.offset,
            ctx,
            op: req.op,
            len: req.len,
            done: 0,
            buffers: req.buffers,
            tenant: req.tenant,
            mode,
            no_unmap: req.no_unmap,
            completion: Some(completion),
            token: Some(token),
        }
    }

    /// Report the result exactly once.
    ///
    /// The command (and its configuration snapshot) is released before the
    /// callback runs; the admission token only after it returns, so the
    /// callback may submit more work even while a freeze is draining.
    pub fn complete(mut self, result: Result<usize>) {
        let completion = self.completion.take();
        let token = self.token.take();
        let buffers = std::mem::take(&mut self.buffers);
        let op = self.op;
        drop(self);

        if let Err(e) = &result {
            tracing::debug!(?op, "command failed: {}", e);
        }
        if let Some(completion) = completion {
            let outcome = IoOutcome {
                result: result.map_err(LoopError::into_completion_error),
                buffers,
            };
            match token {
                Some(token) => token.complete_with(|| completion(outcome)),
                None => completion(outcome),
            }
        }
    }
}

impl Routable for Command {
    fn tenant(&self) -> Option<TenantKey> {
        self.tenant
    }

    fn clear_tenant(&mut self) {
        self.tenant = None;
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("op", &self.op)
            .field("pos", &self.pos)
            .field("len", &self.len)
            .field("done", &self.done)
            .field("mode", &self.mode)
            .field("tenant", &self.tenant)
            .finish()
    }
}

impl Drop for Command {
    fn drop(&mut self) {
        // Dropped without completing, e.g. the pool was already stopped
        if let Some(completion) = self.completion.take() {
            let outcome = IoOutcome {
                result: Err(LoopError::Io(io::Error::new(
                    io::ErrorKind::Other,
                    "command dropped before completion",
                ))),
                buffers: std::mem::take(&mut self.buffers),
            };
            match self.token.take() {
                Some(token) => token.complete_with(|| completion(outcome)),
                None => completion(outcome),
            }
        }
    }
}
