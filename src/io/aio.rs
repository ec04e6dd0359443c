//! Asynchronous direct submission
//!
//! A small set of threads that take a command's whole segment list as one
//! vectored call. Completion happens on the submission thread, or inline on
//! the caller when the submission queue is full.

use std::io::{self, IoSlice, IoSliceMut};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};

use crate::error::LoopError;

use super::{Command, Op};

enum AioMsg {
    Run(Command),
    Stop,
}

/// Handle for submitting commands to a running `AioEngine`
#[derive(Clone)]
pub(crate) struct AioSubmitter {
    tx: Sender<AioMsg>,
}

impl AioSubmitter {
    pub fn submit(&self, cmd: Command) {
        match self.tx.try_send(AioMsg::Run(cmd)) {
            Ok(()) => {}
            Err(TrySendError::Full(AioMsg::Run(cmd)))
            | Err(TrySendError::Disconnected(AioMsg::Run(cmd))) => {
                tracing::trace!("aio queue unavailable, completing inline");
                run(cmd);
            }
            Err(_) => {}
        }
    }
}

/// Owns the submission threads of one bound device
pub(crate) struct AioEngine {
    tx: Sender<AioMsg>,
    threads: Vec<JoinHandle<()>>,
}

impl AioEngine {
    pub fn start(name: &str, threads: usize, depth: usize) -> io::Result<Self> {
        let (tx, rx) = channel::bounded(depth.max(1));
        let mut engine = Self {
            tx,
            threads: Vec::with_capacity(threads),
        };
        for i in 0..threads.max(1) {
            let rx: Receiver<AioMsg> = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-aio{}", name, i))
                .spawn(move || {
                    while let Ok(AioMsg::Run(cmd)) = rx.recv() {
                        run(cmd);
                    }
                })?;
            engine.threads.push(handle);
        }
        Ok(engine)
    }

    pub fn submitter(&self) -> AioSubmitter {
        AioSubmitter {
            tx: self.tx.clone(),
        }
    }
}

impl Drop for AioEngine {
    fn drop(&mut self) {
        for _ in &self.threads {
            let _ = self.tx.send(AioMsg::Stop);
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Skip `done` bytes into the segment list: (first segment, offset in it)
fn resume_point(buffers: &[bytes::BytesMut], done: u64) -> (usize, usize) {
    let mut skip = done;
    for (i, buf) in buffers.iter().enumerate() {
        let len = buf.len() as u64;
        if skip < len {
            return (i, skip as usize);
        }
        skip -= len;
    }
    (buffers.len(), 0)
}

fn transfer(cmd: &mut Command) -> io::Result<usize> {
    let (first, skip) = resume_point(&cmd.buffers, cmd.done);
    let pos = cmd.pos + cmd.done;
    let backing = cmd.ctx.backing.clone();
    match cmd.op {
        Op::Read => {
            let mut slices: Vec<IoSliceMut<'_>> = cmd.buffers[first..]
                .iter_mut()
                .enumerate()
                .map(|(i, b)| {
                    let start = if i == 0 { skip } else { 0 };
                    IoSliceMut::new(&mut b[start..])
                })
                .collect();
            backing.read_vectored_at(&mut slices, pos)
        }
        Op::Write => {
            let slices: Vec<IoSlice<'_>> = cmd.buffers[first..]
                .iter()
                .enumerate()
                .map(|(i, b)| {
                    let start = if i == 0 { skip } else { 0 };
                    IoSlice::new(&b[start..])
                })
                .collect();
            backing.write_vectored_at(&slices, pos)
        }
        _ => Err(io::Error::new(io::ErrorKind::Unsupported, "not a data command")),
    }
}

/// One submission pass. Partial progress goes back through the dispatcher
/// for another pass; a pass that moves nothing fails the command.
pub(crate) fn run(mut cmd: Command) {
    let n = match transfer(&mut cmd) {
        Ok(n) => n as u64,
        Err(e) => return cmd.complete(Err(LoopError::Io(e))),
    };
    cmd.done += n;

    if cmd.done >= cmd.len {
        let len = cmd.len as usize;
        return cmd.complete(Ok(len));
    }

    if n == 0 {
        if cmd.op == Op::Read {
            let (first, skip) = resume_point(&cmd.buffers, cmd.done);
            for (i, buf) in cmd.buffers[first..].iter_mut().enumerate() {
                let start = if i == 0 { skip } else { 0 };
                buf[start..].fill(0);
            }
        }
        let err = io::Error::new(io::ErrorKind::UnexpectedEof, "short transfer made no progress");
        return cmd.complete(Err(LoopError::Io(err)));
    }

    tracing::trace!(op = ?cmd.op, done = cmd.done, len = cmd.len, "requeueing short transfer");
    let dispatcher = cmd.ctx.dispatcher.clone();
    dispatcher.queue(cmd);
}
