//! Synchronous execution paths

use bytes::BytesMut;

use crate::backing::DeallocMode;
use crate::error::{LoopError, Result};
use crate::transform::ActiveTransform;

use super::{Command, DispatchMode, IoContext, Op};

/// Scratch page used to stage transformed data
const SCRATCH_SIZE: usize = 4096;

/// Worker entry point for one command
pub(crate) fn handle_command(mut cmd: Command) {
    tracing::trace!(op = ?cmd.op, pos = cmd.pos, len = cmd.len, mode = ?cmd.mode, "executing command");

    if cmd.mode == DispatchMode::DirectAsync {
        if let Some(aio) = cmd.ctx.aio.clone() {
            aio.submit(cmd);
            return;
        }
        cmd.mode = DispatchMode::Simple;
    }

    let result = execute(&mut cmd);
    cmd.complete(result);
}

fn execute(cmd: &mut Command) -> Result<usize> {
    let ctx = cmd.ctx.clone();
    match (cmd.op, cmd.mode) {
        (Op::Flush, _) => flush(&ctx).map(|_| 0),
        (Op::Discard, _) => deallocate(&ctx, DeallocMode::PunchHole, cmd.pos, cmd.len),
        (Op::WriteZeroes, _) => {
            let mode = if cmd.no_unmap {
                DeallocMode::ZeroRange
            } else {
                DeallocMode::PunchHole
            };
            deallocate(&ctx, mode, cmd.pos, cmd.len)
        }
        (Op::Read, DispatchMode::DoubleBuffered) => match &ctx.transform {
            Some(t) => read_transformed(&ctx, t, cmd.pos, &mut cmd.buffers),
            None => read_simple(&ctx, cmd.pos, &mut cmd.buffers),
        },
        (Op::Write, DispatchMode::DoubleBuffered) => match &ctx.transform {
            Some(t) => write_transformed(&ctx, t, cmd.pos, &cmd.buffers),
            None => write_simple(&ctx, cmd.pos, &cmd.buffers),
        },
        (Op::Read, _) => read_simple(&ctx, cmd.pos, &mut cmd.buffers),
        (Op::Write, _) => write_simple(&ctx, cmd.pos, &cmd.buffers),
    }
}

fn flush(ctx: &IoContext) -> Result<()> {
    ctx.backing.sync()?;
    Ok(())
}

/// Punch or zero `len` bytes, in chunks no larger than the discard limit
fn deallocate(ctx: &IoContext, mode: DeallocMode, pos: u64, len: u64) -> Result<usize> {
    let limits = match (&ctx.transform, ctx.discard) {
        (Some(_), _) => {
            return Err(LoopError::NotSupported(
                "discard is disabled while a transform is active".into(),
            ))
        }
        (None, None) => {
            return Err(LoopError::NotSupported(
                "backing store does not support discard".into(),
            ))
        }
        (None, Some(limits)) => limits,
    };

    let max = limits.max_bytes.max(u64::from(limits.granularity)).max(1);
    let mut done = 0;
    while done < len {
        let chunk = (len - done).min(max);
        ctx.backing.deallocate(mode, pos + done, chunk)?;
        done += chunk;
    }
    Ok(len as usize)
}

/// Zero every byte from (`seg`, `off`) to the end of the segment list
fn zero_tail(buffers: &mut [BytesMut], seg: usize, off: usize) {
    if let Some((first, rest)) = buffers[seg..].split_first_mut() {
        first[off..].fill(0);
        for buf in rest {
            buf.fill(0);
        }
    }
}

fn read_simple(ctx: &IoContext, pos: u64, buffers: &mut [BytesMut]) -> Result<usize> {
    let mut cursor = pos;
    let mut total = 0;
    for i in 0..buffers.len() {
        let want = buffers[i].len();
        let n = ctx.backing.read_at(&mut buffers[i], cursor)?;
        total += want;
        if n < want {
            // Holes and a shrunken store read as zeros
            zero_tail(buffers, i, n);
            return Ok(buffers.iter().map(|b| b.len()).sum());
        }
        cursor += want as u64;
    }
    Ok(total)
}

fn write_simple(ctx: &IoContext, pos: u64, buffers: &[BytesMut]) -> Result<usize> {
    let mut cursor = pos;
    for buf in buffers {
        ctx.backing.write_all_at(buf, cursor)?;
        cursor += buf.len() as u64;
    }
    Ok((cursor - pos) as usize)
}

fn read_transformed(
    ctx: &IoContext,
    transform: &ActiveTransform,
    pos: u64,
    buffers: &mut [BytesMut],
) -> Result<usize> {
    let mut scratch = BytesMut::zeroed(SCRATCH_SIZE);
    let mut cursor = pos;
    for i in 0..buffers.len() {
        let seg_len = buffers[i].len();
        let mut off = 0;
        while off < seg_len {
            let chunk = (seg_len - off).min(SCRATCH_SIZE);
            let n = ctx.backing.read_at(&mut scratch[..chunk], cursor)?;
            transform.decode(&scratch[..n], &mut buffers[i][off..off + n], cursor)?;
            cursor += n as u64;
            if n < chunk {
                zero_tail(buffers, i, off + n);
                return Ok(buffers.iter().map(|b| b.len()).sum());
            }
            off += chunk;
        }
    }
    Ok((cursor - pos) as usize)
}

fn write_transformed(
    ctx: &IoContext,
    transform: &ActiveTransform,
    pos: u64,
    buffers: &[BytesMut],
) -> Result<usize> {
    let mut scratch = BytesMut::zeroed(SCRATCH_SIZE);
    let mut cursor = pos;
    for buf in buffers {
        for chunk in buf.chunks(SCRATCH_SIZE) {
            let staged = &mut scratch[..chunk.len()];
            transform.encode(chunk, staged, cursor)?;
            ctx.backing.write_all_at(staged, cursor)?;
            cursor += chunk.len() as u64;
        }
    }
    Ok((cursor - pos) as usize)
}
