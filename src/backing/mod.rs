//! Backing Store Module
//!
//! The store a bound device exposes: an ordinary file, a block device node,
//! or another vloop device.
//!
//! ## Responsibilities
//! - Resolve a `BackingRef` into an open `BackingStore`
//! - Positional, vectored, sync and deallocate primitives
//! - Geometry: size, logical block size, discard limits
//!
//! A store is owned by exactly one bound device and is dropped outside
//! that device's lock.

mod file;
pub mod geometry;

use std::fmt;
use std::fs::File;
use std::io::{self, IoSlice, IoSliceMut};
use std::path::PathBuf;

use crate::device::{DeviceFlags, DeviceHandle, DeviceId};
use crate::error::{LoopError, Result};

pub use file::FileStore;

/// What a caller asks a device to be bound to
pub enum BackingRef {
    /// Open a path (read-write unless `read_only`, falling back to read-only)
    Path { path: PathBuf, read_only: bool },
    /// Adopt an open descriptor
    File(File),
    /// Stack on top of another vloop device
    Device(DeviceId),
}

impl BackingRef {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path {
            path: path.into(),
            read_only: false,
        }
    }

    pub fn path_read_only(path: impl Into<PathBuf>) -> Self {
        Self::Path {
            path: path.into(),
            read_only: true,
        }
    }

    pub fn file(file: File) -> Self {
        Self::File(file)
    }

    pub fn device(id: DeviceId) -> Self {
        Self::Device(id)
    }

    /// Label used when the caller gave none
    pub(crate) fn label(&self) -> String {
        match self {
            Self::Path { path, .. } => path.display().to_string(),
            Self::File(_) => String::new(),
            Self::Device(id) => format!("vloop{}", id),
        }
    }
}

impl fmt::Debug for BackingRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path { path, read_only } => f
                .debug_struct("Path")
                .field("path", path)
                .field("read_only", read_only)
                .finish(),
            Self::File(file) => f.debug_tuple("File").field(file).finish(),
            Self::Device(id) => f.debug_tuple("Device").field(id).finish(),
        }
    }
}

/// How `deallocate` treats the range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeallocMode {
    /// Release the blocks; reads return zeros
    PunchHole,
    /// Keep the blocks allocated but zeroed
    ZeroRange,
}

/// Discard geometry advertised for a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscardLimits {
    pub granularity: u32,
    pub max_bytes: u64,
}

/// Identity of the backing inode, reported in the status record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackingIdentity {
    pub dev: u64,
    pub ino: u64,
    pub rdev: u64,
}

/// An open backing store
#[derive(Debug)]
pub enum BackingStore {
    File(FileStore),
    /// Another vloop device, held open for as long as this store lives
    Device(DeviceHandle),
}

impl BackingStore {
    pub fn size(&self) -> io::Result<u64> {
        match self {
            Self::File(store) => store.size(),
            Self::Device(handle) => Ok(handle.capacity()),
        }
    }

    /// Read until `buf` is full or the store ends. Returns bytes read.
    pub fn read_at(&self, buf: &mut [u8], pos: u64) -> io::Result<usize> {
        match self {
            Self::File(store) => store.read_at(buf, pos),
            Self::Device(handle) => {
                let len = clamp_len(handle.capacity(), pos, buf.len());
                if len == 0 {
                    return Ok(0);
                }
                let data = handle.read(pos, len).map_err(into_io)?;
                buf[..len].copy_from_slice(&data);
                Ok(len)
            }
        }
    }

    pub fn write_all_at(&self, buf: &[u8], pos: u64) -> io::Result<()> {
        match self {
            Self::File(store) => store.write_all_at(buf, pos),
            Self::Device(handle) => handle.write(pos, buf).map_err(into_io),
        }
    }

    /// One scatter read; may return short
    pub fn read_vectored_at(&self, bufs: &mut [IoSliceMut<'_>], pos: u64) -> io::Result<usize> {
        match self {
            Self::File(store) => store.read_vectored_at(bufs, pos),
            Self::Device(_) => {
                let mut done = 0;
                for buf in bufs.iter_mut() {
                    let n = self.read_at(buf, pos + done as u64)?;
                    done += n;
                    if n < buf.len() {
                        break;
                    }
                }
                Ok(done)
            }
        }
    }

    /// One gather write; may return short
    pub fn write_vectored_at(&self, bufs: &[IoSlice<'_>], pos: u64) -> io::Result<usize> {
        match self {
            Self::File(store) => store.write_vectored_at(bufs, pos),
            Self::Device(_) => {
                let mut done = 0;
                for buf in bufs {
                    self.write_all_at(buf, pos + done as u64)?;
                    done += buf.len();
                }
                Ok(done)
            }
        }
    }

    pub fn sync(&self) -> io::Result<()> {
        match self {
            Self::File(store) => store.sync(),
            Self::Device(handle) => handle.flush().map_err(into_io),
        }
    }

    pub fn deallocate(&self, mode: DeallocMode, pos: u64, len: u64) -> io::Result<()> {
        match self {
            Self::File(store) => store.deallocate(mode, pos, len),
            Self::Device(handle) => {
                let result = match mode {
                    DeallocMode::PunchHole => handle.discard(pos, len),
                    DeallocMode::ZeroRange => handle.write_zeroes(pos, len, true),
                };
                result.map_err(into_io)
            }
        }
    }

    pub fn discard_limits(&self) -> Option<DiscardLimits> {
        match self {
            Self::File(store) => store.discard_limits(),
            Self::Device(handle) => handle.discard_limits(),
        }
    }

    pub fn logical_block_size(&self) -> u32 {
        match self {
            Self::File(store) => store.logical_block_size(),
            Self::Device(handle) => handle.block_size(),
        }
    }

    /// Chained devices always go through the lower device's own workers
    pub fn supports_direct_io(&self) -> bool {
        matches!(self, Self::File(_))
    }

    pub fn direct_requested(&self) -> bool {
        match self {
            Self::File(store) => store.direct_requested(),
            Self::Device(_) => false,
        }
    }

    pub fn is_block_device(&self) -> bool {
        match self {
            Self::File(store) => store.is_block_device(),
            Self::Device(_) => true,
        }
    }

    pub fn writable(&self) -> bool {
        match self {
            Self::File(store) => store.writable(),
            Self::Device(handle) => {
                handle.is_writable() && !handle.flags().contains(DeviceFlags::READ_ONLY)
            }
        }
    }

    /// The vloop device this store sits on, if any
    pub fn lower_device(&self) -> Option<DeviceId> {
        match self {
            Self::File(_) => None,
            Self::Device(handle) => Some(handle.id()),
        }
    }

    pub fn identity(&self) -> BackingIdentity {
        match self {
            Self::File(store) => store.identity(),
            Self::Device(handle) => BackingIdentity {
                dev: 0,
                ino: 0,
                rdev: u64::from(handle.id()),
            },
        }
    }
}

fn clamp_len(size: u64, pos: u64, len: usize) -> usize {
    let available = size.saturating_sub(pos);
    usize::try_from(available).map_or(len, |a| a.min(len))
}

fn into_io(err: LoopError) -> io::Error {
    match err {
        LoopError::Io(e) => e,
        LoopError::NotSupported(msg) => io::Error::new(io::ErrorKind::Unsupported, msg),
        other => io::Error::new(io::ErrorKind::Other, other.to_string()),
    }
}

/// Resolve the plain-file part of a backing reference.
///
/// Chained references need the engine registry and are resolved by the
/// device layer.
pub(crate) fn open_file(backing: BackingRef) -> Result<BackingStore> {
    let store = match backing {
        BackingRef::Path { path, read_only } => FileStore::open(&path, read_only)?,
        BackingRef::File(file) => FileStore::from_file(file)?,
        BackingRef::Device(id) => {
            return Err(LoopError::invalid(format!(
                "device {} must be resolved through the engine",
                id
            )))
        }
    };
    Ok(BackingStore::File(store))
}
