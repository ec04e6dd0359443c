//! File or block device backing store

use std::fs::{File, OpenOptions};
use std::io::{self, IoSlice, IoSliceMut, Seek, SeekFrom};
use std::os::unix::fs::{FileExt, FileTypeExt, MetadataExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use super::{BackingIdentity, DeallocMode, DiscardLimits};

/// Largest number of segments handed to a single vectored call
const MAX_IOVECS: usize = 1024;

/// Largest discard the host accepts in one request, in sectors
const MAX_DISCARD_SECTORS: u64 = (u32::MAX >> 9) as u64;

#[cfg(target_os = "linux")]
const BLKSSZGET: libc::Ioctl = 0x1268;
#[cfg(target_os = "linux")]
const BLKPBSZGET: libc::Ioctl = 0x127B;

/// An open file (or block device node) used as a backing store
#[derive(Debug)]
pub struct FileStore {
    file: File,
    writable: bool,
    /// The descriptor was handed over with O_DIRECT set
    direct: bool,
    block_device: bool,
    logical_block_size: u32,
    physical_block_size: u32,
    identity: BackingIdentity,
}

impl FileStore {
    /// Open `path` read-write, falling back to read-only when the store
    /// refuses writers
    pub fn open(path: &Path, read_only: bool) -> io::Result<Self> {
        let file = if read_only {
            OpenOptions::new().read(true).open(path)?
        } else {
            match OpenOptions::new().read(true).write(true).open(path) {
                Ok(file) => file,
                Err(e)
                    if e.kind() == io::ErrorKind::PermissionDenied
                        || e.raw_os_error() == Some(libc::EROFS) =>
                {
                    tracing::debug!(path = %path.display(), "store refused writers, opening read-only");
                    OpenOptions::new().read(true).open(path)?
                }
                Err(e) => return Err(e),
            }
        };
        let writable = access_mode_writable(&file)?;
        Self::probe(file, writable, false)
    }

    /// Adopt an already open descriptor
    pub fn from_file(file: File) -> io::Result<Self> {
        let writable = access_mode_writable(&file)?;
        let direct = take_direct_flag(&file)?;
        Self::probe(file, writable, direct)
    }

    fn probe(file: File, writable: bool, direct: bool) -> io::Result<Self> {
        let meta = file.metadata()?;
        let block_device = meta.file_type().is_block_device();
        if !block_device && !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "backing store must be a regular file or block device",
            ));
        }
        let (logical_block_size, physical_block_size) = if block_device {
            block_sizes(&file)?
        } else {
            (512, 512)
        };
        Ok(Self {
            identity: BackingIdentity {
                dev: meta.dev(),
                ino: meta.ino(),
                rdev: meta.rdev(),
            },
            file,
            writable,
            direct,
            block_device,
            logical_block_size,
            physical_block_size,
        })
    }

    /// Current size; block devices report theirs through a seek to the end
    pub fn size(&self) -> io::Result<u64> {
        if self.block_device {
            (&self.file).seek(SeekFrom::End(0))
        } else {
            Ok(self.file.metadata()?.len())
        }
    }

    /// Read until `buf` is full or the store ends. Returns bytes read.
    pub fn read_at(&self, buf: &mut [u8], pos: u64) -> io::Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            match self.file.read_at(&mut buf[done..], pos + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(done)
    }

    pub fn write_all_at(&self, buf: &[u8], pos: u64) -> io::Result<()> {
        self.file.write_all_at(buf, pos)
    }

    /// One scatter read. May return short.
    pub fn read_vectored_at(&self, bufs: &mut [IoSliceMut<'_>], pos: u64) -> io::Result<usize> {
        let count = bufs.len().min(MAX_IOVECS);
        read_vectored(&self.file, &mut bufs[..count], pos)
    }

    /// One gather write. May return short.
    pub fn write_vectored_at(&self, bufs: &[IoSlice<'_>], pos: u64) -> io::Result<usize> {
        let count = bufs.len().min(MAX_IOVECS);
        write_vectored(&self.file, &bufs[..count], pos)
    }

    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    /// Deallocate or zero `len` bytes at `pos` without changing the size
    pub fn deallocate(&self, mode: DeallocMode, pos: u64, len: u64) -> io::Result<()> {
        fallocate(&self.file, mode, pos, len)
    }

    /// Granularity comes from the device itself, or from the filesystem
    /// allocation unit for regular files
    pub fn discard_limits(&self) -> Option<DiscardLimits> {
        let granularity = if self.block_device {
            self.physical_block_size
        } else {
            fs_block_size(&self.file)?
        };
        if granularity == 0 {
            return None;
        }
        Some(DiscardLimits {
            granularity,
            max_bytes: MAX_DISCARD_SECTORS * super::geometry::SECTOR_SIZE,
        })
    }

    pub fn logical_block_size(&self) -> u32 {
        self.logical_block_size
    }

    pub fn is_block_device(&self) -> bool {
        self.block_device
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn direct_requested(&self) -> bool {
        self.direct
    }

    pub fn identity(&self) -> BackingIdentity {
        self.identity
    }
}

fn access_mode_writable(file: &File) -> io::Result<bool> {
    // SAFETY: F_GETFL on a descriptor we own has no memory effects
    let flags = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(flags & libc::O_ACCMODE != libc::O_RDONLY)
}

/// Note whether O_DIRECT was set and clear it. Staging buffers are not
/// memory-aligned, so the descriptor itself always stays buffered.
#[cfg(target_os = "linux")]
fn take_direct_flag(file: &File) -> io::Result<bool> {
    let fd = file.as_raw_fd();
    // SAFETY: plain flag manipulation on an owned descriptor
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_DIRECT == 0 {
        return Ok(false);
    }
    // SAFETY: as above
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_DIRECT) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(true)
}

#[cfg(not(target_os = "linux"))]
fn take_direct_flag(_file: &File) -> io::Result<bool> {
    Ok(false)
}

#[cfg(target_os = "linux")]
fn block_sizes(file: &File) -> io::Result<(u32, u32)> {
    let fd = file.as_raw_fd();
    let mut logical: libc::c_int = 0;
    let mut physical: libc::c_uint = 0;
    // SAFETY: both ioctls write a single integer through the pointer
    unsafe {
        if libc::ioctl(fd, BLKSSZGET, &mut logical as *mut libc::c_int) < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::ioctl(fd, BLKPBSZGET, &mut physical as *mut libc::c_uint) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    let logical = u32::try_from(logical).unwrap_or(512).max(512);
    Ok((logical, physical.max(logical)))
}

#[cfg(not(target_os = "linux"))]
fn block_sizes(_file: &File) -> io::Result<(u32, u32)> {
    Ok((512, 512))
}

#[cfg(target_os = "linux")]
fn fs_block_size(file: &File) -> Option<u32> {
    // SAFETY: statfs is plain integer fields, all-zero is a valid value
    let mut stat: libc::statfs = unsafe { std::mem::zeroed() };
    // SAFETY: fstatfs fills the struct we pass
    if unsafe { libc::fstatfs(file.as_raw_fd(), &mut stat) } < 0 {
        return None;
    }
    u32::try_from(stat.f_bsize).ok()
}

#[cfg(not(target_os = "linux"))]
fn fs_block_size(_file: &File) -> Option<u32> {
    None
}

#[cfg(target_os = "linux")]
fn fallocate(file: &File, mode: DeallocMode, pos: u64, len: u64) -> io::Result<()> {
    let mode = match mode {
        DeallocMode::PunchHole => libc::FALLOC_FL_PUNCH_HOLE,
        DeallocMode::ZeroRange => libc::FALLOC_FL_ZERO_RANGE,
    } | libc::FALLOC_FL_KEEP_SIZE;
    let (pos, len) = match (i64::try_from(pos), i64::try_from(len)) {
        (Ok(pos), Ok(len)) => (pos, len),
        _ => return Err(io::Error::from_raw_os_error(libc::EINVAL)),
    };
    // SAFETY: fallocate only touches the file behind the descriptor
    if unsafe { libc::fallocate(file.as_raw_fd(), mode, pos as libc::off_t, len as libc::off_t) } < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EOPNOTSUPP) {
            return Err(io::Error::new(io::ErrorKind::Unsupported, err));
        }
        return Err(err);
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn fallocate(_file: &File, _mode: DeallocMode, _pos: u64, _len: u64) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "fallocate"))
}

#[cfg(target_os = "linux")]
fn read_vectored(file: &File, bufs: &mut [IoSliceMut<'_>], pos: u64) -> io::Result<usize> {
    let pos = i64::try_from(pos).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
    loop {
        // SAFETY: IoSliceMut is ABI compatible with iovec
        let n = unsafe {
            libc::preadv(
                file.as_raw_fd(),
                bufs.as_mut_ptr() as *const libc::iovec,
                bufs.len() as libc::c_int,
                pos as libc::off_t,
            )
        };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn read_vectored(file: &File, bufs: &mut [IoSliceMut<'_>], pos: u64) -> io::Result<usize> {
    let mut done = 0;
    for buf in bufs.iter_mut() {
        let n = file.read_at(buf, pos + done as u64)?;
        done += n;
        if n < buf.len() {
            break;
        }
    }
    Ok(done)
}

#[cfg(target_os = "linux")]
fn write_vectored(file: &File, bufs: &[IoSlice<'_>], pos: u64) -> io::Result<usize> {
    let pos = i64::try_from(pos).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
    loop {
        // SAFETY: IoSlice is ABI compatible with iovec
        let n = unsafe {
            libc::pwritev(
                file.as_raw_fd(),
                bufs.as_ptr() as *const libc::iovec,
                bufs.len() as libc::c_int,
                pos as libc::off_t,
            )
        };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn write_vectored(file: &File, bufs: &[IoSlice<'_>], pos: u64) -> io::Result<usize> {
    let mut done = 0;
    for buf in bufs {
        let n = file.write_at(buf, pos + done as u64)?;
        done += n;
        if n < buf.len() {
            break;
        }
    }
    Ok(done)
}
