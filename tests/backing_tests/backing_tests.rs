//! Tests for backing stores
//!
//! These tests verify:
//! - Opening paths read-write and read-only
//! - Adopting an open descriptor
//! - Positional and vectored I/O, reads stopping at end of file
//! - Punch-hole and zero-range deallocation
//! - Exposed size arithmetic

use std::fs::{self, OpenOptions};
use std::io::{IoSlice, IoSliceMut};

use tempfile::NamedTempFile;
use vloop::backing::geometry::{exposed_size, validate_block_size};
use vloop::backing::{BackingStore, DeallocMode, FileStore};

// =============================================================================
// Helper Functions
// =============================================================================

fn backing_file(data: &[u8]) -> NamedTempFile {
    let tmp = NamedTempFile::new().unwrap();
    fs::write(tmp.path(), data).unwrap();
    tmp
}

fn store_over(data: &[u8]) -> (NamedTempFile, BackingStore) {
    let tmp = backing_file(data);
    let store = BackingStore::File(FileStore::open(tmp.path(), false).unwrap());
    (tmp, store)
}

// =============================================================================
// Open Tests
// =============================================================================

#[test]
fn test_open_read_write() {
    let (_tmp, store) = store_over(&[0u8; 4096]);
    assert!(store.writable());
    assert_eq!(store.size().unwrap(), 4096);
    assert_eq!(store.logical_block_size(), 512);
    assert!(!store.is_block_device());
    assert!(store.supports_direct_io());
    assert!(!store.direct_requested());
    assert!(store.lower_device().is_none());
}

#[test]
fn test_open_read_only() {
    let tmp = backing_file(&[1u8; 1024]);
    let store = FileStore::open(tmp.path(), true).unwrap();
    assert!(!store.writable());
    assert_eq!(store.path(), Some(tmp.path()));
}

#[test]
fn test_adopt_read_only_descriptor() {
    let tmp = backing_file(&[1u8; 1024]);
    let file = OpenOptions::new().read(true).open(tmp.path()).unwrap();
    let store = FileStore::from_file(file).unwrap();
    assert!(!store.writable());
    assert!(store.path().is_none());
}

#[test]
fn test_identity_matches_inode() {
    use std::os::unix::fs::MetadataExt;

    let (tmp, store) = store_over(&[0u8; 512]);
    let meta = fs::metadata(tmp.path()).unwrap();
    let identity = store.identity();
    assert_eq!(identity.ino, meta.ino());
    assert_eq!(identity.dev, meta.dev());
}

#[test]
fn test_open_missing_path_fails() {
    let dir = tempfile::tempdir().unwrap();
    assert!(FileStore::open(&dir.path().join("missing.img"), false).is_err());
}

#[test]
fn test_directory_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let file = fs::File::open(dir.path()).unwrap();
    assert!(FileStore::from_file(file).is_err());
}

// =============================================================================
// I/O Tests
// =============================================================================

#[test]
fn test_read_at_short_at_end_of_file() {
    let (_tmp, store) = store_over(&[9u8; 1000]);
    let mut buf = [0u8; 512];
    assert_eq!(store.read_at(&mut buf, 512).unwrap(), 488);
    assert_eq!(store.read_at(&mut buf, 1000).unwrap(), 0);
}

#[test]
fn test_write_then_read() {
    let (_tmp, store) = store_over(&[0u8; 2048]);
    store.write_all_at(&[0x5Au8; 512], 1024).unwrap();
    store.sync().unwrap();

    let mut buf = [0u8; 1024];
    assert_eq!(store.read_at(&mut buf, 512).unwrap(), 1024);
    assert!(buf[..512].iter().all(|&b| b == 0));
    assert!(buf[512..].iter().all(|&b| b == 0x5A));
}

#[test]
fn test_vectored_io() {
    let (_tmp, store) = store_over(&[0u8; 2048]);
    let a = [1u8; 512];
    let b = [2u8; 1024];
    let n = store
        .write_vectored_at(&[IoSlice::new(&a), IoSlice::new(&b)], 512)
        .unwrap();
    assert_eq!(n, 1536);

    let mut x = [0u8; 1024];
    let mut y = [0u8; 1024];
    let n = store
        .read_vectored_at(&mut [IoSliceMut::new(&mut x), IoSliceMut::new(&mut y)], 0)
        .unwrap();
    assert_eq!(n, 2048);
    assert!(x[..512].iter().all(|&v| v == 0));
    assert!(x[512..].iter().all(|&v| v == 1));
    assert!(y.iter().all(|&v| v == 2));
}

#[test]
fn test_deallocate_reads_back_zero() {
    let (_tmp, store) = store_over(&[0xEEu8; 8192]);
    let limits = match store.discard_limits() {
        Some(limits) => limits,
        None => return,
    };
    assert!(limits.granularity > 0);

    for mode in [DeallocMode::PunchHole, DeallocMode::ZeroRange] {
        store.write_all_at(&[0xEEu8; 8192], 0).unwrap();
        match store.deallocate(mode, 4096, 4096) {
            Ok(()) => {}
            // Some filesystems cannot do this; nothing more to check
            Err(e) if e.kind() == std::io::ErrorKind::Unsupported => continue,
            Err(e) => panic!("deallocate failed: {}", e),
        }
        let mut buf = [0u8; 8192];
        store.read_at(&mut buf, 0).unwrap();
        assert!(buf[..4096].iter().all(|&b| b == 0xEE));
        assert!(buf[4096..].iter().all(|&b| b == 0));
        assert_eq!(store.size().unwrap(), 8192);
    }
}

// =============================================================================
// Geometry Tests
// =============================================================================

#[test]
fn test_exposed_size_law() {
    let cases: &[(u64, u64, Option<u64>, u32, u64)] = &[
        (4096, 0, None, 512, 4096),
        (4096, 1024, None, 512, 3072),
        (4096, 1024, Some(2048), 512, 2048),
        (4096, 1024, Some(8192), 512, 3072),
        (4096, 4096, None, 512, 0),
        (4096, 10_000, Some(512), 512, 0),
        (10_000, 0, None, 512, 9728),
        (10_000, 0, None, 4096, 8192),
        (10_000, 0, Some(1000), 512, 512),
    ];
    for &(store, offset, limit, bs, expected) in cases {
        assert_eq!(
            exposed_size(store, offset, limit, bs),
            expected,
            "store={} offset={} limit={:?} bs={}",
            store,
            offset,
            limit,
            bs
        );
    }
}

#[test]
fn test_block_size_range() {
    assert!(validate_block_size(512).is_ok());
    assert!(validate_block_size(4096).is_ok());
    assert!(validate_block_size(8192).is_err());
    assert!(validate_block_size(768).is_err());
}
