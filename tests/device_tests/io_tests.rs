//! Tests for the device I/O path
//!
//! These tests verify:
//! - Reads and writes land at offset + position in the backing store
//! - Transformed data on disk and round-trips through the device
//! - Short reads past a shrunken store come back zero-filled
//! - Discard and write-zeroes, and their refusal under a transform
//! - Admission checks (alignment, capacity, read-only, unbound)
//! - The async direct path and tenant routing

use std::fs;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::BytesMut;
use tempfile::NamedTempFile;
use vloop::{
    BackingRef, Config, DeviceFlags, DeviceHandle, Engine, ErrorKind, IoRequest, LoopConfig,
    LoopError, TenantKey, TRANSFORM_XOR,
};

// =============================================================================
// Helper Functions
// =============================================================================

fn test_engine() -> Engine {
    let config = Config::builder()
        .initial_devices(0)
        .worker_threads(4)
        .build();
    Engine::new(config).unwrap()
}

fn zero_file(size: usize) -> NamedTempFile {
    let tmp = NamedTempFile::new().unwrap();
    fs::write(tmp.path(), vec![0u8; size]).unwrap();
    tmp
}

fn bind(engine: &Engine, config: LoopConfig) -> DeviceHandle {
    let id = engine.get_free().unwrap();
    let handle = engine.open(id, true).unwrap();
    handle.configure(config).unwrap();
    handle
}

fn read_raw(tmp: &NamedTempFile, pos: u64, len: usize) -> Vec<u8> {
    let file = fs::File::open(tmp.path()).unwrap();
    let mut buf = vec![0u8; len];
    file.read_exact_at(&mut buf, pos).unwrap();
    buf
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed)).collect()
}

// =============================================================================
// Basic Read/Write Tests
// =============================================================================

#[test]
fn test_write_lands_in_backing_file() {
    let engine = test_engine();
    let tmp = zero_file(1 << 20);
    let dev = bind(&engine, LoopConfig::builder(BackingRef::path(tmp.path())).build());

    dev.write(4096, &[0xAAu8; 8192]).unwrap();
    dev.flush().unwrap();

    let back = dev.read(4096, 8192).unwrap();
    assert!(back.iter().all(|&b| b == 0xAA));

    let raw = read_raw(&tmp, 0, 16384);
    assert!(raw[..4096].iter().all(|&b| b == 0));
    assert!(raw[4096..12288].iter().all(|&b| b == 0xAA));
    assert!(raw[12288..].iter().all(|&b| b == 0));
}

#[test]
fn test_overwrite_head_of_filled_image() {
    let engine = test_engine();
    let tmp = NamedTempFile::new().unwrap();
    fs::write(tmp.path(), vec![0xAAu8; 4096]).unwrap();
    let dev = bind(&engine, LoopConfig::builder(BackingRef::path(tmp.path())).build());

    let all = dev.read(0, 4096).unwrap();
    assert_eq!(all.len(), 4096);
    assert!(all.iter().all(|&b| b == 0xAA));

    dev.write(0, &[0u8; 512]).unwrap();
    assert!(dev.read(0, 512).unwrap().iter().all(|&b| b == 0));
    let rest = dev.read(512, 3584).unwrap();
    assert_eq!(rest.len(), 3584);
    assert!(rest.iter().all(|&b| b == 0xAA));
}

#[test]
fn test_offset_shifts_device_positions() {
    let engine = test_engine();
    let tmp = zero_file(16384);
    let dev = bind(
        &engine,
        LoopConfig::builder(BackingRef::path(tmp.path()))
            .offset(2048)
            .build(),
    );
    assert_eq!(dev.capacity(), 14336);

    let data = pattern(1024, 3);
    dev.write(512, &data).unwrap();
    dev.flush().unwrap();
    assert_eq!(read_raw(&tmp, 2560, 1024), data);
}

#[test]
fn test_multi_segment_requests() {
    let engine = test_engine();
    let tmp = zero_file(8192);
    let dev = bind(&engine, LoopConfig::builder(BackingRef::path(tmp.path())).build());

    let a = BytesMut::from(&pattern(512, 1)[..]);
    let b = BytesMut::from(&pattern(1024, 2)[..]);
    let written = dev
        .execute(IoRequest::write(1024, vec![a.clone(), b.clone()]))
        .result
        .unwrap();
    assert_eq!(written, 1536);

    let outcome = dev.execute(IoRequest::read_into(
        1024,
        vec![BytesMut::zeroed(1024), BytesMut::zeroed(512)],
    ));
    assert_eq!(outcome.result.unwrap(), 1536);
    assert_eq!(outcome.buffers.len(), 2);

    let mut expected = a.to_vec();
    expected.extend_from_slice(&b);
    let mut got = outcome.buffers[0].to_vec();
    got.extend_from_slice(&outcome.buffers[1]);
    assert_eq!(got, expected);
}

#[test]
fn test_async_submission_completes_once() {
    let engine = test_engine();
    let tmp = zero_file(65536);
    let dev = bind(&engine, LoopConfig::builder(BackingRef::path(tmp.path())).build());

    let completed = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = crossbeam::channel::unbounded();
    for i in 0..16u64 {
        let completed = completed.clone();
        let tx = tx.clone();
        dev.submit(IoRequest::write_from(i * 4096, &[i as u8; 4096]), move |outcome| {
            completed.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(outcome.result.is_ok());
        });
    }
    for _ in 0..16 {
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }
    assert_eq!(completed.load(Ordering::SeqCst), 16);
    assert_eq!(dev.in_flight(), 0);

    for i in 0..16u64 {
        let data = dev.read(i * 4096, 4096).unwrap();
        assert!(data.iter().all(|&b| b == i as u8));
    }
}

#[test]
fn test_concurrent_writers_from_threads() {
    let engine = test_engine();
    let tmp = zero_file(1 << 18);
    let dev = bind(&engine, LoopConfig::builder(BackingRef::path(tmp.path())).build());
    let device = dev.device().clone();

    let handles: Vec<_> = (0..4u64)
        .map(|t| {
            let device = device.clone();
            thread::spawn(move || {
                for i in 0..8u64 {
                    let offset = (t * 8 + i) * 4096;
                    let req = IoRequest::write_from(offset, &[(t * 8 + i) as u8; 4096])
                        .tenant(TenantKey::new(t + 1));
                    device.execute(req).result.unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    for n in 0..32u64 {
        let data = dev.read(n * 4096, 4096).unwrap();
        assert!(data.iter().all(|&b| b == n as u8), "block {} mismatch", n);
    }
}

// =============================================================================
// Short Read Tests
// =============================================================================

#[test]
fn test_short_read_is_zero_filled() {
    let engine = test_engine();
    let tmp = NamedTempFile::new().unwrap();
    fs::write(tmp.path(), vec![0x11u8; 8192]).unwrap();
    let dev = bind(&engine, LoopConfig::builder(BackingRef::path(tmp.path())).build());
    assert_eq!(dev.capacity(), 8192);

    // Shrink the store underneath the bound device
    let file = fs::OpenOptions::new().write(true).open(tmp.path()).unwrap();
    file.set_len(4096 + 100).unwrap();

    let data = dev.read(4096, 4096).unwrap();
    assert!(data[..100].iter().all(|&b| b == 0x11));
    assert!(data[100..].iter().all(|&b| b == 0));
}

#[test]
fn test_short_read_across_segments() {
    let engine = test_engine();
    let tmp = NamedTempFile::new().unwrap();
    fs::write(tmp.path(), vec![0x22u8; 4096]).unwrap();
    let dev = bind(&engine, LoopConfig::builder(BackingRef::path(tmp.path())).build());

    let file = fs::OpenOptions::new().write(true).open(tmp.path()).unwrap();
    file.set_len(700).unwrap();

    let outcome = dev.execute(IoRequest::read_into(
        0,
        vec![
            BytesMut::from(&[0xFFu8; 512][..]),
            BytesMut::from(&[0xFFu8; 512][..]),
            BytesMut::from(&[0xFFu8; 512][..]),
        ],
    ));
    assert_eq!(outcome.result.unwrap(), 1536);
    assert!(outcome.buffers[0].iter().all(|&b| b == 0x22));
    assert!(outcome.buffers[1][..188].iter().all(|&b| b == 0x22));
    assert!(outcome.buffers[1][188..].iter().all(|&b| b == 0));
    assert!(outcome.buffers[2].iter().all(|&b| b == 0));
}

#[test]
fn test_short_read_with_transform() {
    let engine = test_engine();
    let tmp = zero_file(4096);
    let dev = bind(
        &engine,
        LoopConfig::builder(BackingRef::path(tmp.path()))
            .transform(TRANSFORM_XOR, &[0x5A])
            .build(),
    );

    let file = fs::OpenOptions::new().write(true).open(tmp.path()).unwrap();
    file.set_len(1024).unwrap();

    let data = dev.read(512, 1024).unwrap();
    // Stored zeros decode to the key, bytes past the end stay zero
    assert!(data[..512].iter().all(|&b| b == 0x5A));
    assert!(data[512..].iter().all(|&b| b == 0));
}

// =============================================================================
// Transform Tests
// =============================================================================

#[test]
fn test_xor_data_on_disk() {
    let engine = test_engine();
    let tmp = zero_file(16384);
    let key = b"k3y!";
    let dev = bind(
        &engine,
        LoopConfig::builder(BackingRef::path(tmp.path()))
            .offset(512)
            .transform(TRANSFORM_XOR, key)
            .build(),
    );
    assert!(!dev.uses_direct_io());

    let plain = pattern(6000 - 6000 % 512, 9);
    dev.write(1024, &plain).unwrap();
    dev.flush().unwrap();

    let base = 512 + 1024;
    let raw = read_raw(&tmp, base, plain.len());
    for (i, (&stored, &p)) in raw.iter().zip(plain.iter()).enumerate() {
        let pos = base as usize + i;
        assert_eq!(stored, p ^ key[(pos & 511) % key.len()], "byte {}", pos);
    }

    let back = dev.read(1024, plain.len()).unwrap();
    assert_eq!(&back[..], &plain[..]);
}

#[test]
fn test_xor_larger_than_scratch_page() {
    let engine = test_engine();
    let tmp = zero_file(65536);
    let dev = bind(
        &engine,
        LoopConfig::builder(BackingRef::path(tmp.path()))
            .transform(TRANSFORM_XOR, b"0123456789")
            .build(),
    );

    let plain = pattern(20480, 42);
    dev.write(8192, &plain).unwrap();
    assert_eq!(&dev.read(8192, plain.len()).unwrap()[..], &plain[..]);
    assert_ne!(read_raw(&tmp, 8192, plain.len()), plain);
}

// =============================================================================
// Discard Tests
// =============================================================================

#[test]
fn test_discard_refused_under_transform() {
    let engine = test_engine();
    let tmp = zero_file(8192);
    let dev = bind(
        &engine,
        LoopConfig::builder(BackingRef::path(tmp.path()))
            .transform(TRANSFORM_XOR, b"k")
            .build(),
    );
    assert!(dev.discard_limits().is_none());

    let err = dev.discard(0, 4096).unwrap_err();
    assert!(matches!(err, LoopError::NotSupported(_)));
    assert_eq!(err.kind(), ErrorKind::NotSupported);

    let err = dev.write_zeroes(0, 4096, true).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotSupported);
}

#[test]
fn test_discard_reads_back_zero() {
    let engine = test_engine();
    let tmp = NamedTempFile::new().unwrap();
    fs::write(tmp.path(), vec![0x99u8; 32768]).unwrap();
    let dev = bind(&engine, LoopConfig::builder(BackingRef::path(tmp.path())).build());

    match dev.discard(8192, 8192) {
        Ok(()) => {}
        // Filesystem without hole punching
        Err(e) if e.kind() == ErrorKind::NotSupported => return,
        Err(e) => panic!("discard failed: {}", e),
    }
    let data = dev.read(0, 32768).unwrap();
    assert!(data[..8192].iter().all(|&b| b == 0x99));
    assert!(data[8192..16384].iter().all(|&b| b == 0));
    assert!(data[16384..].iter().all(|&b| b == 0x99));
    assert_eq!(fs::metadata(tmp.path()).unwrap().len(), 32768);
}

#[test]
fn test_write_zeroes_keeps_allocation() {
    let engine = test_engine();
    let tmp = NamedTempFile::new().unwrap();
    fs::write(tmp.path(), vec![0x44u8; 16384]).unwrap();
    let dev = bind(&engine, LoopConfig::builder(BackingRef::path(tmp.path())).build());

    for no_unmap in [true, false] {
        dev.write(0, &[0x44u8; 16384]).unwrap();
        match dev.write_zeroes(4096, 4096, no_unmap) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotSupported => continue,
            Err(e) => panic!("write_zeroes failed: {}", e),
        }
        let data = dev.read(0, 16384).unwrap();
        assert!(data[4096..8192].iter().all(|&b| b == 0));
        assert!(data[8192..].iter().all(|&b| b == 0x44));
    }
}

// =============================================================================
// Admission Tests
// =============================================================================

#[test]
fn test_misaligned_requests_rejected() {
    let engine = test_engine();
    let tmp = zero_file(8192);
    let dev = bind(&engine, LoopConfig::builder(BackingRef::path(tmp.path())).build());

    assert_eq!(dev.read(100, 512).unwrap_err().kind(), ErrorKind::InvalidArgument);
    assert_eq!(dev.read(0, 100).unwrap_err().kind(), ErrorKind::InvalidArgument);
    assert_eq!(
        dev.write(0, &[0u8; 700]).unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );

    // Every segment must be whole blocks, even if the total is
    let outcome = dev.execute(IoRequest::read_into(
        0,
        vec![BytesMut::zeroed(256), BytesMut::zeroed(256)],
    ));
    assert_eq!(outcome.result.unwrap_err().kind(), ErrorKind::InvalidArgument);
    assert_eq!(outcome.buffers.len(), 2);
}

#[test]
fn test_requests_beyond_capacity_rejected() {
    let engine = test_engine();
    let tmp = zero_file(8192);
    let dev = bind(&engine, LoopConfig::builder(BackingRef::path(tmp.path())).build());

    assert_eq!(dev.read(8192, 512).unwrap_err().kind(), ErrorKind::InvalidArgument);
    assert_eq!(dev.read(7680, 1024).unwrap_err().kind(), ErrorKind::InvalidArgument);
    assert!(dev.read(7680, 512).is_ok());
    assert_eq!(
        dev.discard(u64::MAX - 511, 512).unwrap_err().kind(),
        ErrorKind::InvalidArgument
    );
}

#[test]
fn test_write_to_read_only_device_fails() {
    let engine = test_engine();
    let tmp = zero_file(8192);
    let dev = bind(
        &engine,
        LoopConfig::builder(BackingRef::path(tmp.path()))
            .flag(DeviceFlags::READ_ONLY)
            .build(),
    );

    let err = dev.write(0, &[1u8; 512]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IoFailure);
    assert_eq!(dev.discard(0, 512).unwrap_err().kind(), ErrorKind::IoFailure);
    assert!(dev.read(0, 512).is_ok());
    assert!(dev.flush().is_ok());
    assert!(read_raw(&tmp, 0, 512).iter().all(|&b| b == 0));
}

#[test]
fn test_io_on_unbound_device_fails() {
    let engine = test_engine();
    let id = engine.get_free().unwrap();
    let handle = engine.open(id, true).unwrap();

    let outcome = handle.execute(IoRequest::read(0, 512));
    assert!(matches!(outcome.result, Err(LoopError::NotConfigured)));
    assert_eq!(outcome.buffers.len(), 1);
}

#[test]
fn test_io_after_clear_fails() {
    let engine = test_engine();
    let tmp = zero_file(8192);
    let dev = bind(&engine, LoopConfig::builder(BackingRef::path(tmp.path())).build());
    dev.clear().unwrap();
    assert!(matches!(dev.read(0, 512), Err(LoopError::NotConfigured)));
}

// =============================================================================
// Direct I/O Tests
// =============================================================================

#[test]
fn test_direct_path_round_trip() {
    let engine = test_engine();
    let tmp = zero_file(65536);
    let dev = bind(
        &engine,
        LoopConfig::builder(BackingRef::path(tmp.path()))
            .flag(DeviceFlags::DIRECT_IO)
            .build(),
    );
    assert!(dev.uses_direct_io());

    let a = BytesMut::from(&pattern(4096, 5)[..]);
    let b = BytesMut::from(&pattern(8192, 6)[..]);
    let written = dev
        .execute(IoRequest::write(4096, vec![a.clone(), b.clone()]))
        .result
        .unwrap();
    assert_eq!(written, 12288);
    dev.flush().unwrap();

    let back = dev.read(4096, 12288).unwrap();
    assert_eq!(&back[..4096], &a[..]);
    assert_eq!(&back[4096..], &b[..]);
    assert_eq!(read_raw(&tmp, 4096, 4096), a.to_vec());
}

#[test]
fn test_direct_path_past_end_of_store() {
    let engine = test_engine();
    let tmp = NamedTempFile::new().unwrap();
    fs::write(tmp.path(), vec![0x33u8; 8192]).unwrap();
    let dev = bind(
        &engine,
        LoopConfig::builder(BackingRef::path(tmp.path()))
            .flag(DeviceFlags::DIRECT_IO)
            .build(),
    );

    let file = fs::OpenOptions::new().write(true).open(tmp.path()).unwrap();
    file.set_len(4096).unwrap();

    // The pass that moves nothing fails the command, buffer zeroed past the data
    let outcome = dev.execute(IoRequest::read(0, 8192));
    assert_eq!(outcome.result.unwrap_err().kind(), ErrorKind::IoFailure);
    let data = &outcome.buffers[0];
    assert!(data[..4096].iter().all(|&b| b == 0x33));
    assert!(data[4096..].iter().all(|&b| b == 0));
}

#[test]
fn test_direct_path_switch_while_bound() {
    let engine = test_engine();
    let tmp = zero_file(16384);
    let dev = bind(&engine, LoopConfig::builder(BackingRef::path(tmp.path())).build());

    dev.write(0, &[7u8; 4096]).unwrap();
    dev.set_direct_io(true).unwrap();
    assert!(dev.read(0, 4096).unwrap().iter().all(|&b| b == 7));
    dev.write(4096, &[8u8; 4096]).unwrap();
    dev.set_direct_io(false).unwrap();
    assert!(dev.read(4096, 4096).unwrap().iter().all(|&b| b == 8));
}

// =============================================================================
// Tenant Routing Tests
// =============================================================================

#[test]
fn test_tenant_requests_get_their_own_worker() {
    let engine = test_engine();
    let tmp = zero_file(8192);
    let dev = bind(&engine, LoopConfig::builder(BackingRef::path(tmp.path())).build());

    let tenant = TenantKey::new(42);
    dev.execute(IoRequest::read(0, 512).tenant(tenant)).result.unwrap();
    assert!(dev.has_tenant_worker(tenant));
    assert!(!dev.has_tenant_worker(TenantKey::new(43)));

    // Untagged requests run on the root queue
    dev.read(0, 512).unwrap();
    let stats = dev.worker_stats().unwrap();
    assert_eq!(stats.tenants, 1);
    assert_eq!(stats.created, 1);
}

#[test]
fn test_idle_tenant_worker_is_reaped() {
    let config = Config::builder()
        .initial_devices(0)
        .worker_threads(2)
        .idle_worker_timeout(Duration::from_millis(50))
        .build();
    let engine = Engine::new(config).unwrap();
    let tmp = zero_file(8192);
    let dev = bind(&engine, LoopConfig::builder(BackingRef::path(tmp.path())).build());

    let tenant = TenantKey::new(9);
    dev.execute(IoRequest::read(0, 512).tenant(tenant)).result.unwrap();

    let mut reaped = false;
    for _ in 0..200 {
        if !dev.has_tenant_worker(tenant) {
            reaped = true;
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert!(reaped, "idle worker was never reaped");
    assert_eq!(dev.worker_stats().unwrap().evicted, 1);

    // A returning tenant gets a fresh worker
    dev.execute(IoRequest::read(0, 512).tenant(tenant)).result.unwrap();
    assert_eq!(dev.worker_stats().unwrap().created, 2);
}

#[test]
fn test_tenant_cap_degrades_to_root() {
    let config = Config::builder()
        .initial_devices(0)
        .max_tenant_workers(1)
        .build();
    let engine = Engine::new(config).unwrap();
    let tmp = zero_file(8192);
    let dev = bind(&engine, LoopConfig::builder(BackingRef::path(tmp.path())).build());

    dev.execute(IoRequest::read(0, 512).tenant(TenantKey::new(1))).result.unwrap();
    dev.execute(IoRequest::read(0, 512).tenant(TenantKey::new(2))).result.unwrap();

    let stats = dev.worker_stats().unwrap();
    assert_eq!(stats.tenants, 1);
    assert_eq!(stats.degraded, 1);
    assert!(!dev.has_tenant_worker(TenantKey::new(2)));
}
