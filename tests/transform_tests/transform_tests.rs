//! Tests for transforms
//!
//! These tests verify:
//! - Encode/decode round-trips for the built-in transforms
//! - The XOR keystream restarts at every 512 byte boundary
//! - Key validation
//! - Registry registration, lookup and in-use protection

use std::sync::Arc;

use vloop::transform::{
    IdentityTransform, Transform, TransformFactory, TransformRegistry, XorTransform, MAX_KEY_SIZE,
    TRANSFORM_NONE, TRANSFORM_XOR,
};
use vloop::{ErrorKind, LoopError};

// =============================================================================
// Helper Functions
// =============================================================================

fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + 7) as u8).collect()
}

fn alias_factory(key: &[u8]) -> vloop::Result<Box<dyn Transform>> {
    Ok(Box::new(XorTransform::new(key)?))
}

// =============================================================================
// Round-trip Tests
// =============================================================================

#[test]
fn test_xor_round_trip_at_various_positions() {
    let xor = XorTransform::new(b"secret-key").unwrap();
    let plain = sample(1500);

    for pos in [0u64, 1, 511, 512, 4096 + 3, 1 << 40] {
        let mut stored = vec![0u8; plain.len()];
        let mut back = vec![0u8; plain.len()];
        xor.encode(&plain, &mut stored, pos).unwrap();
        assert_ne!(stored, plain);
        xor.decode(&stored, &mut back, pos).unwrap();
        assert_eq!(back, plain, "round trip failed at pos {}", pos);
    }
}

#[test]
fn test_identity_round_trip() {
    let id = IdentityTransform;
    let plain = sample(700);
    let mut out = vec![0u8; plain.len()];
    id.encode(&plain, &mut out, 99).unwrap();
    assert_eq!(out, plain);
    assert!(id.is_identity());
    assert_eq!(id.id(), TRANSFORM_NONE);
}

// =============================================================================
// Keystream Tests
// =============================================================================

#[test]
fn test_xor_keystream_restarts_each_sector() {
    let key = b"abc";
    let xor = XorTransform::new(key).unwrap();
    let zeros = vec![0u8; 1024];
    let mut stream = vec![0u8; 1024];
    xor.encode(&zeros, &mut stream, 0).unwrap();

    for (p, &b) in stream.iter().enumerate() {
        assert_eq!(b, key[(p & 511) % key.len()]);
    }
    // Second sector starts with key[0] again even though 512 % 3 != 0
    assert_eq!(stream[512], b'a');
    assert_eq!(stream[511], key[511 % 3]);
}

#[test]
fn test_xor_split_encoding_matches_whole() {
    let xor = XorTransform::new(b"K").unwrap();
    let plain = sample(2048);

    let mut whole = vec![0u8; plain.len()];
    xor.encode(&plain, &mut whole, 8192).unwrap();

    let mut split = vec![0u8; plain.len()];
    let (a, b) = split.split_at_mut(700);
    xor.encode(&plain[..700], a, 8192).unwrap();
    xor.encode(&plain[700..], b, 8192 + 700).unwrap();

    assert_eq!(whole, split);
}

#[test]
fn test_xor_rejects_mismatched_buffers() {
    let xor = XorTransform::new(b"K").unwrap();
    let mut dst = vec![0u8; 10];
    assert!(xor.encode(&[1u8; 11], &mut dst, 0).is_err());
}

// =============================================================================
// Key Validation Tests
// =============================================================================

#[test]
fn test_xor_key_validation() {
    assert!(matches!(XorTransform::new(b""), Err(LoopError::InvalidArgument(_))));
    assert!(XorTransform::new(&[1u8; MAX_KEY_SIZE]).is_ok());
    assert!(XorTransform::new(&[1u8; MAX_KEY_SIZE + 1]).is_err());
}

#[test]
fn test_registry_rejects_oversized_key_and_unknown_id() {
    let registry = TransformRegistry::new();
    let err = registry.create(TRANSFORM_XOR, &[0u8; 33]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let err = registry.create(42, b"k").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

// =============================================================================
// Registry Tests
// =============================================================================

#[test]
fn test_registry_builtins() {
    let registry = TransformRegistry::new();
    assert_eq!(registry.name(TRANSFORM_NONE).as_deref(), Some("none"));
    assert_eq!(registry.name(TRANSFORM_XOR).as_deref(), Some("xor"));
    assert!(registry.create(TRANSFORM_NONE, b"").unwrap().is_none());

    let active = registry.create(TRANSFORM_XOR, b"K").unwrap().unwrap();
    assert_eq!(active.id(), TRANSFORM_XOR);
    assert_eq!(active.name(), "xor");
}

#[test]
fn test_registry_builtins_cannot_be_unregistered() {
    let registry = TransformRegistry::new();
    assert!(matches!(
        registry.unregister(TRANSFORM_XOR),
        Err(LoopError::InvalidArgument(_))
    ));
    assert!(registry.unregister(TRANSFORM_NONE).is_err());
}

#[test]
fn test_registry_custom_transform_in_use_is_busy() {
    let registry = TransformRegistry::new();
    let factory: TransformFactory = Arc::new(alias_factory);

    registry.register(7, "xor-alias", factory.clone()).unwrap();
    assert!(matches!(registry.register(7, "again", factory), Err(LoopError::Busy)));
    assert_eq!(registry.name(7).as_deref(), Some("xor-alias"));

    let active = registry.create(7, b"key").unwrap().unwrap();
    assert!(matches!(registry.unregister(7), Err(LoopError::Busy)));

    drop(active);
    registry.unregister(7).unwrap();
    assert!(registry.name(7).is_none());
    assert!(registry.create(7, b"key").is_err());
}
