//! XOR transform
//!
//! The legacy loop "cipher": every byte is XORed with the key, the key
//! restarting at each 512-byte sector boundary.

use std::io;

use crate::error::{LoopError, Result};

use super::{Transform, TransformId, MAX_KEY_SIZE, TRANSFORM_XOR};

const SECTOR_MASK: u64 = 511;

/// XOR stream transform. The key is wiped on drop.
#[derive(Debug)]
pub struct XorTransform {
    key: Vec<u8>,
}

impl XorTransform {
    /// Create a transform for `key` (1..=32 bytes)
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.is_empty() {
            return Err(LoopError::invalid("xor transform requires a key"));
        }
        if key.len() > MAX_KEY_SIZE {
            return Err(LoopError::invalid(format!(
                "key size {} exceeds {}",
                key.len(),
                MAX_KEY_SIZE
            )));
        }
        Ok(Self { key: key.to_vec() })
    }

    fn apply(&self, src: &[u8], dst: &mut [u8], pos: u64) -> io::Result<()> {
        if src.len() != dst.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "xor transform needs equal-length buffers",
            ));
        }
        let keysize = self.key.len() as u64;
        for (i, (out, inp)) in dst.iter_mut().zip(src).enumerate() {
            let p = pos + i as u64;
            *out = *inp ^ self.key[((p & SECTOR_MASK) % keysize) as usize];
        }
        Ok(())
    }
}

impl Transform for XorTransform {
    fn id(&self) -> TransformId {
        TRANSFORM_XOR
    }

    fn encode(&self, src: &[u8], dst: &mut [u8], pos: u64) -> io::Result<()> {
        self.apply(src, dst, pos)
    }

    fn decode(&self, src: &[u8], dst: &mut [u8], pos: u64) -> io::Result<()> {
        self.apply(src, dst, pos)
    }

    fn release(&mut self) -> io::Result<()> {
        self.key.fill(0);
        Ok(())
    }
}

impl Drop for XorTransform {
    fn drop(&mut self) {
        self.key.fill(0);
    }
}
