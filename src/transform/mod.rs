//! Transform Module
//!
//! Reversible byte transforms applied to everything a device stores.
//!
//! ## Responsibilities
//! - Define the `Transform` plugin interface (encode/decode/release)
//! - Provide the built-in identity and XOR transforms
//! - Map transform ids to factories (`TransformRegistry`)
//!
//! ## Data Flow
//! ```text
//!   caller buffer ──encode(pos)──▶ scratch ──▶ backing store     (write)
//!   backing store ──▶ scratch ──decode(pos)──▶ caller buffer     (read)
//! ```
//!
//! `pos` is the absolute device byte position of the first byte, so a
//! transform may key its stream on position without caring how a command
//! was split into segments.

mod registry;
mod xor;

use std::fmt;
use std::io;

pub use registry::{ActiveTransform, TransformFactory, TransformRegistry};
pub use xor::XorTransform;

/// Small integer identifying a transform implementation
pub type TransformId = u32;

/// Identity (no transform)
pub const TRANSFORM_NONE: TransformId = 0;

/// Legacy XOR stream cipher
pub const TRANSFORM_XOR: TransformId = 1;

/// Largest key a transform may be configured with
pub const MAX_KEY_SIZE: usize = 32;

/// A reversible byte transform bound to one device.
///
/// `src` and `dst` always have the same length.
pub trait Transform: Send + Sync + fmt::Debug {
    /// Registry id of this transform
    fn id(&self) -> TransformId;

    /// Plaintext to stored form
    fn encode(&self, src: &[u8], dst: &mut [u8], pos: u64) -> io::Result<()>;

    /// Stored form to plaintext
    fn decode(&self, src: &[u8], dst: &mut [u8], pos: u64) -> io::Result<()>;

    /// Release any state captured at init. Called once, on unbind.
    fn release(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// True for the pass-through transform
    fn is_identity(&self) -> bool {
        false
    }
}

/// Pass-through transform
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTransform;

impl Transform for IdentityTransform {
    fn id(&self) -> TransformId {
        TRANSFORM_NONE
    }

    fn encode(&self, src: &[u8], dst: &mut [u8], _pos: u64) -> io::Result<()> {
        dst.copy_from_slice(src);
        Ok(())
    }

    fn decode(&self, src: &[u8], dst: &mut [u8], _pos: u64) -> io::Result<()> {
        dst.copy_from_slice(src);
        Ok(())
    }

    fn is_identity(&self) -> bool {
        true
    }
}
