//! Status records
//!
//! `DeviceStatus` is what `get_status` reports; `StatusUpdate` is what
//! `configure` and `set_status` consume.

use crate::backing::BackingIdentity;
use crate::transform::{TransformId, TRANSFORM_NONE};

use super::{DeviceFlags, DeviceId};

/// Labels are stored NUL-terminated in a 64 byte field, so at most 63
/// bytes survive.
pub const NAME_SIZE: usize = 64;

/// Identity of whoever issues a control operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub uid: u32,
    pub privileged: bool,
}

impl Caller {
    /// Administrator caller (uid 0, privileged)
    pub fn admin() -> Self {
        Self {
            uid: 0,
            privileged: true,
        }
    }

    /// Unprivileged caller with the given uid
    pub fn user(uid: u32) -> Self {
        Self {
            uid,
            privileged: false,
        }
    }
}

impl Default for Caller {
    fn default() -> Self {
        Self::admin()
    }
}

/// Settable part of a device's configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusUpdate {
    /// Byte offset into the backing store
    pub offset: u64,

    /// Cap on the exposed size, `None` for "whole store"
    pub size_limit: Option<u64>,

    pub flags: DeviceFlags,

    /// Transform id (see [`crate::transform`])
    pub transform: TransformId,

    /// Transform key, at most [`crate::transform::MAX_KEY_SIZE`] bytes
    pub key: Vec<u8>,

    /// Free-form label for the backing store
    pub file_name: String,

    /// Free-form label for the transform
    pub crypt_name: String,
}

impl StatusUpdate {
    pub fn new() -> Self {
        Self {
            transform: TRANSFORM_NONE,
            ..Self::default()
        }
    }
}

/// Snapshot of a bound device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStatus {
    pub number: DeviceId,
    pub offset: u64,
    pub size_limit: Option<u64>,
    pub flags: DeviceFlags,
    pub transform: TransformId,
    pub key_size: usize,
    /// Key bytes, only reported to privileged callers
    pub key: Option<Vec<u8>>,
    pub file_name: String,
    pub crypt_name: String,
    pub block_size: u32,
    /// Exposed size in bytes
    pub capacity: u64,
    pub backing: BackingIdentity,
}

impl DeviceStatus {
    /// Turn a snapshot back into an update, for read-modify-write callers.
    /// The key is carried over only if it was visible.
    pub fn to_update(&self) -> StatusUpdate {
        StatusUpdate {
            offset: self.offset,
            size_limit: self.size_limit,
            flags: self.flags,
            transform: self.transform,
            key: self.key.clone().unwrap_or_default(),
            file_name: self.file_name.clone(),
            crypt_name: self.crypt_name.clone(),
        }
    }
}

/// Truncate a label to what fits a `NAME_SIZE` field, on a char boundary
pub(crate) fn truncate_label(label: &str) -> String {
    if label.len() < NAME_SIZE {
        return label.to_string();
    }
    let mut end = NAME_SIZE - 1;
    while !label.is_char_boundary(end) {
        end -= 1;
    }
    label[..end].to_string()
}
