//! Configure parameters

use crate::backing::BackingRef;
use crate::transform::TransformId;

use super::{DeviceFlags, StatusUpdate};

/// Everything `configure` needs to bind a device
#[derive(Debug)]
pub struct LoopConfig {
    /// Store to expose
    pub backing: BackingRef,

    /// Logical block size, 0 to derive it from the backing store
    pub block_size: u32,

    /// Offset, limits, flags and transform
    pub info: StatusUpdate,
}

impl LoopConfig {
    /// Create a new config builder over `backing`
    pub fn builder(backing: BackingRef) -> LoopConfigBuilder {
        LoopConfigBuilder {
            config: LoopConfig {
                backing,
                block_size: 0,
                info: StatusUpdate::new(),
            },
        }
    }
}

/// Builder for LoopConfig
pub struct LoopConfigBuilder {
    config: LoopConfig,
}

impl LoopConfigBuilder {
    /// Set the byte offset into the backing store
    pub fn offset(mut self, offset: u64) -> Self {
        self.config.info.offset = offset;
        self
    }

    /// Cap the exposed size
    pub fn size_limit(mut self, limit: u64) -> Self {
        self.config.info.size_limit = Some(limit);
        self
    }

    /// Set the logical block size (power of two, 512..=4096)
    pub fn block_size(mut self, size: u32) -> Self {
        self.config.block_size = size;
        self
    }

    /// Replace the flag set
    pub fn flags(mut self, flags: DeviceFlags) -> Self {
        self.config.info.flags = flags;
        self
    }

    /// Add flags to the current set
    pub fn flag(mut self, flag: DeviceFlags) -> Self {
        self.config.info.flags |= flag;
        self
    }

    /// Select a transform and its key
    pub fn transform(mut self, id: TransformId, key: &[u8]) -> Self {
        self.config.info.transform = id;
        self.config.info.key = key.to_vec();
        self
    }

    /// Label the backing store
    pub fn file_name(mut self, name: impl Into<String>) -> Self {
        self.config.info.file_name = name.into();
        self
    }

    /// Label the transform
    pub fn crypt_name(mut self, name: impl Into<String>) -> Self {
        self.config.info.crypt_name = name.into();
        self
    }

    pub fn build(self) -> LoopConfig {
        self.config
    }
}
