//! Size and block-size arithmetic

use crate::error::{LoopError, Result};

/// Unit the host addresses a device in
pub const SECTOR_SIZE: u64 = 512;

/// Smallest and largest logical block sizes a device may use
pub const MIN_BLOCK_SIZE: u32 = 512;
pub const MAX_BLOCK_SIZE: u32 = 4096;

/// Bytes a device exposes over a store of `store_size` bytes.
///
/// `min(limit, store_size - offset)`, zero when the offset lies past the end,
/// rounded down to whole blocks of `block_size`.
pub fn exposed_size(store_size: u64, offset: u64, limit: Option<u64>, block_size: u32) -> u64 {
    let available = store_size.saturating_sub(offset);
    let size = match limit {
        Some(limit) => available.min(limit),
        None => available,
    };
    let unit = u64::from(block_size.max(MIN_BLOCK_SIZE));
    size - size % unit
}

/// Check a requested logical block size
pub fn validate_block_size(size: u32) -> Result<()> {
    if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&size) || !size.is_power_of_two() {
        return Err(LoopError::invalid(format!(
            "block size {} is not a power of two in {}..={}",
            size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
        )));
    }
    Ok(())
}

/// Offsets and limits travel as signed 64-bit values in the status record
pub fn validate_range(offset: u64, limit: Option<u64>) -> Result<()> {
    if offset > i64::MAX as u64 || limit.map_or(false, |l| l > i64::MAX as u64) {
        return Err(LoopError::invalid("offset or size limit overflows"));
    }
    Ok(())
}
