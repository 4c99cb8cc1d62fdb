use crate::result::*;

/// A checked cast from the container's size fields to usize
///
/// Sizes are at most 32 bits on disk,
/// but file offsets we compute from them are 64.
pub fn usize<I: Into<u64>>(i: I) -> DatapackResult<usize> {
    let i: u64 = i.into();
    if cfg!(target_pointer_width = "64") {
        Ok(i as usize)
    } else if i > usize::MAX as u64 {
        Err(DatapackError::InsufficientAddressSpace)
    } else {
        Ok(i as usize)
    }
}
