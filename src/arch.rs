use crate::result::*;

/// A checked cast to usize
///
/// Every field we read is at most 32 bits,
/// but sums of them can still overflow a 32-bit address space.
pub fn usize<I: Into<u64>>(i: I) -> ZipResult<usize> {
    usize::try_from(i.into()).map_err(|_| ZipError::InsufficientAddressSpace)
}
