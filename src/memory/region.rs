//! Region-size codec.
//!
//! The ARMv7-M MPU describes a region by a 5-bit SIZE field: a field value
//! of `n` selects a region of `2^(n+1)` bytes, and the region base must be
//! aligned to that full size. The kernel asks for
//! [`region_encoding`]`(size)` as the SIZE field, which makes the programmed
//! region `alignment_for(size)` bytes long and based at an allocation with
//! that same alignment.

/// Smallest SIZE field the hardware accepts (32-byte region).
pub const MIN_REGION_BITS: u8 = 4;

/// Largest SIZE field the hardware accepts (4 GiB region).
pub const MAX_REGION_BITS: u8 = 31;

/// Smallest `bits` with `2^bits >= size`, clamped to the SIZE field range.
pub const fn region_encoding(size: usize) -> u8 {
    let bits = if size <= 1 {
        0
    } else {
        usize::BITS - (size - 1).leading_zeros()
    };
    if bits < MIN_REGION_BITS as u32 {
        MIN_REGION_BITS
    } else if bits > MAX_REGION_BITS as u32 {
        MAX_REGION_BITS
    } else {
        bits as u8
    }
}

/// Base alignment required for a region encoding `size`.
///
/// Saturates to `usize::MAX` (not a power of two, so the allocator rejects
/// it) when the region is too large for the address width.
pub const fn alignment_for(size: usize) -> usize {
    match 1usize.checked_shl(region_encoding(size) as u32 + 1) {
        Some(alignment) => alignment,
        None => usize::MAX,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn five_thousand_bytes() {
        assert_eq!(region_encoding(5000), 13);
        assert_eq!(alignment_for(5000), 16384);
    }

    #[test]
    fn exact_powers_of_two_keep_their_exponent() {
        assert_eq!(region_encoding(1024), 10);
        assert_eq!(region_encoding(1025), 11);
        assert_eq!(alignment_for(1024), 2048);
        assert_eq!(region_encoding(8192), 13);
    }

    #[test]
    fn tiny_sizes_clamp_to_hardware_minimum() {
        assert_eq!(region_encoding(0), MIN_REGION_BITS);
        assert_eq!(region_encoding(1), MIN_REGION_BITS);
        assert_eq!(region_encoding(16), MIN_REGION_BITS);
        assert_eq!(region_encoding(17), 5);
        assert_eq!(alignment_for(1), 32);
    }

    #[quickcheck]
    fn encoding_is_smallest_covering_power(size: u32) -> bool {
        let size = (size >> 1) as usize;
        let bits = u32::from(region_encoding(size));
        let covers = (1u64 << bits) >= size as u64;
        let smallest = bits == u32::from(MIN_REGION_BITS) || (1u64 << (bits - 1)) < size as u64;
        covers && smallest
    }
}
