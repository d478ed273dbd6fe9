//! Packed-offset computation.
//!
//! The offset of a fixed property inside a packed buffer is the summed
//! width of every set property with a lower index: a popcount over the
//! presence mask, weighted by the width table.
//!
//! [`weighted_popcount`] is the reference. [`weighted_popcount_lanes`]
//! expands each mask byte into eight byte lanes, masks the packed width
//! lanes with them, and sums the lanes; it must agree with the reference
//! for every mask. The `lane-offsets` feature makes [`packed_offset`] use
//! the lane kernel.

use crate::schema::FieldWidths;

/// For each mask byte, a `u64` whose byte lane `j` is `0xFF` when bit `j`
/// is set.
static LANE_SELECT: [u64; 256] = build_lane_select();

const fn build_lane_select() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut byte = 0;
    while byte < 256 {
        let mut lanes = 0u64;
        let mut bit = 0;
        while bit < 8 {
            if byte & (1 << bit) != 0 {
                lanes |= 0xFF << (bit * 8);
            }
            bit += 1;
        }
        table[byte] = lanes;
        byte += 1;
    }
    table
}

/// Sum of `widths[i]` over every bit `i` set in `mask`.
pub fn weighted_popcount(mask: u64, widths: &FieldWidths) -> u32 {
    let table = widths.as_array();
    let mut rest = mask;
    let mut total = 0u32;
    while rest != 0 {
        let index = rest.trailing_zeros() as usize;
        total += table[index] as u32;
        rest &= rest - 1;
    }
    total
}

/// Same result as [`weighted_popcount`], computed eight lanes at a time.
pub fn weighted_popcount_lanes(mask: u64, widths: &FieldWidths) -> u32 {
    const LOW_BYTES: u64 = 0x00FF_00FF_00FF_00FF;
    const SUM_16: u64 = 0x0001_0001_0001_0001;

    let mut total = 0u32;
    for (group, &packed) in widths.lanes().iter().enumerate() {
        let byte = (mask >> (group * 8)) as u8;
        if byte == 0 {
            continue;
        }
        let selected = packed & LANE_SELECT[byte as usize];
        // Fold byte lanes into 16-bit lanes, then sum those in the top lane.
        let pairs = (selected & LOW_BYTES) + ((selected >> 8) & LOW_BYTES);
        total += (pairs.wrapping_mul(SUM_16) >> 48) as u32;
    }
    total
}

/// Offset of property `index` in a buffer packed according to `mask`.
///
/// Only bits below `index` count, whether or not `index` itself is set.
pub fn packed_offset(mask: u64, index: u8, widths: &FieldWidths) -> u32 {
    let below = match index {
        0 => 0,
        i if i >= 64 => mask,
        i => mask & ((1u64 << i) - 1),
    };
    #[cfg(feature = "lane-offsets")]
    {
        weighted_popcount_lanes(below, widths)
    }
    #[cfg(not(feature = "lane-offsets"))]
    {
        weighted_popcount(below, widths)
    }
}
