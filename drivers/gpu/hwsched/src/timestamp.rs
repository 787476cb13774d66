//! # Timestamps
//!
//! Per-context 32-bit timestamps wrap around, so ordering is decided with
//! a half-range window rather than a plain integer compare.

use core::cmp::Ordering;

/// Half of the timestamp space; differences at or beyond this wrap
pub const TIMESTAMP_WINDOW: u32 = 0x8000_0000;

/// Compare two timestamps allowing for wraparound
pub fn timestamp_cmp(a: u32, b: u32) -> Ordering {
    if a == b {
        return Ordering::Equal;
    }

    if a > b && a - b < TIMESTAMP_WINDOW {
        return Ordering::Greater;
    }

    let a = a.wrapping_add(TIMESTAMP_WINDOW);
    let b = b.wrapping_add(TIMESTAMP_WINDOW);
    if a > b && a - b <= TIMESTAMP_WINDOW {
        Ordering::Greater
    } else {
        Ordering::Less
    }
}

/// Whether `timestamp` has been reached by the `retired` watermark
#[inline]
pub fn timestamp_reached(timestamp: u32, retired: u32) -> bool {
    timestamp_cmp(timestamp, retired) != Ordering::Greater
}
