//! Segment layout for one transport pairing.
//!
//! A segment holds exactly two rings: ring A (host → coprocessor) and
//! ring B (coprocessor → host). Each side uses one as outbound and the
//! other as inbound. All offsets are 64-byte aligned.

use crate::msg::MSG_SIZE;
use crate::ring::RING_HEADER_SIZE;

/// Round `v` up to the next multiple of 64.
#[inline]
const fn align64(v: usize) -> usize {
    (v + 63) & !63
}

/// Byte offsets of the two rings within a segment.
#[derive(Debug, Clone, Copy)]
pub struct SegmentLayout {
    /// Header of the host → coprocessor ring.
    pub ring_a_header: usize,
    /// Header of the coprocessor → host ring.
    pub ring_b_header: usize,
    /// Total segment size in bytes.
    pub total: usize,
}

impl SegmentLayout {
    /// Compute the layout for rings of `capacity` records each.
    ///
    /// Returns an error string when the arithmetic would overflow.
    pub fn calculate_checked(capacity: u32) -> Result<Self, &'static str> {
        Self::calculate_inner(capacity as usize)
    }

    fn calculate_inner(capacity: usize) -> Result<Self, &'static str> {
        let slots_size = capacity
            .checked_mul(MSG_SIZE)
            .ok_or("segment size overflow (slots)")?;
        let ring_size = RING_HEADER_SIZE
            .checked_add(slots_size)
            .map(align64)
            .ok_or("segment size overflow (ring)")?;

        let ring_a_header = 0usize;
        let ring_b_header = ring_size;
        let total = ring_size
            .checked_mul(2)
            .ok_or("segment size overflow (total)")?;

        Ok(Self {
            ring_a_header,
            ring_b_header,
            total,
        })
    }

    /// Compute the layout, panicking on overflow.
    pub fn calculate(capacity: u32) -> Self {
        Self::calculate_checked(capacity).expect("segment layout overflow")
    }
}
