//! Circular message queue in shared memory.
//!
//! One queue per direction. Indices are free-running `u32` counters: the
//! write index is mutated only by the producing processor, the read index
//! only by the consuming one, and both are visible to the remote side.
//! The active slot is `index & (capacity - 1)`; capacity is a power of two.
//!
//! Invariant: `wr - rd <= capacity` (wrapping arithmetic) at all times.

use std::mem::size_of;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::msg::{Msg, MSG_SIZE};
use crate::region::Region;

/// Ring header size in bytes (three cache lines).
pub const RING_HEADER_SIZE: usize = 192;

/// Shared ring header. Each index sits on its own cache line so the two
/// processors never write the same line.
#[repr(C)]
pub struct RingHeader {
    /// Write index (mutated only by the producer, read by the consumer).
    wr: AtomicU32,
    _pad1: [u8; 60],

    /// Read index (mutated only by the consumer, read by the producer).
    rd: AtomicU32,
    _pad2: [u8; 60],

    /// Slot count (power of two, immutable after init).
    capacity: u32,
    _pad3: [u8; 60],
}

const _: () = assert!(size_of::<RingHeader>() == RING_HEADER_SIZE);

impl RingHeader {
    /// Initialize a fresh header.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or not a power of two.
    pub fn init(&mut self, capacity: u32) {
        assert!(
            capacity.is_power_of_two(),
            "ring capacity must be a power of two"
        );
        self.wr = AtomicU32::new(0);
        self._pad1 = [0; 60];
        self.rd = AtomicU32::new(0);
        self._pad2 = [0; 60];
        self.capacity = capacity;
        self._pad3 = [0; 60];
    }

    #[inline]
    fn mask(&self) -> u32 {
        self.capacity - 1
    }
}

/// Error returned when the ring is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingFull;

/// Snapshot of ring indices for diagnostics and invariant checks.
#[derive(Debug, Clone, Copy)]
pub struct RingStatus {
    /// Free-running write index.
    pub wr: u32,
    /// Free-running read index.
    pub rd: u32,
    /// Slot count.
    pub capacity: u32,
    /// Records currently queued (`wr - rd`, wrapping).
    pub len: u32,
}

/// A view onto one circular queue in a shared region.
///
/// Records are stored in the bit-exact wire encoding so both ends agree on
/// layout regardless of compiler padding.
pub struct MsgRing {
    header: *mut RingHeader,
    slots: *mut [u8; MSG_SIZE],
}

// SAFETY: the ring points into shared memory synchronized via the header
// atomics; producer/consumer exclusivity is enforced by the transport.
unsafe impl Send for MsgRing {}
unsafe impl Sync for MsgRing {}

impl MsgRing {
    /// Create a ring view from raw pointers.
    ///
    /// # Safety
    ///
    /// - `header` must point to a valid, initialized `RingHeader`
    /// - `slots` must point to `capacity` records immediately usable as
    ///   `[u8; MSG_SIZE]`
    /// - the memory must remain valid for the lifetime of this ring
    pub unsafe fn from_raw(header: *mut RingHeader, slots: *mut [u8; MSG_SIZE]) -> Self {
        Self { header, slots }
    }

    /// Initialize a new ring inside `region` and return a view of it.
    ///
    /// # Safety
    ///
    /// The region must be writable, exclusively owned during initialization,
    /// and large enough for the header plus `capacity` slots at
    /// `header_off` (64-byte aligned).
    pub unsafe fn init(region: Region, header_off: usize, capacity: u32) -> Self {
        assert!(header_off % 64 == 0, "header offset must be 64-byte aligned");
        let slots_off = header_off + RING_HEADER_SIZE;
        let required = slots_off + capacity as usize * MSG_SIZE;
        assert!(required <= region.len(), "region too small for ring");

        let header = region.offset(header_off) as *mut RingHeader;
        // SAFETY: bounds asserted above; exclusivity guaranteed by caller.
        unsafe { (*header).init(capacity) };

        let slots = region.offset(slots_off) as *mut [u8; MSG_SIZE];
        // SAFETY: pointers computed from the validated region.
        unsafe { Self::from_raw(header, slots) }
    }

    /// Attach to an already-initialized ring inside `region`.
    ///
    /// # Safety
    ///
    /// The region must contain a valid ring header at `header_off`,
    /// initialized by the other side.
    pub unsafe fn attach(region: Region, header_off: usize) -> Self {
        assert!(header_off % 64 == 0, "header offset must be 64-byte aligned");
        let header = region.offset(header_off) as *mut RingHeader;
        // SAFETY: caller guarantees an initialized header.
        let capacity = unsafe { (*header).capacity };
        assert!(
            capacity.is_power_of_two(),
            "attached ring has invalid capacity"
        );

        let slots_off = header_off + RING_HEADER_SIZE;
        let required = slots_off + capacity as usize * MSG_SIZE;
        assert!(required <= region.len(), "region too small for ring");

        let slots = region.offset(slots_off) as *mut [u8; MSG_SIZE];
        // SAFETY: pointers computed from the validated region.
        unsafe { Self::from_raw(header, slots) }
    }

    #[inline]
    fn header(&self) -> &RingHeader {
        // SAFETY: validity guaranteed at construction.
        unsafe { &*self.header }
    }

    #[inline]
    unsafe fn slot_ptr(&self, slot: usize) -> *mut [u8; MSG_SIZE] {
        // SAFETY: caller guarantees slot < capacity.
        unsafe { self.slots.add(slot) }
    }

    /// Enqueue a record (producer side only).
    ///
    /// The payload write becomes visible to the remote before the index
    /// update: the `Release` store of `wr` publishes the slot contents.
    pub fn enqueue(&self, msg: &Msg) -> Result<(), RingFull> {
        let header = self.header();

        // We are the sole producer, so our own write index needs no
        // synchronization; the remote-published read index does.
        let wr = header.wr.load(Ordering::Relaxed);
        let rd = header.rd.load(Ordering::Acquire);
        if wr.wrapping_sub(rd) >= header.capacity {
            return Err(RingFull);
        }

        let slot = (wr & header.mask()) as usize;
        // SAFETY: slot < capacity via mask.
        unsafe { ptr::write(self.slot_ptr(slot), msg.to_bytes()) };

        header.wr.store(wr.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Dequeue one record (consumer side only).
    pub fn dequeue(&self) -> Option<Msg> {
        let header = self.header();

        let rd = header.rd.load(Ordering::Relaxed);
        let wr = header.wr.load(Ordering::Acquire);
        if rd == wr {
            return None;
        }

        let slot = (rd & header.mask()) as usize;
        // SAFETY: slot < capacity via mask.
        let bytes = unsafe { ptr::read(self.slot_ptr(slot)) };

        header.rd.store(rd.wrapping_add(1), Ordering::Release);
        Some(Msg::from_bytes(bytes))
    }

    /// Drain every queued record, invoking `visit` per record in index
    /// order. Returns the number of records drained. Used only by the
    /// delivery path.
    pub fn dequeue_all<F: FnMut(Msg)>(&self, mut visit: F) -> u32 {
        let mut drained = 0;
        while let Some(msg) = self.dequeue() {
            visit(msg);
            drained += 1;
        }
        drained
    }

    /// Number of records currently queued.
    #[inline]
    pub fn len(&self) -> u32 {
        let header = self.header();
        let wr = header.wr.load(Ordering::Acquire);
        let rd = header.rd.load(Ordering::Acquire);
        wr.wrapping_sub(rd)
    }

    /// Whether the ring appears empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the ring appears full.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    /// Slot count.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.header().capacity
    }

    /// Index snapshot for diagnostics.
    pub fn status(&self) -> RingStatus {
        let header = self.header();
        let wr = header.wr.load(Ordering::Acquire);
        let rd = header.rd.load(Ordering::Acquire);
        RingStatus {
            wr,
            rd,
            capacity: header.capacity,
            len: wr.wrapping_sub(rd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::HeapRegion;

    fn ring_with_capacity(capacity: u32) -> (HeapRegion, MsgRing) {
        let heap = HeapRegion::new_zeroed(RING_HEADER_SIZE + capacity as usize * MSG_SIZE);
        // SAFETY: freshly allocated, exclusively owned.
        let ring = unsafe { MsgRing::init(heap.region(), 0, capacity) };
        (heap, ring)
    }

    #[test]
    fn header_is_three_cache_lines() {
        assert_eq!(size_of::<RingHeader>(), RING_HEADER_SIZE);
    }

    #[test]
    fn fifo_order() {
        let (_heap, ring) = ring_with_capacity(8);

        for v in 0..5u32 {
            ring.enqueue(&Msg::data(1, v)).unwrap();
        }
        assert_eq!(ring.len(), 5);

        for v in 0..5u32 {
            assert_eq!(ring.dequeue().unwrap().value, v);
        }
        assert!(ring.dequeue().is_none());
    }

    #[test]
    fn full_ring_rejects_without_overwrite() {
        let (_heap, ring) = ring_with_capacity(4);

        for v in 0..4u32 {
            ring.enqueue(&Msg::data(1, v)).unwrap();
        }
        assert_eq!(ring.enqueue(&Msg::data(1, 99)), Err(RingFull));
        assert_eq!(ring.len(), 4);

        // The rejected record must not have clobbered anything.
        for v in 0..4u32 {
            assert_eq!(ring.dequeue().unwrap().value, v);
        }
    }

    #[test]
    fn capacity_invariant_holds_through_churn() {
        let (_heap, ring) = ring_with_capacity(4);

        for round in 0..40u32 {
            let _ = ring.enqueue(&Msg::data(1, round));
            let status = ring.status();
            assert!(status.wr.wrapping_sub(status.rd) <= status.capacity);
            if round % 3 == 0 {
                ring.dequeue();
            }
        }
    }

    #[test]
    fn dequeue_all_drains_in_order() {
        let (_heap, ring) = ring_with_capacity(8);
        for v in 0..6u32 {
            ring.enqueue(&Msg::data(2, v)).unwrap();
        }

        let mut seen = Vec::new();
        let drained = ring.dequeue_all(|m| seen.push(m.value));

        assert_eq!(drained, 6);
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
        assert!(ring.is_empty());
    }

    #[test]
    fn attach_sees_initialized_state() {
        let (heap, ring) = ring_with_capacity(8);
        ring.enqueue(&Msg::data(1, 7)).unwrap();

        // SAFETY: same region, header initialized above.
        let view = unsafe { MsgRing::attach(heap.region(), 0) };
        assert_eq!(view.capacity(), 8);
        assert_eq!(view.dequeue().unwrap().value, 7);
    }
}
