//! Per-channel state: lifecycle, receive cache, and waiter bookkeeping.
//!
//! The channel table is software state owned by the transport, one entry per
//! channel id. Only the rings live in shared memory; the cache and waiter
//! structures here are local to each processor.
//!
//! Exclusion rules:
//! - the delivery path is the sole cache producer and brackets every entry
//!   touch with the `busy` counter;
//! - consumers (and the opener while it waits) hold the `consume` lock;
//! - teardown publishes `Free`, drains `busy`, and takes `consume` before
//!   releasing the cache, so neither side can observe freed memory.

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::msg::Msg;

/// Channel lifecycle states.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Entry is idle; no local open, no remote open observed.
    Unused = 0,
    /// The remote's `OPEN` arrived before a local open.
    Waiting = 1,
    /// Handshake complete; data flows.
    Opened = 2,
    /// Close initiated; blocked receivers fail with `ChannelClosed`.
    Free = 3,
}

impl ChannelState {
    /// Convert from the stored representation.
    #[inline]
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(ChannelState::Unused),
            1 => Some(ChannelState::Waiting),
            2 => Some(ChannelState::Opened),
            3 => Some(ChannelState::Free),
            _ => None,
        }
    }
}

/// Error returned when the receive cache is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheFull;

/// Fixed-depth receive cache for one channel.
///
/// Single producer (the delivery path), single consumer (whoever holds the
/// channel's consume lock). Indices follow the same free-running protocol as
/// the shared rings: `wr` advanced only by the producer with a `Release`
/// publish, `rd` only by the consumer.
pub(crate) struct RxCache {
    slots: Box<[UnsafeCell<Msg>]>,
    mask: u32,
    wr: AtomicU32,
    rd: AtomicU32,
}

// SAFETY: slot access follows the SPSC index protocol above; the transport
// enforces single producer (busy bracket) and single consumer (consume lock).
unsafe impl Send for RxCache {}
unsafe impl Sync for RxCache {}

impl RxCache {
    /// Allocate a cache of `depth` slots (power of two).
    pub(crate) fn new(depth: u32) -> Box<Self> {
        assert!(
            depth.is_power_of_two(),
            "cache depth must be a power of two"
        );
        let slots = (0..depth)
            .map(|_| UnsafeCell::new(Msg::new(0, 0, 0, 0)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Box::new(Self {
            slots,
            mask: depth - 1,
            wr: AtomicU32::new(0),
            rd: AtomicU32::new(0),
        })
    }

    /// Push a message (delivery path only). Fails when full; the caller
    /// drops the message and records the overflow.
    pub(crate) fn push(&self, msg: Msg) -> Result<(), CacheFull> {
        let wr = self.wr.load(Ordering::Relaxed);
        let rd = self.rd.load(Ordering::Acquire);
        if wr.wrapping_sub(rd) > self.mask {
            return Err(CacheFull);
        }

        let slot = (wr & self.mask) as usize;
        // SAFETY: slot < depth via mask; we are the sole producer and the
        // consumer will not read this slot until wr is published.
        unsafe { ptr::write(self.slots[slot].get(), msg) };

        self.wr.store(wr.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Pop the oldest message (consumer only).
    pub(crate) fn pop(&self) -> Option<Msg> {
        let rd = self.rd.load(Ordering::Relaxed);
        let wr = self.wr.load(Ordering::Acquire);
        if rd == wr {
            return None;
        }

        let slot = (rd & self.mask) as usize;
        // SAFETY: slot < depth via mask; the producer published wr after
        // writing this slot.
        let msg = unsafe { ptr::read(self.slots[slot].get()) };

        self.rd.store(rd.wrapping_add(1), Ordering::Release);
        Some(msg)
    }

    /// Messages currently cached.
    #[inline]
    pub(crate) fn len(&self) -> u32 {
        let wr = self.wr.load(Ordering::Acquire);
        let rd = self.rd.load(Ordering::Acquire);
        wr.wrapping_sub(rd)
    }
}

/// One channel table entry, pre-allocated per channel id.
pub(crate) struct ChannelEntry {
    /// Lifecycle state (`ChannelState` as u32).
    pub(crate) state: AtomicU32,
    /// Busy reference count bracketing delivery-path touches. Paired with
    /// the `Free` publish in teardown via SeqCst; see `Transport::teardown`.
    pub(crate) busy: AtomicU32,
    /// Receive cache, null until opened. Installed by the opener (the CAS
    /// is the open claim), released by teardown after `busy` drains.
    pub(crate) cache: AtomicPtr<RxCache>,
    /// Waiter mutex; guards the check-then-wait sequence in recv/open.
    pub(crate) wait: Mutex<()>,
    /// Signaled after every cache write and state change.
    pub(crate) avail: Condvar,
    /// Per-channel consumer exclusion.
    pub(crate) consume: Mutex<()>,
}

impl ChannelEntry {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU32::new(ChannelState::Unused as u32),
            busy: AtomicU32::new(0),
            cache: AtomicPtr::new(ptr::null_mut()),
            wait: Mutex::new(()),
            avail: Condvar::new(),
            consume: Mutex::new(()),
        }
    }

    /// Current state (Acquire). Delivery and teardown use explicit SeqCst
    /// accesses where the busy-count pairing requires it.
    #[inline]
    pub(crate) fn state(&self) -> ChannelState {
        ChannelState::from_u32(self.state.load(Ordering::Acquire)).unwrap_or(ChannelState::Unused)
    }

    #[inline]
    pub(crate) fn set_state(&self, state: ChannelState) {
        self.state.store(state as u32, Ordering::Release);
    }

    /// Claim the entry for a local open by installing a fresh cache.
    /// Returns false if another opener (or an open channel) already holds
    /// the claim.
    pub(crate) fn try_claim_cache(&self, depth: u32) -> bool {
        let fresh = Box::into_raw(RxCache::new(depth));
        match self.cache.compare_exchange(
            ptr::null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(_) => {
                // SAFETY: fresh was never shared.
                drop(unsafe { Box::from_raw(fresh) });
                false
            }
        }
    }

    /// Borrow the cache if allocated.
    ///
    /// Callers must hold either the consume lock or a `busy` bracket; those
    /// are the guards that keep teardown from freeing the cache underneath
    /// this reference.
    #[inline]
    pub(crate) fn cache_ref(&self) -> Option<&RxCache> {
        let ptr = self.cache.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // SAFETY: non-null means installed and not yet reaped; the
            // caller's guard (see doc) excludes the reaper.
            Some(unsafe { &*ptr })
        }
    }

    /// Wake every waiter on this channel.
    ///
    /// The empty critical section pairs with the waiter's check-then-wait
    /// under `wait`, closing the missed-wakeup window. The lock is only ever
    /// held for the duration of a predicate check, so this does not block
    /// the delivery path in any meaningful way.
    pub(crate) fn wake_all(&self) {
        drop(self.wait.lock());
        self.avail.notify_all();
    }
}
