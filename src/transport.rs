//! Transport: one remote processor pairing.
//!
//! A transport owns the outbound ring (shared by every channel, guarded by
//! one send lock), the inbound ring (drained only by the delivery path), the
//! doorbell capability, and the channel table. The process-context API
//! (`open`/`close`/`send`/`recv*`) may block; the delivery path
//! (`handle_signal`/`deliver`) never sleeps and never allocates.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::channel::{ChannelEntry, ChannelState};
use crate::doorbell::{Doorbell, MemoryDoorbell};
use crate::error::Error;
use crate::layout::SegmentLayout;
use crate::msg::{is_valid_kind, kind_name, msg_kind, Msg, OPEN_MAGIC};
use crate::region::{HeapRegion, Region};
use crate::ring::{MsgRing, RingStatus};

/// Policy for an inbound `DIE` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiePolicy {
    /// Log the fault announcement and drop it.
    #[default]
    Discard,
    /// Invoke the fault hook installed at construction (log-only if none).
    Fatal,
}

/// Transport tuning knobs.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Slots per ring (power of two).
    pub ring_capacity: u32,
    /// Receive cache depth per channel (power of two).
    pub cache_depth: u32,
    /// Number of logical channels (at most 256; channel ids are one byte).
    pub channel_count: usize,
    /// What to do with an inbound `DIE`.
    pub die_policy: DiePolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 64,
            cache_depth: 32,
            channel_count: 16,
            die_policy: DiePolicy::Discard,
        }
    }
}

impl TransportConfig {
    fn validate(&self) {
        assert!(
            self.ring_capacity.is_power_of_two(),
            "ring capacity must be a power of two"
        );
        assert!(
            self.cache_depth.is_power_of_two(),
            "cache depth must be a power of two"
        );
        assert!(
            self.channel_count >= 1 && self.channel_count <= 256,
            "channel count must be in 1..=256"
        );
    }
}

/// Counter snapshot; see [`Transport::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportStats {
    /// Messages copied into a channel cache.
    pub delivered: u64,
    /// Messages dropped because the addressed cache was full.
    pub cache_overflows: u64,
    /// Records dropped for failing bounds/kind validation.
    pub malformed: u64,
    /// Messages dropped because the addressed channel had no cache.
    pub unopened_drops: u64,
    /// `DIE` messages observed.
    pub die_seen: u64,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    cache_overflows: AtomicU64,
    malformed: AtomicU64,
    unopened_drops: AtomicU64,
    die_seen: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> TransportStats {
        TransportStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            cache_overflows: self.cache_overflows.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            unopened_drops: self.unopened_drops.load(Ordering::Relaxed),
            die_seen: self.die_seen.load(Ordering::Relaxed),
        }
    }
}

/// Backing memory for the segment, kept alive with the transport.
#[allow(dead_code)]
enum Backing {
    /// Externally owned mapping (real shared memory).
    External,
    /// Heap allocation shared by an in-process endpoint pair.
    Heap(Arc<HeapRegion>),
}

/// Fault hook invoked for `DIE` under [`DiePolicy::Fatal`].
pub type FaultHook = Box<dyn Fn(Msg) + Send + Sync>;

/// One remote-processor pairing: queue pair, doorbell, channel table.
pub struct Transport {
    tx: MsgRing,
    /// Transport-wide send lock: the outbound ring is shared by all
    /// channels of this transport.
    tx_lock: Mutex<()>,
    rx: MsgRing,
    /// Guards against overlapping delivery drains without blocking.
    delivering: AtomicBool,
    doorbell: Box<dyn Doorbell>,
    channels: Box<[ChannelEntry]>,
    cache_depth: u32,
    die_policy: DiePolicy,
    fault_hook: Option<FaultHook>,
    counters: Counters,
    region: Region,
    backing: Backing,
}

impl Transport {
    fn new_inner(
        region: Region,
        config: &TransportConfig,
        doorbell: Box<dyn Doorbell>,
        tx: MsgRing,
        rx: MsgRing,
        backing: Backing,
    ) -> Self {
        let channels = (0..config.channel_count)
            .map(|_| ChannelEntry::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            tx,
            tx_lock: Mutex::new(()),
            rx,
            delivering: AtomicBool::new(false),
            doorbell,
            channels,
            cache_depth: config.cache_depth,
            die_policy: config.die_policy,
            fault_hook: None,
            counters: Counters::default(),
            region,
            backing,
        }
    }

    /// Host-side endpoint: initializes both rings in `region`.
    ///
    /// The host must run before the coprocessor side attaches.
    ///
    /// # Safety
    ///
    /// `region` must cover a segment laid out per [`SegmentLayout`] for
    /// `config.ring_capacity`, be writable, and outlive the transport.
    ///
    /// # Panics
    ///
    /// Panics on an invalid `config` or an undersized region.
    pub unsafe fn host(
        region: Region,
        config: &TransportConfig,
        doorbell: Box<dyn Doorbell>,
    ) -> Self {
        config.validate();
        let layout = SegmentLayout::calculate(config.ring_capacity);
        assert!(region.len() >= layout.total, "region too small for segment");

        // SAFETY: offsets come from the validated layout; exclusivity during
        // init is the caller's contract.
        let tx = unsafe { MsgRing::init(region, layout.ring_a_header, config.ring_capacity) };
        let rx = unsafe { MsgRing::init(region, layout.ring_b_header, config.ring_capacity) };
        Self::new_inner(region, config, doorbell, tx, rx, Backing::External)
    }

    /// Coprocessor-side endpoint: attaches to rings the host initialized.
    ///
    /// # Safety
    ///
    /// Same region contract as [`Transport::host`]; additionally the host
    /// side must have finished initialization.
    pub unsafe fn coproc(
        region: Region,
        config: &TransportConfig,
        doorbell: Box<dyn Doorbell>,
    ) -> Self {
        config.validate();
        let layout = SegmentLayout::calculate(config.ring_capacity);
        assert!(region.len() >= layout.total, "region too small for segment");

        // Mirror of the host: ring B is our outbound.
        // SAFETY: the host initialized both headers.
        let tx = unsafe { MsgRing::attach(region, layout.ring_b_header) };
        let rx = unsafe { MsgRing::attach(region, layout.ring_a_header) };
        Self::new_inner(region, config, doorbell, tx, rx, Backing::External)
    }

    /// Build a connected endpoint pair over a heap-backed segment.
    ///
    /// The segment and doorbell latches are shared by both endpoints; the
    /// returned transports are otherwise identical to real host/coprocessor
    /// endpoints. Intended for in-process use and tests.
    pub fn heap_pair(config: &TransportConfig) -> (Transport, Transport) {
        config.validate();
        let layout = SegmentLayout::calculate(config.ring_capacity);
        let heap = Arc::new(HeapRegion::new_zeroed(layout.total));
        let (bell_a, bell_b) = MemoryDoorbell::pair();

        // SAFETY: freshly allocated zeroed segment, kept alive by the Arc
        // stored in each endpoint's backing.
        let mut a = unsafe { Transport::host(heap.region(), config, Box::new(bell_a)) };
        let mut b = unsafe { Transport::coproc(heap.region(), config, Box::new(bell_b)) };
        a.backing = Backing::Heap(heap.clone());
        b.backing = Backing::Heap(heap);
        (a, b)
    }

    /// Install the fault hook invoked for `DIE` under [`DiePolicy::Fatal`].
    /// Must be called before the transport is shared.
    pub fn set_fault_hook(&mut self, hook: FaultHook) {
        self.fault_hook = Some(hook);
    }

    /// The underlying segment view (diagnostics and tests).
    #[inline]
    pub fn region(&self) -> Region {
        self.region
    }

    /// Number of logical channels.
    #[inline]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Lifecycle state of a channel, `None` for an out-of-range id.
    pub fn channel_state(&self, channel: u8) -> Option<ChannelState> {
        self.channels.get(channel as usize).map(|e| e.state())
    }

    /// Outbound ring snapshot.
    pub fn tx_status(&self) -> RingStatus {
        self.tx.status()
    }

    /// Inbound ring snapshot.
    pub fn rx_status(&self) -> RingStatus {
        self.rx.status()
    }

    /// Delivery counter snapshot.
    pub fn stats(&self) -> TransportStats {
        self.counters.snapshot()
    }

    #[inline]
    fn entry(&self, channel: u8) -> Result<&ChannelEntry, Error> {
        self.channels
            .get(channel as usize)
            .ok_or(Error::ChannelNotOpen)
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    /// Send a message to the remote processor.
    ///
    /// Data kinds require the channel to be `Opened`; the control kinds
    /// (`OPEN`, `CLOSE`, `DIE`) are exempt. Fails with [`Error::QueueFull`]
    /// when the outbound ring is full; never retries internally.
    pub fn send(&self, msg: Msg) -> Result<(), Error> {
        if !is_valid_kind(msg.kind) {
            return Err(Error::ProtocolError);
        }
        let entry = self.entry(msg.channel)?;

        let exempt = matches!(msg.kind, msg_kind::OPEN | msg_kind::CLOSE | msg_kind::DIE);
        if !exempt && entry.state() != ChannelState::Opened {
            return Err(Error::ChannelNotOpen);
        }
        self.send_raw(msg)
    }

    /// Enqueue under the transport-wide send lock and ring the doorbell.
    fn send_raw(&self, msg: Msg) -> Result<(), Error> {
        {
            let _guard = self.tx_lock.lock();
            self.tx.enqueue(&msg).map_err(|_| Error::QueueFull)?;
        }
        self.doorbell.ring();
        trace!(
            channel = msg.channel,
            kind = kind_name(msg.kind),
            "message sent"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Channel lifecycle
    // ------------------------------------------------------------------

    /// Open a channel, performing the handshake with the remote side.
    ///
    /// Exactly one `OPEN` (tagged [`OPEN_MAGIC`]) is enqueued. If the
    /// remote's open already arrived (`Waiting` entry) the call completes
    /// immediately; otherwise it blocks up to `timeout` (`None` = forever)
    /// for the peer's `OPEN` to be observed by the delivery path.
    ///
    /// A cached non-handshake message, or an `OPEN` with the wrong magic,
    /// fails with [`Error::ProtocolError`]. A concurrent opener (or an
    /// already open channel) fails with [`Error::Busy`].
    pub fn open(&self, channel: u8, timeout: Option<Duration>) -> Result<(), Error> {
        let entry = self.entry(channel)?;

        // The cache install is the open claim.
        if !entry.try_claim_cache(self.cache_depth) {
            return Err(Error::Busy);
        }

        let was_waiting = entry.state() == ChannelState::Waiting;

        if let Err(e) = self.send_raw(Msg::open(channel)) {
            warn!(channel, error = %e, "open handshake send failed");
            let _consume = entry.consume.lock();
            entry.state.store(ChannelState::Free as u32, Ordering::SeqCst);
            self.teardown(entry);
            return Err(e);
        }

        if was_waiting {
            // Remote opened first; our OPEN above completes their side.
            entry.set_state(ChannelState::Opened);
            debug!(channel, "channel opened (remote was waiting)");
            return Ok(());
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let _consume = entry.consume.lock();
        let mut guard = entry.wait.lock();
        loop {
            match entry.state() {
                ChannelState::Waiting => {
                    entry.set_state(ChannelState::Opened);
                    debug!(channel, "channel opened (handshake complete)");
                    return Ok(());
                }
                ChannelState::Opened => return Ok(()),
                ChannelState::Free => {
                    drop(guard);
                    self.teardown(entry);
                    return Err(Error::ChannelClosed);
                }
                ChannelState::Unused => {}
            }

            if let Some(msg) = entry.cache_ref().and_then(|c| c.pop()) {
                if msg.kind == msg_kind::OPEN && msg.flag == OPEN_MAGIC {
                    entry.set_state(ChannelState::Opened);
                    debug!(channel, "channel opened (handshake complete)");
                    return Ok(());
                }
                warn!(
                    channel,
                    kind = kind_name(msg.kind),
                    flag = msg.flag,
                    "mismatched handshake message"
                );
                drop(guard);
                entry.state.store(ChannelState::Free as u32, Ordering::SeqCst);
                self.teardown(entry);
                return Err(Error::ProtocolError);
            }

            match deadline {
                Some(d) => {
                    if entry.avail.wait_until(&mut guard, d).timed_out() {
                        drop(guard);
                        entry.state.store(ChannelState::Free as u32, Ordering::SeqCst);
                        self.teardown(entry);
                        return Err(Error::Timeout);
                    }
                }
                None => entry.avail.wait(&mut guard),
            }
        }
    }

    /// Close a channel.
    ///
    /// A `CLOSE` is enqueued best-effort: retried until `timeout` expires
    /// (`None` = single attempt), and a send failure is logged rather than
    /// propagated. Local teardown always proceeds: blocked receivers fail
    /// with [`Error::ChannelClosed`], and the entry's resources are released
    /// once the delivery path provably no longer touches them.
    pub fn close(&self, channel: u8, timeout: Option<Duration>) -> Result<(), Error> {
        let entry = self.entry(channel)?;
        if entry.state() != ChannelState::Opened {
            return Err(Error::ChannelNotOpen);
        }

        if let Err(e) = self.send_close(channel, timeout) {
            warn!(channel, error = %e, "close notification not sent");
        }

        entry.state.store(ChannelState::Free as u32, Ordering::SeqCst);
        entry.wake_all();

        // Wait for consumers to drain out, then release.
        let _consume = entry.consume.lock();
        self.teardown(entry);
        debug!(channel, "channel closed");
        Ok(())
    }

    fn send_close(&self, channel: u8, timeout: Option<Duration>) -> Result<(), Error> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            match self.send_raw(Msg::close(channel)) {
                Ok(()) => return Ok(()),
                Err(Error::QueueFull) => match deadline {
                    Some(d) if Instant::now() < d => {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    _ => return Err(Error::QueueFull),
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Release an entry's software state. The caller must hold the entry's
    /// consume lock and have published a non-`Opened` state.
    ///
    /// This is the one intentional busy-wait in the crate: the delivery
    /// path cannot sleep, so it cannot share a blocking lock with teardown.
    /// It brackets every touch with the `busy` counter instead, and we poll
    /// that counter to zero before freeing. SeqCst pairs the delivery
    /// path's increment-then-state-check against our state-publish-then-poll
    /// (both are store-then-load sequences, which weaker orderings do not
    /// order).
    fn teardown(&self, entry: &ChannelEntry) {
        let mut spins = 0u32;
        while entry.busy.load(Ordering::SeqCst) != 0 {
            spins = spins.wrapping_add(1);
            if spins % 64 == 0 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }

        let cache = entry.cache.swap(ptr::null_mut(), Ordering::AcqRel);
        if !cache.is_null() {
            // SAFETY: busy has drained and we hold the consume lock, so no
            // delivery bracket or consumer reference can exist.
            drop(unsafe { Box::from_raw(cache) });
        }
        entry.state.store(ChannelState::Unused as u32, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------
    // Receive path
    // ------------------------------------------------------------------

    /// Non-blocking receive.
    ///
    /// Fails with [`Error::Busy`] when another consumer holds the channel,
    /// [`Error::NoData`] when the cache is empty.
    pub fn try_recv(&self, channel: u8) -> Result<Msg, Error> {
        let entry = self.entry(channel)?;
        let _consume = entry.consume.try_lock().ok_or(Error::Busy)?;

        match entry.state() {
            ChannelState::Free => return Err(Error::ChannelClosed),
            ChannelState::Unused | ChannelState::Waiting => return Err(Error::ChannelNotOpen),
            ChannelState::Opened => {}
        }
        match entry.cache_ref() {
            Some(cache) => cache.pop().ok_or(Error::NoData),
            None => Err(Error::ChannelNotOpen),
        }
    }

    /// Receive, blocking until a message arrives or the channel closes.
    pub fn recv(&self, channel: u8) -> Result<Msg, Error> {
        self.recv_deadline(channel, None)
    }

    /// Receive, blocking up to `timeout`.
    pub fn recv_timeout(&self, channel: u8, timeout: Duration) -> Result<Msg, Error> {
        self.recv_deadline(channel, Some(Instant::now() + timeout))
    }

    fn recv_deadline(&self, channel: u8, deadline: Option<Instant>) -> Result<Msg, Error> {
        let entry = self.entry(channel)?;
        let _consume = entry.consume.lock();
        let mut guard = entry.wait.lock();
        loop {
            match entry.state() {
                ChannelState::Free => return Err(Error::ChannelClosed),
                ChannelState::Unused | ChannelState::Waiting => return Err(Error::ChannelNotOpen),
                ChannelState::Opened => {}
            }

            match entry.cache_ref() {
                Some(cache) => {
                    if let Some(msg) = cache.pop() {
                        return Ok(msg);
                    }
                }
                None => return Err(Error::ChannelNotOpen),
            }

            match deadline {
                Some(d) => {
                    if entry.avail.wait_until(&mut guard, d).timed_out() {
                        return Err(Error::Timeout);
                    }
                }
                None => entry.avail.wait(&mut guard),
            }
        }
    }

    // ------------------------------------------------------------------
    // Delivery path
    // ------------------------------------------------------------------

    /// Doorbell entry point: acknowledge the signal and drain the inbound
    /// ring. Safe to call spuriously.
    pub fn handle_signal(&self) -> u32 {
        if self.doorbell.is_asserted() {
            self.doorbell.clear();
        }
        self.deliver()
    }

    /// Drain the inbound ring, demultiplexing into channel caches.
    ///
    /// Non-blocking and non-allocating; intended to run in interrupt or
    /// fast-path context. Returns the number of records drained. A drain
    /// already in progress on another thread makes this a no-op.
    pub fn deliver(&self) -> u32 {
        let mut drained = 0;
        loop {
            if self.delivering.swap(true, Ordering::Acquire) {
                // Another thread holds the flag; its post-clear re-check
                // below covers any record we would have drained.
                return drained;
            }
            drained += self.rx.dequeue_all(|msg| self.dispatch(msg));
            self.delivering.store(false, Ordering::Release);

            // A record enqueued after our final dequeue was refused by any
            // concurrent caller that saw the flag held, and its doorbell
            // edge may already be acknowledged. Retake the flag and drain
            // rather than strand it.
            if self.rx.is_empty() {
                return drained;
            }
        }
    }

    fn dispatch(&self, msg: Msg) {
        if msg.channel as usize >= self.channels.len() || !is_valid_kind(msg.kind) {
            self.counters.malformed.fetch_add(1, Ordering::Relaxed);
            warn!(
                channel = msg.channel,
                kind = msg.kind,
                "malformed inbound record dropped"
            );
            return;
        }

        if msg.kind == msg_kind::DIE {
            self.handle_die(msg);
            return;
        }

        let entry = &self.channels[msg.channel as usize];

        // Remote-initiated open: flip an idle entry to Waiting without a
        // cache write. A duplicate OPEN on Waiting/Opened is idempotent.
        if msg.kind == msg_kind::OPEN && msg.flag == OPEN_MAGIC {
            match entry.state.compare_exchange(
                ChannelState::Unused as u32,
                ChannelState::Waiting as u32,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    debug!(channel = msg.channel, "remote open observed");
                    entry.wake_all();
                }
                Err(_) => {
                    trace!(channel = msg.channel, "duplicate open ignored");
                }
            }
            return;
        }

        // Bracket the cache touch; pairs with teardown's Free-then-poll.
        entry.busy.fetch_add(1, Ordering::SeqCst);
        if entry.state.load(Ordering::SeqCst) == ChannelState::Free as u32 {
            entry.busy.fetch_sub(1, Ordering::SeqCst);
            trace!(channel = msg.channel, "message dropped, channel closing");
            return;
        }

        let delivered = match entry.cache_ref() {
            None => {
                self.counters.unopened_drops.fetch_add(1, Ordering::Relaxed);
                warn!(
                    channel = msg.channel,
                    kind = kind_name(msg.kind),
                    "message for unopened channel dropped"
                );
                false
            }
            Some(cache) => match cache.push(msg) {
                Ok(()) => {
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    trace!(
                        channel = msg.channel,
                        kind = kind_name(msg.kind),
                        "message delivered"
                    );
                    true
                }
                Err(_) => {
                    self.counters.cache_overflows.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        channel = msg.channel,
                        cached = cache.len(),
                        "receive cache full, message dropped"
                    );
                    false
                }
            },
        };
        entry.busy.fetch_sub(1, Ordering::SeqCst);

        if delivered {
            entry.wake_all();
        }
    }

    fn handle_die(&self, msg: Msg) {
        self.counters.die_seen.fetch_add(1, Ordering::Relaxed);
        match self.die_policy {
            DiePolicy::Discard => {
                error!(value = msg.value, "remote fault announcement discarded");
            }
            DiePolicy::Fatal => {
                error!(value = msg.value, "remote fault announcement");
                if let Some(hook) = &self.fault_hook {
                    hook(msg);
                }
            }
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        // Release caches of channels never closed. Exclusive access here;
        // no delivery path or consumer can be live.
        for entry in self.channels.iter() {
            let cache = entry.cache.swap(ptr::null_mut(), Ordering::AcqRel);
            if !cache.is_null() {
                // SAFETY: exclusive access via &mut self.
                drop(unsafe { Box::from_raw(cache) });
            }
        }
    }
}
