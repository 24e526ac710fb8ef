//! Lifecycle and concurrency tests: close semantics, waiter wakeup, and the
//! delivery-versus-teardown exclusion.

mod support;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use coproc_ipc::{ChannelState, Error, Msg, MsgRing, SegmentLayout, TransportConfig};

use support::{duplex_open, pair, pair_with, pump_until};

#[test]
fn close_wakes_blocked_receiver() {
    let (a, b) = pair();
    duplex_open(&a, &b, 1);

    let b2 = b.clone();
    let receiver = thread::spawn(move || b2.recv(1));

    // Let the receiver park, then close underneath it.
    thread::sleep(Duration::from_millis(30));
    b.close(1, Some(Duration::from_millis(100))).unwrap();

    assert_eq!(receiver.join().unwrap(), Err(Error::ChannelClosed));
    assert_eq!(b.channel_state(1), Some(ChannelState::Unused));
}

#[test]
fn close_wakes_every_waiter() {
    let (a, b) = pair();
    duplex_open(&a, &b, 1);

    // Only one waiter can hold the consume lock; the others queue on it.
    // All of them must come back with ChannelClosed.
    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let b2 = b.clone();
            thread::spawn(move || b2.recv(1))
        })
        .collect();

    thread::sleep(Duration::from_millis(30));
    b.close(1, Some(Duration::from_millis(100))).unwrap();

    for waiter in waiters {
        // A waiter that reacquires the consume lock only after teardown
        // finished sees the entry already recycled to Unused.
        let err = waiter.join().unwrap().unwrap_err();
        assert!(matches!(err, Error::ChannelClosed | Error::ChannelNotOpen));
    }
}

#[test]
fn recv_timeout_expires() {
    let (a, b) = pair();
    duplex_open(&a, &b, 2);

    let start = std::time::Instant::now();
    assert_eq!(
        b.recv_timeout(2, Duration::from_millis(50)),
        Err(Error::Timeout)
    );
    assert!(start.elapsed() >= Duration::from_millis(50));
}

#[test]
fn try_recv_is_busy_while_receiver_blocks() {
    let (a, b) = pair();
    duplex_open(&a, &b, 1);

    let b2 = b.clone();
    let receiver = thread::spawn(move || b2.recv_timeout(1, Duration::from_millis(200)));

    thread::sleep(Duration::from_millis(30));
    assert_eq!(b.try_recv(1), Err(Error::Busy));

    assert_eq!(receiver.join().unwrap(), Err(Error::Timeout));
    // Lock released; back to the normal empty answer.
    assert_eq!(b.try_recv(1), Err(Error::NoData));
}

#[test]
fn operations_on_unopened_channel() {
    let (a, _b) = pair();

    assert_eq!(a.send(Msg::data(5, 1)), Err(Error::ChannelNotOpen));
    assert_eq!(a.try_recv(5), Err(Error::ChannelNotOpen));
    assert_eq!(
        a.recv_timeout(5, Duration::from_millis(10)),
        Err(Error::ChannelNotOpen)
    );
    assert_eq!(
        a.close(5, Some(Duration::from_millis(10))),
        Err(Error::ChannelNotOpen)
    );
    // Out-of-range channel id.
    assert_eq!(a.try_recv(255), Err(Error::ChannelNotOpen));
}

#[test]
fn open_timeout_leaves_channel_reusable() {
    let (a, b) = pair();

    assert_eq!(
        a.open(3, Some(Duration::from_millis(30))),
        Err(Error::Timeout)
    );
    assert_eq!(a.channel_state(3), Some(ChannelState::Unused));

    // b flushes the stale OPEN from the failed attempt, then a full
    // handshake still works on the same channel.
    b.handle_signal();
    assert_eq!(b.channel_state(3), Some(ChannelState::Waiting));
    duplex_open(&a, &b, 3);
    assert_eq!(a.channel_state(3), Some(ChannelState::Opened));
}

#[test]
fn send_after_close_is_rejected() {
    let (a, b) = pair();
    duplex_open(&a, &b, 1);

    a.close(1, Some(Duration::from_millis(100))).unwrap();
    assert_eq!(a.send(Msg::data(1, 1)), Err(Error::ChannelNotOpen));
}

#[test]
fn delivery_during_close_never_touches_freed_cache() {
    // Hammer open/close on one endpoint while records flood its inbound
    // ring. Every record must either land in a live cache or be dropped; a
    // use-after-free in the teardown exclusion shows up here as a crash or
    // corrupted message.
    let config = TransportConfig {
        ring_capacity: 256,
        ..TransportConfig::default()
    };
    let (_a, b) = pair_with(&config);

    let layout = SegmentLayout::calculate(config.ring_capacity);
    // b is the coprocessor side, so ring A is its inbound. The injector
    // thread is that ring's sole producer; _a stays untouched.
    // SAFETY: the region outlives both transports and the ring header was
    // initialized at construction.
    let injector = unsafe { MsgRing::attach(b.region(), layout.ring_a_header) };

    let stop = Arc::new(AtomicBool::new(false));

    let flooder = {
        let stop = stop.clone();
        thread::spawn(move || {
            let mut v = 0u32;
            while !stop.load(Ordering::Relaxed) {
                // One handshake OPEN per burst so the reopening side always
                // makes progress, then data pressure.
                let _ = injector.enqueue(&Msg::open(1));
                for _ in 0..16 {
                    let _ = injector.enqueue(&Msg::data(1, v));
                    v = v.wrapping_add(1);
                }
                thread::yield_now();
            }
        })
    };

    let pumper = {
        let b = b.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                b.handle_signal();
            }
        })
    };

    for _ in 0..50 {
        // The flooder's OPEN flips the entry to Waiting; open then
        // completes against it immediately.
        while b.channel_state(1) != Some(ChannelState::Waiting) {
            thread::yield_now();
        }
        b.open(1, Some(Duration::from_secs(5))).unwrap();
        while b.try_recv(1).is_ok() {}
        b.close(1, None).unwrap();
    }

    stop.store(true, Ordering::Relaxed);
    flooder.join().unwrap();
    pumper.join().unwrap();

    let stats = b.stats();
    assert!(stats.delivered > 0);
    assert!(stats.malformed == 0);
}

#[test]
fn concurrent_senders_on_distinct_channels() {
    let config = TransportConfig {
        ring_capacity: 1024,
        cache_depth: 256,
        ..TransportConfig::default()
    };
    let (a, b) = pair_with(&config);
    duplex_open(&a, &b, 1);
    duplex_open(&a, &b, 2);

    // Sample the shared ring from both endpoint views for the whole run:
    // the write index must never run more than capacity ahead of the read
    // index, no matter how the senders and the drain interleave.
    let stop = Arc::new(AtomicBool::new(false));
    let sampler = {
        let a = a.clone();
        let b = b.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                for status in [a.tx_status(), b.rx_status()] {
                    assert!(status.wr.wrapping_sub(status.rd) <= status.capacity);
                }
                thread::yield_now();
            }
        })
    };

    let senders: Vec<_> = [1u8, 2u8]
        .into_iter()
        .map(|ch| {
            let a = a.clone();
            thread::spawn(move || {
                for v in 0..100u32 {
                    loop {
                        match a.send(Msg::data(ch, v)) {
                            Ok(()) => break,
                            Err(Error::QueueFull) => thread::yield_now(),
                            Err(e) => panic!("send failed: {e}"),
                        }
                    }
                }
            })
        })
        .collect();

    let drained = pump_until(&b, Duration::from_secs(5), || b.stats().delivered >= 200);
    for sender in senders {
        sender.join().unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    sampler.join().unwrap();
    assert!(drained);

    // Per-channel FIFO must survive the interleaving.
    for ch in [1u8, 2u8] {
        for v in 0..100u32 {
            assert_eq!(b.try_recv(ch).unwrap().value, v);
        }
    }
}
