//! Doorbell capability: the hardware signal pair for one transport.
//!
//! The core never touches an interrupt controller directly. Each transport
//! is constructed with a [`Doorbell`] object that covers both directions:
//! `ring` triggers the remote's interrupt line, `is_asserted`/`clear`
//! observe and acknowledge our own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Signal capability injected at transport construction.
pub trait Doorbell: Send + Sync {
    /// Trigger the remote processor's doorbell.
    fn ring(&self);

    /// Whether our incoming signal line is asserted.
    fn is_asserted(&self) -> bool;

    /// Acknowledge (clear) our incoming signal line.
    fn clear(&self);
}

/// In-process doorbell pair over two shared latches.
///
/// Used by tests and same-address-space transports; a real deployment
/// implements [`Doorbell`] over the platform's mailbox or IPI registers.
pub struct MemoryDoorbell {
    /// The remote's incoming line (we ring it).
    tx: Arc<AtomicBool>,
    /// Our incoming line (the remote rings it).
    rx: Arc<AtomicBool>,
}

impl MemoryDoorbell {
    /// Create a crossed pair: ringing one side asserts the other.
    pub fn pair() -> (MemoryDoorbell, MemoryDoorbell) {
        let a_line = Arc::new(AtomicBool::new(false));
        let b_line = Arc::new(AtomicBool::new(false));
        (
            MemoryDoorbell {
                tx: b_line.clone(),
                rx: a_line.clone(),
            },
            MemoryDoorbell {
                tx: a_line,
                rx: b_line,
            },
        )
    }
}

impl Doorbell for MemoryDoorbell {
    fn ring(&self) {
        self.tx.store(true, Ordering::Release);
    }

    fn is_asserted(&self) -> bool {
        self.rx.load(Ordering::Acquire)
    }

    fn clear(&self) {
        self.rx.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_is_crossed() {
        let (a, b) = MemoryDoorbell::pair();

        assert!(!a.is_asserted());
        assert!(!b.is_asserted());

        a.ring();
        assert!(b.is_asserted());
        assert!(!a.is_asserted());

        b.clear();
        assert!(!b.is_asserted());

        b.ring();
        assert!(a.is_asserted());
        a.clear();
        assert!(!a.is_asserted());
    }
}
