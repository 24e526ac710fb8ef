//! Shared helpers for the integration tests.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use coproc_ipc::{ChannelState, Transport, TransportConfig};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

pub fn pair() -> (Arc<Transport>, Arc<Transport>) {
    pair_with(&TransportConfig::default())
}

pub fn pair_with(config: &TransportConfig) -> (Arc<Transport>, Arc<Transport>) {
    init_tracing();
    let (a, b) = Transport::heap_pair(config);
    (Arc::new(a), Arc::new(b))
}

/// Run the open handshake for `channel` from both ends, pumping delivery by
/// hand the way a doorbell interrupt would.
pub fn duplex_open(a: &Arc<Transport>, b: &Arc<Transport>, channel: u8) {
    let a2 = a.clone();
    let opener = thread::spawn(move || a2.open(channel, Some(Duration::from_secs(5))));

    while b.channel_state(channel) != Some(ChannelState::Waiting) {
        b.handle_signal();
        thread::yield_now();
    }
    b.open(channel, Some(Duration::from_secs(5))).unwrap();

    while !opener.is_finished() {
        a.handle_signal();
        thread::yield_now();
    }
    opener.join().unwrap().unwrap();
}

/// Pump `t`'s delivery path until `pred` holds or the timeout expires.
pub fn pump_until(t: &Arc<Transport>, timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while !pred() {
        if std::time::Instant::now() >= deadline {
            return false;
        }
        t.handle_signal();
        thread::yield_now();
    }
    true
}
