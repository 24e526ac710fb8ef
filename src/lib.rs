//! Shared-memory messaging between a host and its coprocessors.
//!
//! Each remote processor pairing owns a shared segment holding two circular
//! queues of fixed 8-byte records, one per direction, plus a doorbell signal
//! pair. On top of that sit up to 256 logical channels with an open
//! handshake, per-channel receive caches, and a delivery path designed to
//! run in interrupt context: it never sleeps and never allocates.
//!
//! The building blocks, bottom up:
//!
//! - [`Msg`]: the 8-byte wire record and its kind constants
//! - [`MsgRing`]: one SPSC circular queue in shared memory
//! - [`SegmentLayout`] and [`Region`]: segment geometry and memory views
//! - [`Doorbell`]: the injected signal capability
//! - [`Transport`]: one pairing; open/close/send/recv plus the delivery path
//! - [`Registry`]: remote-id to transport lookup
//!
//! # Example
//!
//! ```
//! use coproc_ipc::{ChannelState, Msg, Transport, TransportConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let (host, coproc) = Transport::heap_pair(&TransportConfig::default());
//! let host = Arc::new(host);
//!
//! // Both sides open; delivery is pumped by hand here, a real deployment
//! // calls handle_signal from its doorbell interrupt.
//! let opener = {
//!     let host = host.clone();
//!     std::thread::spawn(move || host.open(1, Some(Duration::from_secs(1))))
//! };
//! while coproc.channel_state(1) != Some(ChannelState::Waiting) {
//!     coproc.handle_signal();
//! }
//! coproc.open(1, Some(Duration::from_secs(1))).unwrap();
//! while !opener.is_finished() {
//!     host.handle_signal();
//! }
//! opener.join().unwrap().unwrap();
//!
//! coproc.send(Msg::data(1, 7)).unwrap();
//! host.handle_signal();
//! assert_eq!(host.recv(1).unwrap().value, 7);
//! ```

pub mod channel;
pub mod doorbell;
pub mod error;
pub mod layout;
pub mod msg;
pub mod region;
pub mod registry;
pub mod ring;
pub mod transport;

pub use channel::ChannelState;
pub use doorbell::{Doorbell, MemoryDoorbell};
pub use error::Error;
pub use layout::SegmentLayout;
pub use msg::{is_valid_kind, kind_name, msg_kind, Msg, MSG_SIZE, OPEN_MAGIC};
pub use region::{HeapRegion, Region, SEGMENT_ALIGN};
pub use registry::{Registry, RemoteId};
pub use ring::{MsgRing, RingStatus, RING_HEADER_SIZE};
pub use transport::{DiePolicy, FaultHook, Transport, TransportConfig, TransportStats};
