//! Remote processor registry.
//!
//! Maps small remote ids to live transports so callers can address a peer
//! by id instead of threading `Arc<Transport>` handles everywhere. A slot
//! with no registered transport answers [`Error::DeviceUnavailable`], which
//! is also what callers see while a remote is down for a restart.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::Error;
use crate::msg::Msg;
use crate::transport::Transport;

/// Identifier of one remote processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteId(pub u8);

/// Table of registered remote processors.
pub struct Registry {
    slots: RwLock<Vec<Option<Arc<Transport>>>>,
}

impl Registry {
    /// Create a registry with `capacity` remote slots.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1 && capacity <= 256, "remote ids are one byte");
        Self {
            slots: RwLock::new(vec![None; capacity]),
        }
    }

    /// Register a transport under `id`, replacing any previous occupant.
    ///
    /// Returns the displaced transport so the caller can finish tearing it
    /// down (a restart registers the new pairing over the old one).
    ///
    /// # Panics
    ///
    /// Panics if `id` is outside the registry's capacity; registration ids
    /// come from static platform configuration, not from the wire.
    pub fn register(&self, id: RemoteId, transport: Arc<Transport>) -> Option<Arc<Transport>> {
        let mut slots = self.slots.write();
        let slot = slots
            .get_mut(id.0 as usize)
            .unwrap_or_else(|| panic!("remote id {} out of range", id.0));
        let old = slot.replace(transport);
        if old.is_some() {
            warn!(remote = id.0, "replaced an existing transport registration");
        } else {
            debug!(remote = id.0, "remote registered");
        }
        old
    }

    /// Remove the transport registered under `id`, if any.
    pub fn unregister(&self, id: RemoteId) -> Option<Arc<Transport>> {
        let mut slots = self.slots.write();
        let old = slots.get_mut(id.0 as usize).and_then(|s| s.take());
        if old.is_some() {
            debug!(remote = id.0, "remote unregistered");
        }
        old
    }

    /// Look up the transport for `id`.
    pub fn get(&self, id: RemoteId) -> Result<Arc<Transport>, Error> {
        self.slots
            .read()
            .get(id.0 as usize)
            .and_then(|s| s.clone())
            .ok_or(Error::DeviceUnavailable)
    }

    /// Open `channel` toward remote `id`. See [`Transport::open`].
    pub fn open(&self, id: RemoteId, channel: u8, timeout: Option<Duration>) -> Result<(), Error> {
        self.get(id)?.open(channel, timeout)
    }

    /// Close `channel` toward remote `id`. See [`Transport::close`].
    pub fn close(&self, id: RemoteId, channel: u8, timeout: Option<Duration>) -> Result<(), Error> {
        self.get(id)?.close(channel, timeout)
    }

    /// Send `msg` toward remote `id`. See [`Transport::send`].
    pub fn send(&self, id: RemoteId, msg: Msg) -> Result<(), Error> {
        self.get(id)?.send(msg)
    }

    /// Non-blocking receive from remote `id`. See [`Transport::try_recv`].
    pub fn try_recv(&self, id: RemoteId, channel: u8) -> Result<Msg, Error> {
        self.get(id)?.try_recv(channel)
    }

    /// Blocking receive from remote `id`. See [`Transport::recv`].
    pub fn recv(&self, id: RemoteId, channel: u8) -> Result<Msg, Error> {
        self.get(id)?.recv(channel)
    }

    /// Bounded receive from remote `id`. See [`Transport::recv_timeout`].
    pub fn recv_timeout(
        &self,
        id: RemoteId,
        channel: u8,
        timeout: Duration,
    ) -> Result<Msg, Error> {
        self.get(id)?.recv_timeout(channel, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportConfig;

    #[test]
    fn empty_slot_is_unavailable() {
        let registry = Registry::new(4);
        assert!(matches!(
            registry.get(RemoteId(2)),
            Err(Error::DeviceUnavailable)
        ));
        assert!(matches!(
            registry.send(RemoteId(2), Msg::data(0, 1)),
            Err(Error::DeviceUnavailable)
        ));
    }

    #[test]
    fn out_of_range_id_is_unavailable() {
        let registry = Registry::new(4);
        assert!(matches!(
            registry.get(RemoteId(200)),
            Err(Error::DeviceUnavailable)
        ));
    }

    #[test]
    fn register_replace_unregister() {
        let registry = Registry::new(4);
        let (a, _b) = Transport::heap_pair(&TransportConfig::default());
        let (c, _d) = Transport::heap_pair(&TransportConfig::default());

        assert!(registry.register(RemoteId(1), Arc::new(a)).is_none());
        assert!(registry.get(RemoteId(1)).is_ok());

        // Re-registering the slot hands back the displaced transport.
        let displaced = registry.register(RemoteId(1), Arc::new(c));
        assert!(displaced.is_some());

        assert!(registry.unregister(RemoteId(1)).is_some());
        assert!(registry.unregister(RemoteId(1)).is_none());
        assert!(matches!(
            registry.get(RemoteId(1)),
            Err(Error::DeviceUnavailable)
        ));
    }
}
