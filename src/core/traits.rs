//! The seams to the outside world: the peer messenger and the content store.

#[cfg(feature = "sync")]
use std::collections::HashMap;

use bytes::Bytes;
#[cfg(feature = "sync")]
use parking_lot::RwLock;
use thiserror::Error;

#[cfg(feature = "sync")]
use crate::core::{enr::Enr, message::Message};

/// Errors reported by a [`PeerMessenger`] implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MessengerError {
    #[error("the request timed out")]
    Timeout,
    #[error("the peer is unreachable")]
    Unreachable,
    #[error("messenger I/O error: {0}")]
    Io(String),
}

/// The discovery/session layer this crate runs on top of.
///
/// Requests are answered with exactly one response message, uTP packets are fire-and-forget.
/// Inbound uTP packets must be handed to [`UtpManager::on_packet`](crate::utp::UtpManager::on_packet).
#[cfg(feature = "sync")]
#[cfg_attr(doc_cfg, doc(cfg(feature = "sync")))]
#[async_trait::async_trait]
pub trait PeerMessenger: Send + Sync + 'static {
    /// Sends a request to the peer and waits for its response.
    async fn send_request(&self, peer: &Enr, request: Message) -> Result<Message, MessengerError>;

    /// Sends an encoded uTP packet on the reserved uTP sub-protocol.
    async fn send_utp(&self, peer: &Enr, packet: Bytes) -> Result<(), MessengerError>;
}

/// A key-value store for content, keyed by content key.
pub trait ContentStore: Send + Sync {
    fn get(&self, content_key: &[u8]) -> Option<Bytes>;

    fn put(&self, content_key: Bytes, content: Bytes);

    /// Returns `true` if the store holds the key; the provided implementation uses `get`.
    fn contains(&self, content_key: &[u8]) -> bool {
        self.get(content_key).is_some()
    }
}

/// An in-memory [`ContentStore`].
#[cfg(feature = "sync")]
#[cfg_attr(doc_cfg, doc(cfg(feature = "sync")))]
#[derive(Debug, Default)]
pub struct MemoryStore {
    content: RwLock<HashMap<Bytes, Bytes>>,
}

#[cfg(feature = "sync")]
impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.content.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.read().is_empty()
    }
}

#[cfg(feature = "sync")]
impl ContentStore for MemoryStore {
    fn get(&self, content_key: &[u8]) -> Option<Bytes> {
        self.content.read().get(content_key).cloned()
    }

    fn put(&self, content_key: Bytes, content: Bytes) {
        self.content.write().insert(content_key, content);
    }

    fn contains(&self, content_key: &[u8]) -> bool {
        self.content.read().contains_key(content_key)
    }
}

#[cfg(all(test, feature = "sync"))]
mod tests {
    use super::*;

    #[test]
    fn memory_store() {
        let store = MemoryStore::new();
        assert!(store.is_empty());
        assert!(!store.contains(b"key"));

        store.put(Bytes::from_static(b"key"), Bytes::from_static(b"value"));
        assert!(store.contains(b"key"));
        assert_eq!(store.get(b"key"), Some(Bytes::from_static(b"value")));

        store.put(Bytes::from_static(b"key"), Bytes::from_static(b"other"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(b"key"), Some(Bytes::from_static(b"other")));
    }
}
