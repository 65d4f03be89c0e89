//! Collaborator trait definitions for the messaging core.
//!
//! The core routes messages; it does not own a transport, a routing table,
//! or a blob store. Each of those is a named seam:
//!
//! | Collaborator | Trait | Purpose |
//! |--------------|-------|---------|
//! | Transport | [`RelayPeer`] | Deliver a wire message to a directly connected peer |
//! | Routing table | [`Overlay`] | Own address + peers in proximity order to a target |
//! | Blob store | [`ContentStore`] | Stable content digest of a serialized message |
//!
//! Traits are defined here separately from the core so implementations can
//! live in the embedding node (or in tests) without circular dependencies.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::address::{Digest, OverlayAddr};
use crate::messages::WireMessage;

/// A directly connected peer on the wire-message routing layer.
#[async_trait]
pub trait RelayPeer: Send + Sync {
    /// Overlay address of the peer.
    fn address(&self) -> OverlayAddr;

    /// Deliver one wire message. Sends are serialized per peer by the
    /// transport and may block on it.
    async fn send(&self, msg: &WireMessage) -> Result<()>;
}

/// One fan-out candidate produced by the overlay.
#[derive(Clone)]
pub struct ConnCandidate {
    pub peer: Arc<dyn RelayPeer>,
    /// Whether the peer shares the recipient's proximity bin, the set of
    /// closest-known neighbors of the target address. Inside the bin the
    /// forwarder multicasts; the first candidate outside it ends the
    /// fan-out.
    pub in_prox_bin: bool,
}

/// The overlay routing table.
pub trait Overlay: Send + Sync {
    /// This node's own overlay address.
    fn base_addr(&self) -> OverlayAddr;

    /// Connected peers in order of increasing distance to `target`, at most
    /// `limit` of them.
    fn conn_candidates(&self, target: &OverlayAddr, limit: usize) -> Vec<ConnCandidate>;
}

/// Content-addressed blob storage. The core uses it for exactly one thing:
/// a stable digest of each serialized wire message. Writes are idempotent
/// by content hash.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn store(&self, data: &[u8]) -> Result<Digest>;
}

/// In-memory content store keyed by BLAKE3 hash.
#[derive(Default)]
pub struct MemoryStore {
    chunks: tokio::sync::Mutex<HashMap<Digest, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn store(&self, data: &[u8]) -> Result<Digest> {
        let digest = *blake3::hash(data).as_bytes();
        self.chunks.lock().await.insert(digest, data.to_vec());
        Ok(digest)
    }
}
