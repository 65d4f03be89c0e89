//! # Key Registry
//!
//! Per-(peer, topic) key state: the peer's public key, the symmetric key
//! handles for each direction, their shared expiry, and the virtual
//! protocol channel slot when a bridged session is active.
//!
//! Two indexes are kept consistent:
//!
//! - `peers`: `OverlayAddr → Topic → PeerTopicState`, the forward view.
//! - `reverse`: `SymKeyId → Topic → OverlayAddr`, the authoritative record
//!   of which peer owns each inbound key. Inbound decryption identifies the
//!   sender through this index alone.
//!
//! Plus `inbound_try`, the insertion-ordered list of every inbound key
//! handle, which the dispatcher walks when opening an unknown envelope.
//!
//! Entries are created lazily and never collected within a session. When a
//! peer re-keys, the superseded reverse entry stays behind; it still maps
//! to the same address, so a late message sealed under the old key is
//! attributed correctly.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::address::{OverlayAddr, Topic};
use crate::envelope::{EnvelopePublicKey, SymKeyId};
use crate::messages::ProtocolMsg;

/// Key and session state for one (peer, topic) pair.
#[derive(Default)]
pub(crate) struct PeerTopicState {
    /// Long-term public key, required to initiate an asymmetric handshake.
    pub pubkey: Option<EnvelopePublicKey>,
    /// Key handle used to open incoming envelopes from this peer.
    pub inbound: Option<SymKeyId>,
    /// Key handle used to seal outgoing envelopes to this peer.
    pub outbound: Option<SymKeyId>,
    /// Both keys become invalid once this passes.
    pub expires_at: Option<Instant>,
    /// Injection side of an active virtual protocol session.
    pub rw: Option<mpsc::Sender<ProtocolMsg>>,
}

pub(crate) struct Keyring {
    peers: HashMap<OverlayAddr, HashMap<Topic, PeerTopicState>>,
    reverse: HashMap<SymKeyId, HashMap<Topic, OverlayAddr>>,
    inbound_try: Vec<SymKeyId>,
    validity: Duration,
    topic_capacity: usize,
}

impl Keyring {
    pub fn new(peer_capacity: usize, topic_capacity: usize, validity: Duration) -> Self {
        Self {
            peers: HashMap::with_capacity(peer_capacity),
            reverse: HashMap::new(),
            inbound_try: Vec::new(),
            validity,
            topic_capacity,
        }
    }

    fn entry(&mut self, addr: OverlayAddr, topic: Topic) -> &mut PeerTopicState {
        let capacity = self.topic_capacity;
        self.peers
            .entry(addr)
            .or_insert_with(|| HashMap::with_capacity(capacity))
            .entry(topic)
            .or_default()
    }

    fn get(&self, addr: &OverlayAddr, topic: &Topic) -> Option<&PeerTopicState> {
        self.peers.get(addr)?.get(topic)
    }

    pub fn add_public_key(&mut self, addr: OverlayAddr, topic: Topic, key: EnvelopePublicKey) {
        self.entry(addr, topic).pubkey = Some(key);
    }

    pub fn pubkey(&self, addr: &OverlayAddr, topic: &Topic) -> Option<EnvelopePublicKey> {
        self.get(addr, topic)?.pubkey
    }

    /// Install a registered key handle as the inbound key for (addr, topic):
    /// appends it to the try list, claims it in the reverse index, and
    /// restarts the validity clock.
    pub fn install_inbound(&mut self, addr: OverlayAddr, topic: Topic, id: SymKeyId) {
        let deadline = Instant::now() + self.validity;
        let state = self.entry(addr, topic);
        state.inbound = Some(id);
        state.expires_at = Some(deadline);
        self.inbound_try.push(id);
        self.reverse.entry(id).or_default().insert(topic, addr);
    }

    /// Install a registered key handle as the outbound key for (addr, topic).
    pub fn install_outbound(&mut self, addr: OverlayAddr, topic: Topic, id: SymKeyId) {
        let deadline = Instant::now() + self.validity;
        let state = self.entry(addr, topic);
        state.outbound = Some(id);
        state.expires_at = Some(deadline);
    }

    /// A pair is secured iff both key handles are set and unexpired.
    pub fn is_secured(&self, addr: &OverlayAddr, topic: &Topic) -> bool {
        let Some(state) = self.get(addr, topic) else {
            return false;
        };
        state.inbound.is_some()
            && state.outbound.is_some()
            && state.expires_at.is_some_and(|deadline| deadline > Instant::now())
    }

    /// Outbound key handle, regardless of expiry; callers gate on
    /// [`is_secured`](Self::is_secured) first.
    pub fn outbound_key(&self, addr: &OverlayAddr, topic: &Topic) -> Option<SymKeyId> {
        self.get(addr, topic)?.outbound
    }

    /// Restart the validity clock on an actively used secured pair.
    pub fn touch(&mut self, addr: OverlayAddr, topic: Topic) {
        let validity = self.validity;
        if let Some(state) = self.peers.get_mut(&addr).and_then(|t| t.get_mut(&topic))
            && state.inbound.is_some()
            && state.outbound.is_some()
        {
            state.expires_at = Some(Instant::now() + validity);
        }
    }

    /// Owner of an inbound key handle on a topic.
    pub fn reverse_lookup(&self, id: SymKeyId, topic: &Topic) -> Option<OverlayAddr> {
        self.reverse.get(&id)?.get(topic).copied()
    }

    /// Snapshot of every inbound key handle, in installation order.
    pub fn inbound_try(&self) -> Vec<SymKeyId> {
        self.inbound_try.clone()
    }

    // ------------------------------------------------------------------
    // Virtual protocol channel slots
    // ------------------------------------------------------------------

    pub fn set_rw(&mut self, addr: OverlayAddr, topic: Topic, tx: mpsc::Sender<ProtocolMsg>) {
        self.entry(addr, topic).rw = Some(tx);
    }

    pub fn rw_sender(&self, addr: &OverlayAddr, topic: &Topic) -> Option<mpsc::Sender<ProtocolMsg>> {
        self.get(addr, topic)?.rw.clone()
    }

    /// Clear the session slot; key state is untouched.
    pub fn clear_rw(&mut self, addr: &OverlayAddr, topic: &Topic) {
        if let Some(state) = self.peers.get_mut(addr).and_then(|t| t.get_mut(topic)) {
            state.rw = None;
        }
    }

    /// Drop every session channel, closing all virtual protocol sessions.
    /// Returns how many were active.
    pub fn clear_all_rw(&mut self) -> usize {
        let mut cleared = 0;
        for topics in self.peers.values_mut() {
            for state in topics.values_mut() {
                if state.rw.take().is_some() {
                    cleared += 1;
                }
            }
        }
        cleared
    }

    pub fn is_active(&self, addr: &OverlayAddr, topic: &Topic) -> bool {
        self.get(addr, topic).is_some_and(|state| state.rw.is_some())
    }
}
