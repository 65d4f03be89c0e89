//! # Messaging Core
//!
//! [`Pss`] is the top-level object: it owns the envelope codec, the key
//! registry, the forward cache, and the topic handler table, and borrows
//! the overlay and the content store through their traits.
//!
//! A `Pss` value is a cheap-to-clone handle over shared state; spawned
//! tasks and bridged sessions each hold their own clone.
//!
//! ## Message flow
//!
//! Outbound: [`Pss::send_sym`] / [`Pss::send_asym`] seal the payload into
//! an envelope and hand the wire message to [`Pss::forward`], which fans it
//! out toward the recipient address.
//!
//! Inbound: the transport read loop calls [`Pss::handle_message`] for every
//! wire message a neighbor delivers. Messages addressed elsewhere are
//! relayed; messages for this node are decrypted and dispatched to the
//! handlers registered for the envelope's topic, or fed to the key
//! handshake when they carry key material.
//!
//! ## Locking
//!
//! One mutex guards all mutable state. It is only ever taken inside
//! synchronous blocks: never across an await point, a handler invocation,
//! or a channel send.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use crate::address::{Digest, OverlayAddr, Topic};
use crate::bridge::VirtualPeer;
use crate::cache::ForwardCache;
use crate::envelope::{EnvelopeCodec, EnvelopeKeypair, EnvelopePublicKey, SymKey, SymKeyId};
use crate::error::PssError;
use crate::keyring::Keyring;
use crate::messages::{WireMessage, decode_key_msg, serialize_wire};
use crate::protocols::{ContentStore, Overlay};

/// Upper bound on candidates considered per fan-out.
pub const MAX_FORWARD_FANOUT: usize = 256;

/// Default dedup window once a fan-out completes.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3);

/// Default forward cache entry bound.
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

/// Default sizing hint for the peer map.
pub const DEFAULT_PEER_CAPACITY: usize = 256;

/// Default sizing hint for topics per peer.
pub const DEFAULT_TOPIC_CAPACITY: usize = 8;

/// Default symmetric key validity. Refreshed on use, so an active channel
/// stays secured indefinitely while an abandoned one lapses.
pub const DEFAULT_SYMKEY_VALIDITY: Duration = Duration::from_secs(24 * 60 * 60);

/// Default envelope proof-of-work difficulty in leading zero bits.
pub const DEFAULT_POW_DIFFICULTY: u32 = 8;

/// Tunables for a [`Pss`] instance.
#[derive(Clone, Debug)]
pub struct PssConfig {
    /// How long a completed fan-out suppresses duplicate copies.
    pub cache_ttl: Duration,
    /// Forward cache entry bound.
    pub cache_capacity: usize,
    /// Sizing hint for the peer map.
    pub peer_capacity: usize,
    /// Sizing hint for topics per peer.
    pub topic_capacity: usize,
    /// Validity added whenever a symmetric key is installed or used.
    pub symkey_validity: Duration,
    /// Envelope stamp difficulty; 0 disables stamping and checking.
    pub pow_difficulty: u32,
}

impl Default for PssConfig {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_CACHE_TTL,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            peer_capacity: DEFAULT_PEER_CAPACITY,
            topic_capacity: DEFAULT_TOPIC_CAPACITY,
            symkey_validity: DEFAULT_SYMKEY_VALIDITY,
            pow_difficulty: DEFAULT_POW_DIFFICULTY,
        }
    }
}

/// Application callback for inbound payloads on a topic.
///
/// Invoked with the decrypted payload, a synthetic peer describing the
/// remote end, and the sender's overlay address. Handlers run outside the
/// core lock and may re-enter any `Pss` operation.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        payload: &[u8],
        peer: &VirtualPeer,
        sender: OverlayAddr,
    ) -> anyhow::Result<()>;
}

/// Identifies one registered handler for deregistration. Removing a
/// handler never affects its siblings on the same topic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandlerId {
    topic: Topic,
    seq: u64,
}

pub(crate) struct PssState {
    pub keyring: Keyring,
    pub cache: ForwardCache,
    handlers: HashMap<Topic, HashMap<u64, Arc<dyn Handler>>>,
    next_handler: u64,
    pub stopped: bool,
}

pub(crate) struct PssInner {
    overlay: Arc<dyn Overlay>,
    store: Arc<dyn ContentStore>,
    codec: EnvelopeCodec,
    keys: EnvelopeKeypair,
    state: Mutex<PssState>,
}

/// Handle to the messaging core. Cheap to clone.
#[derive(Clone)]
pub struct Pss {
    inner: Arc<PssInner>,
}

impl Pss {
    pub fn new(
        overlay: Arc<dyn Overlay>,
        store: Arc<dyn ContentStore>,
        keys: EnvelopeKeypair,
        config: PssConfig,
    ) -> Self {
        let state = PssState {
            keyring: Keyring::new(
                config.peer_capacity,
                config.topic_capacity,
                config.symkey_validity,
            ),
            cache: ForwardCache::new(config.cache_capacity, config.cache_ttl),
            handlers: HashMap::new(),
            next_handler: 1,
            stopped: false,
        };
        Self {
            inner: Arc::new(PssInner {
                overlay,
                store,
                codec: EnvelopeCodec::new(config.pow_difficulty),
                keys,
                state: Mutex::new(state),
            }),
        }
    }

    /// Run a closure against the locked state. The closure is synchronous,
    /// which keeps the lock from ever spanning an await point.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut PssState) -> R) -> R {
        let mut state = self.inner.state.lock().expect("pss state lock poisoned");
        f(&mut state)
    }

    pub(crate) fn downgrade(&self) -> Weak<PssInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_inner(inner: Arc<PssInner>) -> Self {
        Self { inner }
    }

    /// This node's overlay address.
    pub fn base_addr(&self) -> OverlayAddr {
        self.inner.overlay.base_addr()
    }

    /// This node's envelope public key pair.
    pub fn public_key(&self) -> EnvelopePublicKey {
        self.inner.keys.public()
    }

    // ------------------------------------------------------------------
    // Key management
    // ------------------------------------------------------------------

    /// Register a peer's public key, required to initiate a handshake
    /// toward it.
    pub fn add_public_key(&self, addr: OverlayAddr, topic: Topic, key: EnvelopePublicKey) {
        self.with_state(|s| s.keyring.add_public_key(addr, topic, key));
    }

    /// Install `raw` as the key for opening envelopes from (addr, topic).
    pub fn set_inbound_symkey(&self, addr: OverlayAddr, topic: Topic, raw: SymKey) -> SymKeyId {
        let id = self.inner.codec.register_symkey(raw);
        self.with_state(|s| s.keyring.install_inbound(addr, topic, id));
        id
    }

    /// Install `raw` as the key for sealing envelopes toward (addr, topic).
    pub fn set_outbound_symkey(&self, addr: OverlayAddr, topic: Topic, raw: SymKey) -> SymKeyId {
        let id = self.inner.codec.register_symkey(raw);
        self.with_state(|s| s.keyring.install_outbound(addr, topic, id));
        id
    }

    /// Whether (addr, topic) holds an unexpired key pair in both directions.
    pub fn is_secured(&self, addr: OverlayAddr, topic: Topic) -> bool {
        self.with_state(|s| s.keyring.is_secured(&addr, &topic))
    }

    /// Whether a virtual protocol session is running for (addr, topic).
    pub fn is_active(&self, addr: OverlayAddr, topic: Topic) -> bool {
        self.with_state(|s| s.keyring.is_active(&addr, &topic))
    }

    // ------------------------------------------------------------------
    // Handler registry
    // ------------------------------------------------------------------

    /// Register a handler for every inbound payload on `topic`.
    pub fn register_handler(&self, topic: Topic, handler: Arc<dyn Handler>) -> HandlerId {
        self.with_state(|s| {
            let seq = s.next_handler;
            s.next_handler += 1;
            s.handlers.entry(topic).or_default().insert(seq, handler);
            HandlerId { topic, seq }
        })
    }

    /// Remove a single handler. Returns whether it was still registered.
    pub fn deregister_handler(&self, id: HandlerId) -> bool {
        self.with_state(|s| {
            let Some(handlers) = s.handlers.get_mut(&id.topic) else {
                return false;
            };
            let removed = handlers.remove(&id.seq).is_some();
            if handlers.is_empty() {
                s.handlers.remove(&id.topic);
            }
            removed
        })
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Send `payload` to (to, topic) under the established outbound
    /// symmetric key. Fails with [`PssError::NotSecured`] before touching
    /// the transport if the pair has no valid key in both directions.
    pub async fn send_sym(
        &self,
        to: OverlayAddr,
        topic: Topic,
        payload: &[u8],
    ) -> Result<(), PssError> {
        let key_id = self.with_state(|s| {
            if !s.keyring.is_secured(&to, &topic) {
                return None;
            }
            s.keyring.touch(to, topic);
            s.keyring.outbound_key(&to, &topic)
        });
        let key_id = key_id.ok_or(PssError::NotSecured)?;
        let key = self
            .inner
            .codec
            .get_symkey(key_id)
            .ok_or_else(|| PssError::Codec(format!("{key_id} missing from key table")))?;
        let env = self.inner.codec.seal_sym(topic, &key, payload)?;
        self.forward(&WireMessage { to, payload: env }).await
    }

    /// Send `payload` to (to, topic) sealed to the peer's registered public
    /// key, signed by this node.
    pub async fn send_asym(
        &self,
        to: OverlayAddr,
        topic: Topic,
        payload: &[u8],
    ) -> Result<(), PssError> {
        let dst = self
            .with_state(|s| s.keyring.pubkey(&to, &topic))
            .ok_or(PssError::NoPublicKey)?;
        let env = self
            .inner
            .codec
            .seal_asym(topic, &self.inner.keys, &dst, payload)?;
        self.forward(&WireMessage { to, payload: env }).await
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Entry point for the transport read loop: one wire message delivered
    /// by the directly connected neighbor `from` (or injected locally when
    /// `from` is `None`).
    ///
    /// Inbound handshake failures are logged and swallowed here; a bad
    /// message never kills the connection that carried it.
    pub async fn handle_message(
        &self,
        from: Option<OverlayAddr>,
        msg: WireMessage,
    ) -> Result<(), PssError> {
        if msg.to != self.base_addr() {
            trace!(to = %msg.to.short_hex(), "not for us, relaying");
            let digest = self.digest(&msg).await?;
            if let Some(from) = from {
                self.with_state(|s| s.cache.mark_sender(digest, from));
            }
            return self.forward_digested(&msg, digest).await;
        }
        match self.process(&msg).await {
            Err(PssError::InvalidHandshake(reason)) => {
                warn!(%reason, "rejected handshake message");
                Ok(())
            }
            other => other,
        }
    }

    /// Process a message for which this node is the recipient: decrypt,
    /// identify the sender, and dispatch by topic or feed the handshake.
    pub async fn process(&self, msg: &WireMessage) -> Result<(), PssError> {
        let env = &msg.payload;
        if !self.inner.codec.check_pow(env) {
            trace!("dropping envelope with insufficient stamp");
            return Ok(());
        }
        let topic = env.topic();

        // Symmetric pass: try every installed inbound key in installation
        // order; the reverse index names the sender on the first match.
        for key_id in self.with_state(|s| s.keyring.inbound_try()) {
            let Some(key) = self.inner.codec.get_symkey(key_id) else {
                continue;
            };
            let Some(plain) = self.inner.codec.open_sym(env, &key) else {
                continue;
            };
            let Some(sender) = self.with_state(|s| s.keyring.reverse_lookup(key_id, &topic))
            else {
                trace!(%key_id, %topic, "symmetric match without reverse index entry");
                continue;
            };
            let secured = self.with_state(|s| {
                let secured = s.keyring.is_secured(&sender, &topic);
                if secured {
                    s.keyring.touch(sender, topic);
                }
                secured
            });
            if !secured {
                return self.accept_key_reply(sender, topic, &plain);
            }
            return self.dispatch(topic, &plain, sender).await;
        }

        // Asymmetric pass: either a handshake bootstrap for us, or an
        // envelope that was never ours. The latter is dropped silently.
        let Some(opened) = self.inner.codec.open_asym(env, &self.inner.keys) else {
            trace!(%topic, "envelope opened with none of our keys, dropping");
            return Ok(());
        };
        if !opened.valid {
            return Err(PssError::InvalidHandshake("signature validation failed"));
        }
        let keymsg = decode_key_msg(&opened.payload)
            .map_err(|_| PssError::InvalidHandshake("payload is not a key message"))?;
        self.accept_handshake(keymsg, topic, opened.sender).await
    }

    async fn dispatch(
        &self,
        topic: Topic,
        payload: &[u8],
        sender: OverlayAddr,
    ) -> Result<(), PssError> {
        let handlers: Vec<Arc<dyn Handler>> = self.with_state(|s| {
            s.handlers
                .get(&topic)
                .map(|m| m.values().cloned().collect())
                .unwrap_or_default()
        });
        if handlers.is_empty() {
            return Err(PssError::NoHandler(topic));
        }
        let peer = VirtualPeer::new(sender);
        for handler in handlers {
            handler
                .handle(payload, &peer, sender)
                .await
                .map_err(|err| PssError::Handler(err.to_string()))?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Forwarding
    // ------------------------------------------------------------------

    /// Relay a wire message toward its recipient address.
    ///
    /// Messages addressed to this node loop back into [`Pss::process`].
    /// Fan-out walks the overlay's candidates in proximity order: inside
    /// the recipient's proximity bin every candidate is tried, and the
    /// first successful send to the recipient itself or to a peer outside
    /// the bin ends the walk.
    pub async fn forward(&self, msg: &WireMessage) -> Result<(), PssError> {
        if msg.to == self.base_addr() {
            return Box::pin(self.process(msg)).await;
        }
        let digest = self.digest(msg).await?;
        self.forward_digested(msg, digest).await
    }

    async fn forward_digested(&self, msg: &WireMessage, digest: Digest) -> Result<(), PssError> {
        if self.with_state(|s| s.cache.should_skip(None, &digest)) {
            trace!(
                digest = %hex::encode(&digest[..4]),
                to = %msg.to.short_hex(),
                "duplicate within dedup window, dropping"
            );
            return Ok(());
        }

        let candidates = self
            .inner
            .overlay
            .conn_candidates(&msg.to, MAX_FORWARD_FANOUT);
        let mut sent = 0usize;
        for candidate in candidates {
            let addr = candidate.peer.address();
            if self.with_state(|s| s.cache.should_skip(Some(&addr), &digest)) {
                trace!(peer = %addr.short_hex(), "skipping candidate already involved");
                continue;
            }
            if let Err(err) = candidate.peer.send(msg).await {
                warn!(peer = %addr.short_hex(), error = %err, "forward attempt failed");
                continue;
            }
            self.with_state(|s| s.cache.mark_sender(digest, addr));
            sent += 1;
            if addr == msg.to || !candidate.in_prox_bin {
                break;
            }
            trace!(peer = %addr.short_hex(), "candidate in proximity bin, continuing fan-out");
        }

        if sent == 0 {
            return Err(PssError::NoRoute);
        }
        self.with_state(|s| s.cache.mark_expire(digest));
        debug!(
            to = %msg.to.short_hex(),
            sent,
            "fan-out complete"
        );
        Ok(())
    }

    async fn digest(&self, msg: &WireMessage) -> Result<Digest, PssError> {
        let bytes = serialize_wire(msg).map_err(|err| PssError::Codec(err.to_string()))?;
        self.inner
            .store
            .store(&bytes)
            .await
            .map_err(|err| PssError::Store(err.to_string()))
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Shut down: closes every virtual protocol session channel, so each
    /// bridged `run` observes end-of-stream and returns. Keys and handlers
    /// stay in place; no new bridged sessions are opened afterwards.
    pub fn stop(&self) {
        let cleared = self.with_state(|s| {
            s.stopped = true;
            s.keyring.clear_all_rw()
        });
        debug!(sessions = cleared, "stopped, virtual protocol channels closed");
    }
}

impl fmt::Display for Pss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pss: addr {} pubkey {}",
            self.base_addr().short_hex(),
            self.public_key().to_hex()
        )
    }
}
