//! # Sotto - Privacy-Preserving Overlay Messaging
//!
//! Sotto lets a node send an opaque payload to a recipient identified only
//! by an overlay address. Messages are sealed end-to-end, relayed through
//! a Kademlia-style neighborhood of directly connected peers, and
//! dispatched by topic at the destination. Relaying nodes see routing
//! metadata, never content.
//!
//! ## Architecture
//!
//! The core is transport-agnostic: the embedding node supplies the overlay
//! routing table, the per-peer transport, and a content-addressed store
//! through traits, and drives the inbound side by feeding received wire
//! messages into [`Pss::handle_message`].
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `pss` | Top-level handle: dispatch, forwarding, sending, handlers |
//! | `address` | Overlay addresses, topics, digests |
//! | `envelope` | Sealing/opening, symmetric key table, proof-of-work stamp |
//! | `keyring` | Per-(peer, topic) key state and reverse key index |
//! | `cache` | Forward cache: duplicate and bounce suppression |
//! | `handshake` | Symmetric key pair establishment over asymmetric bootstrap |
//! | `bridge` | Framed subprotocols run across the overlay |
//! | `messages` | Wire types with bounded serialization |
//! | `protocols` | Collaborator traits (transport, overlay, store) |
//!
//! ## Security Model
//!
//! - Payloads are sealed with ChaCha20-Poly1305; the asymmetric bootstrap
//!   path layers ephemeral X25519 agreement and Ed25519 signatures on top.
//! - A per-(peer, topic) pair of one-directional symmetric keys is
//!   negotiated by a two-message handshake and expires unless used.
//! - Envelopes carry a small proof-of-work stamp, checked before any
//!   decryption is attempted.
//! - Forwarding is best-effort: duplicate suppression and neighborhood
//!   multicast, no delivery or ordering guarantees.

mod address;
mod bridge;
mod cache;
mod envelope;
mod error;
mod handshake;
mod keyring;
mod messages;
mod protocols;
mod pss;

pub use address::{ADDR_LEN, Digest, OverlayAddr, TOPIC_LEN, Topic};
pub use bridge::{ProtocolRunner, ProtocolSpec, VirtualPeer, VirtualReadWriter};
pub use envelope::{
    Envelope, EnvelopeCodec, EnvelopeKeypair, EnvelopePublicKey, OpenedAsym, SYMKEY_LEN, SymKey,
    SymKeyId, random_symkey,
};
pub use error::PssError;
pub use messages::{
    HandshakeKeyMessage, MAX_MSG_SIZE, ProtocolMsg, WireMessage, decode_frame, decode_key_msg,
    deserialize_wire, encode_frame, encode_key_msg, serialize_wire,
};
pub use protocols::{ConnCandidate, ContentStore, MemoryStore, Overlay, RelayPeer};
pub use pss::{
    DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL, DEFAULT_PEER_CAPACITY, DEFAULT_POW_DIFFICULTY,
    DEFAULT_SYMKEY_VALIDITY, DEFAULT_TOPIC_CAPACITY, Handler, HandlerId, MAX_FORWARD_FANOUT, Pss,
    PssConfig,
};
