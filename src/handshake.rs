//! # Key Handshake
//!
//! Establishes the pair of symmetric keys for a (peer, topic) channel by
//! bootstrapping over the asymmetric envelope path.
//!
//! The exchange is two messages:
//!
//! 1. The initiator generates key `Ka`, installs it as its inbound key for
//!    the peer, and sends `HandshakeKeyMessage { from, key: Ka }` sealed to
//!    the peer's public key.
//! 2. The responder installs `Ka` as its outbound key and, unless the pair
//!    is already secured, generates `Kb`, installs it inbound, and returns
//!    `HandshakeKeyMessage { from, key: Kb }` sealed symmetrically under
//!    `Ka`. When the initiator opens that reply it installs `Kb` outbound
//!    and both sides hold a secured pair.
//!
//! When two handshakes race, each side simply installs the other's most
//! recent key; superseded inbound keys stay resolvable through the reverse
//! index so in-flight messages are not lost.

use tracing::debug;

use crate::address::{OverlayAddr, Topic};
use crate::envelope::random_symkey;
use crate::error::PssError;
use crate::messages::{HandshakeKeyMessage, decode_key_msg, encode_key_msg};
use crate::pss::Pss;

impl Pss {
    /// Initiate a key handshake toward `to` on `topic`.
    ///
    /// Requires the peer's public key to be registered. Installs a fresh
    /// inbound key before transmitting, so the responder's symmetric reply
    /// can be opened as soon as it arrives.
    pub async fn send_handshake(&self, to: OverlayAddr, topic: Topic) -> Result<(), PssError> {
        let key = random_symkey();
        self.set_inbound_symkey(to, topic, key);
        let msg = HandshakeKeyMessage {
            from: self.base_addr(),
            key,
        };
        let encoded = encode_key_msg(&msg).map_err(|err| PssError::Codec(err.to_string()))?;
        debug!(peer = %to.short_hex(), %topic, "initiating key handshake");
        self.send_asym(to, topic, &encoded).await
    }

    /// Accept an asymmetrically delivered handshake: install the peer's key
    /// outbound and complete our half of the exchange if needed.
    pub(crate) async fn accept_handshake(
        &self,
        keymsg: HandshakeKeyMessage,
        topic: Topic,
        sender_key: crate::envelope::EnvelopePublicKey,
    ) -> Result<(), PssError> {
        let from = keymsg.from;
        // The envelope signature validated against this key, so remember it;
        // it lets us answer (or re-key) asymmetrically later.
        self.add_public_key(from, topic, sender_key);
        self.set_outbound_symkey(from, topic, keymsg.key);
        debug!(peer = %from.short_hex(), %topic, "installed outbound key from handshake");

        if self.is_secured(from, topic) {
            return Ok(());
        }

        let fresh = random_symkey();
        self.set_inbound_symkey(from, topic, fresh);
        let reply = HandshakeKeyMessage {
            from: self.base_addr(),
            key: fresh,
        };
        let encoded = encode_key_msg(&reply).map_err(|err| PssError::Codec(err.to_string()))?;
        debug!(peer = %from.short_hex(), %topic, "returning fresh inbound key");
        self.send_sym(from, topic, &encoded).await
    }

    /// Accept the responder's symmetric key reply: a symmetric decryption
    /// that succeeded while the pair is not yet secured can only be the
    /// second handshake message.
    pub(crate) fn accept_key_reply(
        &self,
        sender: OverlayAddr,
        topic: Topic,
        plain: &[u8],
    ) -> Result<(), PssError> {
        let keymsg = decode_key_msg(plain)
            .map_err(|_| PssError::InvalidHandshake("unsecured peer sent a non-key payload"))?;
        if keymsg.from != sender {
            return Err(PssError::InvalidHandshake(
                "key reply owner does not match envelope sender",
            ));
        }
        self.set_outbound_symkey(sender, topic, keymsg.key);
        debug!(peer = %sender.short_hex(), %topic, "handshake complete");
        Ok(())
    }
}
