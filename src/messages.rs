//! # Wire Types
//!
//! Serializable message types crossing a process boundary, and the bounded
//! bincode options used to decode them.
//!
//! | Type | Carried by | Encoding |
//! |------|-----------|----------|
//! | [`WireMessage`] | the transport between directly connected peers | fixint |
//! | [`HandshakeKeyMessage`] | an asymmetrically sealed envelope | fixint |
//! | [`ProtocolMsg`] | a sealed envelope, once per bridged frame | varint |
//!
//! All deserialization goes through options with a hard size limit so a
//! hostile length prefix cannot force a huge allocation.

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::address::OverlayAddr;
use crate::envelope::{Envelope, SymKey};

/// Maximum payload size accepted on any wire path (10 MiB).
pub const MAX_MSG_SIZE: usize = 10 * 1024 * 1024;

/// Maximum buffer size for deserialization. Slightly larger than
/// `MAX_MSG_SIZE` to allow for envelope and framing overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_MSG_SIZE as u64) + 4096;

/// Bincode options for wire messages: fixed-width integers, bounded.
fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Bincode options for virtual-protocol frames: varint-coded, bounded.
/// The frame's `code` field is variable-width on the wire.
fn frame_options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_DESERIALIZE_SIZE)
}

/// The unit that travels between directly connected peers: an opaque
/// envelope plus the overlay address it is converging on.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WireMessage {
    pub to: OverlayAddr,
    pub payload: Envelope,
}

pub fn serialize_wire(msg: &WireMessage) -> Result<Vec<u8>, bincode::Error> {
    wire_options().serialize(msg)
}

pub fn deserialize_wire(bytes: &[u8]) -> Result<WireMessage, bincode::Error> {
    wire_options().deserialize(bytes)
}

/// Key exchange payload. Carried asymmetrically to bootstrap a pair of
/// symmetric keys, and symmetrically when the responder returns its half.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeKeyMessage {
    /// Overlay address of the key's owner.
    pub from: OverlayAddr,
    /// Raw symmetric key the receiver must use for messages toward `from`.
    pub key: SymKey,
}

pub fn encode_key_msg(msg: &HandshakeKeyMessage) -> Result<Vec<u8>, bincode::Error> {
    wire_options().serialize(msg)
}

pub fn decode_key_msg(bytes: &[u8]) -> Result<HandshakeKeyMessage, bincode::Error> {
    wire_options().deserialize(bytes)
}

/// One framed record of a bridged subprotocol.
///
/// `size` is redundant with `payload.len()` on purpose: the receiving
/// bridge validates the two against each other before injecting the frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolMsg {
    pub code: u64,
    pub size: u32,
    pub payload: Vec<u8>,
}

impl ProtocolMsg {
    pub fn new(code: u64, payload: Vec<u8>) -> Self {
        Self {
            code,
            size: payload.len() as u32,
            payload,
        }
    }

    /// True iff the size field matches the payload length.
    pub fn is_consistent(&self) -> bool {
        self.size as usize == self.payload.len()
    }
}

pub fn encode_frame(msg: &ProtocolMsg) -> Result<Vec<u8>, bincode::Error> {
    frame_options().serialize(msg)
}

pub fn decode_frame(bytes: &[u8]) -> Result<ProtocolMsg, bincode::Error> {
    frame_options().deserialize(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Topic;
    use crate::envelope::EnvelopeCodec;

    fn test_addr(seed: u8) -> OverlayAddr {
        OverlayAddr::from_bytes([seed; 32])
    }

    fn test_envelope() -> Envelope {
        let codec = EnvelopeCodec::new(0);
        codec
            .seal_sym(Topic::new([1, 2, 3, 4]), &[7u8; 32], b"payload")
            .expect("seal")
    }

    #[test]
    fn wire_message_round_trip() {
        let msg = WireMessage {
            to: test_addr(9),
            payload: test_envelope(),
        };
        let bytes = serialize_wire(&msg).expect("serialize");
        let decoded = deserialize_wire(&bytes).expect("deserialize");
        assert_eq!(decoded.to, msg.to);
        assert_eq!(decoded.payload.topic(), msg.payload.topic());
    }

    #[test]
    fn malformed_wire_data_rejected() {
        assert!(deserialize_wire(&[0xff, 0xfe, 0xfd]).is_err());

        let msg = WireMessage {
            to: test_addr(1),
            payload: test_envelope(),
        };
        let bytes = serialize_wire(&msg).expect("serialize");
        assert!(deserialize_wire(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn key_message_round_trip() {
        let msg = HandshakeKeyMessage {
            from: test_addr(3),
            key: [0xaa; 32],
        };
        let bytes = encode_key_msg(&msg).expect("encode");
        assert_eq!(decode_key_msg(&bytes).expect("decode"), msg);
    }

    #[test]
    fn frame_round_trip() {
        let frame = ProtocolMsg::new(0x10, b"ping".to_vec());
        assert!(frame.is_consistent());
        let bytes = encode_frame(&frame).expect("encode");
        assert_eq!(decode_frame(&bytes).expect("decode"), frame);
    }

    #[test]
    fn frame_size_mismatch_is_detectable() {
        let frame = ProtocolMsg {
            code: 1,
            size: 99,
            payload: b"short".to_vec(),
        };
        assert!(!frame.is_consistent());
        // The mismatch survives the wire; the bridge rejects it on receipt.
        let bytes = encode_frame(&frame).expect("encode");
        assert!(!decode_frame(&bytes).expect("decode").is_consistent());
    }

    #[test]
    fn truncated_frame_rejected() {
        let frame = ProtocolMsg::new(1, vec![0u8; 64]);
        let mut bytes = encode_frame(&frame).expect("encode");
        bytes.truncate(3);
        assert!(decode_frame(&bytes).is_err());
    }
}
