//! # Overlay Addressing
//!
//! Core addressing types shared by every layer of the crate:
//!
//! - [`OverlayAddr`]: 32-byte node identifier in the overlay's XOR metric space
//! - [`Topic`]: 4-byte tag selecting a logical channel and its handlers
//! - [`Digest`]: 32-byte content hash used as the forward-cache key
//!
//! An overlay address is a position in the routing metric space, not a
//! network address. Proximity between two addresses is the number of
//! leading bits their XOR distance shares with zero; higher proximity
//! means closer in the keyspace.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Byte length of an overlay address.
pub const ADDR_LEN: usize = 32;

/// Byte length of a topic tag.
pub const TOPIC_LEN: usize = 4;

/// 32-byte content hash of a serialized wire message.
pub type Digest = [u8; 32];

/// Node identifier in the overlay metric space.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OverlayAddr([u8; ADDR_LEN]);

impl OverlayAddr {
    pub fn from_bytes(bytes: [u8; ADDR_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ADDR_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex label for log output.
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Proximity order of `other` relative to `self`: the number of
    /// leading zero bits in the XOR distance, in `0..=256`. Equal
    /// addresses have proximity 256.
    pub fn proximity(&self, other: &OverlayAddr) -> usize {
        for (i, (a, b)) in self.0.iter().zip(other.0.iter()).enumerate() {
            let diff = a ^ b;
            if diff != 0 {
                return i * 8 + diff.leading_zeros() as usize;
            }
        }
        ADDR_LEN * 8
    }
}

impl From<[u8; ADDR_LEN]> for OverlayAddr {
    fn from(bytes: [u8; ADDR_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for OverlayAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for OverlayAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OverlayAddr({}..)", self.short_hex())
    }
}

/// Fixed-width channel tag. Opaque to routing; only the dispatcher and the
/// handler registry interpret it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Topic(pub [u8; TOPIC_LEN]);

impl Topic {
    pub const fn new(bytes: [u8; TOPIC_LEN]) -> Self {
        Self(bytes)
    }

    /// Derive a topic from an arbitrary byte string by truncated BLAKE3.
    /// Lets applications name channels with readable strings while keeping
    /// the wire tag fixed-width.
    pub fn from_content(content: &[u8]) -> Self {
        let hash = blake3::hash(content);
        let mut tag = [0u8; TOPIC_LEN];
        tag.copy_from_slice(&hash.as_bytes()[..TOPIC_LEN]);
        Self(tag)
    }

    pub fn as_bytes(&self) -> &[u8; TOPIC_LEN] {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr_with_first_byte(b: u8) -> OverlayAddr {
        let mut bytes = [0u8; ADDR_LEN];
        bytes[0] = b;
        OverlayAddr::from_bytes(bytes)
    }

    #[test]
    fn proximity_of_equal_addresses_is_max() {
        let a = addr_with_first_byte(0x42);
        assert_eq!(a.proximity(&a), 256);
    }

    #[test]
    fn proximity_counts_shared_prefix_bits() {
        let a = addr_with_first_byte(0x00);
        // First bit differs: proximity 0.
        assert_eq!(a.proximity(&addr_with_first_byte(0x80)), 0);
        // First nibble shared, fifth bit differs: proximity 4.
        assert_eq!(a.proximity(&addr_with_first_byte(0x08)), 4);
        // Whole first byte shared.
        let mut bytes = [0u8; ADDR_LEN];
        bytes[1] = 0x80;
        assert_eq!(a.proximity(&OverlayAddr::from_bytes(bytes)), 8);
    }

    #[test]
    fn proximity_is_symmetric() {
        let a = addr_with_first_byte(0x12);
        let b = addr_with_first_byte(0x34);
        assert_eq!(a.proximity(&b), b.proximity(&a));
    }

    #[test]
    fn topic_from_content_is_stable_and_fixed_width() {
        let t1 = Topic::from_content(b"chat");
        let t2 = Topic::from_content(b"chat");
        let t3 = Topic::from_content(b"status");
        assert_eq!(t1, t2);
        assert_ne!(t1, t3);
    }

    #[test]
    fn hex_display() {
        let t = Topic::new([0x01, 0x02, 0x03, 0x04]);
        assert_eq!(t.to_string(), "01020304");

        let a = addr_with_first_byte(0xab);
        assert!(a.to_hex().starts_with("ab"));
        assert_eq!(a.to_hex().len(), 64);
    }
}
