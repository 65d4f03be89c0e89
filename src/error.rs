//! Error kinds surfaced by the messaging core.
//!
//! Inbound decryption failures are not errors: an envelope that opens with
//! none of our keys was simply not addressed to us and is dropped silently.
//! Everything that a caller can act on is enumerated here.

use std::fmt;

use crate::address::Topic;

/// Errors returned by send, forward, and dispatch operations.
#[derive(Debug)]
pub enum PssError {
    /// Fan-out attempted zero successful sends.
    NoRoute,
    /// Symmetric send requested but the (address, topic) pair has no valid
    /// outbound key.
    NotSecured,
    /// Asymmetric send requested but no public key is registered for the
    /// (address, topic) pair.
    NoPublicKey,
    /// Inbound message for this node on a topic with no registered handler.
    NoHandler(Topic),
    /// Asymmetric open succeeded but the payload was not a valid key
    /// exchange message, or its signature failed to validate.
    InvalidHandshake(&'static str),
    /// Envelope sealing or opening failed on malformed input or a crypto
    /// error.
    Codec(String),
    /// Virtual-protocol record encode or decode failed.
    BridgeFraming(String),
    /// The content-addressed store could not produce a digest.
    Store(String),
    /// A registered topic handler returned an error.
    Handler(String),
}

impl fmt::Display for PssError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PssError::NoRoute => write!(f, "unable to forward to any peers"),
            PssError::NotSecured => write!(f, "missing complete handshake"),
            PssError::NoPublicKey => write!(f, "no public key registered for peer"),
            PssError::NoHandler(topic) => {
                write!(f, "no registered handler for topic {topic}")
            }
            PssError::InvalidHandshake(reason) => {
                write!(f, "invalid handshake message: {reason}")
            }
            PssError::Codec(reason) => write!(f, "envelope codec failure: {reason}"),
            PssError::BridgeFraming(reason) => {
                write!(f, "virtual protocol framing error: {reason}")
            }
            PssError::Store(reason) => write!(f, "message digest store failure: {reason}"),
            PssError::Handler(reason) => write!(f, "handler failure: {reason}"),
        }
    }
}

impl std::error::Error for PssError {}
