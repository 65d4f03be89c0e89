//! # Envelope Codec
//!
//! Seals and opens the opaque encrypted containers that cross the overlay.
//! An [`Envelope`] carries a topic tag in the clear; everything else is
//! ciphertext. Two sealing modes share one wire shape:
//!
//! - **Symmetric**: ChaCha20-Poly1305 under a registered 32-byte key.
//! - **Asymmetric**: ephemeral X25519 agreement with the recipient's static
//!   key, HKDF-SHA256 key derivation, ChaCha20-Poly1305 payload encryption.
//!   The plaintext embeds the sender's public key pair and a
//!   domain-separated Ed25519 signature, so opening reports who sealed it
//!   and whether the signature validates.
//!
//! The codec also owns the symmetric key table: raw keys are registered
//! once and addressed by opaque [`SymKeyId`] handles everywhere else, so
//! key bytes never spread through the rest of the crate.
//!
//! Sealing stamps a small proof-of-work nonce (leading zero bits of a
//! domain-separated BLAKE3 hash); the dispatcher checks the stamp before
//! attempting any decryption, which prices envelope floods.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519Public, StaticSecret};

use crate::address::Topic;
use crate::error::PssError;

/// Byte length of a raw symmetric key.
pub const SYMKEY_LEN: usize = 32;

/// Byte length of an AEAD nonce.
const NONCE_LEN: usize = 12;

/// Asymmetric plaintext header: sender encryption key (32), sender signing
/// key (32), signature (64).
const ASYM_HEADER_LEN: usize = 128;

/// Domain separation prefix for envelope signatures.
const ENVELOPE_SIGNATURE_DOMAIN: &[u8] = b"sotto-envelope-v1:";

/// Domain separation info for the asymmetric key derivation.
const ASYM_KDF_INFO: &[u8] = b"sotto-asym-v1:";

/// Domain separation prefix for the proof-of-work stamp.
const POW_HASH_DOMAIN: &[u8] = b"sotto-pow-v1:";

/// Maximum stamping attempts before sealing fails. Far above anything a
/// sane difficulty needs; bounds the loop against misconfiguration.
const POW_MAX_NONCE: u64 = 1 << 36;

/// Raw symmetric key material.
pub type SymKey = [u8; SYMKEY_LEN];

/// Opaque handle to a key held in the codec's symmetric key table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct SymKeyId(u64);

impl fmt::Display for SymKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "symkey-{:08x}", self.0)
    }
}

/// Generate a fresh random symmetric key.
pub fn random_symkey() -> SymKey {
    let mut key = [0u8; SYMKEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

/// Node key material for the asymmetric envelope path: an X25519 static
/// secret for decryption and an Ed25519 signing key.
#[derive(Clone)]
pub struct EnvelopeKeypair {
    enc: StaticSecret,
    sig: SigningKey,
}

impl EnvelopeKeypair {
    pub fn generate() -> Self {
        Self {
            enc: StaticSecret::random_from_rng(OsRng),
            sig: SigningKey::generate(&mut OsRng),
        }
    }

    /// Rebuild a keypair from stored secret bytes.
    pub fn from_bytes(enc: [u8; 32], sig: [u8; 32]) -> Self {
        Self {
            enc: StaticSecret::from(enc),
            sig: SigningKey::from_bytes(&sig),
        }
    }

    pub fn secret_bytes(&self) -> ([u8; 32], [u8; 32]) {
        (self.enc.to_bytes(), self.sig.to_bytes())
    }

    pub fn public(&self) -> EnvelopePublicKey {
        EnvelopePublicKey {
            enc: X25519Public::from(&self.enc).to_bytes(),
            sig: self.sig.verifying_key().to_bytes(),
        }
    }
}

/// Public half of an [`EnvelopeKeypair`]: what a peer registers to receive
/// asymmetric messages from us.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct EnvelopePublicKey {
    pub enc: [u8; 32],
    pub sig: [u8; 32],
}

impl EnvelopePublicKey {
    pub fn to_hex(&self) -> String {
        format!("{}{}", hex::encode(self.enc), hex::encode(self.sig))
    }
}

/// Opaque encrypted container. Only the topic is meaningful to routing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    topic: Topic,
    nonce: [u8; NONCE_LEN],
    body: Vec<u8>,
    pow_nonce: u64,
}

impl Envelope {
    pub fn topic(&self) -> Topic {
        self.topic
    }
}

/// Result of a successful asymmetric open.
#[derive(Clone, Debug)]
pub struct OpenedAsym {
    /// The decrypted application payload.
    pub payload: Vec<u8>,
    /// Whether the embedded signature validates over the payload.
    pub valid: bool,
    /// Public key pair the sealer embedded. Trustworthy only when `valid`.
    pub sender: EnvelopePublicKey,
}

/// Envelope sealing and opening plus the symmetric key table.
pub struct EnvelopeCodec {
    symkeys: Mutex<HashMap<SymKeyId, SymKey>>,
    next_id: AtomicU64,
    difficulty: u32,
}

impl EnvelopeCodec {
    /// `difficulty` is the number of leading zero bits required of the
    /// proof-of-work stamp; 0 disables stamping.
    pub fn new(difficulty: u32) -> Self {
        Self {
            symkeys: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            difficulty,
        }
    }

    // ------------------------------------------------------------------
    // Symmetric key table
    // ------------------------------------------------------------------

    /// Register raw key material, returning the handle used to address it.
    pub fn register_symkey(&self, raw: SymKey) -> SymKeyId {
        let id = SymKeyId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.symkeys
            .lock()
            .expect("symkey table lock poisoned")
            .insert(id, raw);
        id
    }

    pub fn get_symkey(&self, id: SymKeyId) -> Option<SymKey> {
        self.symkeys
            .lock()
            .expect("symkey table lock poisoned")
            .get(&id)
            .copied()
    }

    /// Generate and register a fresh random key in one step.
    pub fn generate_symkey(&self) -> SymKeyId {
        self.register_symkey(random_symkey())
    }

    // ------------------------------------------------------------------
    // Sealing
    // ------------------------------------------------------------------

    pub fn seal_sym(
        &self,
        topic: Topic,
        key: &SymKey,
        payload: &[u8],
    ) -> Result<Envelope, PssError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
        let body = cipher
            .encrypt(Nonce::from_slice(&nonce), payload)
            .map_err(|_| PssError::Codec("symmetric seal failed".into()))?;
        let mut env = Envelope {
            topic,
            nonce,
            body,
            pow_nonce: 0,
        };
        self.stamp(&mut env)?;
        Ok(env)
    }

    pub fn seal_asym(
        &self,
        topic: Topic,
        keys: &EnvelopeKeypair,
        dst: &EnvelopePublicKey,
        payload: &[u8],
    ) -> Result<Envelope, PssError> {
        let signature = keys.sig.sign(&signing_input(&topic, payload));

        let mut plain = Vec::with_capacity(ASYM_HEADER_LEN + payload.len());
        plain.extend_from_slice(&X25519Public::from(&keys.enc).to_bytes());
        plain.extend_from_slice(&keys.sig.verifying_key().to_bytes());
        plain.extend_from_slice(&signature.to_bytes());
        plain.extend_from_slice(payload);

        let eph = EphemeralSecret::random_from_rng(OsRng);
        let eph_pub = X25519Public::from(&eph).to_bytes();
        let shared = eph.diffie_hellman(&X25519Public::from(dst.enc));
        let key = derive_asym_key(shared.as_bytes(), &eph_pub, &dst.enc)?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plain.as_slice())
            .map_err(|_| PssError::Codec("asymmetric seal failed".into()))?;

        let mut body = Vec::with_capacity(32 + ciphertext.len());
        body.extend_from_slice(&eph_pub);
        body.extend_from_slice(&ciphertext);

        let mut env = Envelope {
            topic,
            nonce,
            body,
            pow_nonce: 0,
        };
        self.stamp(&mut env)?;
        Ok(env)
    }

    // ------------------------------------------------------------------
    // Opening
    // ------------------------------------------------------------------

    /// Open a symmetrically sealed envelope. `None` means the key does not
    /// match; the caller tries its next candidate.
    pub fn open_sym(&self, env: &Envelope, key: &SymKey) -> Option<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
        cipher
            .decrypt(Nonce::from_slice(&env.nonce), env.body.as_slice())
            .ok()
    }

    /// Open an asymmetrically sealed envelope with our static secret.
    /// `None` means the envelope was not sealed to us.
    pub fn open_asym(&self, env: &Envelope, keys: &EnvelopeKeypair) -> Option<OpenedAsym> {
        if env.body.len() < 32 {
            return None;
        }
        let mut eph_pub = [0u8; 32];
        eph_pub.copy_from_slice(&env.body[..32]);

        let our_pub = X25519Public::from(&keys.enc).to_bytes();
        let shared = keys.enc.diffie_hellman(&X25519Public::from(eph_pub));
        let key = derive_asym_key(shared.as_bytes(), &eph_pub, &our_pub).ok()?;

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let plain = cipher
            .decrypt(Nonce::from_slice(&env.nonce), &env.body[32..])
            .ok()?;
        if plain.len() < ASYM_HEADER_LEN {
            return None;
        }

        let mut enc = [0u8; 32];
        enc.copy_from_slice(&plain[..32]);
        let mut sig_pub = [0u8; 32];
        sig_pub.copy_from_slice(&plain[32..64]);
        let mut sig_bytes = [0u8; 64];
        sig_bytes.copy_from_slice(&plain[64..ASYM_HEADER_LEN]);
        let payload = plain[ASYM_HEADER_LEN..].to_vec();

        let valid = match VerifyingKey::from_bytes(&sig_pub) {
            Ok(vk) => vk
                .verify(
                    &signing_input(&env.topic, &payload),
                    &Signature::from_bytes(&sig_bytes),
                )
                .is_ok(),
            Err(_) => false,
        };

        Some(OpenedAsym {
            payload,
            valid,
            sender: EnvelopePublicKey { enc, sig: sig_pub },
        })
    }

    // ------------------------------------------------------------------
    // Proof of work
    // ------------------------------------------------------------------

    /// True iff the envelope carries a valid stamp for our difficulty.
    pub fn check_pow(&self, env: &Envelope) -> bool {
        self.difficulty == 0 || pow_ok(env, self.difficulty)
    }

    fn stamp(&self, env: &mut Envelope) -> Result<(), PssError> {
        if self.difficulty == 0 {
            return Ok(());
        }
        for nonce in 0..POW_MAX_NONCE {
            env.pow_nonce = nonce;
            if pow_ok(env, self.difficulty) {
                return Ok(());
            }
        }
        Err(PssError::Codec(
            "proof-of-work nonce space exhausted".into(),
        ))
    }
}

fn signing_input(topic: &Topic, payload: &[u8]) -> Vec<u8> {
    let mut input =
        Vec::with_capacity(ENVELOPE_SIGNATURE_DOMAIN.len() + topic.as_bytes().len() + payload.len());
    input.extend_from_slice(ENVELOPE_SIGNATURE_DOMAIN);
    input.extend_from_slice(topic.as_bytes());
    input.extend_from_slice(payload);
    input
}

fn derive_asym_key(
    shared: &[u8; 32],
    eph_pub: &[u8; 32],
    recipient_pub: &[u8; 32],
) -> Result<[u8; 32], PssError> {
    let hk = Hkdf::<Sha256>::new(None, shared);
    let mut info = Vec::with_capacity(ASYM_KDF_INFO.len() + 64);
    info.extend_from_slice(ASYM_KDF_INFO);
    info.extend_from_slice(eph_pub);
    info.extend_from_slice(recipient_pub);
    let mut okm = [0u8; 32];
    hk.expand(&info, &mut okm)
        .map_err(|_| PssError::Codec("envelope key derivation failed".into()))?;
    Ok(okm)
}

fn pow_ok(env: &Envelope, difficulty: u32) -> bool {
    let mut hasher = blake3::Hasher::new();
    hasher.update(POW_HASH_DOMAIN);
    hasher.update(env.topic.as_bytes());
    hasher.update(&env.nonce);
    hasher.update(&env.body);
    hasher.update(&env.pow_nonce.to_le_bytes());
    leading_zero_bits(hasher.finalize().as_bytes()) >= difficulty
}

fn leading_zero_bits(hash: &[u8; 32]) -> u32 {
    let mut bits = 0u32;
    for byte in hash {
        if *byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: Topic = Topic::new([1, 2, 3, 4]);

    #[test]
    fn sym_round_trip() {
        let codec = EnvelopeCodec::new(0);
        let key = random_symkey();
        let env = codec.seal_sym(TOPIC, &key, b"hello overlay").expect("seal");
        assert_eq!(env.topic(), TOPIC);
        assert_eq!(
            codec.open_sym(&env, &key).expect("open"),
            b"hello overlay".to_vec()
        );
    }

    #[test]
    fn sym_wrong_key_fails() {
        let codec = EnvelopeCodec::new(0);
        let env = codec.seal_sym(TOPIC, &random_symkey(), b"secret").expect("seal");
        assert!(codec.open_sym(&env, &random_symkey()).is_none());
    }

    #[test]
    fn asym_round_trip_with_valid_signature() {
        let codec = EnvelopeCodec::new(0);
        let alice = EnvelopeKeypair::generate();
        let bob = EnvelopeKeypair::generate();

        let env = codec
            .seal_asym(TOPIC, &alice, &bob.public(), b"bootstrap")
            .expect("seal");
        let opened = codec.open_asym(&env, &bob).expect("open");
        assert_eq!(opened.payload, b"bootstrap".to_vec());
        assert!(opened.valid);
        assert_eq!(opened.sender, alice.public());
    }

    #[test]
    fn asym_wrong_recipient_fails() {
        let codec = EnvelopeCodec::new(0);
        let alice = EnvelopeKeypair::generate();
        let bob = EnvelopeKeypair::generate();
        let eve = EnvelopeKeypair::generate();

        let env = codec
            .seal_asym(TOPIC, &alice, &bob.public(), b"bootstrap")
            .expect("seal");
        assert!(codec.open_asym(&env, &eve).is_none());
    }

    #[test]
    fn asym_tampered_body_fails() {
        let codec = EnvelopeCodec::new(0);
        let alice = EnvelopeKeypair::generate();
        let bob = EnvelopeKeypair::generate();

        let mut env = codec
            .seal_asym(TOPIC, &alice, &bob.public(), b"bootstrap")
            .expect("seal");
        let last = env.body.len() - 1;
        env.body[last] ^= 0x01;
        assert!(codec.open_asym(&env, &bob).is_none());
    }

    #[test]
    fn sym_envelope_does_not_open_asymmetrically() {
        let codec = EnvelopeCodec::new(0);
        let bob = EnvelopeKeypair::generate();
        let env = codec.seal_sym(TOPIC, &random_symkey(), b"data").expect("seal");
        assert!(codec.open_asym(&env, &bob).is_none());
    }

    #[test]
    fn pow_stamp_checks_out() {
        let codec = EnvelopeCodec::new(16);
        let key = random_symkey();
        let mut env = codec.seal_sym(TOPIC, &key, b"stamped").expect("seal");
        assert!(codec.check_pow(&env));

        // Any change to the sealed content invalidates the stamp with
        // overwhelming probability.
        env.body.push(0);
        assert!(!codec.check_pow(&env));
    }

    #[test]
    fn pow_disabled_accepts_anything() {
        let strict = EnvelopeCodec::new(16);
        let lax = EnvelopeCodec::new(0);
        let env = lax.seal_sym(TOPIC, &random_symkey(), b"unstamped").expect("seal");
        assert!(lax.check_pow(&env));
        assert!(!strict.check_pow(&env));
    }

    #[test]
    fn symkey_table_register_and_get() {
        let codec = EnvelopeCodec::new(0);
        let raw = random_symkey();
        let id = codec.register_symkey(raw);
        assert_eq!(codec.get_symkey(id), Some(raw));

        let other = codec.generate_symkey();
        assert_ne!(id, other);
        assert!(codec.get_symkey(other).is_some());
        assert_ne!(codec.get_symkey(other), Some(raw));
    }
}
