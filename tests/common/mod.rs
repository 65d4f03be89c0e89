//! Shared in-memory fakes for the integration tests: a scripted overlay,
//! peers that deliver straight into another node's dispatcher, and peers
//! that only record what they were asked to send.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use async_trait::async_trait;

use sotto::{
    ConnCandidate, EnvelopeCodec, EnvelopeKeypair, MemoryStore, Overlay, OverlayAddr, Pss,
    PssConfig, RelayPeer, Topic, WireMessage, random_symkey,
};

pub const TOPIC: Topic = Topic::new([1, 2, 3, 4]);

pub fn addr(seed: u8) -> OverlayAddr {
    OverlayAddr::from_bytes([seed; 32])
}

/// Overlay with a scripted candidate list, returned in insertion order
/// regardless of target.
pub struct StaticOverlay {
    base: OverlayAddr,
    conns: Mutex<Vec<ConnCandidate>>,
}

impl StaticOverlay {
    pub fn new(base: OverlayAddr) -> Self {
        Self {
            base,
            conns: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, candidate: ConnCandidate) {
        self.conns.lock().expect("overlay lock").push(candidate);
    }
}

impl Overlay for StaticOverlay {
    fn base_addr(&self) -> OverlayAddr {
        self.base
    }

    fn conn_candidates(&self, _target: &OverlayAddr, limit: usize) -> Vec<ConnCandidate> {
        let conns = self.conns.lock().expect("overlay lock");
        conns.iter().take(limit).cloned().collect()
    }
}

/// Peer that delivers every send into the remote node's dispatcher, tagged
/// with the sending node's address, like a loopback transport would.
pub struct MemoryPeer {
    origin: OverlayAddr,
    target: Pss,
}

#[async_trait]
impl RelayPeer for MemoryPeer {
    fn address(&self) -> OverlayAddr {
        self.target.base_addr()
    }

    async fn send(&self, msg: &WireMessage) -> Result<()> {
        self.target
            .handle_message(Some(self.origin), msg.clone())
            .await?;
        Ok(())
    }
}

/// Chronological log of (peer address, message) pairs across a whole test.
pub type SendLog = Arc<Mutex<Vec<(OverlayAddr, WireMessage)>>>;

pub fn send_log() -> SendLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// How many sends in `log` went to `addr`.
pub fn sent_to(log: &SendLog, addr: OverlayAddr) -> usize {
    log.lock()
        .expect("send log lock")
        .iter()
        .filter(|(to, _)| *to == addr)
        .count()
}

/// Order of peer addresses in `log`.
pub fn send_order(log: &SendLog) -> Vec<OverlayAddr> {
    log.lock()
        .expect("send log lock")
        .iter()
        .map(|(to, _)| *to)
        .collect()
}

/// Peer that records sends into a shared log, optionally refusing them.
pub struct RecordingPeer {
    pub addr: OverlayAddr,
    pub log: SendLog,
    pub fail: bool,
}

#[async_trait]
impl RelayPeer for RecordingPeer {
    fn address(&self) -> OverlayAddr {
        self.addr
    }

    async fn send(&self, msg: &WireMessage) -> Result<()> {
        if self.fail {
            bail!("transport refused the message");
        }
        self.log
            .lock()
            .expect("send log lock")
            .push((self.addr, msg.clone()));
        Ok(())
    }
}

pub fn node(base: OverlayAddr) -> (Pss, Arc<StaticOverlay>) {
    node_with(base, PssConfig::default())
}

pub fn node_with(base: OverlayAddr, config: PssConfig) -> (Pss, Arc<StaticOverlay>) {
    let overlay = Arc::new(StaticOverlay::new(base));
    let pss = Pss::new(
        overlay.clone(),
        Arc::new(MemoryStore::new()),
        EnvelopeKeypair::generate(),
        config,
    );
    (pss, overlay)
}

/// Give `from` a direct connection delivering into `to`.
pub fn connect(from_overlay: &StaticOverlay, from: &Pss, to: &Pss, in_prox_bin: bool) {
    from_overlay.add(ConnCandidate {
        peer: Arc::new(MemoryPeer {
            origin: from.base_addr(),
            target: to.clone(),
        }),
        in_prox_bin,
    });
}

/// Add a recording candidate to an overlay.
pub fn record(overlay: &StaticOverlay, addr: OverlayAddr, log: &SendLog, in_prox_bin: bool) {
    overlay.add(ConnCandidate {
        peer: Arc::new(RecordingPeer {
            addr,
            log: log.clone(),
            fail: false,
        }),
        in_prox_bin,
    });
}

/// A wire message with an opaque sealed payload, good enough to relay.
pub fn dummy_wire(to: OverlayAddr, payload: &[u8]) -> WireMessage {
    let codec = EnvelopeCodec::new(0);
    let env = codec
        .seal_sym(TOPIC, &random_symkey(), payload)
        .expect("seal");
    WireMessage { to, payload: env }
}

/// Manually install a full symmetric key pair between two nodes.
pub fn secure_pair(a: &Pss, b: &Pss, topic: Topic) {
    let toward_a = random_symkey();
    let toward_b = random_symkey();
    a.set_inbound_symkey(b.base_addr(), topic, toward_a);
    b.set_outbound_symkey(a.base_addr(), topic, toward_a);
    b.set_inbound_symkey(a.base_addr(), topic, toward_b);
    a.set_outbound_symkey(b.base_addr(), topic, toward_b);
}
