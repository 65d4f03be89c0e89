//! # Virtual Protocol Bridge
//!
//! Runs a conventional framed subprotocol across the overlay as if the
//! remote peer were directly connected. One session exists per
//! (remote address, topic); each session owns a [`VirtualReadWriter`]
//! whose writes are sealed-and-forwarded and whose reads are fed by
//! decrypted inbound payloads.
//!
//! [`Pss::register_protocol`] installs a topic handler that opens a session
//! on the first frame from a new peer, spawns the subprotocol's `run`
//! function as a task, and injects every subsequent frame into the
//! session's channel. The channel holds a single frame, so the dispatcher
//! hands frames over in the exact order it processed them and a slow
//! subprotocol backpressures its sender.
//!
//! When `run` returns, the session slot in the key registry is cleared;
//! the keys negotiated for the pair persist.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::address::{OverlayAddr, Topic};
use crate::error::PssError;
use crate::messages::{MAX_MSG_SIZE, ProtocolMsg, decode_frame, encode_frame};
use crate::pss::{Handler, HandlerId, Pss, PssInner};

/// Describes a bridged subprotocol.
#[derive(Clone, Debug)]
pub struct ProtocolSpec {
    pub name: String,
    pub version: u32,
    /// Upper bound on a single frame's payload.
    pub max_msg_size: usize,
}

impl ProtocolSpec {
    pub fn new(name: &str, version: u32) -> Self {
        Self {
            name: name.to_string(),
            version,
            max_msg_size: MAX_MSG_SIZE,
        }
    }
}

/// Synthetic peer identity handed to handlers and bridged subprotocols.
/// Carries the zero node id; the overlay address is the real identity.
#[derive(Clone, Debug)]
pub struct VirtualPeer {
    id: [u8; 32],
    addr: OverlayAddr,
    name: String,
}

impl VirtualPeer {
    pub(crate) fn new(addr: OverlayAddr) -> Self {
        Self {
            id: [0u8; 32],
            addr,
            name: format!("pss:{}", addr.short_hex()),
        }
    }

    pub fn node_id(&self) -> [u8; 32] {
        self.id
    }

    pub fn address(&self) -> OverlayAddr {
        self.addr
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Framed endpoint of one bridged session.
///
/// Reading yields frames in dispatcher order and ends when the session is
/// torn down. Writing seals the frame for the remote peer, symmetrically
/// once the pair is secured, asymmetrically before that.
pub struct VirtualReadWriter {
    to: OverlayAddr,
    topic: Topic,
    spec: Arc<ProtocolSpec>,
    pss: Pss,
    inbound: mpsc::Receiver<ProtocolMsg>,
}

impl VirtualReadWriter {
    /// Next inbound frame; `None` once the session channel is closed.
    pub async fn read_msg(&mut self) -> Option<ProtocolMsg> {
        self.inbound.recv().await
    }

    /// Seal `(code, payload)` as one frame and forward it to the remote
    /// end of this session.
    pub async fn write_msg(&self, code: u64, payload: &[u8]) -> Result<(), PssError> {
        if payload.len() > self.spec.max_msg_size {
            return Err(PssError::BridgeFraming(format!(
                "frame of {} bytes exceeds {} limit of {}",
                payload.len(),
                self.spec.name,
                self.spec.max_msg_size
            )));
        }
        let frame = ProtocolMsg::new(code, payload.to_vec());
        let encoded =
            encode_frame(&frame).map_err(|err| PssError::BridgeFraming(err.to_string()))?;
        if self.pss.is_secured(self.to, self.topic) {
            self.pss.send_sym(self.to, self.topic, &encoded).await
        } else {
            self.pss.send_asym(self.to, self.topic, &encoded).await
        }
    }

    pub fn remote(&self) -> OverlayAddr {
        self.to
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }
}

/// Signature of a bridged subprotocol's entry point.
pub type ProtocolRunner = Arc<
    dyn Fn(VirtualPeer, VirtualReadWriter) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>
        + Send
        + Sync,
>;

/// Topic handler that feeds one bridged subprotocol.
struct BridgeHandler {
    // Weak: the handler table lives inside the core state, so a strong
    // handle here would keep the core alive through its own registry.
    pss: Weak<PssInner>,
    topic: Topic,
    spec: Arc<ProtocolSpec>,
    run: ProtocolRunner,
}

impl BridgeHandler {
    /// Look up the session channel for `remote`, opening the session and
    /// spawning its `run` task when this is the first frame.
    fn session_channel(&self, pss: &Pss, peer: &VirtualPeer) -> Option<mpsc::Sender<ProtocolMsg>> {
        let remote = peer.address();
        let (tx, rx) = mpsc::channel(1);
        let (sender, fresh_rx) = pss.with_state(|s| {
            if s.stopped {
                return (None, None);
            }
            match s.keyring.rw_sender(&remote, &self.topic) {
                Some(existing) => (Some(existing), None),
                None => {
                    s.keyring.set_rw(remote, self.topic, tx.clone());
                    (Some(tx), Some(rx))
                }
            }
        });

        if let Some(rx) = fresh_rx {
            let rw = VirtualReadWriter {
                to: remote,
                topic: self.topic,
                spec: self.spec.clone(),
                pss: pss.clone(),
                inbound: rx,
            };
            let run = self.run.clone();
            let name = self.spec.name.clone();
            let topic = self.topic;
            let pss = pss.clone();
            let peer = peer.clone();
            debug!(peer = %remote.short_hex(), %topic, protocol = %name, "virtual protocol session opened");
            tokio::spawn(async move {
                match run(peer, rw).await {
                    Ok(()) => {
                        debug!(peer = %remote.short_hex(), %topic, protocol = %name, "virtual protocol session finished")
                    }
                    Err(err) => {
                        warn!(peer = %remote.short_hex(), %topic, protocol = %name, error = %err, "virtual protocol session terminated")
                    }
                }
                pss.with_state(|s| s.keyring.clear_rw(&remote, &topic));
            });
        }
        sender
    }
}

#[async_trait]
impl Handler for BridgeHandler {
    async fn handle(
        &self,
        payload: &[u8],
        peer: &VirtualPeer,
        sender: OverlayAddr,
    ) -> anyhow::Result<()> {
        let Some(inner) = self.pss.upgrade() else {
            return Ok(());
        };
        let pss = Pss::from_inner(inner);

        let frame = decode_frame(payload)
            .map_err(|err| PssError::BridgeFraming(err.to_string()))?;
        if !frame.is_consistent() {
            return Err(PssError::BridgeFraming(format!(
                "size field {} does not match payload length {}",
                frame.size,
                frame.payload.len()
            ))
            .into());
        }
        if frame.payload.len() > self.spec.max_msg_size {
            return Err(PssError::BridgeFraming(format!(
                "frame of {} bytes exceeds {} limit of {}",
                frame.payload.len(),
                self.spec.name,
                self.spec.max_msg_size
            ))
            .into());
        }

        let Some(tx) = self.session_channel(&pss, peer) else {
            return Ok(());
        };
        if tx.send(frame).await.is_err() {
            // The run task returned between lookup and injection; drop the
            // frame and let the next one open a fresh session.
            pss.with_state(|s| s.keyring.clear_rw(&sender, &self.topic));
            warn!(peer = %sender.short_hex(), topic = %self.topic, "session closed mid-injection, frame dropped");
        }
        Ok(())
    }
}

impl Pss {
    /// Bridge `topic` to a framed subprotocol: every peer that sends on the
    /// topic gets a dedicated session running `run` against a virtual
    /// read/write endpoint.
    pub fn register_protocol(
        &self,
        topic: Topic,
        spec: ProtocolSpec,
        run: ProtocolRunner,
    ) -> HandlerId {
        let handler = BridgeHandler {
            pss: self.downgrade(),
            topic,
            spec: Arc::new(spec),
            run,
        };
        self.register_handler(topic, Arc::new(handler))
    }
}
