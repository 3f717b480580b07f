//! Reference UDP implementation of the transport contract.
//!
//! Production deployments sit roomnet on a real peer-to-peer messaging
//! facility with relays and NAT traversal; this adapter exists so a node
//! is usable out of the box between hosts that can reach each other
//! directly. Peers are identified by a static roster mapping transport
//! identities to UDP endpoints.
//!
//! Semantics are deliberately modest: `RELIABLE` and `AUTO_RESTART` are
//! accepted but delivery stays best-effort, sessions are implicit (a
//! peer is "connected" once traffic has flowed), and transport-level
//! ping is not measured. Each datagram is prefixed with the 4-byte
//! channel id so unrelated channels stay separable.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use roomnet_core::transport::{
    InboundMessage, PeerId, SendFlags, SendOutcome, SessionInfo, Transport, TransportEvent,
    TransportTuning,
};

/// Channel id prefix carried on every datagram.
const CHANNEL_PREFIX_LEN: usize = 4;

const UDP_RECV_BUF_SIZE: usize = 2048;

struct Roster {
    endpoints: HashMap<PeerId, SocketAddr>,
    by_addr: HashMap<SocketAddr, PeerId>,
}

/// UDP-backed transport with a static peer roster.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    roster: Mutex<Roster>,
    inbound: Mutex<HashMap<u32, VecDeque<InboundMessage>>>,
    events: Mutex<VecDeque<TransportEvent>>,
    active: Mutex<HashSet<PeerId>>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpTransport {
    /// Bind the socket and start the receive task.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn bind(
        self_id: PeerId,
        bind_addr: SocketAddr,
        tuning: &TransportTuning,
    ) -> std::io::Result<Arc<Self>> {
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        info!(
            "UDP transport for {self_id} bound: {} (tuning: rate={}B/s buffer={}B nagle={:?}, best-effort)",
            socket.local_addr()?,
            tuning.send_rate,
            tuning.send_buffer_size,
            tuning.nagle
        );

        let transport = Arc::new(Self {
            socket: socket.clone(),
            roster: Mutex::new(Roster {
                endpoints: HashMap::new(),
                by_addr: HashMap::new(),
            }),
            inbound: Mutex::new(HashMap::new()),
            events: Mutex::new(VecDeque::new()),
            active: Mutex::new(HashSet::new()),
            recv_task: Mutex::new(None),
        });

        // The task holds only a weak handle so dropping the transport
        // tears the loop down.
        let recv_task = tokio::spawn(Self::recv_loop(Arc::downgrade(&transport), socket));
        *transport.recv_task.lock().unwrap() = Some(recv_task);

        Ok(transport)
    }

    /// The bound local address.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Add or replace a roster entry.
    pub fn add_endpoint(&self, peer: PeerId, endpoint: SocketAddr) {
        let mut roster = self.roster.lock().unwrap();
        if let Some(old) = roster.endpoints.insert(peer, endpoint) {
            roster.by_addr.remove(&old);
        }
        roster.by_addr.insert(endpoint, peer);
    }

    async fn recv_loop(transport: Weak<Self>, socket: Arc<UdpSocket>) {
        let mut buf = [0u8; UDP_RECV_BUF_SIZE];
        loop {
            let (n, from) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("UDP recv error: {e}");
                    continue;
                }
            };

            let Some(transport) = transport.upgrade() else {
                return;
            };

            if n < CHANNEL_PREFIX_LEN {
                debug!("short datagram ({n} bytes) from {from}");
                continue;
            }

            let sender = {
                let roster = transport.roster.lock().unwrap();
                roster.by_addr.get(&from).copied()
            };
            let Some(sender) = sender else {
                debug!("dropping datagram from unlisted endpoint {from}");
                continue;
            };

            let channel = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
            let payload = buf[CHANNEL_PREFIX_LEN..n].to_vec();

            // First traffic from a roster peer doubles as its session
            // request.
            if transport.active.lock().unwrap().insert(sender) {
                transport
                    .events
                    .lock()
                    .unwrap()
                    .push_back(TransportEvent::SessionRequested(sender));
            }

            transport
                .inbound
                .lock()
                .unwrap()
                .entry(channel)
                .or_default()
                .push_back(InboundMessage { sender, payload });
        }
    }
}

impl Transport for UdpTransport {
    fn send_to_peer(
        &self,
        peer: PeerId,
        payload: &[u8],
        _flags: SendFlags,
        channel: u32,
    ) -> SendOutcome {
        let endpoint = {
            let roster = self.roster.lock().unwrap();
            roster.endpoints.get(&peer).copied()
        };
        let Some(endpoint) = endpoint else {
            return SendOutcome::PeerUnknown;
        };

        let mut wire = Vec::with_capacity(CHANNEL_PREFIX_LEN + payload.len());
        wire.extend_from_slice(&channel.to_be_bytes());
        wire.extend_from_slice(payload);

        match self.socket.try_send_to(&wire, endpoint) {
            Ok(_) => {
                self.active.lock().unwrap().insert(peer);
                SendOutcome::Sent
            }
            Err(e) => {
                debug!("UDP send to {peer} ({endpoint}) failed: {e}");
                SendOutcome::TransientError
            }
        }
    }

    fn drain(&self, channel: u32, max: usize) -> Vec<InboundMessage> {
        let mut inbound = self.inbound.lock().unwrap();
        match inbound.get_mut(&channel) {
            Some(queue) => {
                let take = max.min(queue.len());
                queue.drain(..take).collect()
            }
            None => Vec::new(),
        }
    }

    fn poll_events(&self) -> Vec<TransportEvent> {
        self.events.lock().unwrap().drain(..).collect()
    }

    fn accept_session(&self, peer: PeerId) {
        self.active.lock().unwrap().insert(peer);
    }

    fn close_session(&self, peer: PeerId) {
        self.active.lock().unwrap().remove(&peer);
    }

    fn session_info(&self, peer: PeerId) -> Option<SessionInfo> {
        let known = self.roster.lock().unwrap().endpoints.contains_key(&peer);
        if !known {
            return None;
        }

        Some(SessionInfo {
            connected: self.active.lock().unwrap().contains(&peer),
            ping_ms: -1,
            relayed: false,
        })
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        if let Some(task) = self.recv_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const NODE_A: PeerId = PeerId::from_raw(101);
    const NODE_B: PeerId = PeerId::from_raw(202);

    async fn pair() -> (Arc<UdpTransport>, Arc<UdpTransport>) {
        let tuning = TransportTuning::default();
        let a = UdpTransport::bind(NODE_A, "127.0.0.1:0".parse().unwrap(), &tuning)
            .await
            .expect("bind A failed");
        let b = UdpTransport::bind(NODE_B, "127.0.0.1:0".parse().unwrap(), &tuning)
            .await
            .expect("bind B failed");

        a.add_endpoint(NODE_B, b.local_addr().unwrap());
        b.add_endpoint(NODE_A, a.local_addr().unwrap());
        (a, b)
    }

    async fn drain_one(transport: &UdpTransport, channel: u32) -> InboundMessage {
        for _ in 0..500 {
            if let Some(message) = transport.drain(channel, 16).into_iter().next() {
                return message;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("no message arrived on channel {channel}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_send_and_drain() {
        let (a, b) = pair().await;

        let outcome = a.send_to_peer(NODE_B, b"hello room", SendFlags::unreliable(), 0);
        assert_eq!(outcome, SendOutcome::Sent);

        let message = drain_one(&b, 0).await;
        assert_eq!(message.sender, NODE_A);
        assert_eq!(message.payload, b"hello room");

        // First traffic surfaced as a session request.
        let events = b.poll_events();
        assert!(matches!(
            events.as_slice(),
            [TransportEvent::SessionRequested(peer)] if *peer == NODE_A
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_channels_do_not_mix() {
        let (a, b) = pair().await;

        a.send_to_peer(NODE_B, b"on zero", SendFlags::unreliable(), 0);
        a.send_to_peer(NODE_B, b"on seven", SendFlags::unreliable(), 7);

        let on_seven = drain_one(&b, 7).await;
        assert_eq!(on_seven.payload, b"on seven");

        let on_zero = drain_one(&b, 0).await;
        assert_eq!(on_zero.payload, b"on zero");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_peer_and_session_info() {
        let (a, _b) = pair().await;

        let outcome = a.send_to_peer(PeerId::from_raw(999), b"x", SendFlags::unreliable(), 0);
        assert_eq!(outcome, SendOutcome::PeerUnknown);
        assert!(a.session_info(PeerId::from_raw(999)).is_none());

        // Roster peer with no traffic yet: known but not connected.
        let info = a.session_info(NODE_B).unwrap();
        assert!(!info.connected);
        assert_eq!(info.ping_ms, -1);

        a.send_to_peer(NODE_B, b"x", SendFlags::unreliable(), 0);
        assert!(a.session_info(NODE_B).unwrap().connected);

        a.close_session(NODE_B);
        assert!(!a.session_info(NODE_B).unwrap().connected);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_datagrams_from_unlisted_endpoints_are_dropped() {
        let tuning = TransportTuning::default();
        let a = UdpTransport::bind(NODE_A, "127.0.0.1:0".parse().unwrap(), &tuning)
            .await
            .expect("bind A failed");

        // A stranger socket sends straight at A's endpoint.
        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut wire = 0u32.to_be_bytes().to_vec();
        wire.extend_from_slice(b"spoof");
        stranger
            .send_to(&wire, a.local_addr().unwrap())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a.drain(0, 16).is_empty());
        assert!(a.poll_events().is_empty());
    }
}
