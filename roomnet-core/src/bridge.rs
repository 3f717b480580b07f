//! Bidirectional pump between the TUN device and the transport.
//!
//! The bridge owns the TUN device and the poll engine and drives both
//! directions:
//!
//! - **Egress**: a dedicated reader thread pulls IP datagrams off the
//!   TUN device, resolves the destination to a peer (or fans out for
//!   broadcast/multicast), wraps the datagram in an `IP_PACKET` frame
//!   and hands it to the transport with unreliable flags.
//! - **Ingress**: the poll engine drains the transport on its own thread
//!   and dispatches each frame here; data packets are written straight
//!   to the TUN device, pings are answered, pongs update liveness.
//!
//! The registry and the transport are independent collaborators held by
//! non-owning handles; no lock is held across a TUN read, a TUN write,
//! or a transport call.

use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::poll::{InboundHandler, PollEngine, PollTuning};
use crate::proto::{Frame, FrameKind, VPN_CHANNEL};
use crate::registry::{ConnectionKind, MembershipRegistry};
use crate::subnet::SubnetMap;
use crate::transport::{
    InboundMessage, PeerId, SendFlags, SendOutcome, Transport, TransportEvent,
};
use crate::tun::TunDevice;

/// Consecutive send failures before a peer is marked down.
const SEND_FAILURE_THRESHOLD: u32 = 5;

/// Sleep between empty non-blocking TUN reads.
const EGRESS_IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Bridge setup errors. Runtime I/O and transport errors are absorbed
/// and surfaced through counters instead.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("bridge is already running")]
    AlreadyRunning,

    #[error("TUN configuration failed: {0}")]
    TunConfig(#[from] io::Error),
}

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Local address on the room subnet
    pub address: Ipv4Addr,
    /// Room subnet mask
    pub netmask: Ipv4Addr,
    /// Interface MTU
    pub mtu: u16,
    /// Poll engine tuning
    pub poll: PollTuning,
}

/// Event counters, updated lock-free from both pump directions.
#[derive(Debug, Default)]
pub struct BridgeStats {
    tun_rx_packets: AtomicU64,
    tun_tx_packets: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    hellos_sent: AtomicU64,
    dropped_malformed: AtomicU64,
    dropped_unknown_sender: AtomicU64,
    dropped_no_route: AtomicU64,
    send_failures: AtomicU64,
    degraded: AtomicBool,
}

impl BridgeStats {
    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tun_rx_packets: self.tun_rx_packets.load(Ordering::Relaxed),
            tun_tx_packets: self.tun_tx_packets.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            hellos_sent: self.hellos_sent.load(Ordering::Relaxed),
            dropped_malformed: self.dropped_malformed.load(Ordering::Relaxed),
            dropped_unknown_sender: self.dropped_unknown_sender.load(Ordering::Relaxed),
            dropped_no_route: self.dropped_no_route.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of the bridge counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    /// Packets read from the TUN device
    pub tun_rx_packets: u64,
    /// Packets written to the TUN device
    pub tun_tx_packets: u64,
    /// Frames handed to the transport
    pub frames_sent: u64,
    /// Frames received and dispatched
    pub frames_received: u64,
    /// Session hellos emitted
    pub hellos_sent: u64,
    /// Inbound frames dropped as malformed or oversized
    pub dropped_malformed: u64,
    /// Inbound frames dropped because the sender is not a member
    pub dropped_unknown_sender: u64,
    /// Egress packets dropped for lack of a destination peer
    pub dropped_no_route: u64,
    /// Individual send attempts the transport rejected
    pub send_failures: u64,
    /// Set after a hard TUN read/write error; the pumps keep running
    pub degraded: bool,
}

/// Per-peer link status, answered from the transport's session info.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Direct,
    Relayed,
    NotAvailable,
}

/// Result of a [`Bridge::peer_stats`] query.
#[derive(Debug, Clone, Copy)]
pub struct PeerLinkStats {
    /// Whether the session is currently established
    pub connected: bool,
    /// Round-trip time in milliseconds, -1 when not connected
    pub ping_ms: i32,
    /// Path kind, `NotAvailable` when not connected
    pub kind: LinkKind,
}

/// Parsed destination of an outbound packet.
enum PacketDst {
    V4(Ipv4Addr),
    V6,
    Malformed,
}

fn destination(packet: &[u8]) -> PacketDst {
    if packet.is_empty() {
        return PacketDst::Malformed;
    }

    match packet[0] >> 4 {
        4 if packet.len() >= 20 => {
            PacketDst::V4(Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]))
        }
        6 if packet.len() >= 40 => PacketDst::V6,
        _ => PacketDst::Malformed,
    }
}

/// State shared between the egress thread, the poll engine thread and
/// the control surface.
struct BridgeCore {
    tun: Box<dyn TunDevice>,
    transport: Arc<dyn Transport>,
    registry: Arc<MembershipRegistry>,
    subnet: SubnetMap,
    stats: BridgeStats,
    mtu: usize,
    running: AtomicBool,
}

impl BridgeCore {
    // ---- egress ----

    fn egress_loop(&self) {
        let mut buf = vec![0u8; self.mtu.max(1500)];
        let mut failures: HashMap<PeerId, u32> = HashMap::new();

        while self.running.load(Ordering::Acquire) {
            match self.tun.read_packet(&mut buf) {
                Ok(0) => thread::sleep(EGRESS_IDLE_SLEEP),
                Ok(n) => {
                    self.stats.tun_rx_packets.fetch_add(1, Ordering::Relaxed);
                    self.handle_outbound(&buf[..n], &mut failures);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(EGRESS_IDLE_SLEEP);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!("TUN read error: {e}");
                    self.stats.degraded.store(true, Ordering::Relaxed);
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }
    }

    fn handle_outbound(&self, packet: &[u8], failures: &mut HashMap<PeerId, u32>) {
        let dst = match destination(packet) {
            PacketDst::V4(dst) => dst,
            PacketDst::V6 => {
                // IPv6 is pass-through only; there is no room mapping to
                // route unicast by.
                self.stats.dropped_no_route.fetch_add(1, Ordering::Relaxed);
                return;
            }
            PacketDst::Malformed => {
                self.stats.dropped_malformed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let wire = Frame::encode_ip_packet(packet);

        if self.subnet.is_fanout(dst) {
            for peer in self.registry.snapshot() {
                self.send_encoded(peer, &wire, failures);
            }
            return;
        }

        match self.subnet.lookup(dst) {
            Some(peer) if self.registry.contains(peer) => {
                self.send_encoded(peer, &wire, failures);
            }
            _ => {
                // Unknown destination, or a race with remove_peer. Not an
                // error either way.
                self.stats.dropped_no_route.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn send_encoded(&self, peer: PeerId, wire: &[u8], failures: &mut HashMap<PeerId, u32>) {
        match self
            .transport
            .send_to_peer(peer, wire, SendFlags::unreliable(), VPN_CHANNEL)
        {
            SendOutcome::Sent => {
                failures.remove(&peer);
                self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
            }
            outcome => {
                self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                let count = failures.entry(peer).or_insert(0);
                *count += 1;
                if *count == SEND_FAILURE_THRESHOLD {
                    warn!("peer {peer} unreachable after {count} sends ({outcome:?}); marking down");
                    self.registry.set_connection_kind(peer, ConnectionKind::Down);
                }
            }
        }
    }

    // ---- ingress ----

    fn handle_inbound(&self, message: InboundMessage) {
        let sender = message.sender;
        if !self.registry.contains(sender) {
            self.stats
                .dropped_unknown_sender
                .fetch_add(1, Ordering::Relaxed);
            return;
        }

        let frame = match Frame::decode(&message.payload) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("dropping malformed frame from {sender}: {e}");
                self.stats.dropped_malformed.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);

        match frame.kind {
            FrameKind::SessionHello => {
                debug!("session hello from {sender}");
                self.refresh_connection_kind(sender);
            }
            FrameKind::IpPacket => {
                if frame.payload.len() > self.mtu {
                    self.stats.dropped_malformed.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                match self.tun.write_packet(&frame.payload) {
                    Ok(_) => {
                        self.stats.tun_tx_packets.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        // Kernel queue full; the packet is lost, which is
                        // ordinary for IP.
                    }
                    Err(e) => {
                        error!("TUN write error: {e}");
                        self.stats.degraded.store(true, Ordering::Relaxed);
                    }
                }
            }
            FrameKind::Ping => {
                let pong = Frame::pong(frame.payload).encode();
                if self
                    .transport
                    .send_to_peer(sender, &pong, SendFlags::unreliable(), VPN_CHANNEL)
                    == SendOutcome::Sent
                {
                    self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
            FrameKind::Pong => {
                if let Some(info) = self.transport.session_info(sender) {
                    self.registry.record_ping(sender, info.ping_ms);
                }
            }
        }
    }

    fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::SessionRequested(peer) => {
                if self.registry.contains(peer) {
                    info!("accepting session from {peer}");
                    self.transport.accept_session(peer);
                } else {
                    debug!("ignoring session request from unknown peer {peer}");
                }
            }
            TransportEvent::SessionFailed { peer, reason } => {
                // Advisory only; the transport's auto-restart recovers
                // sessions we still want.
                warn!("session with {peer} failed: {reason}");
            }
        }
    }

    fn refresh_connection_kind(&self, peer: PeerId) {
        let kind = match self.transport.session_info(peer) {
            Some(info) if info.connected && info.relayed => ConnectionKind::Relayed,
            Some(info) if info.connected => ConnectionKind::Direct,
            _ => ConnectionKind::Unknown,
        };
        self.registry.set_connection_kind(peer, kind);
    }
}

impl InboundHandler for BridgeCore {
    fn on_batch(&self, batch: Vec<InboundMessage>) {
        for message in batch {
            self.handle_inbound(message);
        }
    }

    fn on_event(&self, event: TransportEvent) {
        self.handle_event(event);
    }
}

/// The bridge: top-level owner of the TUN device and the poll engine.
pub struct Bridge {
    core: Arc<BridgeCore>,
    poll: PollTuning,
    engine: Option<PollEngine>,
    egress: Option<thread::JoinHandle<()>>,
}

impl Bridge {
    /// Build a bridge around an already-open TUN device.
    ///
    /// The device is configured (address, MTU, link state, non-blocking
    /// mode) when [`start`](Self::start) runs.
    pub fn new(
        tun: Box<dyn TunDevice>,
        transport: Arc<dyn Transport>,
        registry: Arc<MembershipRegistry>,
        config: BridgeConfig,
    ) -> Self {
        let core = Arc::new(BridgeCore {
            tun,
            transport,
            registry,
            subnet: SubnetMap::new(config.address, config.netmask),
            stats: BridgeStats::default(),
            mtu: config.mtu as usize,
            running: AtomicBool::new(false),
        });

        Self {
            core,
            poll: config.poll,
            engine: None,
            egress: None,
        }
    }

    /// The address map the room layer keeps in sync with membership.
    pub fn subnet(&self) -> &SubnetMap {
        &self.core.subnet
    }

    /// The configured interface name, as assigned by the platform.
    pub fn device_name(&self) -> &str {
        self.core.tun.name()
    }

    /// Whether the pumps are running.
    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::Acquire)
    }

    /// Configure the interface and start both pump directions.
    ///
    /// Only setup errors propagate; once running, I/O faults are absorbed
    /// and reported through [`stats`](Self::stats).
    pub fn start(&mut self) -> Result<(), BridgeError> {
        self.start_inner(None)
    }

    /// Like [`start`](Self::start), but drives the poll loop on an
    /// externally supplied runtime.
    pub fn start_on(&mut self, handle: Handle) -> Result<(), BridgeError> {
        self.start_inner(Some(handle))
    }

    fn start_inner(&mut self, handle: Option<Handle>) -> Result<(), BridgeError> {
        if self.core.running.swap(true, Ordering::AcqRel) {
            return Err(BridgeError::AlreadyRunning);
        }

        let core = &self.core;
        let setup = (|| -> io::Result<()> {
            core.tun
                .set_ip(core.subnet.local_addr(), core.subnet.netmask())?;
            core.tun.set_mtu(core.mtu as u16)?;
            core.tun.set_up(true)?;
            core.tun.set_non_blocking(true)
        })();

        if let Err(e) = setup {
            self.core.running.store(false, Ordering::Release);
            return Err(e.into());
        }

        info!(
            "bridge up on '{}' ({}/{})",
            core.tun.name(),
            core.subnet.local_addr(),
            core.subnet.netmask()
        );

        let engine = match handle {
            Some(handle) => PollEngine::start_on(
                handle,
                self.poll.clone(),
                self.core.transport.clone(),
                self.core.clone(),
            ),
            None => PollEngine::start(
                self.poll.clone(),
                self.core.transport.clone(),
                self.core.clone(),
            ),
        };
        self.engine = Some(engine);

        let core = self.core.clone();
        let egress = thread::Builder::new()
            .name("roomnet-tun".into())
            .spawn(move || core.egress_loop())
            .expect("failed to spawn TUN reader thread");
        self.egress = Some(egress);

        Ok(())
    }

    /// Stop both pumps, shut the interface down and clear the room.
    pub fn stop(&mut self) {
        if !self.core.running.swap(false, Ordering::AcqRel) {
            return;
        }

        if let Some(egress) = self.egress.take() {
            if egress.join().is_err() {
                warn!("TUN reader thread panicked");
            }
        }

        if let Some(mut engine) = self.engine.take() {
            engine.stop();
        }

        if let Err(e) = self.core.tun.set_up(false) {
            debug!("failed to bring interface down: {e}");
        }

        self.core.registry.clear_peers();
        info!("bridge stopped");
    }

    // ---- membership control surface ----

    /// Add a peer to the room.
    ///
    /// A new member immediately gets a `SESSION_HELLO` with reliable,
    /// auto-restarting delivery, which opens the underlying session.
    pub fn add_peer(&self, peer: PeerId) -> bool {
        if !self.core.registry.add_peer(peer) {
            return false;
        }

        let hello = Frame::session_hello().encode();
        match self.core.transport.send_to_peer(
            peer,
            &hello,
            SendFlags::reliable_auto_restart(),
            VPN_CHANNEL,
        ) {
            SendOutcome::Sent => {
                self.core.registry.mark_hello_sent(peer);
                self.core.stats.hellos_sent.fetch_add(1, Ordering::Relaxed);
            }
            outcome => {
                // The peer stays; the transport re-establishes broken
                // sessions on the next reliable send.
                warn!("failed to send session hello to {peer}: {outcome:?}");
                self.core
                    .stats
                    .send_failures
                    .fetch_add(1, Ordering::Relaxed);
            }
        }

        true
    }

    /// Remove a peer, closing its session and dropping its addresses.
    pub fn remove_peer(&self, peer: PeerId) -> bool {
        self.core.subnet.unmap_peer(peer);
        self.core.registry.remove_peer(peer)
    }

    /// Remove every peer.
    pub fn clear_peers(&self) {
        for peer in self.core.registry.snapshot() {
            self.core.subnet.unmap_peer(peer);
        }
        self.core.registry.clear_peers();
    }

    /// Send an opaque payload to every room member.
    pub fn broadcast(&self, payload: &[u8], flags: SendFlags) {
        for peer in self.core.registry.snapshot() {
            match self
                .core
                .transport
                .send_to_peer(peer, payload, flags, VPN_CHANNEL)
            {
                SendOutcome::Sent => {
                    self.core.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                }
                _ => {
                    self.core
                        .stats
                        .send_failures
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Per-peer link status from the transport's session info.
    pub fn peer_stats(&self, peer: PeerId) -> PeerLinkStats {
        match self.core.transport.session_info(peer) {
            Some(info) if info.connected => PeerLinkStats {
                connected: true,
                ping_ms: info.ping_ms,
                kind: if info.relayed {
                    LinkKind::Relayed
                } else {
                    LinkKind::Direct
                },
            },
            _ => PeerLinkStats {
                connected: false,
                ping_ms: -1,
                kind: LinkKind::NotAvailable,
            },
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> StatsSnapshot {
        self.core.stats.snapshot()
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use crate::transport::SessionInfo;

    /// TUN double: scripted reads, recorded writes.
    struct MockTun {
        reads: Mutex<VecDeque<Vec<u8>>>,
        writes: Mutex<Vec<Vec<u8>>>,
    }

    impl MockTun {
        fn new() -> Self {
            Self {
                reads: Mutex::new(VecDeque::new()),
                writes: Mutex::new(Vec::new()),
            }
        }
    }

    impl TunDevice for Arc<MockTun> {
        fn name(&self) -> &str {
            "mock0"
        }

        fn mtu(&self) -> u16 {
            1420
        }

        fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.lock().unwrap().pop_front() {
                Some(packet) => {
                    buf[..packet.len()].copy_from_slice(&packet);
                    Ok(packet.len())
                }
                None => Err(io::Error::new(io::ErrorKind::WouldBlock, "no packet")),
            }
        }

        fn write_packet(&self, buf: &[u8]) -> io::Result<usize> {
            self.writes.lock().unwrap().push(buf.to_vec());
            Ok(buf.len())
        }

        fn set_ip(&self, _addr: Ipv4Addr, _netmask: Ipv4Addr) -> io::Result<()> {
            Ok(())
        }

        fn set_mtu(&self, _mtu: u16) -> io::Result<()> {
            Ok(())
        }

        fn set_up(&self, _up: bool) -> io::Result<()> {
            Ok(())
        }

        fn set_non_blocking(&self, _on: bool) -> io::Result<()> {
            Ok(())
        }
    }

    #[derive(Debug, Clone)]
    struct SentRecord {
        peer: PeerId,
        payload: Vec<u8>,
        flags: SendFlags,
        channel: u32,
    }

    /// Transport double recording sends; outcome is scriptable.
    struct MockTransport {
        sent: Mutex<Vec<SentRecord>>,
        outcome: Mutex<SendOutcome>,
        accepted: Mutex<Vec<PeerId>>,
        info: Mutex<Option<SessionInfo>>,
    }

    impl MockTransport {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                outcome: Mutex::new(SendOutcome::Sent),
                accepted: Mutex::new(Vec::new()),
                info: Mutex::new(None),
            }
        }

        fn sent(&self) -> Vec<SentRecord> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Transport for MockTransport {
        fn send_to_peer(
            &self,
            peer: PeerId,
            payload: &[u8],
            flags: SendFlags,
            channel: u32,
        ) -> SendOutcome {
            self.sent.lock().unwrap().push(SentRecord {
                peer,
                payload: payload.to_vec(),
                flags,
                channel,
            });
            *self.outcome.lock().unwrap()
        }

        fn drain(&self, _channel: u32, _max: usize) -> Vec<InboundMessage> {
            Vec::new()
        }

        fn poll_events(&self) -> Vec<TransportEvent> {
            Vec::new()
        }

        fn accept_session(&self, peer: PeerId) {
            self.accepted.lock().unwrap().push(peer);
        }

        fn close_session(&self, _peer: PeerId) {}

        fn session_info(&self, _peer: PeerId) -> Option<SessionInfo> {
            *self.info.lock().unwrap()
        }
    }

    const SELF_ID: u64 = 101;
    const PEER_B: u64 = 202;

    struct Harness {
        bridge: Bridge,
        transport: Arc<MockTransport>,
        registry: Arc<MembershipRegistry>,
        tun: Arc<MockTun>,
    }

    fn harness() -> Harness {
        let transport = Arc::new(MockTransport::new());
        let registry = Arc::new(MembershipRegistry::new(
            PeerId::from_raw(SELF_ID),
            transport.clone(),
        ));
        let tun = Arc::new(MockTun::new());
        let bridge = Bridge::new(
            Box::new(tun.clone()),
            transport.clone(),
            registry.clone(),
            BridgeConfig {
                address: Ipv4Addr::new(10, 7, 0, 1),
                netmask: Ipv4Addr::new(255, 255, 255, 0),
                mtu: 1420,
                poll: PollTuning::default(),
            },
        );
        Harness {
            bridge,
            transport,
            registry,
            tun,
        }
    }

    /// A minimal IPv4 header with the given destination, padded to `len`.
    fn ipv4_packet(dst: Ipv4Addr, len: usize) -> Vec<u8> {
        assert!(len >= 20);
        let mut packet = vec![0u8; len];
        packet[0] = 0x45;
        packet[16..20].copy_from_slice(&dst.octets());
        packet
    }

    #[test]
    fn test_add_peer_sends_hello() {
        let Harness {
            bridge, transport, ..
        } = harness();

        assert!(bridge.add_peer(PeerId::from_raw(PEER_B)));

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].peer, PeerId::from_raw(PEER_B));
        assert_eq!(sent[0].payload, vec![0x01, 0x00, 0x00]);
        assert_eq!(sent[0].channel, VPN_CHANNEL);
        assert!(sent[0].flags.is_set(SendFlags::RELIABLE));
        assert!(sent[0].flags.is_set(SendFlags::AUTO_RESTART));

        // Idempotent re-add sends nothing further.
        assert!(!bridge.add_peer(PeerId::from_raw(PEER_B)));
        assert_eq!(transport.sent().len(), 1);
    }

    #[test]
    fn test_ping_is_answered_with_pong() {
        let Harness {
            bridge, transport, ..
        } = harness();
        bridge.add_peer(PeerId::from_raw(PEER_B));

        bridge.core.handle_inbound(InboundMessage {
            sender: PeerId::from_raw(PEER_B),
            payload: vec![0x03, 0x00, 0x04, 0xDE, 0xAD, 0xBE, 0xEF],
        });

        let sent = transport.sent();
        let pong = sent.last().unwrap();
        assert_eq!(pong.peer, PeerId::from_raw(PEER_B));
        assert_eq!(pong.payload, vec![0x04, 0x00, 0x04, 0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(pong.channel, VPN_CHANNEL);
        assert!(!pong.flags.is_set(SendFlags::RELIABLE));
    }

    #[test]
    fn test_egress_wraps_and_routes_by_destination() {
        let Harness {
            bridge, transport, ..
        } = harness();
        let peer = PeerId::from_raw(PEER_B);
        let peer_addr = Ipv4Addr::new(10, 7, 0, 2);
        bridge.add_peer(peer);
        bridge.subnet().map_peer(peer_addr, peer);

        let packet = ipv4_packet(peer_addr, 60);
        let mut failures = HashMap::new();
        bridge.core.handle_outbound(&packet, &mut failures);

        let sent = transport.sent();
        let data = sent.last().unwrap();
        assert_eq!(data.peer, peer);
        assert_eq!(data.payload[0], 0x02);
        assert_eq!(data.payload[1..3], [0x00, 0x3C]);
        assert_eq!(&data.payload[3..], packet.as_slice());
        assert!(!data.flags.is_set(SendFlags::RELIABLE));
    }

    #[test]
    fn test_inbound_ip_packet_reaches_tun() {
        let Harness { bridge, tun, .. } = harness();
        bridge.add_peer(PeerId::from_raw(PEER_B));

        let packet = ipv4_packet(Ipv4Addr::new(10, 7, 0, 1), 60);
        let mut frame = vec![0x02, 0x00, 0x3C];
        frame.extend_from_slice(&packet);

        bridge.core.handle_inbound(InboundMessage {
            sender: PeerId::from_raw(PEER_B),
            payload: frame,
        });

        let writes = tun.writes.lock().unwrap().clone();
        assert_eq!(writes, vec![packet]);
        assert_eq!(bridge.stats().tun_tx_packets, 1);
    }

    #[test]
    fn test_unknown_frame_kind_is_dropped_silently() {
        let Harness {
            bridge,
            transport,
            tun,
            ..
        } = harness();
        bridge.add_peer(PeerId::from_raw(PEER_B));
        let sends_before = transport.sent().len();

        bridge.core.handle_inbound(InboundMessage {
            sender: PeerId::from_raw(PEER_B),
            payload: vec![0xFF, 0x00, 0x00],
        });

        assert!(tun.writes.lock().unwrap().is_empty());
        assert_eq!(transport.sent().len(), sends_before);
        assert_eq!(bridge.stats().dropped_malformed, 1);
    }

    #[test]
    fn test_non_member_sender_is_dropped() {
        let Harness { bridge, .. } = harness();

        bridge.core.handle_inbound(InboundMessage {
            sender: PeerId::from_raw(999),
            payload: vec![0x03, 0x00, 0x00],
        });

        assert_eq!(bridge.stats().dropped_unknown_sender, 1);
        assert_eq!(bridge.stats().frames_received, 0);
    }

    #[test]
    fn test_no_egress_after_remove_peer() {
        let Harness {
            bridge, transport, ..
        } = harness();
        let peer = PeerId::from_raw(PEER_B);
        let peer_addr = Ipv4Addr::new(10, 7, 0, 2);
        bridge.add_peer(peer);
        bridge.subnet().map_peer(peer_addr, peer);
        bridge.remove_peer(peer);

        let sends_before = transport.sent().len();
        let mut failures = HashMap::new();
        bridge
            .core
            .handle_outbound(&ipv4_packet(peer_addr, 40), &mut failures);

        assert_eq!(transport.sent().len(), sends_before);
        assert_eq!(bridge.stats().dropped_no_route, 1);
    }

    #[test]
    fn test_broadcast_destination_fans_out() {
        let Harness {
            bridge, transport, ..
        } = harness();
        bridge.add_peer(PeerId::from_raw(202));
        bridge.add_peer(PeerId::from_raw(303));

        let sends_before = transport.sent().len();
        let mut failures = HashMap::new();
        bridge.core.handle_outbound(
            &ipv4_packet(Ipv4Addr::new(10, 7, 0, 255), 28),
            &mut failures,
        );

        let sent = transport.sent();
        let mut targets: Vec<u64> = sent[sends_before..].iter().map(|s| s.peer.raw()).collect();
        targets.sort_unstable();
        assert_eq!(targets, vec![202, 303]);
    }

    #[test]
    fn test_consecutive_send_failures_mark_peer_down() {
        let Harness {
            bridge,
            transport,
            registry,
            ..
        } = harness();
        let peer = PeerId::from_raw(PEER_B);
        let peer_addr = Ipv4Addr::new(10, 7, 0, 2);
        bridge.add_peer(peer);
        bridge.subnet().map_peer(peer_addr, peer);

        *transport.outcome.lock().unwrap() = SendOutcome::TransientError;

        let mut failures = HashMap::new();
        let packet = ipv4_packet(peer_addr, 40);
        for _ in 0..SEND_FAILURE_THRESHOLD {
            bridge.core.handle_outbound(&packet, &mut failures);
        }

        let state = registry.peer_state(peer).unwrap();
        assert_eq!(state.kind, ConnectionKind::Down);
        // The peer is down, not gone.
        assert!(registry.contains(peer));

        // A successful send resets the streak.
        *transport.outcome.lock().unwrap() = SendOutcome::Sent;
        bridge.core.handle_outbound(&packet, &mut failures);
        assert!(failures.get(&peer).is_none());
    }

    #[test]
    fn test_session_request_auto_accepts_members_only() {
        let Harness {
            bridge, transport, ..
        } = harness();
        bridge.add_peer(PeerId::from_raw(PEER_B));

        bridge
            .core
            .handle_event(TransportEvent::SessionRequested(PeerId::from_raw(PEER_B)));
        bridge
            .core
            .handle_event(TransportEvent::SessionRequested(PeerId::from_raw(999)));

        assert_eq!(
            transport.accepted.lock().unwrap().as_slice(),
            &[PeerId::from_raw(PEER_B)]
        );
    }

    #[test]
    fn test_pong_updates_peer_ping() {
        let Harness {
            bridge,
            transport,
            registry,
            ..
        } = harness();
        let peer = PeerId::from_raw(PEER_B);
        bridge.add_peer(peer);

        *transport.info.lock().unwrap() = Some(SessionInfo {
            connected: true,
            ping_ms: 42,
            relayed: false,
        });

        bridge.core.handle_inbound(InboundMessage {
            sender: peer,
            payload: vec![0x04, 0x00, 0x00],
        });

        assert_eq!(registry.peer_state(peer).unwrap().last_ping_ms, 42);
    }

    #[test]
    fn test_peer_stats_reflect_session_info() {
        let Harness {
            bridge, transport, ..
        } = harness();
        let peer = PeerId::from_raw(PEER_B);

        let stats = bridge.peer_stats(peer);
        assert!(!stats.connected);
        assert_eq!(stats.ping_ms, -1);
        assert_eq!(stats.kind, LinkKind::NotAvailable);

        *transport.info.lock().unwrap() = Some(SessionInfo {
            connected: true,
            ping_ms: 17,
            relayed: true,
        });
        let stats = bridge.peer_stats(peer);
        assert!(stats.connected);
        assert_eq!(stats.ping_ms, 17);
        assert_eq!(stats.kind, LinkKind::Relayed);
    }

    #[test]
    fn test_oversized_inbound_packet_is_dropped() {
        let Harness { bridge, tun, .. } = harness();
        bridge.add_peer(PeerId::from_raw(PEER_B));

        let oversized = vec![0u8; 2000];
        let mut frame = vec![0x02];
        frame.extend_from_slice(&(oversized.len() as u16).to_be_bytes());
        frame.extend_from_slice(&oversized);

        bridge.core.handle_inbound(InboundMessage {
            sender: PeerId::from_raw(PEER_B),
            payload: frame,
        });

        assert!(tun.writes.lock().unwrap().is_empty());
        assert_eq!(bridge.stats().dropped_malformed, 1);
    }
}
