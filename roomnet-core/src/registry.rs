//! Membership registry: the authoritative set of known peers.
//!
//! The registry is a single-mutex map from peer identity to per-peer
//! liveness state. Critical sections are O(1) or O(n) copies and never
//! perform I/O; session teardown and observer notification happen after
//! the lock is released, so no caller ever observes a half-removed peer
//! that still has an active session.

use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{debug, info};

use crate::transport::{PeerId, Transport};

/// How a peer's session is currently reaching us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    /// No observation yet
    Unknown,
    /// Direct path
    Direct,
    /// Traffic is relayed
    Relayed,
    /// Sends are failing; the entry is kept so recovery stays transparent
    Down,
}

/// Per-peer liveness state.
#[derive(Debug, Clone, Copy)]
pub struct PeerState {
    /// When the peer was inserted
    pub joined_at: Instant,
    /// When we last sent a session hello to this peer
    pub last_hello_sent: Option<Instant>,
    /// Last observed connection kind
    pub kind: ConnectionKind,
    /// Last observed round-trip time in milliseconds, -1 when unknown
    pub last_ping_ms: i32,
}

impl PeerState {
    fn new() -> Self {
        Self {
            joined_at: Instant::now(),
            last_hello_sent: None,
            kind: ConnectionKind::Unknown,
            last_ping_ms: -1,
        }
    }
}

/// Observer for membership churn.
///
/// Callbacks fire outside the registry lock, on the thread that performed
/// the mutation.
pub trait MembershipObserver: Send + Sync {
    fn on_peer_joined(&self, _peer: PeerId) {}
    fn on_peer_left(&self, _peer: PeerId) {}
}

/// Thread-safe membership set.
///
/// The local node's own identity is never present. Insertion is
/// idempotent; removal closes the peer's transport session.
pub struct MembershipRegistry {
    self_id: PeerId,
    transport: Arc<dyn Transport>,
    peers: Mutex<HashMap<PeerId, PeerState>>,
    observers: Mutex<Vec<Arc<dyn MembershipObserver>>>,
}

impl MembershipRegistry {
    /// Create an empty registry for a node with the given self identity.
    pub fn new(self_id: PeerId, transport: Arc<dyn Transport>) -> Self {
        Self {
            self_id,
            transport,
            peers: Mutex::new(HashMap::new()),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// The local node's identity.
    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    /// Register an observer for join/leave notifications.
    pub fn add_observer(&self, observer: Arc<dyn MembershipObserver>) {
        self.observers.lock().unwrap().push(observer);
    }

    /// Insert a peer. Returns whether a new entry was created.
    ///
    /// The local identity is rejected, and re-inserting a known peer is a
    /// no-op, leaving its state untouched.
    pub fn add_peer(&self, peer: PeerId) -> bool {
        if peer == self.self_id {
            debug!("refusing to add self ({peer}) to membership");
            return false;
        }

        let created = {
            let mut peers = self.peers.lock().unwrap();
            match peers.entry(peer) {
                std::collections::hash_map::Entry::Occupied(_) => false,
                std::collections::hash_map::Entry::Vacant(slot) => {
                    slot.insert(PeerState::new());
                    true
                }
            }
        };

        if created {
            info!("peer {peer} joined the room");
            for observer in self.observers.lock().unwrap().iter() {
                observer.on_peer_joined(peer);
            }
        }

        created
    }

    /// Remove a peer, closing its transport session.
    ///
    /// Once this returns, no subsequent egress frame targets the peer
    /// until it is added again.
    pub fn remove_peer(&self, peer: PeerId) -> bool {
        let removed = self.peers.lock().unwrap().remove(&peer).is_some();

        if removed {
            info!("peer {peer} left the room");
            self.transport.close_session(peer);
            for observer in self.observers.lock().unwrap().iter() {
                observer.on_peer_left(peer);
            }
        }

        removed
    }

    /// Remove every peer, closing all sessions.
    ///
    /// The map is swapped out in one critical section, so concurrent
    /// readers see either the full membership or none of it.
    pub fn clear_peers(&self) {
        let drained = {
            let mut peers = self.peers.lock().unwrap();
            mem::take(&mut *peers)
        };

        if drained.is_empty() {
            return;
        }

        info!("clearing {} peers", drained.len());
        for peer in drained.keys() {
            self.transport.close_session(*peer);
            for observer in self.observers.lock().unwrap().iter() {
                observer.on_peer_left(*peer);
            }
        }
    }

    /// Whether a peer is currently a member.
    pub fn contains(&self, peer: PeerId) -> bool {
        self.peers.lock().unwrap().contains_key(&peer)
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.peers.lock().unwrap().is_empty()
    }

    /// Point-in-time copy of the membership for lock-free iteration.
    pub fn snapshot(&self) -> Vec<PeerId> {
        self.peers.lock().unwrap().keys().copied().collect()
    }

    /// Copy of a peer's state, if it is a member.
    pub fn peer_state(&self, peer: PeerId) -> Option<PeerState> {
        self.peers.lock().unwrap().get(&peer).copied()
    }

    /// Record that a session hello was sent to a peer.
    pub fn mark_hello_sent(&self, peer: PeerId) {
        if let Some(state) = self.peers.lock().unwrap().get_mut(&peer) {
            state.last_hello_sent = Some(Instant::now());
        }
    }

    /// Update a peer's observed connection kind.
    pub fn set_connection_kind(&self, peer: PeerId, kind: ConnectionKind) {
        if let Some(state) = self.peers.lock().unwrap().get_mut(&peer) {
            if state.kind != kind {
                debug!("peer {peer} connection is now {kind:?}");
                state.kind = kind;
            }
        }
    }

    /// Record a round-trip observation from a pong.
    pub fn record_ping(&self, peer: PeerId, ping_ms: i32) {
        if let Some(state) = self.peers.lock().unwrap().get_mut(&peer) {
            state.last_ping_ms = ping_ms;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::transport::{InboundMessage, SendFlags, SendOutcome, SessionInfo, TransportEvent};

    #[derive(Default)]
    struct RecordingTransport {
        closed: Mutex<Vec<PeerId>>,
    }

    impl Transport for RecordingTransport {
        fn send_to_peer(
            &self,
            _peer: PeerId,
            _payload: &[u8],
            _flags: SendFlags,
            _channel: u32,
        ) -> SendOutcome {
            SendOutcome::Sent
        }

        fn drain(&self, _channel: u32, _max: usize) -> Vec<InboundMessage> {
            Vec::new()
        }

        fn poll_events(&self) -> Vec<TransportEvent> {
            Vec::new()
        }

        fn accept_session(&self, _peer: PeerId) {}

        fn close_session(&self, peer: PeerId) {
            self.closed.lock().unwrap().push(peer);
        }

        fn session_info(&self, _peer: PeerId) -> Option<SessionInfo> {
            None
        }
    }

    #[derive(Default)]
    struct CountingObserver {
        joined: AtomicUsize,
        left: AtomicUsize,
    }

    impl MembershipObserver for CountingObserver {
        fn on_peer_joined(&self, _peer: PeerId) {
            self.joined.fetch_add(1, Ordering::SeqCst);
        }

        fn on_peer_left(&self, _peer: PeerId) {
            self.left.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn registry() -> (MembershipRegistry, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let registry = MembershipRegistry::new(PeerId::from_raw(101), transport.clone());
        (registry, transport)
    }

    #[test]
    fn test_add_peer_idempotent() {
        let (registry, _) = registry();
        let peer = PeerId::from_raw(202);

        assert!(registry.add_peer(peer));
        let first = registry.peer_state(peer).unwrap();

        assert!(!registry.add_peer(peer));
        assert_eq!(registry.len(), 1);

        // Re-adding must not reset existing state.
        let second = registry.peer_state(peer).unwrap();
        assert_eq!(first.joined_at, second.joined_at);
    }

    #[test]
    fn test_self_never_joins() {
        let (registry, _) = registry();
        assert!(!registry.add_peer(PeerId::from_raw(101)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_closes_session() {
        let (registry, transport) = registry();
        let peer = PeerId::from_raw(202);

        registry.add_peer(peer);
        assert!(registry.remove_peer(peer));
        assert!(!registry.contains(peer));
        assert_eq!(transport.closed.lock().unwrap().as_slice(), &[peer]);

        // Removing again is a no-op and closes nothing new.
        assert!(!registry.remove_peer(peer));
        assert_eq!(transport.closed.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_clear_closes_every_session() {
        let (registry, transport) = registry();
        for raw in [202, 303, 404] {
            registry.add_peer(PeerId::from_raw(raw));
        }

        registry.clear_peers();
        assert!(registry.is_empty());

        let mut closed = transport.closed.lock().unwrap().clone();
        closed.sort();
        assert_eq!(
            closed,
            vec![
                PeerId::from_raw(202),
                PeerId::from_raw(303),
                PeerId::from_raw(404)
            ]
        );
    }

    #[test]
    fn test_observer_notifications() {
        let (registry, _) = registry();
        let observer = Arc::new(CountingObserver::default());
        registry.add_observer(observer.clone());

        registry.add_peer(PeerId::from_raw(202));
        registry.add_peer(PeerId::from_raw(202)); // idempotent: no second event
        registry.add_peer(PeerId::from_raw(303));
        registry.remove_peer(PeerId::from_raw(202));
        registry.clear_peers();

        assert_eq!(observer.joined.load(Ordering::SeqCst), 2);
        assert_eq!(observer.left.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_liveness_updates() {
        let (registry, _) = registry();
        let peer = PeerId::from_raw(202);
        registry.add_peer(peer);

        registry.set_connection_kind(peer, ConnectionKind::Direct);
        registry.record_ping(peer, 23);
        registry.mark_hello_sent(peer);

        let state = registry.peer_state(peer).unwrap();
        assert_eq!(state.kind, ConnectionKind::Direct);
        assert_eq!(state.last_ping_ms, 23);
        assert!(state.last_hello_sent.is_some());

        // Updates to unknown peers are dropped silently.
        registry.record_ping(PeerId::from_raw(999), 5);
        assert!(registry.peer_state(PeerId::from_raw(999)).is_none());
    }
}
