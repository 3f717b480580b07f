//! Peer-addressed datagram transport contract.
//!
//! The bridge does not own a network stack of its own; it talks to an
//! external messaging facility that addresses peers by opaque identity,
//! opens per-peer sessions implicitly on first send, and may fall back to
//! relayed delivery when a direct path is unavailable.
//!
//! Implementations must be callable from any thread. Session lifecycle
//! notifications are *not* delivered as callbacks into bridge code;
//! instead the transport queues [`TransportEvent`]s and the poll engine
//! drains them on its own thread, so transport-owned threads never enter
//! bridge logic.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Opaque stable peer identity assigned by the transport.
///
/// Ordered and equality-comparable; used as the routing key everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(u64);

impl PeerId {
    /// Wrap a raw transport identity.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw 64-bit identity.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-send delivery flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendFlags(u8);

impl SendFlags {
    /// Ordered, retransmitted delivery.
    pub const RELIABLE: u8 = 0b0000_0001;

    /// Transparently re-establish the session after a transient break.
    pub const AUTO_RESTART: u8 = 0b0000_0010;

    /// Best-effort delivery with no buffering delay.
    pub fn unreliable() -> Self {
        Self(0)
    }

    /// Reliable delivery with transparent session restart; used for
    /// session hellos.
    pub fn reliable_auto_restart() -> Self {
        Self(Self::RELIABLE | Self::AUTO_RESTART)
    }

    /// Check if a flag is set
    pub fn is_set(&self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    /// Get raw flags value
    pub fn raw(&self) -> u8 {
        self.0
    }
}

/// Outcome of a single send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Accepted by the transport (delivery still subject to the flags).
    Sent,
    /// Transient failure; the packet is lost but the session may recover.
    TransientError,
    /// The transport has no session or route for this peer.
    PeerUnknown,
}

/// An inbound datagram drained from the transport.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Authenticated sender identity
    pub sender: PeerId,
    /// Raw frame bytes
    pub payload: Vec<u8>,
}

/// Session lifecycle notifications, queued by the transport and drained
/// on the poll engine thread.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A remote peer wants to open a session with us.
    SessionRequested(PeerId),
    /// A session attempt failed; advisory only.
    SessionFailed { peer: PeerId, reason: String },
}

/// Point-in-time session status for a peer.
#[derive(Debug, Clone, Copy)]
pub struct SessionInfo {
    /// Whether the session is currently established
    pub connected: bool,
    /// Round-trip time in milliseconds, or -1 when unknown
    pub ping_ms: i32,
    /// Whether traffic is flowing through a relay
    pub relayed: bool,
}

/// Transport tuning knobs handed through at startup.
///
/// The core never interprets these; transports apply what they support
/// and ignore the rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportTuning {
    /// Target send rate in bytes per second
    pub send_rate: u32,
    /// Send buffer size in bytes
    pub send_buffer_size: u32,
    /// Nagle delay; zero disables buffering entirely
    pub nagle: Duration,
}

impl Default for TransportTuning {
    fn default() -> Self {
        Self {
            send_rate: 10 * 1024 * 1024,
            send_buffer_size: 2 * 1024 * 1024,
            nagle: Duration::ZERO,
        }
    }
}

/// The peer-addressed datagram service the bridge is built on.
pub trait Transport: Send + Sync {
    /// Send one datagram to a peer on the given channel.
    fn send_to_peer(
        &self,
        peer: PeerId,
        payload: &[u8],
        flags: SendFlags,
        channel: u32,
    ) -> SendOutcome;

    /// Drain up to `max` queued inbound messages for a channel without
    /// blocking. An empty vector means nothing was pending.
    fn drain(&self, channel: u32, max: usize) -> Vec<InboundMessage>;

    /// Drain queued session lifecycle events without blocking.
    fn poll_events(&self) -> Vec<TransportEvent>;

    /// Accept a session requested by a remote peer.
    fn accept_session(&self, peer: PeerId);

    /// Tear down the session with a peer, if any.
    fn close_session(&self, peer: PeerId);

    /// Query session status for a peer; `None` when the transport has
    /// never seen it.
    fn session_info(&self, peer: PeerId) -> Option<SessionInfo>;
}
