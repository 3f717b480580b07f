//! Wire framing for the VPN channel.
//!
//! Every payload exchanged between peers on the VPN channel is wrapped in
//! a small frame. All multi-byte fields are network byte order (big
//! endian) and the layout is identical on every node:
//!
//! ```text
//! offset 0: u8  kind      (1=SESSION_HELLO, 2=IP_PACKET, 3=PING, 4=PONG)
//! offset 1: u16 length    (payload length, network byte order)
//! offset 3: payload       (length bytes)
//! ```
//!
//! A frame whose declared length exceeds the received datagram is
//! malformed and must be dropped. Frames with an unknown kind are also
//! dropped, never answered with an error; the sender may simply be a
//! newer node.

use std::fmt;

/// The single message channel used for all VPN traffic.
///
/// The transport must not multiplex unrelated traffic onto it.
pub const VPN_CHANNEL: u32 = 0;

/// Size of the frame header in bytes.
pub const FRAME_HEADER_SIZE: usize = 3;

/// Maximum payload a frame can carry (bounded by the u16 length field).
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Frame kind discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Opens a transport session with a peer; carries no payload.
    SessionHello = 1,
    /// A raw IP datagram destined for the receiver's TUN device.
    IpPacket = 2,
    /// Liveness probe; payload is an opaque nonce echoed back in the pong.
    Ping = 3,
    /// Reply to a ping, carrying the ping's nonce.
    Pong = 4,
}

impl FrameKind {
    /// Decode a wire discriminator, returning `None` for unknown values.
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::SessionHello),
            2 => Some(Self::IpPacket),
            3 => Some(Self::Ping),
            4 => Some(Self::Pong),
            _ => None,
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SessionHello => "SESSION_HELLO",
            Self::IpPacket => "IP_PACKET",
            Self::Ping => "PING",
            Self::Pong => "PONG",
        };
        f.write_str(name)
    }
}

/// A decoded VPN frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame kind
    pub kind: FrameKind,
    /// Payload bytes; semantics depend on `kind`
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a session hello frame (empty payload).
    pub fn session_hello() -> Self {
        Self {
            kind: FrameKind::SessionHello,
            payload: Vec::new(),
        }
    }

    /// Wrap an IP datagram.
    pub fn ip_packet(packet: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::IpPacket,
            payload: packet,
        }
    }

    /// Create a ping carrying an opaque nonce.
    pub fn ping(nonce: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Ping,
            payload: nonce,
        }
    }

    /// Create a pong echoing a ping's nonce.
    pub fn pong(nonce: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Pong,
            payload: nonce,
        }
    }

    /// Encode an IP datagram frame straight from a borrowed packet.
    ///
    /// Equivalent to `Frame::ip_packet(packet.to_vec()).encode()` without
    /// the intermediate copy; the egress path wraps every TUN read this
    /// way.
    pub fn encode_ip_packet(packet: &[u8]) -> Vec<u8> {
        debug_assert!(packet.len() <= MAX_FRAME_PAYLOAD);

        let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + packet.len());
        buf.push(FrameKind::IpPacket as u8);
        buf.extend_from_slice(&(packet.len() as u16).to_be_bytes());
        buf.extend_from_slice(packet);
        buf
    }

    /// Total encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    /// Encode the frame to wire bytes (network byte order).
    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(self.payload.len() <= MAX_FRAME_PAYLOAD);

        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.push(self.kind as u8);
        buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode a frame from a received datagram.
    ///
    /// Trailing bytes past the declared length are ignored; transports
    /// deliver exact datagrams in practice.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(FrameError::Truncated { actual: buf.len() });
        }

        let kind = FrameKind::from_wire(buf[0]).ok_or(FrameError::UnknownKind(buf[0]))?;
        let declared = u16::from_be_bytes([buf[1], buf[2]]) as usize;

        let available = buf.len() - FRAME_HEADER_SIZE;
        if declared > available {
            return Err(FrameError::LengthMismatch {
                declared,
                available,
            });
        }

        Ok(Self {
            kind,
            payload: buf[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + declared].to_vec(),
        })
    }
}

/// Framing errors
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame too short: {actual} bytes (header is {FRAME_HEADER_SIZE})")]
    Truncated { actual: usize },

    #[error("declared payload length {declared} exceeds datagram ({available} available)")]
    LengthMismatch { declared: usize, available: usize },

    #[error("unknown frame kind: 0x{0:02X}")]
    UnknownKind(u8),
}
