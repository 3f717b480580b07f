//! Core library for the roomnet peer-to-peer VPN overlay.
//!
//! roomnet bridges a local virtual network interface (TUN) to an opaque
//! peer-addressed messaging transport. IP datagrams read from the TUN
//! device are framed and shipped to the peer that owns the destination
//! address; frames received from peers are unwrapped and written back
//! into the TUN device. Two peers joined to the same room appear to each
//! other as neighbors on a shared private subnet.
//!
//! # Architecture
//!
//! The library is organized into several key modules:
//!
//! - `proto`: Wire framing for the VPN channel (hello/data/ping/pong)
//! - `tun`: Virtual Layer-3 adapter backends (Linux, macOS, Wintun)
//! - `transport`: The peer-addressed datagram transport contract
//! - `registry`: Membership set of known peers and their liveness state
//! - `poll`: Adaptive-interval engine draining inbound transport traffic
//! - `subnet`: Reverse mapping from in-subnet addresses to peer identities
//! - `bridge`: Bidirectional pump wiring TUN and transport together
//! - `control`: Node configuration types
//!
//! The transport itself is external: callers hand the bridge any
//! implementation of [`transport::Transport`], and the room layer keeps
//! the membership registry and subnet map in sync with room membership.

pub mod bridge;
pub mod control;
pub mod poll;
pub mod proto;
pub mod registry;
pub mod subnet;
pub mod transport;
pub mod tun;

pub use bridge::{Bridge, BridgeStats};
pub use proto::{Frame, FrameKind, VPN_CHANNEL};
pub use registry::MembershipRegistry;
pub use transport::{PeerId, SendFlags, Transport};
