//! Peer addressing within the room subnet.
//!
//! Every room member is configured with an address inside a common
//! subnet; which address belongs to which peer is decided by the room
//! layer and fed into this map. The bridge only needs the reverse lookup
//! (destination address to peer identity) and a predicate telling it
//! which destinations fan out to the whole room.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use tracing::debug;

use crate::transport::PeerId;

/// Reverse map from in-subnet IPv4 addresses to peer identities.
pub struct SubnetMap {
    local: Ipv4Addr,
    netmask: Ipv4Addr,
    broadcast: Ipv4Addr,
    peers: Mutex<HashMap<Ipv4Addr, PeerId>>,
}

impl SubnetMap {
    /// Create the map for a local interface address and netmask.
    pub fn new(local: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        let addr = u32::from(local);
        let mask = u32::from(netmask);
        let broadcast = Ipv4Addr::from((addr & mask) | !mask);

        Self {
            local,
            netmask,
            broadcast,
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// The local interface address.
    pub fn local_addr(&self) -> Ipv4Addr {
        self.local
    }

    /// The interface netmask.
    pub fn netmask(&self) -> Ipv4Addr {
        self.netmask
    }

    /// Associate an in-subnet address with a peer.
    ///
    /// Called by the room layer when membership changes. Re-mapping an
    /// address replaces the previous owner.
    pub fn map_peer(&self, addr: Ipv4Addr, peer: PeerId) {
        debug!("mapping {addr} -> peer {peer}");
        self.peers.lock().unwrap().insert(addr, peer);
    }

    /// Drop the mapping for an address.
    pub fn unmap_addr(&self, addr: Ipv4Addr) {
        self.peers.lock().unwrap().remove(&addr);
    }

    /// Drop every mapping owned by a peer.
    pub fn unmap_peer(&self, peer: PeerId) {
        self.peers.lock().unwrap().retain(|_, p| *p != peer);
    }

    /// Resolve a destination address to its peer, if mapped.
    pub fn lookup(&self, addr: Ipv4Addr) -> Option<PeerId> {
        self.peers.lock().unwrap().get(&addr).copied()
    }

    /// Whether a destination fans out to every room member: the subnet
    /// broadcast address, the limited broadcast address, or any IPv4
    /// multicast group.
    pub fn is_fanout(&self, addr: Ipv4Addr) -> bool {
        addr == self.broadcast || addr == Ipv4Addr::BROADCAST || addr.is_multicast()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> SubnetMap {
        SubnetMap::new(
            Ipv4Addr::new(10, 7, 0, 1),
            Ipv4Addr::new(255, 255, 255, 0),
        )
    }

    #[test]
    fn test_lookup_roundtrip() {
        let map = map();
        let peer = PeerId::from_raw(202);
        let addr = Ipv4Addr::new(10, 7, 0, 2);

        assert_eq!(map.lookup(addr), None);
        map.map_peer(addr, peer);
        assert_eq!(map.lookup(addr), Some(peer));

        map.unmap_addr(addr);
        assert_eq!(map.lookup(addr), None);
    }

    #[test]
    fn test_unmap_peer_drops_all_addresses() {
        let map = map();
        let peer = PeerId::from_raw(202);
        map.map_peer(Ipv4Addr::new(10, 7, 0, 2), peer);
        map.map_peer(Ipv4Addr::new(10, 7, 0, 3), peer);
        map.map_peer(Ipv4Addr::new(10, 7, 0, 4), PeerId::from_raw(303));

        map.unmap_peer(peer);
        assert_eq!(map.lookup(Ipv4Addr::new(10, 7, 0, 2)), None);
        assert_eq!(map.lookup(Ipv4Addr::new(10, 7, 0, 3)), None);
        assert_eq!(
            map.lookup(Ipv4Addr::new(10, 7, 0, 4)),
            Some(PeerId::from_raw(303))
        );
    }

    #[test]
    fn test_fanout_predicate() {
        let map = map();
        assert!(map.is_fanout(Ipv4Addr::new(10, 7, 0, 255)));
        assert!(map.is_fanout(Ipv4Addr::BROADCAST));
        assert!(map.is_fanout(Ipv4Addr::new(224, 0, 0, 251)));

        assert!(!map.is_fanout(Ipv4Addr::new(10, 7, 0, 2)));
        assert!(!map.is_fanout(Ipv4Addr::new(10, 7, 1, 255)));
    }
}
