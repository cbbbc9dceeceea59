//! Peer directory.
//!
//! The hub knows each connected client by two keys: its overlay address
//! (for routing tunneled packets) and the public address its datagrams
//! arrive from (for validating keep-alives). Both entries share one
//! lease; a valid keep-alive renews both.

use crate::cache::TtlMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// A connected client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Peer {
    /// Address inside the overlay network.
    pub overlay_addr: IpAddr,
    /// Internet-facing address its datagrams arrive from.
    pub public_addr: SocketAddr,
}

/// Dual-keyed peer registry with leased entries.
pub struct PeerDirectory {
    by_overlay: TtlMap<Ipv4Addr, Peer>,
    by_public: TtlMap<IpAddr, Peer>,
    ttl: Duration,
}

impl PeerDirectory {
    pub fn new(ttl: Duration) -> Self {
        Self {
            by_overlay: TtlMap::new(),
            by_public: TtlMap::new(),
            ttl,
        }
    }

    /// Register a peer under both keys with a fresh lease.
    ///
    /// Called on a validated Connect; an existing registration for either
    /// key is replaced.
    pub fn insert(&self, peer: Peer) {
        if let IpAddr::V4(overlay) = peer.overlay_addr.to_canonical() {
            self.by_overlay.insert(overlay, peer, self.ttl);
        }
        self.by_public
            .insert(peer.public_addr.ip().to_canonical(), peer, self.ttl);
    }

    /// Look up a peer by overlay address.
    pub fn get_by_overlay(&self, addr: Ipv4Addr) -> Option<Peer> {
        self.by_overlay.get(&addr)
    }

    /// Renew a peer's lease from a keep-alive.
    ///
    /// The sender's public IP must already be registered; keep-alives
    /// from unknown addresses cannot create or extend leases. Returns
    /// whether the lease was renewed.
    pub fn refresh(&self, overlay_addr: IpAddr, public_ip: IpAddr) -> bool {
        let public_ip = public_ip.to_canonical();
        if !self.by_public.contains(&public_ip) {
            return false;
        }

        if let IpAddr::V4(overlay) = overlay_addr.to_canonical() {
            self.by_overlay.touch(&overlay);
        }
        self.by_public.touch(&public_ip);
        true
    }

    /// Whether a public IP has a live registration.
    pub fn contains_public(&self, public_ip: IpAddr) -> bool {
        self.by_public.contains(&public_ip.to_canonical())
    }
}
