//! Overlay network snapshot cell.
//!
//! The hub's view of its own overlay binding: the device address plus
//! prefix. Republished whenever the device address changes; readers take
//! a copy, so a routing decision always sees one consistent pair.

use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::sync::RwLock;

/// Routing class of an IPv4 destination relative to the overlay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteClass {
    /// The hub's own overlay address.
    OwnAddress,
    /// Another host inside the overlay CIDR.
    Overlay,
    /// Outside the overlay; belongs to the upstream stack.
    External,
}

/// Atomically replaceable `{address, prefix}` pair.
pub struct Overlay {
    net: RwLock<Ipv4Net>,
}

impl Overlay {
    /// `net.addr()` is the hub's own overlay address (host bits kept).
    pub fn new(net: Ipv4Net) -> Self {
        Self {
            net: RwLock::new(net),
        }
    }

    /// Replace the published pair. Last writer wins.
    pub fn publish(&self, net: Ipv4Net) {
        *self.net.write().expect("overlay lock poisoned") = net;
    }

    /// Copy of the current pair.
    pub fn snapshot(&self) -> Ipv4Net {
        *self.net.read().expect("overlay lock poisoned")
    }

    /// Classify a destination against the current snapshot.
    pub fn classify(&self, dst: Ipv4Addr) -> RouteClass {
        let net = self.snapshot();
        if dst == net.addr() {
            RouteClass::OwnAddress
        } else if net.contains(&dst) {
            RouteClass::Overlay
        } else {
            RouteClass::External
        }
    }
}
