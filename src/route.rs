//! Host-route primitives over netlink.
//!
//! The domain router pins resolved addresses to the tunnel by installing
//! `/32` routes via the TUN device's overlay address. Dropping the
//! table releases the netlink socket.

use crate::tun::{TunDevice, TunError};
use futures::TryStreamExt;
use netlink_packet_route::route::{RouteAddress, RouteAttribute};
use rtnetlink::{new_connection, Handle, IpVersion};
use std::net::Ipv4Addr;
use thiserror::Error;
use tracing::debug;

/// Errors from route queries and installs.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("netlink connection failed: {0}")]
    Connection(std::io::Error),

    #[error("netlink error: {0}")]
    Netlink(#[from] rtnetlink::Error),

    #[error("interface not found: {0}")]
    InterfaceNotFound(String),

    #[error(transparent)]
    Device(#[from] TunError),
}

/// Netlink-backed `/32` host-route table operations.
pub struct RouteTable {
    handle: Handle,
}

impl RouteTable {
    pub fn new() -> Result<Self, RouteError> {
        let (connection, handle, _) = new_connection().map_err(RouteError::Connection)?;
        tokio::spawn(connection);
        Ok(Self { handle })
    }

    /// Whether a `/32` route to `dst` already points at `device`.
    pub async fn route_exists(
        &self,
        device: &TunDevice,
        dst: Ipv4Addr,
    ) -> Result<bool, RouteError> {
        let index = self.link_index(device.link_name()).await?;
        let info = device.lookup_info().await?;

        let mut routes = self.handle.route().get(IpVersion::V4).execute();
        while let Some(route) = routes.try_next().await? {
            if route.header.destination_prefix_length != 32 {
                continue;
            }

            let mut matches_dst = false;
            let mut via_device = false;
            for attribute in &route.attributes {
                match attribute {
                    RouteAttribute::Destination(RouteAddress::Inet(addr)) => {
                        matches_dst = *addr == dst;
                    }
                    RouteAttribute::Oif(oif) => {
                        via_device |= *oif == index;
                    }
                    RouteAttribute::Gateway(RouteAddress::Inet(gw)) => {
                        via_device |= *gw == info.addr;
                    }
                    _ => {}
                }
            }

            if matches_dst && via_device {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Install a `/32` route to `dst` via the device's overlay address.
    ///
    /// A duplicate install fails with a recoverable netlink error; the
    /// caller re-checks with [`RouteTable::route_exists`].
    pub async fn add_route(&self, device: &TunDevice, dst: Ipv4Addr) -> Result<(), RouteError> {
        let info = device.lookup_info().await?;

        debug!(dst = %dst, gateway = %info.addr, "adding host route");
        self.handle
            .route()
            .add()
            .v4()
            .destination_prefix(dst, 32)
            .gateway(info.addr)
            .execute()
            .await?;

        Ok(())
    }

    async fn link_index(&self, name: &str) -> Result<u32, RouteError> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();

        if let Some(link) = links.try_next().await? {
            Ok(link.header.index)
        } else {
            Err(RouteError::InterfaceNotFound(name.to_string()))
        }
    }
}

// Route manipulation requires CAP_NET_ADMIN; exercised manually rather
// than in unit tests.
