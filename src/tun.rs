//! TUN device management.
//!
//! Opens the tunnel device with packet information enabled (the 4-byte
//! frame header is part of the data plane), configures address, MTU and
//! link state over netlink, and provides blocking reader/writer threads
//! bridged to the async world through channels.

use crate::config::{DEVICE_MTU, MTU_HEADROOM};
use crate::frame::FRAME_HEADER_SIZE;
use futures::TryStreamExt;
use ipnet::Ipv4Net;
use netlink_packet_route::address::{AddressAttribute, AddressScope};
use netlink_packet_route::link::LinkAttribute;
use netlink_packet_route::route::RouteScope;
use rtnetlink::{new_connection, Handle};
use std::fs::File;
use std::io::{Read, Write};
use std::net::Ipv4Addr;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::mpsc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Channel sender for packets to be written to the TUN device.
pub type TunTx = mpsc::Sender<Vec<u8>>;

const TUN_PATH: &str = "/dev/net/tun";
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_MULTI_QUEUE: libc::c_short = 0x0100;

/// Errors that can occur with TUN operations.
#[derive(Debug, Error)]
pub enum TunError {
    #[error("failed to open {TUN_PATH}: {0}")]
    Open(std::io::Error),

    #[error("TUNSETIFF failed: {0}")]
    SetIff(std::io::Error),

    #[error("netlink error: {0}")]
    Netlink(#[from] rtnetlink::Error),

    #[error("netlink connection failed: {0}")]
    Connection(std::io::Error),

    #[error("interface not found: {0}")]
    InterfaceNotFound(String),

    #[error("interface {0} has no IPv4 address")]
    NoAddress(String),

    #[error("failed to dup tun fd: {0}")]
    Dup(std::io::Error),
}

/// The local overlay binding of a TUN device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    /// IPv4 address assigned to the device.
    pub addr: Ipv4Addr,
    /// Prefix length of the assigned address.
    pub prefix_len: u8,
    /// Current link MTU.
    pub mtu: u16,
    /// Underlying file descriptor.
    pub fd: RawFd,
}

impl DeviceInfo {
    /// The overlay network pair: device address plus prefix.
    pub fn network(&self) -> Ipv4Net {
        Ipv4Net::new(self.addr, self.prefix_len).expect("prefix length from kernel")
    }
}

/// An open TUN device.
pub struct TunDevice {
    file: File,
    name: String,
}

impl TunDevice {
    /// Open (or create) `tun<index>` with packet information enabled.
    ///
    /// Requires CAP_NET_ADMIN.
    pub fn open(index: u32) -> Result<Self, TunError> {
        let name = format!("tun{}", index);

        let file = File::options()
            .read(true)
            .write(true)
            .open(TUN_PATH)
            .map_err(TunError::Open)?;

        #[repr(C)]
        struct IfReq {
            name: [u8; libc::IFNAMSIZ],
            flags: libc::c_short,
            pad: [u8; 22],
        }

        let mut req = IfReq {
            name: [0; libc::IFNAMSIZ],
            flags: IFF_TUN | IFF_MULTI_QUEUE,
            pad: [0; 22],
        };
        // Leave room for the trailing NUL.
        let name_bytes = name.as_bytes();
        req.name[..name_bytes.len().min(libc::IFNAMSIZ - 1)]
            .copy_from_slice(&name_bytes[..name_bytes.len().min(libc::IFNAMSIZ - 1)]);

        let rc = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut req) };
        if rc < 0 {
            return Err(TunError::SetIff(std::io::Error::last_os_error()));
        }

        info!(name = %name, "TUN device opened");

        Ok(Self { file, name })
    }

    /// Interface name.
    pub fn link_name(&self) -> &str {
        &self.name
    }

    /// Raw file descriptor.
    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Configure the device for server mode: link up, MTU reduced by the
    /// message-header headroom, overlay address with the overlay prefix,
    /// and a link-scope host route to the hub's own address.
    pub async fn configure_server(&self, network: Ipv4Net) -> Result<(), TunError> {
        let handle = connect()?;
        let index = link_index(&handle, &self.name).await?;

        debug!(name = %self.name, "bringing link up");
        handle.link().set(index).up().execute().await?;

        let link_mtu = link_mtu(&handle, &self.name).await?;
        let mtu = link_mtu.saturating_sub(MTU_HEADROOM as u32);
        debug!(name = %self.name, mtu, "setting link mtu");
        handle.link().set(index).mtu(mtu).execute().await?;

        debug!(name = %self.name, network = %network, "adding address");
        let mut request = handle.address().add(
            index,
            std::net::IpAddr::V4(network.addr()),
            network.prefix_len(),
        );
        request.message_mut().header.scope = AddressScope::Link;
        request.execute().await?;

        debug!(name = %self.name, addr = %network.addr(), "adding point-to-point route");
        handle
            .route()
            .add()
            .v4()
            .destination_prefix(network.addr(), 32)
            .output_interface(index)
            .scope(RouteScope::Link)
            .execute()
            .await?;

        Ok(())
    }

    /// Configure the device for client mode: fixed tunnel MTU, link up,
    /// and the client's overlay address as a host address.
    pub async fn configure_client(&self, network: Ipv4Net) -> Result<(), TunError> {
        let handle = connect()?;
        let index = link_index(&handle, &self.name).await?;

        debug!(name = %self.name, mtu = DEVICE_MTU, "setting link mtu");
        handle
            .link()
            .set(index)
            .mtu(DEVICE_MTU as u32)
            .execute()
            .await?;

        debug!(name = %self.name, "bringing link up");
        handle.link().set(index).up().execute().await?;

        debug!(name = %self.name, addr = %network.addr(), "adding address");
        handle
            .address()
            .add(index, std::net::IpAddr::V4(network.addr()), 32)
            .execute()
            .await?;

        Ok(())
    }

    /// Re-query the device's current binding from the kernel.
    pub async fn lookup_info(&self) -> Result<DeviceInfo, TunError> {
        let handle = connect()?;

        let mut links = handle
            .link()
            .get()
            .match_name(self.name.clone())
            .execute();
        let link = links
            .try_next()
            .await?
            .ok_or_else(|| TunError::InterfaceNotFound(self.name.clone()))?;

        let index = link.header.index;
        let mut mtu = 0u16;
        for attribute in link.attributes {
            if let LinkAttribute::Mtu(value) = attribute {
                mtu = value as u16;
            }
        }

        let mut addresses = handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();
        while let Some(message) = addresses.try_next().await? {
            let prefix_len = message.header.prefix_len;
            for attribute in message.attributes {
                if let AddressAttribute::Address(std::net::IpAddr::V4(addr)) = attribute {
                    return Ok(DeviceInfo {
                        addr,
                        prefix_len,
                        mtu,
                        fd: self.fd(),
                    });
                }
            }
        }

        Err(TunError::NoAddress(self.name.clone()))
    }

    /// Create a writer for this device.
    ///
    /// Duplicates the file descriptor so writes happen independently of
    /// reads. Returns the writer (to run on its own thread) and the
    /// channel for submitting framed packets.
    pub fn create_writer(&self) -> Result<(TunWriter, TunTx), TunError> {
        let file = dup_file(&self.file)?;
        let (tx, rx) = mpsc::channel();

        Ok((
            TunWriter {
                file,
                rx,
                name: self.name.clone(),
            },
            tx,
        ))
    }

    /// Create a reader for this device.
    ///
    /// Duplicates the file descriptor; the reader runs on its own thread
    /// and hands complete frames to the async side over `frame_tx`.
    pub fn create_reader(
        &self,
        buf_size: usize,
        frame_tx: tokio::sync::mpsc::Sender<Vec<u8>>,
    ) -> Result<TunReader, TunError> {
        let file = dup_file(&self.file)?;

        Ok(TunReader {
            file,
            frame_tx,
            buf_size,
            name: self.name.clone(),
        })
    }
}

impl std::fmt::Debug for TunDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunDevice")
            .field("name", &self.name)
            .field("fd", &self.file.as_raw_fd())
            .finish()
    }
}

/// Writer thread for a TUN device.
///
/// Services a queue of outbound framed packets. Multiple producers send
/// via the TunTx channel; the loop exits when all senders are dropped or
/// the interface goes away.
pub struct TunWriter {
    file: File,
    rx: mpsc::Receiver<Vec<u8>>,
    name: String,
}

impl TunWriter {
    /// Run the writer loop. Blocks until the channel closes.
    pub fn run(mut self) {
        info!(name = %self.name, "TUN writer starting");

        for packet in self.rx {
            if let Err(e) = self.file.write_all(&packet) {
                if e.raw_os_error() == Some(libc::EFAULT) {
                    info!(name = %self.name, "TUN interface gone, writer stopping");
                    break;
                }
                error!(name = %self.name, error = %e, "TUN write error");
            } else {
                debug!(name = %self.name, len = packet.len(), "TUN packet written");
            }
        }

        info!(name = %self.name, "TUN writer stopped");
    }
}

/// Reader thread for a TUN device.
///
/// Reads framed packets and forwards them to the async side. Designed
/// for a dedicated thread since TUN reads block.
pub struct TunReader {
    file: File,
    frame_tx: tokio::sync::mpsc::Sender<Vec<u8>>,
    buf_size: usize,
    name: String,
}

impl TunReader {
    /// Run the reader loop. Exits when the receiving side is dropped or
    /// the interface goes away.
    pub fn run(mut self) {
        info!(name = %self.name, "TUN reader starting");

        let mut buf = vec![0u8; self.buf_size];
        loop {
            match self.file.read(&mut buf) {
                Ok(n) if n > FRAME_HEADER_SIZE => {
                    if self.frame_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        info!(name = %self.name, "frame channel closed, reader stopping");
                        break;
                    }
                }
                Ok(n) => {
                    debug!(name = %self.name, len = n, "undersized TUN frame dropped");
                }
                Err(e) => {
                    if e.raw_os_error() == Some(libc::EFAULT) {
                        info!(name = %self.name, "TUN interface gone, reader stopping");
                    } else {
                        warn!(name = %self.name, error = %e, "TUN read error");
                        continue;
                    }
                    break;
                }
            }
        }

        info!(name = %self.name, "TUN reader stopped");
    }
}

/// Open a netlink handle, spawning its connection task.
fn connect() -> Result<Handle, TunError> {
    let (connection, handle, _) = new_connection().map_err(TunError::Connection)?;
    tokio::spawn(connection);
    Ok(handle)
}

/// Get the interface index by name.
async fn link_index(handle: &Handle, name: &str) -> Result<u32, TunError> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();

    if let Some(link) = links.try_next().await? {
        Ok(link.header.index)
    } else {
        Err(TunError::InterfaceNotFound(name.to_string()))
    }
}

/// Get the current link MTU by name.
async fn link_mtu(handle: &Handle, name: &str) -> Result<u32, TunError> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();

    if let Some(link) = links.try_next().await? {
        for attribute in link.attributes {
            if let LinkAttribute::Mtu(mtu) = attribute {
                return Ok(mtu);
            }
        }
    }
    Err(TunError::InterfaceNotFound(name.to_string()))
}

/// Duplicate a file descriptor into an independently owned File.
fn dup_file(file: &File) -> Result<File, TunError> {
    let fd = unsafe { libc::dup(file.as_raw_fd()) };
    if fd < 0 {
        return Err(TunError::Dup(std::io::Error::last_os_error()));
    }
    Ok(unsafe { File::from_raw_fd(fd) })
}
