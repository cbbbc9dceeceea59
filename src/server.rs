//! Server forwarding engine.
//!
//! The hub reads datagrams from one UDP socket and frames from the TUN
//! device, dispatching one task per message. Tunneled packets are routed
//! by destination: the hub's own address is answered locally (ICMP echo),
//! overlay addresses go to their registered peer or draw a host-
//! unreachable error, and everything else is written to the TUN for the
//! upstream stack.

use crate::config::{ServerConfig, KEEP_ALIVE_MAX, SERVER_READ_BUFFER};
use crate::frame;
use crate::netmon::NetMonitor;
use crate::overlay::{Overlay, RouteClass};
use crate::packet::{self, IPPROTO_ICMP};
use crate::peers::{Peer, PeerDirectory};
use crate::proto::{Message, MessageKind};
use crate::tun::{TunDevice, TunError, TunTx};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Errors from the server engine.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Tun(#[from] TunError),

    #[error("socket setup failed: {0}")]
    Socket(std::io::Error),

    #[error("socket send failed: {0}")]
    Send(std::io::Error),

    #[error("TUN writer channel closed")]
    TunChannelClosed,
}

/// Shared hub state.
pub struct Server {
    conn: UdpSocket,
    tun_tx: TunTx,
    overlay: Overlay,
    peers: PeerDirectory,
}

impl Server {
    fn new(conn: UdpSocket, tun_tx: TunTx, overlay: Overlay) -> Arc<Self> {
        Arc::new(Self {
            conn,
            tun_tx,
            overlay,
            peers: PeerDirectory::new(KEEP_ALIVE_MAX),
        })
    }

    /// Route a tunneled IPv4 packet to `dst`.
    ///
    /// Synthesized ICMP answers re-enter the decision tree with the
    /// original sender as their destination, so a reply to a tunneled
    /// ping leaves through the sender's peer entry.
    async fn route(&self, mut payload: Vec<u8>, mut dst: Ipv4Addr) -> Result<(), ServerError> {
        loop {
            match self.overlay.classify(dst) {
                RouteClass::OwnAddress => match self.handle_self(&payload)? {
                    Some((reply, reply_dst)) => {
                        payload = reply;
                        dst = reply_dst;
                    }
                    None => return Ok(()),
                },

                RouteClass::Overlay => match self.peers.get_by_overlay(dst) {
                    Some(peer) => {
                        let msg = Message::data(peer.overlay_addr, payload);
                        debug!(peer = %peer.public_addr, "send data");
                        self.conn
                            .send_to(&msg.encode(), peer.public_addr)
                            .await
                            .map_err(ServerError::Send)?;
                        return Ok(());
                    }
                    None => match self.unknown_host_reply(&payload) {
                        Some((reply, reply_dst)) => {
                            payload = reply;
                            dst = reply_dst;
                        }
                        None => return Ok(()),
                    },
                },

                RouteClass::External => {
                    debug!(dst = %dst, "write data to device");
                    self.tun_tx
                        .send(frame::encode(&payload))
                        .map_err(|_| ServerError::TunChannelClosed)?;
                    return Ok(());
                }
            }
        }
    }

    /// A packet addressed to the hub itself.
    ///
    /// Non-ICMP traffic is written back to the TUN unchanged for the
    /// local stack. An Echo Request earns an Echo Reply, returned with
    /// its routing destination; other ICMP is dropped.
    fn handle_self(&self, payload: &[u8]) -> Result<Option<(Vec<u8>, Ipv4Addr)>, ServerError> {
        if packet::ipv4_proto(payload) != Some(IPPROTO_ICMP) {
            self.tun_tx
                .send(payload.to_vec())
                .map_err(|_| ServerError::TunChannelClosed)?;
            return Ok(None);
        }

        let our_addr = self.overlay.snapshot().addr();
        match packet::build_echo_reply(payload, our_addr) {
            Some(reply) => {
                let reply_dst = packet::ipv4_dst(&reply).expect("reply built as IPv4");
                Ok(Some((reply, reply_dst)))
            }
            None => Ok(None),
        }
    }

    /// An overlay destination with no live peer: answer with ICMP
    /// Destination Unreachable toward the packet's source.
    fn unknown_host_reply(&self, payload: &[u8]) -> Option<(Vec<u8>, Ipv4Addr)> {
        let our_addr = self.overlay.snapshot().addr();
        let reply = packet::build_host_unreachable(payload, our_addr)?;
        let reply_dst = packet::ipv4_dst(&reply).expect("reply built as IPv4");
        Some((reply, reply_dst))
    }

    /// Handle one datagram from a client.
    async fn handle_client_packet(&self, buf: Vec<u8>, src: SocketAddr) {
        debug!(len = buf.len(), "read packet");

        let msg = match Message::decode(&buf) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "can't parse datagram");
                return;
            }
        };

        match msg.kind {
            MessageKind::Connect => self.handle_connect(msg, src).await,
            MessageKind::KeepAlive => self.handle_keep_alive(msg, src).await,
            _ => {
                if msg.addr.is_unspecified() {
                    warn!(src = %src, "empty address in packet");
                    return;
                }
                let Some(dst) = packet::ipv4_dst(&msg.payload) else {
                    debug!(src = %src, "non-IPv4 payload dropped");
                    return;
                };
                if let Err(e) = self.route(msg.payload, dst).await {
                    warn!(error = %e, "can't route payload");
                }
            }
        }
    }

    async fn handle_connect(&self, msg: Message, src: SocketAddr) {
        if msg.addr.is_unspecified() {
            debug!(src = %src, "drop connect with empty peer address");
            return;
        }

        let network = self.overlay.snapshot();
        let in_network = match msg.addr.to_canonical() {
            IpAddr::V4(addr) => network.contains(&addr),
            IpAddr::V6(_) => false,
        };
        if !in_network {
            debug!(
                addr = %msg.addr,
                network = %network,
                "drop connect from outside the overlay"
            );
            return;
        }

        let ack = Message::control(MessageKind::Ack);
        if let Err(e) = self.conn.send_to(&ack.encode(), src).await {
            warn!(error = %e, "handshake response send failed");
            return;
        }

        self.peers.insert(Peer {
            overlay_addr: msg.addr,
            public_addr: src,
        });

        info!(peer = %msg.addr, inet = %src, "peer connected");
    }

    async fn handle_keep_alive(&self, msg: Message, src: SocketAddr) {
        debug!(src = %src, "keep alive");

        // Leases only renew for a public IP that already connected.
        if !self.peers.refresh(msg.addr, src.ip()) {
            return;
        }

        let ack = Message::control(MessageKind::Ack);
        if let Err(e) = self.conn.send_to(&ack.encode(), src).await {
            warn!(error = %e, "keep alive response send failed");
        }
    }

    /// Handle one packet read from the TUN device.
    async fn handle_device_packet(&self, payload: Vec<u8>) {
        let Some(dst) = packet::ipv4_dst(&payload) else {
            debug!(len = payload.len(), "non-IPv4 device packet dropped");
            return;
        };

        debug!(len = payload.len(), dst = %dst, "receive device packet");
        if let Err(e) = self.route(payload, dst).await {
            warn!(error = %e, "can't route payload");
        }
    }

    /// Spawn the UDP read loop and its dispatcher. One handler task per
    /// datagram; the hand-off channel holds `queue` pending messages.
    pub fn spawn_udp_ingest(self: &Arc<Self>, queue: usize) -> Vec<JoinHandle<()>> {
        let (tx, mut rx) = mpsc::channel::<(Vec<u8>, SocketAddr)>(queue);

        let server = self.clone();
        let read_task = tokio::spawn(async move {
            info!("start listening for datagrams");
            let mut buf = vec![0u8; SERVER_READ_BUFFER];
            loop {
                match server.conn.recv_from(&mut buf).await {
                    Ok((n, src)) => {
                        if tx.send((buf[..n].to_vec(), src)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "read error"),
                }
            }
        });

        let server = self.clone();
        let dispatch_task = tokio::spawn(async move {
            while let Some((buf, src)) = rx.recv().await {
                let server = server.clone();
                tokio::spawn(async move {
                    server.handle_client_packet(buf, src).await;
                });
            }
        });

        vec![read_task, dispatch_task]
    }

    /// Spawn the dispatcher for frames read from the TUN device.
    pub fn spawn_tun_ingest(self: &Arc<Self>, mut frames: mpsc::Receiver<Vec<u8>>) -> JoinHandle<()> {
        let server = self.clone();
        tokio::spawn(async move {
            info!("start device read loop");
            while let Some(tun_frame) = frames.recv().await {
                let payload = frame::strip(&tun_frame).to_vec();
                if payload.is_empty() {
                    continue;
                }
                let server = server.clone();
                tokio::spawn(async move {
                    server.handle_device_packet(payload).await;
                });
            }
        })
    }
}

/// Running server: ingest loops and the overlay republisher.
pub struct ServerHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// Abort all engine tasks; the TUN threads exit with their channels.
    pub fn stop(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Configure the TUN device, bind the listener, and start the engine.
pub async fn run_server(
    tun: TunDevice,
    config: ServerConfig,
    monitor: &NetMonitor,
) -> Result<ServerHandle, ServerError> {
    tun.configure_server(config.network).await?;

    let conn = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, config.server_port))
        .await
        .map_err(ServerError::Socket)?;

    let info = tun.lookup_info().await?;

    let (writer, tun_tx) = tun.create_writer()?;
    std::thread::spawn(move || writer.run());

    let queue = std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(1);

    let (frame_tx, frame_rx) = mpsc::channel(queue);
    let reader = tun.create_reader(SERVER_READ_BUFFER, frame_tx)?;
    std::thread::spawn(move || reader.run());

    let server = Server::new(conn, tun_tx, Overlay::new(info.network()));

    let mut tasks = server.spawn_udp_ingest(queue);
    tasks.push(server.spawn_tun_ingest(frame_rx));

    // Republish the overlay pair whenever the device address changes.
    let events = monitor.subscribe();
    let tun = Arc::new(tun);
    tasks.push(tokio::spawn(republish_overlay(server, tun, events)));

    Ok(ServerHandle { tasks })
}

async fn republish_overlay(
    server: Arc<Server>,
    tun: Arc<TunDevice>,
    mut events: mpsc::Receiver<()>,
) {
    while events.recv().await.is_some() {
        match tun.lookup_info().await {
            Ok(info) => {
                info!(network = %info.network(), "republishing overlay network");
                server.overlay.publish(info.network());
            }
            Err(e) => warn!(error = %e, "device info lookup failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::tests::{make_echo_request, make_ipv4_packet};
    use crate::packet::IcmpType;
    use ipnet::Ipv4Net;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    const HUB: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    async fn test_server() -> (Arc<Server>, std_mpsc::Receiver<Vec<u8>>, SocketAddr) {
        let conn = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = conn.local_addr().unwrap();
        let (tun_tx, tun_rx) = std_mpsc::channel();
        let overlay = Overlay::new(Ipv4Net::new(HUB, 24).unwrap());
        (Server::new(conn, tun_tx, overlay), tun_rx, addr)
    }

    /// Register a peer at `socket`'s address via a real Connect.
    async fn connect_peer(server: &Arc<Server>, socket: &UdpSocket, overlay_addr: Ipv4Addr) {
        let connect = Message::new(MessageKind::Connect, IpAddr::V4(overlay_addr));
        let src = socket.local_addr().unwrap();
        server.handle_client_packet(connect.encode(), src).await;

        let mut buf = [0u8; 64];
        let (n, _) = tokio::time::timeout(Duration::from_secs(1), socket.recv_from(&mut buf))
            .await
            .expect("no ack")
            .unwrap();
        assert_eq!(Message::decode(&buf[..n]).unwrap().kind, MessageKind::Ack);
    }

    #[tokio::test]
    async fn test_connect_registers_peer_and_acks() {
        let (server, _tun_rx, _addr) = test_server().await;
        let peer_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        connect_peer(&server, &peer_socket, Ipv4Addr::new(10, 0, 0, 7)).await;

        let peer = server
            .peers
            .get_by_overlay(Ipv4Addr::new(10, 0, 0, 7))
            .expect("peer registered");
        assert_eq!(peer.public_addr, peer_socket.local_addr().unwrap());
        assert!(server.peers.contains_public(peer.public_addr.ip()));
    }

    #[tokio::test]
    async fn test_connect_rejected_outside_overlay() {
        let (server, _tun_rx, _addr) = test_server().await;
        let src: SocketAddr = "203.0.113.5:1200".parse().unwrap();

        let connect = Message::new(MessageKind::Connect, "192.168.99.7".parse().unwrap());
        server.handle_client_packet(connect.encode(), src).await;
        assert!(server
            .peers
            .get_by_overlay("192.168.99.7".parse().unwrap())
            .is_none());

        let connect = Message::control(MessageKind::Connect);
        server.handle_client_packet(connect.encode(), src).await;
        assert!(!server.peers.contains_public(src.ip()));
    }

    #[tokio::test]
    async fn test_keep_alive_from_unknown_source_is_silent() {
        let (server, _tun_rx, _addr) = test_server().await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let keep_alive = Message::new(MessageKind::KeepAlive, "10.0.0.7".parse().unwrap());
        server
            .handle_client_packet(keep_alive.encode(), socket.local_addr().unwrap())
            .await;

        let mut buf = [0u8; 64];
        let result =
            tokio::time::timeout(Duration::from_millis(100), socket.recv_from(&mut buf)).await;
        assert!(result.is_err(), "no ack for an unregistered source");
    }

    #[tokio::test]
    async fn test_keep_alive_from_known_source_acks() {
        let (server, _tun_rx, _addr) = test_server().await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        connect_peer(&server, &socket, Ipv4Addr::new(10, 0, 0, 7)).await;

        let keep_alive = Message::new(MessageKind::KeepAlive, "10.0.0.7".parse().unwrap());
        server
            .handle_client_packet(keep_alive.encode(), socket.local_addr().unwrap())
            .await;

        let mut buf = [0u8; 64];
        let (n, _) = tokio::time::timeout(Duration::from_secs(1), socket.recv_from(&mut buf))
            .await
            .expect("no ack")
            .unwrap();
        assert_eq!(Message::decode(&buf[..n]).unwrap().kind, MessageKind::Ack);
    }

    #[tokio::test]
    async fn test_data_forwarded_to_registered_peer() {
        let (server, _tun_rx, _addr) = test_server().await;
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        connect_peer(&server, &sender, Ipv4Addr::new(10, 0, 0, 2)).await;
        connect_peer(&server, &receiver, Ipv4Addr::new(10, 0, 0, 7)).await;

        let inner = make_ipv4_packet(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 7),
            17,
            64,
            b"hello",
        );
        let data = Message::data("10.0.0.2".parse().unwrap(), inner.clone());
        server
            .handle_client_packet(data.encode(), sender.local_addr().unwrap())
            .await;

        let mut buf = [0u8; 256];
        let (n, _) = tokio::time::timeout(Duration::from_secs(1), receiver.recv_from(&mut buf))
            .await
            .expect("no forwarded data")
            .unwrap();
        let forwarded = Message::decode(&buf[..n]).unwrap();
        assert_eq!(forwarded.kind, MessageKind::Data);
        assert_eq!(forwarded.addr, "10.0.0.7".parse::<IpAddr>().unwrap());
        assert_eq!(forwarded.payload, inner);
    }

    #[tokio::test]
    async fn test_unknown_overlay_host_draws_unreachable() {
        let (server, _tun_rx, _addr) = test_server().await;
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        connect_peer(&server, &sender, Ipv4Addr::new(10, 0, 0, 2)).await;

        // Ping a silent overlay address with no peer entry.
        let ping = make_echo_request(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 99),
            64,
            5,
            9,
            b"lost",
        );
        let data = Message::data("10.0.0.2".parse().unwrap(), ping);
        server
            .handle_client_packet(data.encode(), sender.local_addr().unwrap())
            .await;

        let mut buf = [0u8; 256];
        let (n, _) = tokio::time::timeout(Duration::from_secs(1), sender.recv_from(&mut buf))
            .await
            .expect("no unreachable reply")
            .unwrap();
        let reply = Message::decode(&buf[..n]).unwrap();
        assert_eq!(reply.kind, MessageKind::Data);

        let icmp = packet::parse_icmp(&reply.payload).unwrap();
        assert_eq!(icmp.kind, IcmpType::DestinationUnreachable as u8);
        assert_eq!(icmp.id, 5);
        assert_eq!(icmp.seq, 9);
        assert_eq!(packet::ipv4_src(&reply.payload), Some(HUB));
        assert_eq!(
            packet::ipv4_dst(&reply.payload),
            Some(Ipv4Addr::new(10, 0, 0, 2))
        );
    }

    #[tokio::test]
    async fn test_echo_request_to_hub_gets_reply() {
        let (server, _tun_rx, _addr) = test_server().await;
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        connect_peer(&server, &sender, Ipv4Addr::new(10, 0, 0, 7)).await;

        let ping = make_echo_request(Ipv4Addr::new(10, 0, 0, 7), HUB, 64, 17, 3, b"payload");
        let data = Message::data("10.0.0.7".parse().unwrap(), ping);
        server
            .handle_client_packet(data.encode(), sender.local_addr().unwrap())
            .await;

        let mut buf = [0u8; 256];
        let (n, _) = tokio::time::timeout(Duration::from_secs(1), sender.recv_from(&mut buf))
            .await
            .expect("no echo reply")
            .unwrap();
        let reply = Message::decode(&buf[..n]).unwrap();

        let icmp = packet::parse_icmp(&reply.payload).unwrap();
        assert_eq!(icmp.kind, IcmpType::EchoReply as u8);
        assert_eq!(icmp.id, 17);
        assert_eq!(icmp.seq, 3);
        assert_eq!(icmp.payload, b"payload");
        assert_eq!(packet::ipv4_ttl(&reply.payload), Some(63));
    }

    #[tokio::test]
    async fn test_external_destination_written_to_tun() {
        let (server, tun_rx, _addr) = test_server().await;
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let inner = make_ipv4_packet(
            Ipv4Addr::new(10, 0, 0, 7),
            Ipv4Addr::new(8, 8, 8, 8),
            17,
            64,
            b"outbound",
        );
        let data = Message::data("10.0.0.7".parse().unwrap(), inner.clone());
        server
            .handle_client_packet(data.encode(), sender.local_addr().unwrap())
            .await;

        let written = tun_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(frame::strip(&written), &inner);
    }

    #[tokio::test]
    async fn test_non_icmp_for_hub_written_to_tun_unchanged() {
        let (server, tun_rx, _addr) = test_server().await;

        let inner = make_ipv4_packet(Ipv4Addr::new(10, 0, 0, 7), HUB, 6, 64, &[0u8; 20]);
        server.handle_device_packet(inner.clone()).await;

        let written = tun_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(written, inner);
    }

    #[tokio::test]
    async fn test_data_with_unspecified_address_dropped() {
        let (server, tun_rx, _addr) = test_server().await;

        let inner = make_ipv4_packet(
            Ipv4Addr::new(10, 0, 0, 7),
            Ipv4Addr::new(8, 8, 8, 8),
            17,
            64,
            b"x",
        );
        let mut data = Message::control(MessageKind::Data);
        data.payload = inner;
        server
            .handle_client_packet(data.encode(), "203.0.113.5:9999".parse().unwrap())
            .await;

        assert!(tun_rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[tokio::test]
    async fn test_non_ipv4_payload_dropped() {
        let (server, tun_rx, _addr) = test_server().await;

        let mut ipv6 = vec![0u8; 48];
        ipv6[0] = 0x60;
        let data = Message::data("10.0.0.7".parse().unwrap(), ipv6);
        server
            .handle_client_packet(data.encode(), "203.0.113.5:9999".parse().unwrap())
            .await;

        assert!(tun_rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[tokio::test]
    async fn test_end_to_end_echo_over_loopback() {
        let (server, _tun_rx, server_addr) = test_server().await;
        let _ingest = server.spawn_udp_ingest(4);

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(server_addr).await.unwrap();

        // Handshake.
        client
            .send(&Message::new(MessageKind::Connect, "10.0.0.7".parse().unwrap()).encode())
            .await
            .unwrap();
        let mut buf = vec![0u8; 2048];
        let n = tokio::time::timeout(Duration::from_secs(1), client.recv(&mut buf))
            .await
            .expect("no ack")
            .unwrap();
        assert_eq!(Message::decode(&buf[..n]).unwrap().kind, MessageKind::Ack);

        // 1000 pings of 1200 bytes to the hub address, zero loss.
        let payload = vec![0x5a; 1200 - 28]; // IPv4 + ICMP headers fill the rest
        for seq in 0..1000u16 {
            let ping = make_echo_request(
                Ipv4Addr::new(10, 0, 0, 7),
                HUB,
                64,
                1,
                seq,
                &payload,
            );
            assert_eq!(ping.len(), 1200);

            client
                .send(&Message::data("10.0.0.7".parse().unwrap(), ping).encode())
                .await
                .unwrap();

            let n = tokio::time::timeout(Duration::from_secs(1), client.recv(&mut buf))
                .await
                .unwrap_or_else(|_| panic!("echo {} lost", seq))
                .unwrap();
            let reply = Message::decode(&buf[..n]).unwrap();
            assert_eq!(reply.kind, MessageKind::Data);

            let icmp = packet::parse_icmp(&reply.payload).unwrap();
            assert_eq!(icmp.kind, IcmpType::EchoReply as u8);
            assert_eq!(icmp.seq, seq);
        }
    }
}
