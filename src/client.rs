//! Client session.
//!
//! A session owns one UDP socket at a time, replaced wholesale on every
//! (re)handshake, and proves liveness with keep-alives: a probe every
//! 30 s, and a forced re-handshake whenever 40 s pass without an Ack.
//! Three long-lived loops move packets (UDP read, TUN read, encode and
//! send) under a supervisor that runs the timers.

use crate::config::{
    ClientConfig, HANDSHAKE_TIMEOUT, KEEP_ALIVE_MAX, KEEP_ALIVE_REQUEST, RETRY_DELAY,
};
use crate::frame::{self, FRAME_HEADER_SIZE};
use crate::netmon::NetMonitor;
use crate::proto::{Message, MessageKind, ProtoError};
use crate::tun::{DeviceInfo, TunDevice, TunError, TunTx};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Errors from the client session.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Tun(#[from] TunError),

    #[error("socket setup failed: {0}")]
    Socket(std::io::Error),

    #[error("handshake send failed: {0}")]
    HandshakeSend(std::io::Error),

    #[error("handshake read failed: {0}")]
    HandshakeRead(std::io::Error),

    #[error("no handshake response within {HANDSHAKE_TIMEOUT:?}")]
    HandshakeTimeout,

    #[error("bad handshake response: {0}")]
    HandshakeParse(#[from] ProtoError),

    #[error("unexpected message kind {got} instead of {expected} in handshake")]
    UnexpectedKind {
        got: MessageKind,
        expected: MessageKind,
    },
}

/// Shared session state.
struct Session {
    conn: RwLock<Arc<UdpSocket>>,
    device: std::sync::RwLock<DeviceInfo>,
    tun: Arc<TunDevice>,
    config: ClientConfig,
    /// Ack arrival signal from the UDP read loop; single-permit, so
    /// bursts coalesce.
    ack: Notify,
    /// Pinged after a handshake publishes a new socket so the read loop
    /// abandons the stale one.
    conn_changed: Notify,
}

impl Session {
    /// Snapshot the current socket.
    async fn current(&self) -> Arc<UdpSocket> {
        self.conn.read().await.clone()
    }

    fn device_info(&self) -> DeviceInfo {
        *self.device.read().expect("device info lock poisoned")
    }

    /// Read buffer size: tunnel MTU plus the frame header.
    fn buf_size(&self) -> usize {
        self.device_info().mtu as usize + FRAME_HEADER_SIZE
    }

    /// Re-handshake under the session write lock: open a fresh socket,
    /// refresh the device binding, prove the server answers, publish.
    /// On failure the previous socket stays published; its traffic is
    /// stale but the retry timer owns recovery.
    async fn handshake(&self) -> Result<(), ClientError> {
        let mut guard = self.conn.write().await;

        let socket = dial(&self.config)?;

        let info = self.tun.lookup_info().await?;
        *self.device.write().expect("device info lock poisoned") = info;

        handshake_exchange(
            &socket,
            IpAddr::V4(info.addr),
            info.mtu as usize + FRAME_HEADER_SIZE,
            HANDSHAKE_TIMEOUT,
        )
        .await?;

        *guard = Arc::new(socket);
        self.conn_changed.notify_waiters();

        info!(
            server = %self.config.server_addr,
            port = self.config.server_port,
            "connection established"
        );
        Ok(())
    }

    /// Send one keep-alive probe on the current socket.
    async fn keep_alive(&self) -> Result<(), std::io::Error> {
        debug!("send keep alive");
        let msg = Message::new(MessageKind::KeepAlive, IpAddr::V4(self.device_info().addr));
        self.current().await.send(&msg.encode()).await?;
        Ok(())
    }
}

/// Running client: the supervisor and packet loops.
pub struct ClientHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl ClientHandle {
    /// Abort all session tasks. The socket closes when the last loop
    /// drops its reference; the TUN threads exit when their channels do.
    pub fn stop(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Configure the TUN device, perform the initial handshake, and start
/// the session loops. Initial failure is fatal; later failures retry.
pub async fn run_client(
    tun: Arc<TunDevice>,
    config: ClientConfig,
    monitor: &NetMonitor,
) -> Result<ClientHandle, ClientError> {
    tun.configure_client(config.network).await?;

    let info = tun.lookup_info().await?;
    let events = monitor.subscribe();

    let (writer, tun_tx) = tun.create_writer()?;
    std::thread::spawn(move || writer.run());

    let (frame_tx, frame_rx) = mpsc::channel(1);
    let buf_size = info.mtu as usize + FRAME_HEADER_SIZE;
    let reader = tun.create_reader(buf_size, frame_tx)?;

    let session = Arc::new(Session {
        conn: RwLock::new(Arc::new(dial(&config)?)),
        device: std::sync::RwLock::new(info),
        tun,
        config,
        ack: Notify::new(),
        conn_changed: Notify::new(),
    });

    session.handshake().await?;

    std::thread::spawn(move || reader.run());

    let tasks = vec![
        tokio::spawn(supervise(session.clone(), events)),
        tokio::spawn(read_connection(session.clone(), tun_tx)),
        tokio::spawn(forward_device(session, frame_rx)),
    ];

    Ok(ClientHandle { tasks })
}

/// Keep-alive and reconnect supervisor.
async fn supervise(session: Arc<Session>, mut events: mpsc::Receiver<()>) {
    let start = tokio::time::Instant::now();
    let mut keep_alive = tokio::time::interval_at(start + KEEP_ALIVE_REQUEST, KEEP_ALIVE_REQUEST);
    let mut force_reconnect = tokio::time::interval_at(start + KEEP_ALIVE_MAX, KEEP_ALIVE_MAX);
    let mut retry_at: Option<tokio::time::Instant> = None;

    loop {
        let reconnect = tokio::select! {
            _ = keep_alive.tick() => {
                if let Err(e) = session.keep_alive().await {
                    warn!(error = %e, "keep alive failed");
                    retry_at = Some(tokio::time::Instant::now() + RETRY_DELAY);
                }
                false
            }
            _ = session.ack.notified() => {
                keep_alive.reset();
                force_reconnect.reset();
                false
            }
            _ = force_reconnect.tick() => true,
            Some(_) = events.recv() => {
                debug!("network change, reconnecting");
                true
            }
            _ = tokio::time::sleep_until(retry_at.unwrap_or_else(tokio::time::Instant::now)),
                if retry_at.is_some() => true,
        };

        if !reconnect {
            continue;
        }

        retry_at = None;
        match session.handshake().await {
            Ok(()) => {
                // A fresh session starts its liveness window from zero.
                keep_alive.reset();
                force_reconnect.reset();
            }
            Err(e) => {
                warn!(error = %e, "handshake failed");
                retry_at = Some(tokio::time::Instant::now() + RETRY_DELAY);
            }
        }
    }
}

/// UDP read loop: Acks feed the supervisor, Data goes to the TUN.
async fn read_connection(session: Arc<Session>, tun_tx: TunTx) {
    loop {
        let conn = session.current().await;
        let mut buf = vec![0u8; session.buf_size()];

        let n = tokio::select! {
            result = conn.recv(&mut buf) => match result {
                Ok(n) => n,
                Err(e) => {
                    // A replaced or closed socket ends up here; the
                    // next iteration picks up the live one.
                    debug!(error = %e, "socket read error");
                    continue;
                }
            },
            _ = session.conn_changed.notified() => continue,
        };

        let msg = match Message::decode(&buf[..n]) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "malformed datagram dropped");
                continue;
            }
        };

        match msg.kind {
            MessageKind::Ack => session.ack.notify_one(),
            MessageKind::Data => {
                if tun_tx.send(frame::encode(&msg.payload)).is_err() {
                    info!("TUN writer gone, stopping connection reader");
                    return;
                }
            }
            kind => debug!(kind = %kind, "unexpected message kind dropped"),
        }
    }
}

/// TUN-to-UDP loop: wrap device frames in Data messages.
async fn forward_device(session: Arc<Session>, mut frames: mpsc::Receiver<Vec<u8>>) {
    while let Some(tun_frame) = frames.recv().await {
        let payload = frame::strip(&tun_frame);
        if payload.is_empty() {
            continue;
        }

        let msg = Message::data(IpAddr::V4(session.device_info().addr), payload.to_vec());
        if let Err(e) = session.current().await.send(&msg.encode()).await {
            warn!(error = %e, "tunnel send failed");
        }
    }

    info!("TUN reader gone, stopping device forwarder");
}

/// Open the session socket: bound to the fixed client port, connected
/// to the server. `SO_REUSEADDR` lets a re-handshake rebind the port
/// while the read loop still holds the previous socket.
fn dial(config: &ClientConfig) -> Result<UdpSocket, ClientError> {
    let server: SocketAddr = (config.server_addr, config.server_port).into();
    let local: SocketAddr = match server {
        SocketAddr::V4(_) => (std::net::Ipv4Addr::UNSPECIFIED, config.client_port).into(),
        SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, config.client_port).into(),
    };

    let domain = Domain::for_address(server);
    let socket =
        Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(ClientError::Socket)?;
    socket.set_reuse_address(true).map_err(ClientError::Socket)?;
    socket.bind(&local.into()).map_err(ClientError::Socket)?;
    socket.connect(&server.into()).map_err(ClientError::Socket)?;
    socket.set_nonblocking(true).map_err(ClientError::Socket)?;

    UdpSocket::from_std(socket.into()).map_err(ClientError::Socket)
}

/// The wire half of a handshake: send Connect, require one Ack within
/// the deadline.
async fn handshake_exchange(
    socket: &UdpSocket,
    local_addr: IpAddr,
    buf_size: usize,
    deadline: Duration,
) -> Result<(), ClientError> {
    let request = Message::new(MessageKind::Connect, local_addr);
    socket
        .send(&request.encode())
        .await
        .map_err(ClientError::HandshakeSend)?;

    let mut buf = vec![0u8; buf_size];
    let n = tokio::time::timeout(deadline, socket.recv(&mut buf))
        .await
        .map_err(|_| ClientError::HandshakeTimeout)?
        .map_err(ClientError::HandshakeRead)?;

    let response = Message::decode(&buf[..n])?;
    if response.kind != MessageKind::Ack {
        return Err(ClientError::UnexpectedKind {
            got: response.kind,
            expected: MessageKind::Ack,
        });
    }

    Ok(())
}
