//! Tunnel message wire format.
//!
//! Every UDP datagram carries exactly one message; the datagram boundary
//! is the message boundary, so no payload length field is needed.
//!
//! ## Wire Format
//!
//! | Offset | Field   | Size     | Notes                               |
//! |--------|---------|----------|-------------------------------------|
//! | 0      | kind    | 1 byte   | MessageKind value                   |
//! | 1      | addr_len| 1 byte   | 4 (IPv4) or 16 (IPv6)               |
//! | 2      | addr    | addr_len | sender's overlay address            |
//! | 2+len  | payload | variable | raw IPv4 packet for Data, else empty|

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;

/// Smallest well-formed message: kind + addr_len + IPv4 address.
/// A 6-byte record therefore has an empty payload.
pub const MIN_MESSAGE_SIZE: usize = 6;

/// Largest message header: kind + addr_len + IPv6 address.
pub const MAX_HEADER_SIZE: usize = 1 + 1 + 16;

/// Errors from decoding a tunnel message.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("message length {got} less than minimum {MIN_MESSAGE_SIZE}")]
    TooShort { got: usize },

    #[error("address length {addr_len} overruns message of {got} bytes")]
    AddrOverrun { addr_len: usize, got: usize },

    #[error("can't parse {0} bytes as an ip address")]
    BadAddr(usize),
}

/// Message type identifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    /// Client handshake request; addr is the client's overlay address.
    Connect = 0,
    /// Tunneled IPv4 packet.
    Data = 1,
    /// Server acknowledgement of Connect or KeepAlive.
    Ack = 2,
    /// Client liveness probe.
    KeepAlive = 3,
}

impl MessageKind {
    /// Try to convert from a byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(MessageKind::Connect),
            1 => Some(MessageKind::Data),
            2 => Some(MessageKind::Ack),
            3 => Some(MessageKind::KeepAlive),
            _ => None,
        }
    }

    /// Convert to a byte.
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Connect => "Connect",
            MessageKind::Data => "Data",
            MessageKind::Ack => "Ack",
            MessageKind::KeepAlive => "KeepAlive",
        };
        write!(f, "{}", name)
    }
}

/// A single tunnel message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    /// Sender's overlay address. `0.0.0.0` when the sender has none
    /// (Ack carries no address).
    pub addr: IpAddr,
    pub payload: Vec<u8>,
}

impl Message {
    /// Create a message with an address and no payload.
    pub fn new(kind: MessageKind, addr: IpAddr) -> Self {
        Self {
            kind,
            addr,
            payload: Vec::new(),
        }
    }

    /// Create an addressless control message (encoded as IPv4 `0.0.0.0`).
    pub fn control(kind: MessageKind) -> Self {
        Self::new(kind, IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    /// Create a Data message carrying one raw IPv4 packet.
    pub fn data(addr: IpAddr, payload: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Data,
            addr,
            payload,
        }
    }

    /// Encode into a single contiguous buffer.
    pub fn encode(&self) -> Vec<u8> {
        let addr_bytes: Vec<u8> = match self.addr {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        };

        let mut buf = Vec::with_capacity(2 + addr_bytes.len() + self.payload.len());
        buf.push(self.kind.to_byte());
        buf.push(addr_bytes.len() as u8);
        buf.extend_from_slice(&addr_bytes);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode from one datagram.
    ///
    /// The 6-byte minimum admits a zero-payload record with an IPv4
    /// address; shorter datagrams are rejected even when they would
    /// otherwise parse.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < MIN_MESSAGE_SIZE {
            return Err(ProtoError::TooShort { got: buf.len() });
        }

        // Unknown kind bytes still parse; the dispatch layer treats them
        // as Data-like traffic, matching the wire's open-ended default arm.
        let kind = MessageKind::from_byte(buf[0]).unwrap_or(MessageKind::Data);

        let addr_len = buf[1] as usize;
        if 2 + addr_len > buf.len() {
            return Err(ProtoError::AddrOverrun {
                addr_len,
                got: buf.len(),
            });
        }

        let addr = match addr_len {
            4 => {
                let octets: [u8; 4] = buf[2..6].try_into().expect("slice length checked");
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            16 => {
                let octets: [u8; 16] = buf[2..18].try_into().expect("slice length checked");
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            n => return Err(ProtoError::BadAddr(n)),
        };

        Ok(Self {
            kind,
            addr,
            payload: buf[2 + addr_len..].to_vec(),
        })
    }
}
