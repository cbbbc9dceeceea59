//! Run configuration and protocol timing constants.

use crate::proto::MAX_HEADER_SIZE;
use ipnet::Ipv4Net;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// Longest a session may go without a successful keep-alive round trip;
/// also the peer directory lease.
pub const KEEP_ALIVE_MAX: Duration = Duration::from_secs(40);

/// Interval between client keep-alive probes.
pub const KEEP_ALIVE_REQUEST: Duration = Duration::from_secs(30);

/// Delay before retrying a failed handshake or keep-alive send; also the
/// DNS query timeout.
pub const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Deadline for the single Ack read during a handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// MTU configured on the client TUN device.
pub const DEVICE_MTU: u16 = 1280;

/// Server-side read buffer: a full Ethernet-sized payload plus framing.
pub const SERVER_READ_BUFFER: usize = 1504;

/// MTU headroom the server reserves for the message header.
pub const MTU_HEADROOM: u16 = MAX_HEADER_SIZE as u16;

/// Errors from command-line and address configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid network cidr {value}: {source}")]
    BadCidr {
        value: String,
        source: ipnet::AddrParseError,
    },

    #[error("invalid peer endpoint {0}: expected host:port")]
    BadEndpoint(String),

    #[error("peer endpoint {0} has no host; client mode needs a server address")]
    MissingHost(String),
}

/// Client-mode settings.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// This client's overlay address with the overlay prefix.
    pub network: Ipv4Net,
    /// Fixed local UDP port.
    pub client_port: u16,
    /// Server's internet address.
    pub server_addr: IpAddr,
    /// Server's UDP port.
    pub server_port: u16,
}

/// Server-mode settings.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// The hub's overlay address with the overlay prefix.
    pub network: Ipv4Net,
    /// UDP listen port.
    pub server_port: u16,
}

/// Parse a `host:port` peer endpoint. The host part may be empty
/// (server mode only listens, so only the port matters).
pub fn parse_endpoint(endpoint: &str) -> Result<(Option<IpAddr>, u16), ConfigError> {
    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::BadEndpoint(endpoint.to_string()))?;

    let port: u16 = port
        .parse()
        .map_err(|_| ConfigError::BadEndpoint(endpoint.to_string()))?;

    if host.is_empty() {
        return Ok((None, port));
    }

    let addr: IpAddr = host
        .trim_matches(['[', ']'])
        .parse()
        .map_err(|_| ConfigError::BadEndpoint(endpoint.to_string()))?;

    Ok((Some(addr), port))
}

/// Parse an overlay CIDR, keeping the host address bits.
pub fn parse_network(cidr: &str) -> Result<Ipv4Net, ConfigError> {
    cidr.parse().map_err(|source| ConfigError::BadCidr {
        value: cidr.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint() {
        let (host, port) = parse_endpoint("203.0.113.5:1300").unwrap();
        assert_eq!(host, Some("203.0.113.5".parse().unwrap()));
        assert_eq!(port, 1300);
    }

    #[test]
    fn test_parse_endpoint_port_only() {
        let (host, port) = parse_endpoint(":1300").unwrap();
        assert_eq!(host, None);
        assert_eq!(port, 1300);
    }

    #[test]
    fn test_parse_endpoint_invalid() {
        assert!(parse_endpoint("1300").is_err());
        assert!(parse_endpoint("host.example:1300").is_err());
        assert!(parse_endpoint("1.2.3.4:notaport").is_err());
    }

    #[test]
    fn test_parse_network_keeps_host_bits() {
        let net = parse_network("192.168.50.1/24").unwrap();
        assert_eq!(net.addr(), "192.168.50.1".parse::<std::net::Ipv4Addr>().unwrap());
        assert_eq!(net.prefix_len(), 24);
    }

    #[test]
    fn test_parse_network_invalid() {
        assert!(parse_network("not-a-cidr").is_err());
        assert!(parse_network("192.168.50.1/33").is_err());
    }
}
