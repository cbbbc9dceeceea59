//! TUN packet-information framing.
//!
//! A TUN device opened with packet information delivers and accepts a
//! 4-byte prefix in front of every IP packet. On Linux the prefix is two
//! flag bytes (zero) followed by the EtherType in network order; on the
//! BSD family it is the address family as a 4-byte integer.
//!
//! Only the IPv4 form is emitted; the tunnel does not carry IPv6.
//!
//! <https://docs.kernel.org/networking/tuntap.html#frame-format>

/// Size of the packet-information prefix.
pub const FRAME_HEADER_SIZE: usize = 4;

/// EtherType for IPv4, big-endian.
#[cfg(not(target_os = "macos"))]
const ETHERTYPE_IPV4: u16 = 0x0800;

/// The fixed IPv4 prefix for this build's platform.
#[cfg(not(target_os = "macos"))]
pub const IPV4_FRAME_HEADER: [u8; FRAME_HEADER_SIZE] = [
    0,
    0,
    (ETHERTYPE_IPV4 >> 8) as u8,
    (ETHERTYPE_IPV4 & 0xff) as u8,
];

/// AF_INET as a 4-byte big-endian integer.
#[cfg(target_os = "macos")]
pub const IPV4_FRAME_HEADER: [u8; FRAME_HEADER_SIZE] = [0, 0, 0, 2];

/// Prepend the platform frame header to an IPv4 packet.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&IPV4_FRAME_HEADER);
    buf.extend_from_slice(payload);
    buf
}

/// Strip the frame header, returning the IP packet bytes.
///
/// Returns an empty slice for frames shorter than the header.
pub fn strip(frame: &[u8]) -> &[u8] {
    if frame.len() < FRAME_HEADER_SIZE {
        return &[];
    }
    &frame[FRAME_HEADER_SIZE..]
}
