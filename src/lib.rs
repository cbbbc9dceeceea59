//! hubtun: a minimalist point-to-multipoint userspace VPN.
//!
//! One or more clients connect to a central hub over a single UDP
//! socket each, tunneling IPv4 packets between their TUN devices and
//! the hub's. The hub also forwards between clients that share its
//! overlay network and answers for itself with ICMP.

pub mod cache;
pub mod client;
pub mod config;
pub mod domains;
pub mod frame;
pub mod netmon;
pub mod overlay;
pub mod packet;
pub mod peers;
pub mod proto;
pub mod resolver;
pub mod route;
pub mod server;
pub mod tun;

// Re-export protocol types
pub use proto::{Message, MessageKind, ProtoError};

// Re-export configuration
pub use config::{ClientConfig, ConfigError, ServerConfig};

// Re-export engine entry points
pub use client::{run_client, ClientError, ClientHandle};
pub use server::{run_server, ServerError, ServerHandle};

// Re-export platform types
pub use netmon::{NetMonError, NetMonitor};
pub use route::{RouteError, RouteTable};
pub use tun::{DeviceInfo, TunDevice, TunError};
