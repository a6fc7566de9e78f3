use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

pub mod endpoint;
pub mod link;
pub mod tls;
pub mod wire;

pub use endpoint::{Endpoint, Service};
pub use link::Link;
pub use wire::{Request, Response};

/// Converts an IP address and port to a socket address.
pub fn ip_addr_to_socket_addr(ip: IpAddr, port: u16) -> SocketAddr {
    match ip {
        IpAddr::V4(ip) => SocketAddr::from((ip, port)),
        IpAddr::V6(ip) => SocketAddr::from((ip, port)),
    }
}

pub const BROKER_PORT: u16 = 8030;
pub const NODE_PORT: u16 = 8040;
/// The name every endpoint presents in its certificate.
pub const SERVER_NAME: &str = "localhost";
/// Keeps a link alive while a long call (a whole run) is outstanding.
pub const KEEP_ALIVE: Duration = Duration::from_secs(2);
/// Largest frame either side will read.
pub const MAX_FRAME_LEN: u32 = 256 * 1024 * 1024;
