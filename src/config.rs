// Tunables shared by the client and the server.
//
// The defaults mirror the classic TFTP behaviour of a long inactivity window and a small
// number of retransmissions. Tests shrink both so loss scenarios finish quickly.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Well-known TFTP port.
pub const DEFAULT_PORT: u16 = 69;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Timing rules applied to every wait-for-reply inside one transfer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferConfig {
    /// How long to wait for a reply before the wait is considered timed out.
    pub timeout: Duration,

    /// How many times the same DATA or WRQ packet may be resent before giving up.
    pub max_retries: u32,
}

impl Default for TransferConfig {
    fn default() -> TransferConfig {
        TransferConfig {
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory served to clients. Every request is confined to it.
    pub root: PathBuf,

    pub bind: IpAddr,

    pub port: u16,

    /// Refuse every write request.
    pub read_only: bool,

    pub transfer: TransferConfig,
}

impl ServerConfig {
    pub fn new(root: impl Into<PathBuf>) -> ServerConfig {
        ServerConfig {
            root: root.into(),
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            read_only: false,
            transfer: TransferConfig::default(),
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_defaults() {
        let config = ServerConfig::new("/srv/tftp");
        assert_eq!(config.listen_addr(), "0.0.0.0:69".parse::<SocketAddr>().unwrap());
        assert!(!config.read_only);
        assert_eq!(config.transfer.timeout, Duration::from_secs(20));
        assert_eq!(config.transfer.max_retries, 5);
    }
}
