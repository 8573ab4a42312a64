// The listening half of the server.
//
// The listener only receives and spawns: every datagram arriving on the well-known port is
// handed to a task of its own, which binds its own socket and owns its file and counters. A
// failing transfer therefore never disturbs the listener or any other transfer.

use crate::config::ServerConfig;
use crate::root::ServerRoot;
use crate::srv_conn::{self, ServerRequestHandler};
use crate::tftp::{SocketError, TftpSocket};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

pub struct Server {
    sock: TftpSocket,
    root: Arc<ServerRoot>,
    config: Arc<ServerConfig>,
}

impl Server {
    /// Validates the root directory and binds the listening socket with address reuse.
    pub fn bind(config: ServerConfig) -> anyhow::Result<Server> {
        let root = ServerRoot::new(&config.root)?;
        let sock = TftpSocket::bind_reusable(config.listen_addr())?;
        log::info!("Serving {:?} on {}", root.path(), sock.local_addr()?);

        Ok(Server {
            sock,
            root: Arc::new(root),
            config: Arc::new(config),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        self.sock.local_addr()
    }

    /// Receives requests forever. Only an error on the listening socket itself ends the loop.
    pub async fn run(self) -> Result<(), SocketError> {
        loop {
            match self.sock.recv().await {
                Ok((packet, src)) => {
                    let root = Arc::clone(&self.root);
                    let config = Arc::clone(&self.config);
                    tokio::spawn(async move {
                        match ServerRequestHandler::new(&root, &config, &packet, src).await {
                            Ok(handler) => {
                                let _ = handler.handle().await;
                            }
                            Err(e) => log::warn!("Refused request from {src}: {e}"),
                        }
                    });
                }
                Err(SocketError::Malformed { src, error }) => {
                    log::warn!("Malformed request from {src}: {error}");
                    let config = Arc::clone(&self.config);
                    tokio::spawn(async move {
                        if let Err(e) = srv_conn::reject_malformed(&config, src).await {
                            log::warn!("Could not answer {src}: {e}");
                        }
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Serves `root` on every interface at `port` until the process is stopped.
pub async fn serve(root: &Path, port: u16) -> anyhow::Result<()> {
    let mut config = ServerConfig::new(root);
    config.port = port;
    Server::bind(config)?.run().await?;
    Ok(())
}
