// Client side: one request, one transfer, one socket.
//
// Each operation binds a fresh ephemeral socket, sends its request to the server's well-known
// port and then lets the transfer engine take over. The server answers from a port of its own,
// which becomes the transfer ID for the rest of the session.

use crate::config::TransferConfig;
use crate::processor::PacketProcessor;
use crate::tftp::{self, FileMode, Packet, PacketError, TftpSocket};
use crate::transfer::{self, Transfer, TransferError};
use std::ffi::OsString;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWrite;

/// Rejects names that could never go on the wire, before any packet is sent.
fn validate_filename(name: &str) -> Result<(), TransferError> {
    if name.is_empty() {
        return Err(PacketError::Encode("Filename must not be empty".to_string()).into());
    }
    if !tftp::is_ascii_printable(name) {
        let msg = format!("Filename {:?} is not printable ASCII", name);
        return Err(PacketError::Encode(msg).into());
    }
    Ok(())
}

/// Hidden sibling of `local` that a download is written to until it completes.
fn partial_path(local: &Path) -> io::Result<PathBuf> {
    let name = local.file_name().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("{:?} does not name a file", local))
    })?;
    let mut partial = OsString::from(".");
    partial.push(name);
    partial.push(".part");
    Ok(local.with_file_name(partial))
}

#[derive(Debug, Clone)]
pub struct Client {
    server: SocketAddr,
    config: TransferConfig,
}

impl Client {
    pub fn new(server: SocketAddr) -> Client {
        Client::with_config(server, TransferConfig::default())
    }

    pub fn with_config(server: SocketAddr, config: TransferConfig) -> Client {
        Client { server, config }
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    fn open_transfer(&self) -> Result<Transfer, TransferError> {
        let local: SocketAddr = match self.server {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let sock = TftpSocket::bind(local)?;
        Ok(Transfer::to_server(sock, self.server, self.config))
    }

    /// Downloads `remote` into `local`. Returns the number of bytes written. The data lands in
    /// a sibling file that replaces `local` only once the download completes, so a failed
    /// download leaves `local` as it was.
    pub async fn get(&self, remote: &str, local: &Path) -> Result<u64, TransferError> {
        validate_filename(remote)?;
        let partial = partial_path(local)?;
        let mut transfer = self.open_transfer()?;
        let file = File::create(&partial).await?;

        log::info!("GET {remote} from {} into {:?}", self.server, local);
        let request = Packet::ReadReq { path: remote.to_string(), mode: FileMode::Octet };
        let bytes = transfer::receive_file(&mut transfer, Some(request), file, &partial).await?;
        if let Err(e) = tokio::fs::rename(&partial, local).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e.into());
        }
        Ok(bytes)
    }

    /// Uploads `local` as `remote`. Returns the number of bytes sent.
    pub async fn put(&self, local: &Path, remote: &str) -> Result<u64, TransferError> {
        validate_filename(remote)?;
        let file = File::open(local).await?;
        let mut transfer = self.open_transfer()?;

        log::info!("PUT {:?} to {} as {remote}", local, self.server);
        let request = Packet::WriteReq { path: remote.to_string(), mode: FileMode::Octet };
        transfer.run(PacketProcessor::for_sending_after(request, file)).await
    }

    /// Streams the server's directory listing into `out`.
    pub async fn dir(
        &self,
        out: impl AsyncWrite + Unpin + Send + 'static,
    ) -> Result<u64, TransferError> {
        let mut transfer = self.open_transfer()?;
        let request = Packet::ReadReq { path: String::new(), mode: FileMode::Octet };
        transfer.run(PacketProcessor::for_receiving_after(request, out)).await
    }
}

/// Downloads `remote_name` from `server` into `local_name`.
pub async fn get(
    server: SocketAddr,
    remote_name: &str,
    local_name: &Path,
) -> Result<u64, TransferError> {
    Client::new(server).get(remote_name, local_name).await
}

/// Uploads `local_name` to `server` as `remote_name`.
pub async fn put(
    server: SocketAddr,
    remote_name: &str,
    local_name: &Path,
) -> Result<u64, TransferError> {
    Client::new(server).put(local_name, remote_name).await
}
