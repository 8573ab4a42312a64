// This module contains the server-side connection handler.
//
// Server connections are initiated when a ReadReq or a WriteReq is received. The server handles
// this by creating a ServerRequestHandler instance, which works in roughly the following stages:
//
// 1. Bind a fresh ephemeral socket for this client. Every reply, including a rejection, leaves
//    from it, so the listener never talks to clients itself.
// 2. Classify the request with `dispatch`. Validation happens once here, for reads and writes
//    alike, and yields a rejection, a directory listing, or a file path inside the root.
// 3. Open the data source or sink. Failures become ERROR packets with the matching code.
// 4. Hand the source or sink to a `Transfer`, which runs the send/wait cycles to completion.
//
// A read request with an empty filename is answered with a listing of the server root, sent
// like any other file.

use crate::config::ServerConfig;
use crate::processor::PacketProcessor;
use crate::root::ServerRoot;
use crate::tftp::{self, ErrorCode, Packet, SocketError, TftpSocket};
use crate::transfer::{self, Transfer, TransferError};
use std::error;
use std::fmt;
use std::io::{self, Cursor};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::fs::File;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RequestKind {
    Read,
    Write,
}

/// The outcome of validating one request.
#[derive(Debug, PartialEq)]
pub enum Dispatch {
    Rejected { code: ErrorCode, reason: String },
    DirectoryListing,
    File { kind: RequestKind, path: PathBuf },
}

/// Validates `request` and resolves its filename against `root`.
pub fn dispatch(root: &ServerRoot, request: &Packet, read_only: bool) -> Dispatch {
    let (kind, filename) = match request {
        Packet::ReadReq { path, .. } => (RequestKind::Read, path),
        Packet::WriteReq { path, .. } => (RequestKind::Write, path),
        other => {
            return Dispatch::Rejected {
                code: ErrorCode::Illegal,
                reason: format!(
                    "Only read and write requests are valid initial requests, got {:?}",
                    other.op_code()
                ),
            }
        }
    };

    if kind == RequestKind::Write && read_only {
        return Dispatch::Rejected {
            code: ErrorCode::AccessViolation,
            reason: "Server does not accept writes".to_string(),
        };
    }

    if filename.is_empty() {
        return match kind {
            RequestKind::Read => Dispatch::DirectoryListing,
            RequestKind::Write => Dispatch::Rejected {
                code: ErrorCode::AccessViolation,
                reason: "Write request without a filename".to_string(),
            },
        };
    }

    if !tftp::is_ascii_printable(filename) || filename.contains(['/', '\\']) {
        return Dispatch::Rejected {
            code: ErrorCode::AccessViolation,
            reason: format!("Filename {:?} is not a plain printable name", filename),
        };
    }

    match root.resolve(filename) {
        Ok(path) => Dispatch::File { kind, path },
        Err(e) => Dispatch::Rejected { code: ErrorCode::AccessViolation, reason: e.to_string() },
    }
}

/// What the handler will do once its transfer starts.
enum Job {
    Send(PacketProcessor),
    Receive { file: File, path: PathBuf },
}

/// An object responsible for handling a request.
pub struct ServerRequestHandler {
    /// The transfer, bound to a socket of its own and to the requesting peer.
    transfer: Transfer,

    job: Job,

    /// The address the request came from.
    dst: SocketAddr,
}

/// Binds an OS-assigned port on the listener's address.
fn bind_ephemeral_socket(config: &ServerConfig) -> Result<TftpSocket, SocketError> {
    TftpSocket::bind(SocketAddr::new(config.bind, 0))
}

async fn send_error_packet(sock: &TftpSocket, dst: SocketAddr, code: ErrorCode) {
    // Error packet is sent as a courtesy, we don't care how it goes.
    let _ = sock.send(&Packet::error(code), dst).await;
}

async fn open_for_reading(path: &Path) -> io::Result<File> {
    let metadata = tokio::fs::metadata(path).await?;
    if !metadata.is_file() {
        let msg = format!("{:?} is not a regular file", path);
        return Err(io::Error::new(io::ErrorKind::PermissionDenied, msg));
    }
    File::open(path).await
}

impl ServerRequestHandler {
    pub async fn new(
        root: &ServerRoot,
        config: &ServerConfig,
        initial_request: &Packet,
        src: SocketAddr,
    ) -> Result<ServerRequestHandler, ServerConnectionError> {
        let sock = bind_ephemeral_socket(config)?;

        let job = match dispatch(root, initial_request, config.read_only) {
            Dispatch::Rejected { code, reason } => {
                send_error_packet(&sock, src, code).await;
                return Err(ServerConnectionError::BadRequest(reason));
            }
            Dispatch::DirectoryListing => {
                log::info!("DIR request from {src}");
                match root.listing().await {
                    Ok(listing) => Job::Send(PacketProcessor::for_sending(Cursor::new(listing))),
                    Err(e) => {
                        send_error_packet(&sock, src, e.kind().into()).await;
                        return Err(e.into());
                    }
                }
            }
            Dispatch::File { kind: RequestKind::Read, path } => {
                log::info!("RRQ from {src} for {:?}", path);
                match open_for_reading(&path).await {
                    Ok(f) => Job::Send(PacketProcessor::for_sending(f)),
                    Err(e) => {
                        send_error_packet(&sock, src, e.kind().into()).await;
                        return Err(e.into());
                    }
                }
            }
            Dispatch::File { kind: RequestKind::Write, path } => {
                log::info!("WRQ from {src} for {:?}", path);
                // Existing files are never overwritten.
                match File::create_new(&path).await {
                    Ok(file) => Job::Receive { file, path },
                    Err(e) => {
                        send_error_packet(&sock, src, e.kind().into()).await;
                        return Err(e.into());
                    }
                }
            }
        };

        Ok(ServerRequestHandler {
            transfer: Transfer::new(sock, src, config.transfer),
            job,
            dst: src,
        })
    }

    /// Does the work of sending and receiving data over the connection until the connection closes
    pub async fn handle(self) -> Result<u64, ServerConnectionError> {
        let ServerRequestHandler { mut transfer, job, dst } = self;

        let result = match job {
            Job::Send(processor) => transfer.run(processor).await,
            Job::Receive { file, path } => {
                transfer::receive_file(&mut transfer, None, file, &path).await
            }
        };

        match &result {
            Ok(bytes) => log::info!("Transfer with {dst} complete, {bytes} bytes"),
            Err(e) => log::warn!("Transfer with {dst} failed: {e}"),
        }
        Ok(result?)
    }
}

/// Answers a datagram the listener could not decode from a socket of its own.
pub async fn reject_malformed(
    config: &ServerConfig,
    src: SocketAddr,
) -> Result<(), ServerConnectionError> {
    let sock = bind_ephemeral_socket(config)?;
    send_error_packet(&sock, src, ErrorCode::Illegal).await;
    Ok(())
}

#[derive(Debug)]
pub enum ServerConnectionError {
    BadRequest(String),
    File(io::Error),
    Socket(SocketError),
    Transfer(TransferError),
}

impl error::Error for ServerConnectionError {}

impl fmt::Display for ServerConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::BadRequest(msg) => write!(f, "Invalid request: {msg}"),
            Self::File(e) => write!(f, "File IO error: {e}"),
            Self::Socket(e) => write!(f, "{e}"),
            Self::Transfer(e) => write!(f, "{e}"),
        }
    }
}

impl From<io::Error> for ServerConnectionError {
    fn from(e: io::Error) -> ServerConnectionError {
        ServerConnectionError::File(e)
    }
}

impl From<SocketError> for ServerConnectionError {
    fn from(e: SocketError) -> ServerConnectionError {
        ServerConnectionError::Socket(e)
    }
}

impl From<TransferError> for ServerConnectionError {
    fn from(e: TransferError) -> ServerConnectionError {
        ServerConnectionError::Transfer(e)
    }
}
