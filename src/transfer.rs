// Socket-level half of the transfer engine.
//
// A `Transfer` owns one socket dedicated to one peer and runs a `PacketProcessor` to
// completion. It works in send/wait cycles:
//
// 1. Send the packet the processor asked for. It is kept around for retransmission.
// 2. Wait for a reply from the peer, bounded by the inactivity timeout. Packets the processor
//    tolerates (stale acks, duplicates, unexpected opcodes) and undecodable datagrams are
//    logged and the wait continues within the same window.
// 3. On timeout the sending side resends the kept packet, up to the retry ceiling. The
//    receiving side gives up immediately, since retransmission belongs to the sender.
//
// The peer's address and port are the transfer ID. A transfer started by a request doesn't
// know the peer's port yet, so it adopts the source of the first reply and sticks with it.

use crate::config::TransferConfig;
use crate::processor::{PacketProcessor, ResultAction};
use crate::tftp::{ErrorCode, Packet, PacketError, SocketError, TftpSocket};
use std::error;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use tokio::fs::File;
use tokio::time::Instant;

#[derive(Debug)]
pub enum TransferError {
    Socket(SocketError),
    /// Reading the source or writing the sink failed.
    Io(io::Error),
    Packet(PacketError),
    ProtocolViolation(String),
    /// The same packet went unanswered past the retry ceiling.
    TimeoutExceeded { block: u16, attempts: u32 },
    /// The peer ended the transfer with an ERROR packet.
    PeerError { code: ErrorCode, message: String },
}

impl error::Error for TransferError {}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Socket(e) => write!(f, "{e}"),
            Self::Io(e) => write!(f, "File IO error: {e}"),
            Self::Packet(e) => write!(f, "{e}"),
            Self::ProtocolViolation(msg) => write!(f, "Protocol violation: {msg}"),
            Self::TimeoutExceeded { block, attempts } => {
                write!(f, "Timed out waiting on block {block} after {attempts} attempt(s)")
            }
            Self::PeerError { code, message } => {
                write!(f, "Peer sent error {} ({:?}): {message}", code.as_u16(), code)
            }
        }
    }
}

impl From<io::Error> for TransferError {
    fn from(e: io::Error) -> TransferError {
        TransferError::Io(e)
    }
}

impl From<PacketError> for TransferError {
    fn from(e: PacketError) -> TransferError {
        TransferError::Packet(e)
    }
}

impl From<SocketError> for TransferError {
    fn from(e: SocketError) -> TransferError {
        match e {
            SocketError::Packet(e) => TransferError::Packet(e),
            e => TransferError::Socket(e),
        }
    }
}

impl TransferError {
    /// The ERROR packet worth sending to the peer when this failure ends the session, if any.
    fn courtesy_packet(&self) -> Option<Packet> {
        match self {
            Self::Io(e) => Some(Packet::Error {
                code: e.kind().into(),
                message: format!("{}", e.kind()),
            }),
            Self::ProtocolViolation(_) => Some(Packet::error(ErrorCode::Illegal)),
            _ => None,
        }
    }
}

/// The transfer ID of the remote end.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Peer {
    /// Only the address the request goes to is known. The first reply binds the peer.
    Unbound(SocketAddr),
    Bound(SocketAddr),
}

/// What happened while waiting for a reply.
enum Reply {
    Send(Packet),
    Finished,
}

/// One file transfer over one dedicated socket.
pub struct Transfer {
    sock: TftpSocket,
    peer: Peer,
    config: TransferConfig,
}

impl Transfer {
    /// A transfer with a peer whose transfer ID is already known, as on the server side.
    pub fn new(sock: TftpSocket, peer: SocketAddr, config: TransferConfig) -> Transfer {
        Transfer { sock, peer: Peer::Bound(peer), config }
    }

    /// A transfer that opens with a request to `server`. The first reply fixes the peer.
    pub fn to_server(sock: TftpSocket, server: SocketAddr, config: TransferConfig) -> Transfer {
        Transfer { sock, peer: Peer::Unbound(server), config }
    }

    fn dst(&self) -> SocketAddr {
        match self.peer {
            Peer::Unbound(addr) | Peer::Bound(addr) => addr,
        }
    }

    /// Accepts `src` as the peer if it matches or if no peer is bound yet.
    fn accept_source(&mut self, src: SocketAddr) -> bool {
        match self.peer {
            Peer::Bound(addr) => addr == src,
            Peer::Unbound(_) => {
                log::debug!("Transfer bound to {src}");
                self.peer = Peer::Bound(src);
                true
            }
        }
    }

    /// Does the work of sending and receiving data until the transfer ends. Returns the number
    /// of bytes transferred.
    pub async fn run(&mut self, mut processor: PacketProcessor) -> Result<u64, TransferError> {
        let result = self.drive(&mut processor).await;
        if let Err(e) = &result {
            if let Some(packet) = e.courtesy_packet() {
                // Error packet is sent as a courtesy, we don't care how it goes.
                let _ = self.sock.send(&packet, self.dst()).await;
            }
        }
        result
    }

    async fn drive(&mut self, processor: &mut PacketProcessor) -> Result<u64, TransferError> {
        let mut out_packet = match processor.first_packet().await? {
            ResultAction::SendPacketAndAwait(p) => p,
            ResultAction::Finish(p) => {
                if let Some(p) = p {
                    self.sock.send(&p, self.dst()).await?;
                }
                return Ok(processor.bytes_transferred());
            }
            ResultAction::RetryRecv(msg) => {
                return Err(TransferError::ProtocolViolation(format!(
                    "Processor asked to wait before anything was sent: {msg}"
                )));
            }
        };

        // This loop is used for message sending as well as retries, depending on whether
        // |out_packet| has been overwritten.
        let mut retries = 0;
        loop {
            self.sock.send(&out_packet, self.dst()).await?;

            match self.await_reply(processor).await {
                Ok(Reply::Send(p)) => {
                    out_packet = p;
                    retries = 0;
                }
                Ok(Reply::Finished) => return Ok(processor.bytes_transferred()),
                Err(TransferError::Socket(SocketError::Timeout(_))) => {
                    if !processor.retransmits() || retries >= self.config.max_retries {
                        return Err(TransferError::TimeoutExceeded {
                            block: processor.pending_block(),
                            attempts: retries + 1,
                        });
                    }
                    retries += 1;
                    log::info!(
                        "Timed out waiting on {:?}, resending (retry {retries}/{max})",
                        self.dst(),
                        max = self.config.max_retries
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn await_reply(
        &mut self,
        processor: &mut PacketProcessor,
    ) -> Result<Reply, TransferError> {
        let started_waiting = Instant::now();
        loop {
            let remaining = self.config.timeout.saturating_sub(started_waiting.elapsed());
            match self.sock.recv_with_timeout(remaining).await {
                Ok((packet, src)) => {
                    // First, check whether the data came from the peer we were expecting.
                    if !self.accept_source(src) {
                        log::warn!(
                            "Packet from unknown transfer ID {src}, expected {}",
                            self.dst()
                        );
                        // ERROR packets are never answered.
                        if !matches!(packet, Packet::Error { .. }) {
                            let reply = Packet::error(ErrorCode::UnknownTid);
                            let _ = self.sock.send(&reply, src).await;
                        }
                        continue;
                    }

                    log::trace!("Got packet from {src}: {:?}", packet.op_code());
                    match processor.process_packet(&packet).await? {
                        ResultAction::SendPacketAndAwait(p) => return Ok(Reply::Send(p)),
                        ResultAction::RetryRecv(msg) => {
                            log::warn!("Protocol violation from {src}: {msg}");
                        }
                        ResultAction::Finish(p) => {
                            if let Some(p) = p {
                                self.sock.send(&p, src).await?;
                            }
                            return Ok(Reply::Finished);
                        }
                    }
                }
                Err(SocketError::Malformed { src, error }) => {
                    log::warn!("Ignoring malformed datagram from {src}: {error}");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Runs a receiving transfer into the file at `path`, which `file` was opened for. If the
/// transfer fails the partially written file is removed.
pub async fn receive_file(
    transfer: &mut Transfer,
    request: Option<Packet>,
    file: File,
    path: &Path,
) -> Result<u64, TransferError> {
    let processor = match request {
        Some(request) => PacketProcessor::for_receiving_after(request, file),
        None => PacketProcessor::for_receiving(file),
    };

    let result = transfer.run(processor).await;
    if result.is_err() {
        match tokio::fs::remove_file(path).await {
            Ok(()) => log::info!("Aborted transfer: removed incomplete file {:?}", path),
            Err(e) => log::warn!("Could not remove incomplete file {:?}: {e}", path),
        }
    }
    result
}
