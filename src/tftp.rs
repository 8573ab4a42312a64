use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

/// Largest payload a single DATA packet may carry. A shorter payload ends the transfer.
pub const DATA_BUFFER_SIZE: usize = 512;

/// Receive buffer size. Larger than any valid packet so oversized datagrams are noticed
/// instead of silently truncated.
const RECV_BUFFER_SIZE: usize = 8192;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents a failure to turn a packet into bytes or bytes into a packet.
#[derive(Debug, PartialEq)]
pub enum PacketError {
    Encode(String),
    Decode(String),
}

impl error::Error for PacketError {}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PacketError::Encode(e) => write!(f, "Packet encoding error: {e}"),
            PacketError::Decode(e) => write!(f, "Packet decoding error: {e}"),
        }
    }
}

/// Represents an error returned from the TFTP Socket handler
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    /// An outgoing packet could not be encoded.
    Packet(PacketError),
    /// A datagram arrived but could not be decoded.
    Malformed { src: SocketAddr, error: PacketError },
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {e}"),
            SocketError::Packet(e) => write!(f, "{e}"),
            SocketError::Malformed { src, error } => {
                write!(f, "Malformed datagram from {src}: {error}")
            }
            SocketError::Timeout(e) => write!(f, "Socket IO timeout: {e}"),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

impl From<PacketError> for SocketError {
    fn from(e: PacketError) -> Self {
        SocketError::Packet(e)
    }
}

pub type TftpResult<T> = Result<T, SocketError>;

/// Represents the mode for a file the client wishes to read or write.
///
/// Only octet transfers are ever performed; the other modes are recognised so a request
/// naming them still decodes.
#[derive(Debug, Clone, PartialEq)]
pub enum FileMode {
    NetAscii,
    Octet,
    Mail,
    /// A mode string this implementation does not know, kept verbatim.
    Other(String),
}

impl FileMode {
    fn parse(raw: &str) -> FileMode {
        match raw.to_lowercase().as_str() {
            "netascii" => FileMode::NetAscii,
            "octet" => FileMode::Octet,
            "mail" => FileMode::Mail,
            _ => FileMode::Other(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            FileMode::NetAscii => "netascii",
            FileMode::Octet => "octet",
            FileMode::Mail => "mail",
            FileMode::Other(s) => s,
        }
    }
}

/// Represents a TFTP Error code surfaced by a TFTP Error packet
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ErrorCode {
    Undefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    Illegal,
    UnknownTid,
    FileAlreadyExists,
    NoSuchUser,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        match self {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::Illegal => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
        }
    }

    /// Codes outside the RFC 1350 range are folded into `Undefined`.
    pub fn from_u16(raw: u16) -> ErrorCode {
        match raw {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::Illegal,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::Undefined,
        }
    }

    /// The fixed human-readable message for this code.
    pub fn default_message(self) -> &'static str {
        match self {
            ErrorCode::Undefined => "Not defined, see error message (if any).",
            ErrorCode::FileNotFound => "File not found.",
            ErrorCode::AccessViolation => "Access violation.",
            ErrorCode::DiskFull => "Disk full or allocation exceeded.",
            ErrorCode::Illegal => "Illegal TFTP operation.",
            ErrorCode::UnknownTid => "Unknown transfer ID.",
            ErrorCode::FileAlreadyExists => "File already exists.",
            ErrorCode::NoSuchUser => "No such user.",
        }
    }
}

impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> ErrorCode {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
            io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
            io::ErrorKind::WriteZero
            | io::ErrorKind::StorageFull
            | io::ErrorKind::QuotaExceeded => ErrorCode::DiskFull,
            io::ErrorKind::ReadOnlyFilesystem => ErrorCode::AccessViolation,
            _ => ErrorCode::Undefined,
        }
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file path the client wants to read. Empty asks for a directory listing.
        path: String,

        /// The file mode.
        mode: FileMode,
    },

    /// A write request packet
    WriteReq {
        path: String,
        mode: FileMode,
    },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error {
        code: ErrorCode,
        message: String,
    },
}

/// Returns true when every character of `s` is printable ASCII, which here includes the
/// whitespace characters space, tab, newline, carriage return, vertical tab and form feed.
pub fn is_ascii_printable(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_ascii_graphic() || matches!(c, ' ' | '\t' | '\n' | '\r' | '\x0b' | '\x0c'))
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Given a buffer, assumes the string begins at the beginning of the buffer and concatenates until
/// it finds a 0 byte, which it assumes terminates the string.
///
/// Returns the string extracted from the buffer as well as the position of the 0 byte in the
/// buffer it was given (or the size of the buffer, if no 0 byte was encountered)
fn string_from_buffer(buf: &[u8]) -> (String, usize) {
    match buf.iter().position(|&c| c == 0x00) {
        Some(end) => (buf[..end].iter().map(|&c| char::from(c)).collect(), end),
        None => (buf.iter().map(|&c| char::from(c)).collect(), buf.len()),
    }
}

/// The opcode space of TFTP. OACK exists on the wire but is never produced or consumed here.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    Rrq,
    Wrq,
    Data,
    Ack,
    Error,
    Oack,
}

impl OpCode {
    pub fn as_u16(self) -> u16 {
        match self {
            OpCode::Rrq => 1,
            OpCode::Wrq => 2,
            OpCode::Data => 3,
            OpCode::Ack => 4,
            OpCode::Error => 5,
            OpCode::Oack => 6,
        }
    }
}

fn retrieve_op_code(buf: &[u8]) -> Result<OpCode, PacketError> {
    let rawcode = u16_from_buffer(&buf[..2]);
    match rawcode {
        1 => Ok(OpCode::Rrq),
        2 => Ok(OpCode::Wrq),
        3 => Ok(OpCode::Data),
        4 => Ok(OpCode::Ack),
        5 => Ok(OpCode::Error),
        6 => Ok(OpCode::Oack),
        _ => Err(PacketError::Decode(format!("Unknown opcode retrieved: {rawcode}"))),
    }
}

fn parse_path_and_mode(buf: &[u8]) -> Result<(String, FileMode), PacketError> {
    let (path, path_end) = string_from_buffer(buf);

    if path_end == buf.len() {
        return Err(PacketError::Decode(
            "Request does not contain a mode, but it needs to!".to_string(),
        ));
    }

    let rest = &buf[path_end + 1..];
    if rest.last() != Some(&0x00) {
        return Err(PacketError::Decode("Mode must be terminated with a null byte!".to_string()));
    }

    let (raw_mode, _) = string_from_buffer(&rest[..rest.len() - 1]);
    if raw_mode.is_empty() {
        return Err(PacketError::Decode("Request mode is empty".to_string()));
    }

    Ok((path, FileMode::parse(&raw_mode)))
}

fn parse_error(buf: &[u8]) -> Result<Packet, PacketError> {
    let code = ErrorCode::from_u16(u16_from_buffer(&buf[2..4]));
    let (message, message_end) = string_from_buffer(&buf[4..]);
    if message_end == buf.len() - 4 {
        return Err(PacketError::Decode(
            "Error message must be terminated with a null byte!".to_string(),
        ));
    }
    Ok(Packet::Error { code, message })
}

fn push_string(out: &mut Vec<u8>, field: &str, s: &str) -> Result<(), PacketError> {
    if !is_ascii_printable(s) {
        return Err(PacketError::Encode(format!("{field} is not printable ASCII: {s:?}")));
    }
    out.extend_from_slice(s.as_bytes());
    out.push(0x00);
    Ok(())
}

impl Packet {
    pub fn op_code(&self) -> OpCode {
        match self {
            Packet::ReadReq { .. } => OpCode::Rrq,
            Packet::WriteReq { .. } => OpCode::Wrq,
            Packet::Data { .. } => OpCode::Data,
            Packet::Ack { .. } => OpCode::Ack,
            Packet::Error { .. } => OpCode::Error,
        }
    }

    /// Builds an error packet carrying the code's fixed message.
    pub fn error(code: ErrorCode) -> Packet {
        Packet::Error { code, message: code.default_message().to_string() }
    }

    /// Serializes the packet into its wire form, integers in network byte order.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let mut out = Vec::with_capacity(4 + DATA_BUFFER_SIZE);
        out.extend_from_slice(&self.op_code().as_u16().to_be_bytes());

        match self {
            Packet::ReadReq { path, mode } | Packet::WriteReq { path, mode } => {
                push_string(&mut out, "Filename", path)?;
                push_string(&mut out, "Mode", mode.as_str())?;
            }
            Packet::Data { block, data } => {
                if data.len() > DATA_BUFFER_SIZE {
                    return Err(PacketError::Encode(format!(
                        "Data payload of {} bytes exceeds {DATA_BUFFER_SIZE} bytes",
                        data.len()
                    )));
                }
                out.extend_from_slice(&block.to_be_bytes());
                out.extend_from_slice(data);
            }
            Packet::Ack { block } => out.extend_from_slice(&block.to_be_bytes()),
            Packet::Error { code, message } => {
                out.extend_from_slice(&code.as_u16().to_be_bytes());
                push_string(&mut out, "Error message", message)?;
            }
        }

        Ok(out)
    }

    pub fn parse_from_buf(buf: &[u8]) -> Result<Packet, PacketError> {
        if buf.len() < 4 {
            return Err(PacketError::Decode(format!("Packet too short: {} bytes", buf.len())));
        }

        match retrieve_op_code(&buf[..2])? {
            OpCode::Rrq => {
                let (path, mode) = parse_path_and_mode(&buf[2..])?;
                Ok(Packet::ReadReq { path, mode })
            }
            OpCode::Wrq => {
                let (path, mode) = parse_path_and_mode(&buf[2..])?;
                Ok(Packet::WriteReq { path, mode })
            }
            OpCode::Data => Ok(Packet::Data {
                block: u16_from_buffer(&buf[2..4]),
                data: Vec::from(&buf[4..]),
            }),
            OpCode::Ack => {
                if buf.len() != 4 {
                    let msg = format!("Ack must be exactly 4 bytes, got {}", buf.len());
                    return Err(PacketError::Decode(msg));
                }
                Ok(Packet::Ack { block: u16_from_buffer(&buf[2..4]) })
            }
            OpCode::Error => parse_error(buf),
            OpCode::Oack => {
                Err(PacketError::Decode("Option acknowledgements are not supported".to_string()))
            }
        }
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that parses TFTP headers and
/// returns the packets in a more structured format.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    /// Binds with address reuse enabled, for the well-known listening port.
    pub fn bind_reusable(addr: SocketAddr) -> TftpResult<TftpSocket> {
        let domain = if addr.is_ipv4() { socket2::Domain::IPV4 } else { socket2::Domain::IPV6 };
        let socket =
            socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        let std_socket: UdpSocket = socket.into();
        Ok(TftpSocket { sock: Async::new(std_socket)? })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    pub async fn send(&self, packet: &Packet, dst: SocketAddr) -> TftpResult<()> {
        let buf = packet.encode()?;
        self.sock.send_to(&buf, dst).await?;
        Ok(())
    }

    pub async fn recv(&self) -> TftpResult<(Packet, SocketAddr)> {
        let mut buf = [0; RECV_BUFFER_SIZE];
        let (total_written, src) = self.sock.recv_from(&mut buf).await?;

        match Packet::parse_from_buf(&buf[..total_written]) {
            Ok(packet) => Ok((packet, src)),
            Err(error) => Err(SocketError::Malformed { src, error }),
        }
    }

    pub async fn recv_with_timeout(&self, ttl: Duration) -> TftpResult<(Packet, SocketAddr)> {
        timeout(ttl, self.recv()).await?
    }
}
