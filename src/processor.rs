// Packet-level half of the transfer engine.
//
// A processor never touches a socket. It is fed one inbound packet at a time and answers with
// the action the connection loop in `transfer` should take. The sending side reads blocks from
// a source and waits for matching acks; the receiving side writes blocks to a sink and acks
// them. Both keep exactly one block in flight.

use crate::tftp::{self, Packet};
use crate::transfer::TransferError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Where outgoing file contents come from: a file, a directory listing, anything readable.
pub type DataSource = Box<dyn AsyncRead + Unpin + Send>;

/// Where incoming file contents go.
pub type DataSink = Box<dyn AsyncWrite + Unpin + Send>;

/// Block numbers start at 1 and wrap from 65535 back to 1. Zero only ever acknowledges a WRQ.
pub fn next_block(block: u16) -> u16 {
    if block == u16::MAX {
        1
    } else {
        block + 1
    }
}

/// Represents an action that the caller of PacketProcessor should take in
/// response to processing a packet.
#[derive(Debug, PartialEq)]
pub enum ResultAction {
    /// Caller should send the packet and await a response. The packet replaces the one kept
    /// for retransmission.
    SendPacketAndAwait(tftp::Packet),

    /// Caller should ignore the packet it just received and keep waiting, logging the reason.
    RetryRecv(String),

    /// The transfer is complete. Caller sends the packet, if any, and closes the connection.
    Finish(Option<tftp::Packet>),
}

/// One direction of one transfer.
pub enum PacketProcessor {
    Send(SendProcessor<DataSource>),
    Receive(ReceiveProcessor<DataSink>),
}

impl PacketProcessor {
    /// Sends `source` as DATA blocks starting with block 1. Used to answer a read request.
    pub fn for_sending(source: impl AsyncRead + Unpin + Send + 'static) -> PacketProcessor {
        PacketProcessor::Send(SendProcessor::new(Box::new(source)))
    }

    /// Sends `request` first and starts sending `source` once it is acknowledged with block 0.
    pub fn for_sending_after(
        request: Packet,
        source: impl AsyncRead + Unpin + Send + 'static,
    ) -> PacketProcessor {
        PacketProcessor::Send(SendProcessor::with_request(Box::new(source), request))
    }

    /// Acknowledges block 0, then writes DATA blocks to `sink`. Used to answer a write request.
    pub fn for_receiving(sink: impl AsyncWrite + Unpin + Send + 'static) -> PacketProcessor {
        PacketProcessor::Receive(ReceiveProcessor::new(Box::new(sink)))
    }

    /// Sends `request` first and writes the DATA blocks answering it to `sink`.
    pub fn for_receiving_after(
        request: Packet,
        sink: impl AsyncWrite + Unpin + Send + 'static,
    ) -> PacketProcessor {
        PacketProcessor::Receive(ReceiveProcessor::with_request(Box::new(sink), request))
    }

    pub async fn first_packet(&mut self) -> Result<ResultAction, TransferError> {
        match self {
            PacketProcessor::Send(p) => p.first_packet().await,
            PacketProcessor::Receive(p) => Ok(p.first_packet()),
        }
    }

    /// Given an incoming packet, processes it and describes the action the caller should take.
    pub async fn process_packet(
        &mut self,
        packet: &tftp::Packet,
    ) -> Result<ResultAction, TransferError> {
        match self {
            PacketProcessor::Send(p) => p.process_ack(packet).await,
            PacketProcessor::Receive(p) => p.process_data(packet).await,
        }
    }

    /// Only the sending side retransmits on timeout.
    pub fn retransmits(&self) -> bool {
        matches!(self, PacketProcessor::Send(_))
    }

    /// The block the processor is currently waiting on.
    pub fn pending_block(&self) -> u16 {
        match self {
            PacketProcessor::Send(p) => p.curr_block,
            PacketProcessor::Receive(p) => p.expected_block,
        }
    }

    /// Bytes acknowledged by the peer when sending, bytes written when receiving.
    pub fn bytes_transferred(&self) -> u64 {
        match self {
            PacketProcessor::Send(p) => p.bytes_sent,
            PacketProcessor::Receive(p) => p.bytes_written,
        }
    }
}

pub struct SendProcessor<R> {
    source: R,
    request: Option<Packet>,
    curr_block: u16,
    curr_len: usize,
    awaiting_final_ack: bool,
    bytes_sent: u64,
}

impl<R: AsyncRead + Unpin> SendProcessor<R> {
    pub fn new(source: R) -> SendProcessor<R> {
        SendProcessor {
            source,
            request: None,
            curr_block: 0,
            curr_len: 0,
            awaiting_final_ack: false,
            bytes_sent: 0,
        }
    }

    pub fn with_request(source: R, request: Packet) -> SendProcessor<R> {
        SendProcessor { request: Some(request), ..SendProcessor::new(source) }
    }

    pub async fn first_packet(&mut self) -> Result<ResultAction, TransferError> {
        match self.request.take() {
            Some(request) => Ok(ResultAction::SendPacketAndAwait(request)),
            None => self.next_data().await,
        }
    }

    async fn next_data(&mut self) -> Result<ResultAction, TransferError> {
        let data = read_block(&mut self.source).await?;
        self.curr_block = next_block(self.curr_block);
        self.curr_len = data.len();
        // A full block can never be the last one, so a source ending on a block boundary
        // is closed by an empty block.
        if data.len() < tftp::DATA_BUFFER_SIZE {
            self.awaiting_final_ack = true;
        }
        Ok(ResultAction::SendPacketAndAwait(tftp::Packet::Data { block: self.curr_block, data }))
    }

    pub async fn process_ack(
        &mut self,
        packet: &tftp::Packet,
    ) -> Result<ResultAction, TransferError> {
        match packet {
            &tftp::Packet::Ack { block } if block == self.curr_block => {
                self.bytes_sent += self.curr_len as u64;
                if self.awaiting_final_ack {
                    return Ok(ResultAction::Finish(None));
                }
                self.next_data().await
            }
            tftp::Packet::Ack { block } => Ok(ResultAction::RetryRecv(format!(
                "Ignoring ack for block {block}, still waiting on block {cb}",
                cb = self.curr_block
            ))),
            tftp::Packet::Error { code, message } => Err(TransferError::PeerError {
                code: *code,
                message: message.clone(),
            }),
            _ => Ok(ResultAction::RetryRecv(format!(
                "Expected to receive an Ack packet, but got {:?} instead",
                packet.op_code()
            ))),
        }
    }
}

async fn read_block<R: AsyncRead + Unpin>(f: &mut R) -> Result<Vec<u8>, std::io::Error> {
    let mut buf = vec![0_u8; tftp::DATA_BUFFER_SIZE];
    let mut cursor = 0;

    // A single read may return fewer bytes than asked for without being at the end of the
    // source, so keep reading into the rest of the buffer until it is full or we hit EOF.
    loop {
        let s = f.read(&mut buf[cursor..]).await?;
        cursor += s;
        if cursor == buf.len() || s == 0 {
            buf.truncate(cursor);
            return Ok(buf);
        }
    }
}

pub struct ReceiveProcessor<W> {
    sink: W,
    request: Option<Packet>,
    expected_block: u16,
    prev_block: u16,
    bytes_written: u64,
}

impl<W: AsyncWrite + Unpin> ReceiveProcessor<W> {
    pub fn new(sink: W) -> ReceiveProcessor<W> {
        ReceiveProcessor {
            sink,
            request: None,
            expected_block: 1,
            prev_block: 0,
            bytes_written: 0,
        }
    }

    pub fn with_request(sink: W, request: Packet) -> ReceiveProcessor<W> {
        ReceiveProcessor { request: Some(request), ..ReceiveProcessor::new(sink) }
    }

    pub fn first_packet(&mut self) -> ResultAction {
        match self.request.take() {
            Some(request) => ResultAction::SendPacketAndAwait(request),
            None => ResultAction::SendPacketAndAwait(tftp::Packet::Ack { block: 0 }),
        }
    }

    pub fn into_inner(self) -> W {
        self.sink
    }

    pub async fn process_data(
        &mut self,
        packet: &tftp::Packet,
    ) -> Result<ResultAction, TransferError> {
        match packet {
            tftp::Packet::Data { data, .. } if data.len() > tftp::DATA_BUFFER_SIZE => {
                Err(TransferError::ProtocolViolation(format!(
                    "Data packet carries {} bytes, more than the {} allowed",
                    data.len(),
                    tftp::DATA_BUFFER_SIZE
                )))
            }
            &tftp::Packet::Data { block, ref data } if block == self.expected_block => {
                self.sink.write_all(data).await?;
                self.bytes_written += data.len() as u64;
                self.prev_block = block;
                self.expected_block = next_block(block);

                let ack = tftp::Packet::Ack { block };
                if data.len() < tftp::DATA_BUFFER_SIZE {
                    self.sink.flush().await?;
                    Ok(ResultAction::Finish(Some(ack)))
                } else {
                    Ok(ResultAction::SendPacketAndAwait(ack))
                }
            }
            // The peer never saw our ack for this block. Ack it again, but don't write it twice.
            &tftp::Packet::Data { block, .. } if block == self.prev_block => {
                log::debug!("Duplicate data block {block}, acknowledging again");
                Ok(ResultAction::SendPacketAndAwait(tftp::Packet::Ack { block }))
            }
            tftp::Packet::Data { block, .. } => Ok(ResultAction::RetryRecv(format!(
                "Data blocks must be received in sequence. Received data for block {block}, \
                but expected block {eb}.",
                eb = self.expected_block
            ))),
            tftp::Packet::Error { code, message } => Err(TransferError::PeerError {
                code: *code,
                message: message.clone(),
            }),
            _ => Ok(ResultAction::RetryRecv(format!(
                "Expected to receive a Data packet, but got {:?} instead",
                packet.op_code()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tftp::{ErrorCode, FileMode};
    use std::io::Cursor;
    use std::path::Path;
    use tempdir::TempDir;
    use tokio::fs::File;
    use tokio_test::assert_ok;

    fn sender(contents: Vec<u8>) -> SendProcessor<Cursor<Vec<u8>>> {
        SendProcessor::new(Cursor::new(contents))
    }

    #[tokio::test]
    async fn test_read_first_packet_succeeds() {
        let mut processor = sender(b"testing".to_vec());

        assert_eq!(
            assert_ok!(processor.first_packet().await),
            ResultAction::SendPacketAndAwait(tftp::Packet::Data {
                block: 1,
                data: vec![0x74, 0x65, 0x73, 0x74, 0x69, 0x6E, 0x67]
            })
        );
    }

    #[tokio::test]
    async fn test_read_multiple_packets_succeeds() {
        let mut contents = vec![0x78; 1024];
        contents.extend_from_slice(b"testing");
        let mut processor = sender(contents);

        assert_eq!(
            assert_ok!(processor.first_packet().await),
            ResultAction::SendPacketAndAwait(tftp::Packet::Data { block: 1, data: vec![0x78; 512] })
        );

        assert_eq!(
            assert_ok!(processor.process_ack(&tftp::Packet::Ack { block: 1 }).await),
            ResultAction::SendPacketAndAwait(tftp::Packet::Data { block: 2, data: vec![0x78; 512] })
        );

        assert_eq!(
            assert_ok!(processor.process_ack(&tftp::Packet::Ack { block: 2 }).await),
            ResultAction::SendPacketAndAwait(tftp::Packet::Data {
                block: 3,
                data: vec![0x74, 0x65, 0x73, 0x74, 0x69, 0x6E, 0x67]
            })
        );

        assert_eq!(
            assert_ok!(processor.process_ack(&tftp::Packet::Ack { block: 3 }).await),
            ResultAction::Finish(None)
        );
        assert_eq!(processor.bytes_sent, 1031);
    }

    #[tokio::test]
    async fn test_full_final_block_is_followed_by_empty_block() {
        let mut processor = sender(vec![0x61; 512]);

        assert_eq!(
            assert_ok!(processor.first_packet().await),
            ResultAction::SendPacketAndAwait(tftp::Packet::Data { block: 1, data: vec![0x61; 512] })
        );
        assert_eq!(
            assert_ok!(processor.process_ack(&tftp::Packet::Ack { block: 1 }).await),
            ResultAction::SendPacketAndAwait(tftp::Packet::Data { block: 2, data: vec![] })
        );
        assert_eq!(
            assert_ok!(processor.process_ack(&tftp::Packet::Ack { block: 2 }).await),
            ResultAction::Finish(None)
        );
    }

    #[tokio::test]
    async fn test_empty_source_sends_one_empty_block() {
        let mut processor = sender(vec![]);

        assert_eq!(
            assert_ok!(processor.first_packet().await),
            ResultAction::SendPacketAndAwait(tftp::Packet::Data { block: 1, data: vec![] })
        );
        assert_eq!(
            assert_ok!(processor.process_ack(&tftp::Packet::Ack { block: 1 }).await),
            ResultAction::Finish(None)
        );
    }

    #[tokio::test]
    async fn test_send_after_request_waits_for_ack_zero() {
        let wrq = tftp::Packet::WriteReq { path: "up.bin".to_string(), mode: FileMode::Octet };
        let mut processor = SendProcessor::with_request(Cursor::new(b"abc".to_vec()), wrq.clone());

        assert_eq!(
            assert_ok!(processor.first_packet().await),
            ResultAction::SendPacketAndAwait(wrq)
        );
        assert!(matches!(
            assert_ok!(processor.process_ack(&tftp::Packet::Ack { block: 5 }).await),
            ResultAction::RetryRecv(_)
        ));
        assert_eq!(
            assert_ok!(processor.process_ack(&tftp::Packet::Ack { block: 0 }).await),
            ResultAction::SendPacketAndAwait(tftp::Packet::Data { block: 1, data: b"abc".to_vec() })
        );
    }

    #[tokio::test]
    async fn test_send_ignores_mismatched_ack() {
        let mut processor = sender(vec![0x78; 1024]);
        let _ = processor.first_packet().await;

        assert_eq!(
            assert_ok!(processor.process_ack(&tftp::Packet::Ack { block: 2 }).await),
            ResultAction::RetryRecv(
                "Ignoring ack for block 2, still waiting on block 1".to_string()
            )
        );
        assert_eq!(
            assert_ok!(processor.process_ack(&tftp::Packet::Ack { block: 0 }).await),
            ResultAction::RetryRecv(
                "Ignoring ack for block 0, still waiting on block 1".to_string()
            )
        );
        // Ignoring an ack must not advance the block.
        assert_eq!(
            assert_ok!(processor.process_ack(&tftp::Packet::Ack { block: 1 }).await),
            ResultAction::SendPacketAndAwait(tftp::Packet::Data { block: 2, data: vec![0x78; 512] })
        );
    }

    #[tokio::test]
    async fn test_send_wraps_block_number_to_one() {
        let mut processor = sender(vec![0x78; 1024]);
        processor.curr_block = u16::MAX - 1;

        assert_eq!(
            assert_ok!(processor.first_packet().await),
            ResultAction::SendPacketAndAwait(tftp::Packet::Data {
                block: u16::MAX,
                data: vec![0x78; 512]
            })
        );
        assert_eq!(
            assert_ok!(processor.process_ack(&tftp::Packet::Ack { block: u16::MAX }).await),
            ResultAction::SendPacketAndAwait(tftp::Packet::Data { block: 1, data: vec![0x78; 512] })
        );
    }

    #[tokio::test]
    async fn test_process_recv_error() {
        let mut processor = sender(vec![0x78; 1024]);
        let _ = processor.first_packet().await;

        let message = "whoops".to_string();
        let error = tftp::Packet::Error { code: ErrorCode::Undefined, message };
        match processor.process_ack(&error).await {
            Err(TransferError::PeerError { code, message }) => {
                assert_eq!(code, ErrorCode::Undefined);
                assert_eq!(message, "whoops");
            }
            other => panic!("expected a peer error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_process_read_invalid_packet() {
        let mut processor = sender(vec![0x78; 1024]);
        let _ = processor.first_packet().await;

        assert_eq!(
            assert_ok!(processor.process_ack(&data(1, vec![0x01])).await),
            ResultAction::RetryRecv(
                "Expected to receive an Ack packet, but got Data instead".to_string()
            )
        );
    }

    #[tokio::test]
    async fn test_sending_from_file() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("test.txt");
        tokio::fs::write(&path, b"testing").await.unwrap();

        let file = File::open(&path).await.unwrap();
        let mut processor = PacketProcessor::for_sending(file);
        assert!(processor.retransmits());
        assert_eq!(
            assert_ok!(processor.first_packet().await),
            ResultAction::SendPacketAndAwait(data(1, b"testing".to_vec()))
        );
        assert_eq!(
            assert_ok!(processor.process_packet(&tftp::Packet::Ack { block: 1 }).await),
            ResultAction::Finish(None)
        );
        assert_eq!(processor.bytes_transferred(), 7);
    }

    fn data(block: u16, data: Vec<u8>) -> tftp::Packet {
        tftp::Packet::Data { block, data }
    }

    fn receiver() -> ReceiveProcessor<Vec<u8>> {
        ReceiveProcessor::new(Vec::new())
    }

    #[tokio::test]
    async fn test_write_first_packet_succeeds() {
        let mut processor = receiver();
        assert_eq!(
            processor.first_packet(),
            ResultAction::SendPacketAndAwait(tftp::Packet::Ack { block: 0 })
        );
    }

    #[tokio::test]
    async fn test_write_multiple_packets_succeeds() {
        let mut processor = receiver();
        let _ = processor.first_packet();

        assert_eq!(
            assert_ok!(processor.process_data(&data(1, vec![0x78; 512])).await),
            ResultAction::SendPacketAndAwait(tftp::Packet::Ack { block: 1 })
        );

        assert_eq!(
            assert_ok!(processor.process_data(&data(2, b"testing".to_vec())).await),
            ResultAction::Finish(Some(tftp::Packet::Ack { block: 2 }))
        );

        let mut expected = vec![0x78; 512];
        expected.extend_from_slice(b"testing");
        assert_eq!(processor.bytes_written, 519);
        assert_eq!(processor.into_inner(), expected);
    }

    #[tokio::test]
    async fn test_duplicate_data_is_written_once_and_acked_twice() {
        let mut processor = receiver();
        let block = tftp::Packet::Data { block: 1, data: vec![0x42; 512] };

        assert_eq!(
            assert_ok!(processor.process_data(&block).await),
            ResultAction::SendPacketAndAwait(tftp::Packet::Ack { block: 1 })
        );
        assert_eq!(
            assert_ok!(processor.process_data(&block).await),
            ResultAction::SendPacketAndAwait(tftp::Packet::Ack { block: 1 })
        );
        assert_eq!(processor.expected_block, 2);
        assert_eq!(processor.into_inner(), vec![0x42; 512]);
    }

    #[tokio::test]
    async fn test_receive_accepts_wraparound() {
        let mut processor = receiver();
        processor.expected_block = u16::MAX - 1;
        processor.prev_block = u16::MAX - 2;

        for block in [u16::MAX - 1, u16::MAX, 1] {
            assert_eq!(
                assert_ok!(processor.process_data(&data(block, vec![0x01; 512])).await),
                ResultAction::SendPacketAndAwait(tftp::Packet::Ack { block })
            );
        }
        assert_eq!(
            assert_ok!(processor.process_data(&data(2, vec![0x02])).await),
            ResultAction::Finish(Some(tftp::Packet::Ack { block: 2 }))
        );
        assert_eq!(processor.into_inner().len(), 512 * 3 + 1);
    }

    #[tokio::test]
    async fn test_full_block_does_not_finish_receive() {
        let mut processor = receiver();

        assert_eq!(
            assert_ok!(processor.process_data(&data(1, vec![0x00; 512])).await),
            ResultAction::SendPacketAndAwait(tftp::Packet::Ack { block: 1 })
        );
        assert_eq!(
            assert_ok!(processor.process_data(&data(2, vec![])).await),
            ResultAction::Finish(Some(tftp::Packet::Ack { block: 2 }))
        );
    }

    #[tokio::test]
    async fn test_process_data_out_of_sequence() {
        let mut processor = receiver();
        let _ = processor.first_packet();

        assert_eq!(
            assert_ok!(processor.process_data(&data(2, vec![0x01])).await),
            ResultAction::RetryRecv(
                "Data blocks must be received in sequence. Received data for block 2, \
                but expected block 1."
                    .to_string()
            )
        );
        assert!(processor.into_inner().is_empty());
    }

    #[tokio::test]
    async fn test_process_write_invalid_packet() {
        let mut processor = receiver();
        let _ = processor.first_packet();

        assert_eq!(
            assert_ok!(processor.process_data(&tftp::Packet::Ack { block: 1 }).await),
            ResultAction::RetryRecv(
                "Expected to receive a Data packet, but got Ack instead".to_string()
            )
        );
    }

    #[tokio::test]
    async fn test_process_write_recv_error() {
        let mut processor = receiver();
        let _ = processor.first_packet();

        let error = tftp::Packet::Error { code: ErrorCode::DiskFull, message: "full".to_string() };
        match processor.process_data(&error).await {
            Err(TransferError::PeerError { code, .. }) => assert_eq!(code, ErrorCode::DiskFull),
            other => panic!("expected a peer error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_data_is_a_violation() {
        let mut processor = receiver();
        match processor.process_data(&tftp::Packet::Data { block: 1, data: vec![0; 600] }).await {
            Err(TransferError::ProtocolViolation(_)) => (),
            other => panic!("expected a protocol violation, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_receiving_after_request_sends_request_first() {
        let rrq = tftp::Packet::ReadReq { path: "x".to_string(), mode: FileMode::Octet };
        let mut processor = PacketProcessor::for_receiving_after(rrq.clone(), Vec::<u8>::new());
        assert!(!processor.retransmits());
        assert_eq!(
            assert_ok!(processor.first_packet().await),
            ResultAction::SendPacketAndAwait(rrq)
        );
        assert_eq!(processor.pending_block(), 1);
    }

    #[tokio::test]
    async fn test_receiving_into_file() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("out.bin");
        let file = File::create(&path).await.unwrap();
        let mut processor = PacketProcessor::for_receiving(file);

        let _ = processor.first_packet().await;
        assert_eq!(
            assert_ok!(processor.process_packet(&data(1, b"hello".to_vec())).await),
            ResultAction::Finish(Some(tftp::Packet::Ack { block: 1 }))
        );
        assert_eq!(read(&path).await, b"hello".to_vec());
    }

    async fn read(path: &Path) -> Vec<u8> {
        tokio::fs::read(path).await.unwrap()
    }

    #[test]
    fn test_next_block_skips_zero() {
        assert_eq!(next_block(0), 1);
        assert_eq!(next_block(1), 2);
        assert_eq!(next_block(u16::MAX), 1);
    }
}
