mod status;
mod utils;

use std::io;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;

use bytecheck::CheckBytes;
use rkyv::de::deserializers::SharedDeserializeMap;
use rkyv::ser::serializers::AllocSerializer;
use rkyv::validation::validators::DefaultValidator;
use rkyv::{AlignedVec, Archive, Deserialize, Serialize};
pub use status::{ArchivedErrorCode, ArchivedStatus, ErrorCode, Status};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::net::utils::{FrameHeader, HEADER_SIZE};
use crate::{RpcMessage, SCRATCH_SPACE};

pub const BUFFER_SIZE: usize = 64 << 10;
/// The largest frame payload a peer may declare, larger frames are rejected
/// before any of the payload is buffered.
pub const MAX_FRAME_SIZE: usize = 64 << 20;

/// The stable discriminant identifying a message type on the wire.
pub type MessageKind = u16;

#[derive(Debug)]
/// A single frame received from the peer.
pub enum Frame {
    /// An archived message along with its kind.
    Message {
        kind: MessageKind,
        payload: AlignedVec,
    },
    /// The peer aborted the session with an error.
    Error(Status),
}

/// Decodes and validates an archived message.
pub fn decode<Msg>(payload: &AlignedVec) -> Result<Msg, Status>
where
    Msg: Archive,
    Msg::Archived: for<'a> CheckBytes<DefaultValidator<'a>>
        + Deserialize<Msg, SharedDeserializeMap>
        + 'static,
{
    rkyv::from_bytes::<Msg>(payload).map_err(|_| Status::invalid())
}

/// A connection to a peer.
///
/// Every frame is flushed as soon as it is written, messages are expected
/// to be batched by the caller where throughput matters.
pub struct Channel {
    remote_addr: SocketAddr,
    reader: OwnedReadHalf,
    writer: BufWriter<OwnedWriteHalf>,
    hot_buffer: Box<[u8]>,
    buf: Vec<u8>,
}

impl Channel {
    /// Connects to the remote address.
    pub async fn connect(remote_addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(remote_addr).await?;
        Self::from_stream(stream, remote_addr)
    }

    /// Connects to the remote address, failing with [ErrorKind::TimedOut]
    /// if the connection is not established in time.
    pub async fn connect_timeout(
        remote_addr: SocketAddr,
        timeout: Duration,
    ) -> io::Result<Self> {
        match tokio::time::timeout(timeout, Self::connect(remote_addr)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                ErrorKind::TimedOut,
                format!("Timed out connecting to {}", remote_addr),
            )),
        }
    }

    pub(crate) fn from_stream(
        stream: TcpStream,
        remote_addr: SocketAddr,
    ) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();

        Ok(Self {
            remote_addr,
            reader,
            writer: BufWriter::new(writer),
            hot_buffer: vec![0; BUFFER_SIZE].into_boxed_slice(),
            buf: Vec::new(),
        })
    }

    #[inline]
    /// The address of the remote connection.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Archives and sends a message to the peer.
    pub async fn send<Msg>(&mut self, msg: &Msg) -> Result<(), Status>
    where
        Msg: RpcMessage + Serialize<AllocSerializer<SCRATCH_SPACE>>,
    {
        let bytes =
            rkyv::to_bytes::<_, SCRATCH_SPACE>(msg).map_err(|_| Status::invalid())?;
        self.send_frame(Msg::KIND, &bytes)
            .await
            .map_err(Status::connection)
    }

    /// Sends an already archived message payload to the peer.
    pub async fn send_frame(&mut self, kind: MessageKind, payload: &[u8]) -> io::Result<()> {
        let buffer = utils::serialize_message(kind, payload);
        self.writer.write_all(&buffer).await?;
        self.writer.flush().await
    }

    /// Sends an error frame to the peer.
    pub async fn send_error(&mut self, status: &Status) -> io::Result<()> {
        self.writer.write_all(&utils::serialize_error(status)).await?;
        self.writer.flush().await
    }

    /// Receives the next message, expecting it to be of type `Msg`.
    ///
    /// Error frames from the peer are returned as the error, as is the
    /// connection closing before a message arrives.
    pub async fn recv<Msg>(&mut self) -> Result<Msg, Status>
    where
        Msg: RpcMessage,
        Msg::Archived: for<'a> CheckBytes<DefaultValidator<'a>>
            + Deserialize<Msg, SharedDeserializeMap>
            + 'static,
    {
        match self.recv_frame().await {
            Ok(Some(Frame::Message { kind, payload })) if kind == Msg::KIND => {
                decode(&payload)
            },
            Ok(Some(Frame::Message { kind, .. })) => Err(Status::unexpected(kind)),
            Ok(Some(Frame::Error(status))) => Err(status),
            Ok(None) => Err(Status::closed()),
            Err(e) => Err(Status::connection(e)),
        }
    }

    /// Receives the next frame from the peer.
    ///
    /// Returns `None` if the peer closed the connection cleanly between frames.
    pub async fn recv_frame(&mut self) -> io::Result<Option<Frame>> {
        if self.extend_buffer_pos(HEADER_SIZE).await? {
            return self.closed_at_boundary();
        }

        let header = utils::parse_header(&self.buf).ok_or_else(|| {
            io::Error::new(ErrorKind::InvalidData, "Received an invalid frame header")
        })?;

        let declared = match header {
            FrameHeader::Payload { data, .. } | FrameHeader::Error { data } => data,
        };
        if declared > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                format!(
                    "Frame of {} bytes exceeds the limit of {} bytes",
                    declared, MAX_FRAME_SIZE
                ),
            ));
        }

        let (data_len, frame) = match header {
            FrameHeader::Payload { kind, data } => {
                if self.extend_buffer_pos(HEADER_SIZE + data).await? {
                    return Err(ErrorKind::UnexpectedEof.into());
                }

                let mut payload = AlignedVec::with_capacity(data);
                payload.extend_from_slice(&self.buf[HEADER_SIZE..HEADER_SIZE + data]);
                (data, Frame::Message { kind, payload })
            },
            FrameHeader::Error { data } => {
                if self.extend_buffer_pos(HEADER_SIZE + data).await? {
                    return Err(ErrorKind::UnexpectedEof.into());
                }

                let mut payload = AlignedVec::with_capacity(data);
                payload.extend_from_slice(&self.buf[HEADER_SIZE..HEADER_SIZE + data]);
                let status = rkyv::from_bytes::<Status>(&payload).unwrap_or_else(|_| {
                    Status::internal("The peer sent an unreadable error.")
                });
                (data, Frame::Error(status))
            },
        };

        self.buf.drain(..HEADER_SIZE + data_len);
        Ok(Some(frame))
    }

    /// Closes the write half of the connection, signalling the peer
    /// that no more frames follow.
    pub async fn close(mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }

    /// Sends the error to the peer and closes the connection.
    pub async fn close_with_error(mut self, status: &Status) -> io::Result<()> {
        self.send_error(status).await?;
        self.writer.shutdown().await
    }

    fn closed_at_boundary(&self) -> io::Result<Option<Frame>> {
        if self.buf.is_empty() {
            Ok(None)
        } else {
            Err(ErrorKind::UnexpectedEof.into())
        }
    }

    /// Reads from the socket until the buffer holds at least `min_len` bytes.
    ///
    /// Returns `true` if the connection was closed first.
    async fn extend_buffer_pos(&mut self, min_len: usize) -> io::Result<bool> {
        while self.buf.len() < min_len {
            let n = self.reader.read(&mut self.hot_buffer[..]).await?;
            if n == 0 {
                return Ok(true);
            }
            self.buf.extend_from_slice(&self.hot_buffer[..n]);
        }

        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    async fn connected_pair() -> io::Result<(Channel, TcpStream)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let client = TcpStream::connect(addr).await?;
        let (server, peer) = listener.accept().await?;
        Ok((Channel::from_stream(server, peer)?, client))
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() -> anyhow::Result<()> {
        let (mut channel, mut client) = connected_pair().await?;

        let mut header = utils::serialize_message(1, b"");
        header[utils::FRAME_TYPE_SIZE + utils::MESSAGE_KIND_SIZE..utils::LEN_SIZE]
            .copy_from_slice(&u32::MAX.to_le_bytes());
        client.write_all(&header).await?;

        let err = channel
            .recv_frame()
            .await
            .expect_err("Oversized frame should be rejected");
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        Ok(())
    }

    #[tokio::test]
    async fn test_frame_at_boundary_is_read() -> anyhow::Result<()> {
        let (mut channel, mut client) = connected_pair().await?;

        client.write_all(&utils::serialize_message(3, b"abc")).await?;
        client.shutdown().await?;

        match channel.recv_frame().await? {
            Some(Frame::Message { kind, payload }) => {
                assert_eq!(kind, 3);
                assert_eq!(payload.as_slice(), b"abc");
            },
            other => panic!("Expected a message frame, got {:?}", other),
        }
        assert!(channel.recv_frame().await?.is_none(), "Clean close between frames.");
        Ok(())
    }
}
