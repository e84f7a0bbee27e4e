use std::io::{self, ErrorKind};
use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;

use crate::message::Message;
use crate::network::{Frame, FrameCodec, Hello};
use crate::AppResult;

/// A framed TCP connection to another rank.
///
/// Senders only write to it and receivers only read from it, but both sides
/// share the same framing.
#[derive(Debug)]
pub struct Connection {
    stream: BufWriter<TcpStream>,
    buffer: BytesMut,
    write_buffer: BytesMut,
    codec: FrameCodec,
    peer: SocketAddr,
}

impl Connection {
    /// Wraps a connected socket. `buffer_size` is the initial read buffer
    /// capacity; `max_frame_size` bounds a single frame in both directions.
    pub fn new(socket: TcpStream, peer: SocketAddr, buffer_size: usize, max_frame_size: usize) -> Connection {
        Connection {
            stream: BufWriter::new(socket),
            buffer: BytesMut::with_capacity(buffer_size),
            write_buffer: BytesMut::with_capacity(buffer_size),
            codec: FrameCodec::new(max_frame_size),
            peer,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Reads a `Frame` from the connection.
    ///
    /// Reads from the socket until a complete frame can be parsed. A format
    /// error or an oversized frame is returned as an error and the connection
    /// should be closed.
    ///
    /// If the peer closes the connection while a frame is being sent, an error
    /// is returned. If the peer closes the connection cleanly, `None` is
    /// returned.
    pub async fn read_frame(&mut self) -> AppResult<Option<Frame>> {
        loop {
            if let Some(frame) = self.codec.parse(&mut self.buffer)? {
                return Ok(Some(frame));
            }
            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                return if self.buffer.is_empty() {
                    Ok(None)
                } else {
                    Err(
                        io::Error::new(ErrorKind::ConnectionReset, "connection reset by peer")
                            .into(),
                    )
                };
            }
        }
    }

    pub async fn write_hello(&mut self, hello: &Hello) -> AppResult<()> {
        self.write_buffer.clear();
        self.codec.encode_hello(hello, &mut self.write_buffer)?;
        self.flush_frame().await
    }

    /// Writes and flushes one message frame. On success the frame has been
    /// handed to the kernel.
    pub async fn write_message(&mut self, seq: u64, message: &Message) -> AppResult<()> {
        self.write_buffer.clear();
        self.codec.encode_message(seq, message, &mut self.write_buffer)?;
        self.flush_frame().await
    }

    async fn flush_frame(&mut self) -> AppResult<()> {
        self.stream.write_all(&self.write_buffer).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Resolves once the peer has closed its side. Nothing is ever sent back
    /// on a sender's connection, so any read result means the link is gone.
    pub async fn wait_closed(&mut self) -> AppResult<()> {
        loop {
            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                return Ok(());
            }
            self.buffer.clear();
        }
    }

    pub async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }
}
