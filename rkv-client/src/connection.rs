//! # Connections
//!
//! Purpose: Own one TCP stream to the server together with its reusable
//! buffers, and split it into independent read/write halves when a
//! subscription needs to read push frames while other tasks write commands.
//!
//! ## Design Principles
//! 1. **Buffer Reuse**: Each connection keeps its own read and write buffers.
//! 2. **Cancel-Safe Reads**: Partial frames stay in the read buffer, so a read
//!    future can be dropped inside `select!` without losing data.
//! 3. **Deadlines at the Edge**: Timeouts wrap whole operations, not syscalls.

use std::future::Future;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::error::{ClientError, ClientResult};
use crate::resp::{decode, encode_command, RespValue};

const READ_BUF_CAPACITY: usize = 4 * 1024;
const WRITE_BUF_CAPACITY: usize = 256;

/// Socket settings applied when dialing.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Server host name or IP.
    pub host: String,
    /// Server TCP port.
    pub port: u16,
    /// Optional TCP read timeout.
    pub read_timeout: Option<Duration>,
    /// Optional TCP write timeout.
    pub write_timeout: Option<Duration>,
    /// Optional TCP connect timeout.
    pub connect_timeout: Option<Duration>,
}

/// Single TCP connection with reusable buffers.
pub struct Connection {
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: Vec<u8>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl Connection {
    /// Dials the server described by `options`.
    pub async fn connect(options: &ConnectOptions) -> ClientResult<Self> {
        let dial = async {
            TcpStream::connect((options.host.as_str(), options.port))
                .await
                .map_err(ClientError::from)
        };
        let stream = with_deadline(options.connect_timeout, dial).await?;
        // Disable Nagle to keep request latency low for small payloads.
        stream.set_nodelay(true)?;

        Ok(Connection {
            stream,
            read_buf: BytesMut::with_capacity(READ_BUF_CAPACITY),
            write_buf: Vec::with_capacity(WRITE_BUF_CAPACITY),
            read_timeout: options.read_timeout,
            write_timeout: options.write_timeout,
        })
    }

    /// Sends one command and waits for its reply. The read deadline is
    /// extended by `grace` for commands the server is allowed to hold (BLPOP).
    pub async fn exec_with_grace(
        &mut self,
        args: &[&[u8]],
        grace: Duration,
    ) -> ClientResult<RespValue> {
        self.write_buf.clear();
        encode_command(args, &mut self.write_buf);
        let stream = &mut self.stream;
        let buf = &self.write_buf;
        with_deadline(self.write_timeout, async {
            stream.write_all(buf).await?;
            stream.flush().await?;
            Ok::<(), ClientError>(())
        })
        .await?;

        let read_timeout = self.read_timeout.map(|limit| limit + grace);
        with_deadline(read_timeout, read_frame(&mut self.stream, &mut self.read_buf)).await
    }

    /// Splits the connection into a frame reader and a command writer.
    ///
    /// Bytes already buffered for reading move with the reader.
    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        let (read, write) = self.stream.into_split();
        (
            FrameReader {
                half: read,
                buf: self.read_buf,
            },
            FrameWriter {
                half: write,
                buf: self.write_buf,
                write_timeout: self.write_timeout,
            },
        )
    }
}

/// Read half of a split connection. Reads have no deadline: a subscription
/// waits for publishes as long as the connection lives.
pub struct FrameReader {
    half: OwnedReadHalf,
    buf: BytesMut,
}

impl FrameReader {
    /// Reads the next complete frame. Cancel-safe.
    pub async fn read_value(&mut self) -> ClientResult<RespValue> {
        read_frame(&mut self.half, &mut self.buf).await
    }
}

/// Write half of a split connection.
pub struct FrameWriter {
    half: OwnedWriteHalf,
    buf: Vec<u8>,
    write_timeout: Option<Duration>,
}

impl FrameWriter {
    /// Encodes and writes one command without waiting for a reply.
    pub async fn send(&mut self, args: &[&[u8]]) -> ClientResult<()> {
        self.buf.clear();
        encode_command(args, &mut self.buf);
        let half = &mut self.half;
        let buf = &self.buf;
        with_deadline(self.write_timeout, async {
            half.write_all(buf).await?;
            half.flush().await?;
            Ok::<(), ClientError>(())
        })
        .await
    }

    /// Shuts down the write direction, signalling EOF to the server.
    pub async fn shutdown(&mut self) -> ClientResult<()> {
        self.half.shutdown().await?;
        Ok(())
    }
}

async fn read_frame<R>(reader: &mut R, buf: &mut BytesMut) -> ClientResult<RespValue>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(value) = decode(buf)? {
            return Ok(value);
        }
        if reader.read_buf(buf).await? == 0 {
            return Err(ClientError::ConnectionClosed);
        }
    }
}

/// Runs `fut` under an optional deadline, mapping expiry to `Timeout`.
pub(crate) async fn with_deadline<F, T>(limit: Option<Duration>, fut: F) -> ClientResult<T>
where
    F: Future<Output = ClientResult<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| ClientError::Timeout)?,
        None => fut.await,
    }
}
