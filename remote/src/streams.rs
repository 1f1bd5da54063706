use anyhow::Context;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::instrument;

use crate::crypt::EncryptionContext;
use crate::error::TransferError;
use crate::protocol::{HEADER_LEN, TransferHeader};

async fn with_timeout<T>(
    timeout: std::time::Duration,
    what: &str,
    fut: impl std::future::Future<Output = std::io::Result<T>>,
) -> anyhow::Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.with_context(|| format!("failed to {what}")),
        Err(elapsed) => Err(anyhow::Error::new(elapsed)).with_context(|| {
            format!(
                "timed out after {} trying to {what}",
                humantime::format_duration(timeout)
            )
        }),
    }
}

/// Sending half of a portal connection.
///
/// Generic over the underlying writer type - works with TCP or any AsyncWrite.
#[derive(Debug)]
pub struct SendStream<W = OwnedWriteHalf> {
    writer: tokio::io::BufWriter<W>,
    io_timeout: std::time::Duration,
}

impl<W: AsyncWrite + Unpin> SendStream<W> {
    pub fn new(stream: W, io_timeout: std::time::Duration) -> Self {
        Self {
            writer: tokio::io::BufWriter::new(stream),
            io_timeout,
        }
    }

    /// Write a header and flush it so the peer can act on it right away.
    pub async fn send_header(&mut self, header: &TransferHeader) -> anyhow::Result<()> {
        let bytes = header.to_bytes();
        with_timeout(self.io_timeout, "send transfer header", async {
            self.writer.write_all(&bytes).await?;
            self.writer.flush().await
        })
        .await
    }

    /// Send one piece of payload, sealed when `crypt` is set. Returns the bytes put on the wire.
    #[instrument(level = "trace", skip(self, data, crypt), fields(len = data.len()))]
    pub async fn send_chunk(
        &mut self,
        data: &[u8],
        crypt: Option<&EncryptionContext>,
    ) -> anyhow::Result<u64> {
        match crypt {
            None => {
                with_timeout(self.io_timeout, "send chunk", self.writer.write_all(data)).await?;
                Ok(data.len() as u64)
            }
            Some(crypt) => {
                let sealed = crypt.seal_chunk(data)?;
                let wire_len = u32::try_from(sealed.len()).map_err(|_| {
                    TransferError::FramingError(format!(
                        "sealed chunk of {} bytes does not fit the length prefix",
                        sealed.len()
                    ))
                })?;
                with_timeout(self.io_timeout, "send sealed chunk", async {
                    self.writer.write_all(&wire_len.to_le_bytes()).await?;
                    self.writer.write_all(&sealed).await
                })
                .await?;
                Ok(4 + sealed.len() as u64)
            }
        }
    }

    pub async fn flush(&mut self) -> anyhow::Result<()> {
        with_timeout(self.io_timeout, "flush portal stream", self.writer.flush()).await
    }

    pub async fn close(&mut self) -> anyhow::Result<()> {
        with_timeout(self.io_timeout, "close portal stream", self.writer.shutdown()).await
    }
}

/// Receiving half of a portal connection.
#[derive(Debug)]
pub struct RecvStream<R = OwnedReadHalf> {
    reader: tokio::io::BufReader<R>,
    io_timeout: std::time::Duration,
    sealed: Vec<u8>,
}

impl<R: AsyncRead + Unpin> RecvStream<R> {
    pub fn new(stream: R, io_timeout: std::time::Duration) -> Self {
        Self {
            reader: tokio::io::BufReader::new(stream),
            io_timeout,
            sealed: Vec::new(),
        }
    }

    pub async fn recv_header(&mut self) -> anyhow::Result<TransferHeader> {
        let mut bytes = [0u8; HEADER_LEN];
        with_timeout(
            self.io_timeout,
            "receive transfer header",
            self.reader.read_exact(&mut bytes),
        )
        .await?;
        Ok(TransferHeader::decode(&mut &bytes[..])?)
    }

    /// Receive the next piece of a DATA payload into `buf` and return its length.
    ///
    /// A plaintext stream yields exactly `min(remaining, piece_size)` bytes. An encrypted stream
    /// yields one sealed chunk whose plaintext may be any size from 1 to `remaining` bytes, since the
    /// sender picks its own chunking.
    #[instrument(level = "trace", skip(self, crypt, buf))]
    pub async fn recv_chunk(
        &mut self,
        remaining: u64,
        piece_size: usize,
        crypt: Option<&EncryptionContext>,
        buf: &mut Vec<u8>,
    ) -> anyhow::Result<usize> {
        match crypt {
            None => {
                let len = usize::try_from(remaining).unwrap_or(usize::MAX).min(piece_size);
                buf.resize(len, 0);
                with_timeout(self.io_timeout, "receive chunk", self.reader.read_exact(buf))
                    .await?;
                Ok(len)
            }
            Some(crypt) => {
                let mut prefix = [0u8; 4];
                with_timeout(
                    self.io_timeout,
                    "receive sealed chunk length",
                    self.reader.read_exact(&mut prefix),
                )
                .await?;
                let wire_len = u32::from_le_bytes(prefix) as u64;
                let overhead = crypt.overhead() as u64;
                if wire_len <= overhead || wire_len - overhead > remaining {
                    return Err(TransferError::FramingError(format!(
                        "sealed chunk of {wire_len} bytes does not fit the {remaining} bytes left"
                    ))
                    .into());
                }
                self.sealed.resize(wire_len as usize, 0);
                with_timeout(
                    self.io_timeout,
                    "receive sealed chunk",
                    self.reader.read_exact(&mut self.sealed),
                )
                .await?;
                let plaintext = crypt.open_chunk(&self.sealed)?;
                let len = plaintext.len();
                *buf = plaintext;
                Ok(len)
            }
        }
    }
}

/// Both halves of one portal connection.
#[derive(Debug)]
pub struct PortalConnection<R = OwnedReadHalf, W = OwnedWriteHalf> {
    pub recv: RecvStream<R>,
    pub send: SendStream<W>,
    pub peer: std::net::SocketAddr,
    pub local: std::net::SocketAddr,
}

impl PortalConnection {
    pub fn from_tcp(
        stream: tokio::net::TcpStream,
        io_timeout: std::time::Duration,
    ) -> anyhow::Result<Self> {
        let peer = stream
            .peer_addr()
            .context("failed to read portal peer address")?;
        let local = stream
            .local_addr()
            .context("failed to read portal local address")?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            recv: RecvStream::new(read_half, io_timeout),
            send: SendStream::new(write_half, io_timeout),
            peer,
            local,
        })
    }
}
