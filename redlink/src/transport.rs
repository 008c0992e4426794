//! Byte transport to one server
//!
//! Owns the duplex stream (TCP, optionally wrapped in TLS) and exposes a
//! buffered read half that decodes one reply frame at a time plus a buffered
//! write half. The pub/sub driver splits the two halves apart so pushes can
//! be read while control commands are written.

use crate::protocol::RespDecoder;
use bytes::{Buf, BytesMut};
use redlink_core::{
    config::ConnectOpts,
    error::{RedisError, RedisResult},
    value::RespValue,
};
use std::io::Cursor;
use std::sync::Arc;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;

const READ_BUFFER_CAPACITY: usize = 8192;

trait RawStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> RawStream for T {}

type BoxedStream = Box<dyn RawStream>;

/// Read half: raw stream plus the frame accumulation buffer
pub struct ReadEnd {
    reader: ReadHalf<BoxedStream>,
    buf: BytesMut,
}

impl ReadEnd {
    /// Read exactly one reply frame.
    ///
    /// # Errors
    ///
    /// [`RedisError::Eof`] when the stream closes at a frame boundary,
    /// [`RedisError::ConnectionClosed`] when it closes mid-frame, and
    /// [`RedisError::InvalidState`] on a framing violation.
    pub async fn read_reply(&mut self) -> RedisResult<RespValue> {
        loop {
            if !self.buf.is_empty() {
                let mut cursor = Cursor::new(&self.buf[..]);
                if let Some(value) = RespDecoder::decode(&mut cursor)? {
                    let pos = cursor.position() as usize;
                    self.buf.advance(pos);
                    return Ok(value);
                }
            }

            let n = self.reader.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(if self.buf.is_empty() {
                    RedisError::Eof
                } else {
                    RedisError::ConnectionClosed
                });
            }
        }
    }
}

/// Buffered write half
pub struct WriteEnd {
    writer: BufWriter<WriteHalf<BoxedStream>>,
}

impl WriteEnd {
    /// Buffer bytes for writing
    pub async fn write_all(&mut self, bytes: &[u8]) -> RedisResult<()> {
        self.writer.write_all(bytes).await?;
        Ok(())
    }

    /// Flush buffered bytes to the socket
    pub async fn flush(&mut self) -> RedisResult<()> {
        self.writer.flush().await?;
        Ok(())
    }

    /// Shut the write direction down; repeated calls are harmless
    pub async fn shutdown(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

/// A connected duplex byte stream
pub struct Transport {
    read: ReadEnd,
    write: WriteEnd,
}

impl Transport {
    /// Open a stream to the server named by `opts`.
    ///
    /// # Errors
    ///
    /// [`RedisError::ConnectError`] for TLS setup failures; dial failures
    /// surface as [`RedisError::Io`] so the reconnect policy can keep
    /// retrying them. Malformed ports never reach this point: they are
    /// rejected while the options are parsed.
    pub async fn connect(opts: &ConnectOpts) -> RedisResult<Self> {
        let addr = opts.address();
        debug!("connecting to {}", addr);
        let mut stream = TcpStream::connect(&addr).await?;

        if let Some(keepalive_duration) = opts.tcp_keepalive {
            let socket = socket2::Socket::from(stream.into_std()?);
            let keepalive = socket2::TcpKeepalive::new().with_time(keepalive_duration);
            socket.set_tcp_keepalive(&keepalive)?;
            stream = TcpStream::from_std(socket.into())?;
        }

        let stream: BoxedStream = if opts.tls {
            Box::new(Self::wrap_tls(stream, &opts.hostname).await?)
        } else {
            Box::new(stream)
        };

        let (reader, writer) = tokio::io::split(stream);
        Ok(Self {
            read: ReadEnd {
                reader,
                buf: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            },
            write: WriteEnd {
                writer: BufWriter::new(writer),
            },
        })
    }

    async fn wrap_tls(
        stream: TcpStream,
        hostname: &str,
    ) -> RedisResult<tokio_rustls::client::TlsStream<TcpStream>> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));

        let server_name = ServerName::try_from(hostname.to_string())
            .map_err(|_| RedisError::ConnectError(format!("invalid TLS hostname: {hostname}")))?;

        connector
            .connect(server_name, stream)
            .await
            .map_err(|e| RedisError::ConnectError(format!("TLS handshake failed: {e}")))
    }

    /// Write a request payload and flush it
    pub async fn write_all(&mut self, bytes: &[u8]) -> RedisResult<()> {
        self.write.write_all(bytes).await
    }

    /// Flush buffered request bytes
    pub async fn flush(&mut self) -> RedisResult<()> {
        self.write.flush().await
    }

    /// Read one reply frame
    pub async fn read_reply(&mut self) -> RedisResult<RespValue> {
        self.read.read_reply().await
    }

    /// Write one payload, flush, and read one reply frame
    pub async fn send(&mut self, payload: &[u8]) -> RedisResult<RespValue> {
        self.write.write_all(payload).await?;
        self.write.flush().await?;
        self.read.read_reply().await
    }

    /// Close the stream; closing twice is a no-op
    pub async fn close(&mut self) {
        self.write.shutdown().await;
    }

    /// Split into independently usable read and write halves
    #[must_use]
    pub fn into_split(self) -> (ReadEnd, WriteEnd) {
        (self.read, self.write)
    }
}
