//! Byte-level transport over one physical channel.
//!
//! A [`Connection`] owns a TCP socket, a serial line or an arbitrary in-memory stream and
//! bounds every read by its configured timeout. It appends no framing and never retries;
//! both belong to the layers above.

use crate::config::TransportConfig;
use crate::error::{AppResult, InstrumentError};
use futures::FutureExt;
use std::fmt;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, info};

#[cfg(feature = "serial")]
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Default read chunk used by the delimited and exact-length readers.
const READ_CHUNK: usize = 256;

/// Identity of a physical channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// TCP socket `host:port`
    Tcp { host: String, port: u16 },
    /// Serial device path
    Serial { path: String },
    /// In-memory stream (tests, simulators)
    Stream { label: String },
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "{}:{}", host, port),
            Endpoint::Serial { path } => write!(f, "{}", path),
            Endpoint::Stream { label } => write!(f, "stream:{}", label),
        }
    }
}

/// Result of a non-blocking liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Link is usable as far as the OS can tell.
    Open,
    /// The peer closed or reset the link.
    ClosedByPeer,
    /// The link type or platform cannot tell.
    Undetermined,
}

/// Any bidirectional async byte stream.
pub trait LinkIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> LinkIo for T {}

enum Link {
    Tcp(TcpStream),
    #[cfg(feature = "serial")]
    Serial(SerialStream),
    Stream(Box<dyn LinkIo>),
}

impl Link {
    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self {
            Link::Tcp(s) => s.write_all(bytes).await?,
            #[cfg(feature = "serial")]
            Link::Serial(s) => s.write_all(bytes).await?,
            Link::Stream(s) => s.write_all(bytes).await?,
        }
        match self {
            Link::Tcp(s) => s.flush().await,
            #[cfg(feature = "serial")]
            Link::Serial(s) => s.flush().await,
            Link::Stream(s) => s.flush().await,
        }
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Link::Tcp(s) => s.read(buf).await,
            #[cfg(feature = "serial")]
            Link::Serial(s) => s.read(buf).await,
            Link::Stream(s) => s.read(buf).await,
        }
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            Link::Tcp(s) => s.shutdown().await,
            #[cfg(feature = "serial")]
            Link::Serial(_) => Ok(()),
            Link::Stream(s) => s.shutdown().await,
        }
    }
}

/// One open channel to an instrument.
///
/// Operations on a connection must be serialized by the caller; share it behind
/// [`SharedConnection`](super::SharedConnection) when several drivers talk to one channel.
pub struct Connection {
    endpoint: Endpoint,
    timeout: Duration,
    link: Option<Link>,
    /// Bytes read past a delimiter, served first by the next read.
    pending: Vec<u8>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Connection {
    /// Open the endpoint described by a transport configuration.
    ///
    /// Bridge transports open the bridge's own socket or serial line.
    pub async fn open(config: &TransportConfig) -> AppResult<Self> {
        let timeout = config.timeout();
        match config.endpoint()? {
            Endpoint::Tcp { host, port } => Self::open_tcp(&host, port, timeout).await,
            Endpoint::Serial { path } => {
                Self::open_serial(&path, config.baud_rate().unwrap_or(9600), timeout)
            }
            Endpoint::Stream { label } => Err(InstrumentError::Configuration(format!(
                "stream endpoint '{}' cannot be opened from configuration",
                label
            ))),
        }
    }

    /// Connect to `host:port`, bounding the connect itself by `timeout`.
    pub async fn open_tcp(host: &str, port: u16, timeout_after: Duration) -> AppResult<Self> {
        let endpoint = Endpoint::Tcp {
            host: host.to_string(),
            port,
        };
        let stream = timeout(timeout_after, TcpStream::connect((host, port)))
            .await
            .map_err(|_| InstrumentError::Timeout(timeout_after))?
            .map_err(|e| InstrumentError::connection(&endpoint, e))?;
        stream.set_nodelay(true)?;

        info!(%endpoint, "TCP connection opened");
        Ok(Self::with_link(endpoint, Link::Tcp(stream), timeout_after))
    }

    /// Open a serial line at `baud_rate`, 8 data bits, no parity, 1 stop bit, no flow control.
    #[cfg(feature = "serial")]
    pub fn open_serial(path: &str, baud_rate: u32, timeout_after: Duration) -> AppResult<Self> {
        let endpoint = Endpoint::Serial {
            path: path.to_string(),
        };
        let port = tokio_serial::new(path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(timeout_after)
            .open_native_async()
            .map_err(|e| InstrumentError::connection(&endpoint, e))?;

        info!(%endpoint, baud_rate, "Serial port opened");
        Ok(Self::with_link(endpoint, Link::Serial(port), timeout_after))
    }

    /// Open a serial line (unavailable without the `serial` feature).
    #[cfg(not(feature = "serial"))]
    pub fn open_serial(path: &str, baud_rate: u32, timeout_after: Duration) -> AppResult<Self> {
        let _ = (path, baud_rate, timeout_after);
        Err(InstrumentError::FeatureNotEnabled("serial".to_string()))
    }

    /// Wrap an already-connected stream, e.g. one half of `tokio::io::duplex`.
    pub fn from_stream<S>(label: impl Into<String>, stream: S, timeout_after: Duration) -> Self
    where
        S: LinkIo + 'static,
    {
        let endpoint = Endpoint::Stream {
            label: label.into(),
        };
        Self::with_link(endpoint, Link::Stream(Box::new(stream)), timeout_after)
    }

    fn with_link(endpoint: Endpoint, link: Link, timeout: Duration) -> Self {
        Self {
            endpoint,
            timeout,
            link: Some(link),
            pending: Vec::new(),
        }
    }

    /// The channel this connection was opened on.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Read timeout applied to every receive.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether `close` has not been called yet.
    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    /// Write all bytes as-is.
    pub async fn send(&mut self, bytes: &[u8]) -> AppResult<()> {
        let link = self.link.as_mut().ok_or(InstrumentError::NotConnected)?;
        link.write_all(bytes).await?;
        debug!(
            endpoint = %self.endpoint,
            tx = %String::from_utf8_lossy(bytes).escape_debug(),
            "sent"
        );
        Ok(())
    }

    /// One read of at most `max_bytes`, bounded by the connection timeout.
    pub async fn receive(&mut self, max_bytes: usize) -> AppResult<Vec<u8>> {
        if !self.pending.is_empty() {
            let take = max_bytes.min(self.pending.len());
            return Ok(self.pending.drain(..take).collect());
        }

        let deadline = Instant::now() + self.timeout;
        let mut buf = vec![0u8; max_bytes.max(1)];
        let n = self.read_chunk(&mut buf, deadline).await?;
        buf.truncate(n);
        debug!(
            endpoint = %self.endpoint,
            rx = %String::from_utf8_lossy(&buf).escape_debug(),
            "received"
        );
        Ok(buf)
    }

    /// Read exactly `len` bytes; the whole read shares one timeout window.
    pub async fn receive_exact(&mut self, len: usize) -> AppResult<Vec<u8>> {
        let deadline = Instant::now() + self.timeout;
        self.receive_exact_before(len, deadline).await
    }

    /// Read exactly `len` bytes, failing with `Timeout` once `deadline` passes.
    ///
    /// Lets a caller spread one timeout window over several frames.
    pub async fn receive_exact_before(
        &mut self,
        len: usize,
        deadline: Instant,
    ) -> AppResult<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        let from_pending = len.min(self.pending.len());
        out.extend(self.pending.drain(..from_pending));

        let mut chunk = [0u8; READ_CHUNK];
        while out.len() < len {
            let want = (len - out.len()).min(READ_CHUNK);
            let n = self.read_chunk(&mut chunk[..want], deadline).await?;
            out.extend_from_slice(&chunk[..n]);
        }
        debug!(endpoint = %self.endpoint, rx_len = out.len(), "received frame");
        Ok(out)
    }

    /// Read up to and including `delimiter`, or fail once `max_bytes` arrive without it.
    pub async fn receive_until(&mut self, delimiter: u8, max_bytes: usize) -> AppResult<Vec<u8>> {
        let deadline = Instant::now() + self.timeout;
        let mut out = std::mem::take(&mut self.pending);
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            if let Some(pos) = out.iter().position(|b| *b == delimiter) {
                self.pending = out.split_off(pos + 1);
                debug!(
                    endpoint = %self.endpoint,
                    rx = %String::from_utf8_lossy(&out).escape_debug(),
                    "received"
                );
                return Ok(out);
            }
            if out.len() >= max_bytes {
                return Err(InstrumentError::Protocol(format!(
                    "no delimiter 0x{:02X} within {} bytes",
                    delimiter, max_bytes
                )));
            }
            let n = self.read_chunk(&mut chunk, deadline).await?;
            out.extend_from_slice(&chunk[..n]);
        }
    }

    /// Drop buffered bytes and whatever the link already holds, without waiting.
    ///
    /// Called before a request so that a late answer to an earlier, timed-out request is
    /// never taken as the answer to the new one. Returns the number of bytes dropped.
    pub fn discard_input(&mut self) -> AppResult<usize> {
        let mut dropped = self.pending.len();
        self.pending.clear();

        let link = self.link.as_mut().ok_or(InstrumentError::NotConnected)?;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match link.read(&mut chunk).now_or_never() {
                Some(Ok(n)) if n > 0 => dropped += n,
                Some(Err(e)) => return Err(e.into()),
                // Nothing ready, or end of stream: the next receive reports the latter.
                _ => break,
            }
        }
        if dropped > 0 {
            debug!(endpoint = %self.endpoint, dropped, "discarded stale input");
        }
        Ok(dropped)
    }

    async fn read_chunk(&mut self, buf: &mut [u8], deadline: Instant) -> AppResult<usize> {
        let link = self.link.as_mut().ok_or(InstrumentError::NotConnected)?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let n = timeout(remaining, link.read(buf))
            .await
            .map_err(|_| InstrumentError::Timeout(self.timeout))??;
        if n == 0 && !buf.is_empty() {
            return Err(InstrumentError::connection(&self.endpoint, "closed by peer"));
        }
        Ok(n)
    }

    /// Classify the link without blocking.
    ///
    /// Only TCP sockets can be peeked; every other link reports `Undetermined`.
    pub fn probe(&self) -> AppResult<LinkState> {
        let link = self.link.as_ref().ok_or(InstrumentError::NotConnected)?;
        let Link::Tcp(stream) = link else {
            return Ok(LinkState::Undetermined);
        };

        let mut buf = [0u8; 1];
        let state = match stream.peek(&mut buf).now_or_never() {
            None => LinkState::Open,
            Some(Ok(0)) => LinkState::ClosedByPeer,
            Some(Ok(_)) => LinkState::Open,
            Some(Err(e)) => match e.kind() {
                io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::NotConnected => LinkState::ClosedByPeer,
                _ => LinkState::Undetermined,
            },
        };
        Ok(state)
    }

    /// Close the link. Safe to call repeatedly.
    pub async fn close(&mut self) {
        self.pending.clear();
        if let Some(mut link) = self.link.take() {
            if let Err(e) = link.shutdown().await {
                debug!(endpoint = %self.endpoint, error = %e, "shutdown failed, dropping link");
            }
            info!(endpoint = %self.endpoint, "Connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn duplex_pair() -> (Connection, tokio::io::DuplexStream) {
        let (near, far) = tokio::io::duplex(1024);
        let conn = Connection::from_stream("test", near, Duration::from_millis(200));
        (conn, far)
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let (mut conn, mut far) = duplex_pair();
        conn.send(b"*IDN?\n").await.unwrap();

        let mut buf = [0u8; 6];
        far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"*IDN?\n");

        far.write_all(b"ACME,SG100\n").await.unwrap();
        let reply = conn.receive(64).await.unwrap();
        assert_eq!(reply, b"ACME,SG100\n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_times_out() {
        let (mut conn, _far) = duplex_pair();
        let err = conn.receive(16).await.unwrap_err();
        assert!(matches!(err, InstrumentError::Timeout(d) if d == Duration::from_millis(200)));
    }

    #[tokio::test]
    async fn test_receive_until_keeps_trailing_bytes() {
        let (mut conn, mut far) = duplex_pair();
        far.write_all(b"first\rsecond\r").await.unwrap();

        assert_eq!(conn.receive_until(b'\r', 64).await.unwrap(), b"first\r");
        assert_eq!(conn.receive_until(b'\r', 64).await.unwrap(), b"second\r");
    }

    #[tokio::test]
    async fn test_receive_exact_spans_reads() {
        let (mut conn, mut far) = duplex_pair();
        tokio::spawn(async move {
            far.write_all(&[1, 2, 3]).await.unwrap();
            tokio::task::yield_now().await;
            far.write_all(&[4, 5]).await.unwrap();
            far
        });
        assert_eq!(conn.receive_exact(5).await.unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_discard_input_drops_late_answers_without_waiting() {
        let (mut conn, mut far) = duplex_pair();
        far.write_all(b"late\rlater\r").await.unwrap();
        assert_eq!(conn.receive_until(b'\r', 64).await.unwrap(), b"late\r");

        far.write_all(b"stale").await.unwrap();
        assert_eq!(conn.discard_input().unwrap(), b"later\r".len() + b"stale".len());
        assert_eq!(conn.discard_input().unwrap(), 0);

        far.write_all(b"fresh\r").await.unwrap();
        assert_eq!(conn.receive_until(b'\r', 64).await.unwrap(), b"fresh\r");
    }

    #[tokio::test]
    async fn test_eof_is_connection_error() {
        let (mut conn, far) = duplex_pair();
        drop(far);
        let err = conn.receive(8).await.unwrap_err();
        assert!(matches!(err, InstrumentError::Connection { .. }));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut conn, _far) = duplex_pair();
        conn.close().await;
        conn.close().await;
        assert!(!conn.is_open());
        assert!(matches!(
            conn.send(b"x").await,
            Err(InstrumentError::NotConnected)
        ));
        assert!(matches!(conn.probe(), Err(InstrumentError::NotConnected)));
    }

    #[tokio::test]
    async fn test_probe_stream_is_undetermined() {
        let (conn, _far) = duplex_pair();
        assert_eq!(conn.probe().unwrap(), LinkState::Undetermined);
    }

    #[tokio::test]
    async fn test_probe_tcp_detects_peer_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let conn = Connection::open_tcp("127.0.0.1", port, Duration::from_secs(1))
            .await
            .unwrap();
        let (peer, _) = listener.accept().await.unwrap();
        assert_eq!(conn.probe().unwrap(), LinkState::Open);

        drop(peer);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(conn.probe().unwrap(), LinkState::ClosedByPeer);
    }

    #[tokio::test]
    async fn test_open_tcp_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = Connection::open_tcp("127.0.0.1", port, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, InstrumentError::Connection { .. }));
    }
}
