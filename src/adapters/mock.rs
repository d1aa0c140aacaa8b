//! Mock instrument peer
//!
//! Provides an in-memory instrument on the far side of a [`Connection`] so drivers can be
//! exercised without hardware. The peer splits incoming bytes into requests, records each one
//! and answers through a caller-supplied responder.
//!
//! # Example
//!
//! ```rust,ignore
//! let (conn, device) = MockDevice::spawn("sg", MockFraming::Lines, |req| {
//!     (req == b"*IDN?").then(|| b"ACME,SG100,0,1.0\n".to_vec())
//! });
//! ```

use super::transport::Connection;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::trace;

/// Read timeout given to mock connections.
pub const MOCK_TIMEOUT: Duration = Duration::from_millis(500);

/// How the peer splits the byte stream into requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFraming {
    /// `\n`-terminated lines; the terminator is stripped.
    Lines,
    /// `\r`-terminated frames; the terminator is kept.
    CarriageReturn,
    /// Every chunk read from the stream is one request.
    Raw,
}

/// A simulated instrument answering on an in-memory stream.
pub struct MockDevice {
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
    task: JoinHandle<()>,
}

impl MockDevice {
    /// Start the peer and return the driver-side connection.
    ///
    /// `responder` sees each request and returns the bytes to send back, if any.
    pub fn spawn<F>(label: &str, framing: MockFraming, responder: F) -> (Connection, MockDevice)
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        let (near, far) = tokio::io::duplex(4096);
        let requests = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(serve(far, framing, responder, requests.clone()));
        let conn = Connection::from_stream(label, near, MOCK_TIMEOUT);
        (conn, MockDevice { requests, task })
    }

    /// Requests seen so far, decoded as text.
    pub async fn requests(&self) -> Vec<String> {
        self.requests
            .lock()
            .await
            .iter()
            .map(|r| String::from_utf8_lossy(r).into_owned())
            .collect()
    }

    /// Requests seen so far, as raw bytes.
    pub async fn raw_requests(&self) -> Vec<Vec<u8>> {
        self.requests.lock().await.clone()
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve<F>(
    mut stream: DuplexStream,
    framing: MockFraming,
    mut responder: F,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
) where
    F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
{
    let mut pending = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        pending.extend_from_slice(&chunk[..n]);

        for request in split_requests(&mut pending, framing) {
            trace!(request = %String::from_utf8_lossy(&request).escape_debug(), "mock request");
            requests.lock().await.push(request.clone());
            if let Some(reply) = responder(&request) {
                if stream.write_all(&reply).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn split_requests(pending: &mut Vec<u8>, framing: MockFraming) -> Vec<Vec<u8>> {
    let delimiter = match framing {
        MockFraming::Raw => return vec![std::mem::take(pending)],
        MockFraming::Lines => b'\n',
        MockFraming::CarriageReturn => b'\r',
    };

    let mut out = Vec::new();
    while let Some(pos) = pending.iter().position(|b| *b == delimiter) {
        let mut request: Vec<u8> = pending.drain(..=pos).collect();
        if framing == MockFraming::Lines {
            request.pop();
        }
        out.push(request);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_lines_strips_terminator() {
        let mut pending = b"++addr 5\n*IDN?\npart".to_vec();
        let requests = split_requests(&mut pending, MockFraming::Lines);
        assert_eq!(requests, vec![b"++addr 5".to_vec(), b"*IDN?".to_vec()]);
        assert_eq!(pending, b"part");
    }

    #[test]
    fn test_split_carriage_return_keeps_terminator() {
        let mut pending = b"0010030902=?107\r".to_vec();
        let requests = split_requests(&mut pending, MockFraming::CarriageReturn);
        assert_eq!(requests, vec![b"0010030902=?107\r".to_vec()]);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_mock_device_answers_and_records() {
        let (mut conn, device) = MockDevice::spawn("echo", MockFraming::Raw, |req| {
            Some(req.iter().rev().copied().collect())
        });
        conn.send(b"abc").await.unwrap();
        assert_eq!(conn.receive(16).await.unwrap(), b"cba");
        assert_eq!(device.raw_requests().await, vec![b"abc".to_vec()]);
    }
}
