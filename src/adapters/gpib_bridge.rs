//! GPIB-to-Ethernet/USB bridge line adapter.
//!
//! The bridge speaks newline-terminated ASCII. Lines starting with `++` configure the bridge
//! itself, everything else is forwarded to the currently addressed bus device. The bridge
//! keeps no useful notion of "current device" for us: several adapters may share one bridge,
//! so every addressed transaction re-selects its device first.

use super::transport::Connection;
use crate::error::{AppResult, InstrumentError};
use std::fmt;
use std::time::Duration;
use tracing::debug;

/// Bridge read timeout limits, in milliseconds.
const READ_TIMEOUT_MS: std::ops::RangeInclusive<u128> = 1..=3000;

/// A primary GPIB bus address (1-31).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpibAddress(u8);

impl GpibAddress {
    /// Validate a bus address.
    pub fn new(address: u8) -> AppResult<Self> {
        if (1..=31).contains(&address) {
            Ok(Self(address))
        } else {
            Err(InstrumentError::OutOfRange(format!(
                "GPIB address {} outside 1-31",
                address
            )))
        }
    }

    /// The raw address.
    pub fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for GpibAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Controller-mode bridge on top of one [`Connection`].
#[derive(Debug)]
pub struct GpibBridge {
    conn: Connection,
}

impl GpibBridge {
    /// Take over `conn` and program the bridge.
    ///
    /// Sends controller mode, no read-after-write, the bridge read timeout derived from the
    /// connection timeout, and no end-of-string append. Nothing is read back.
    pub async fn attach(conn: Connection) -> AppResult<Self> {
        let mut bridge = Self { conn };
        let read_tmo = bridge.read_timeout_ms();
        for setup in [
            "++mode 1".to_string(),
            "++auto 0".to_string(),
            format!("++read_tmo_ms {}", read_tmo),
            "++eos 3".to_string(),
        ] {
            bridge.send_line(&setup).await?;
        }
        debug!(endpoint = %bridge.conn.endpoint(), read_tmo, "GPIB bridge configured");
        Ok(bridge)
    }

    /// Bridge read timeout programmed at attach, clamped to 1..=3000 ms.
    pub fn read_timeout_ms(&self) -> u128 {
        self.conn
            .timeout()
            .as_millis()
            .clamp(*READ_TIMEOUT_MS.start(), *READ_TIMEOUT_MS.end())
    }

    /// Address `address` for the next transaction.
    pub async fn select(&mut self, address: GpibAddress) -> AppResult<()> {
        self.send_line(&format!("++addr {}", address)).await
    }

    /// Send `cmd` to the bus, selecting `address` first when given.
    pub async fn write(&mut self, cmd: &str, address: Option<GpibAddress>) -> AppResult<()> {
        if let Some(address) = address {
            self.select(address).await?;
        }
        self.send_line(cmd).await
    }

    /// Ask the addressed device to talk until EOI and return one receive of at most `max_bytes`.
    pub async fn read(
        &mut self,
        address: Option<GpibAddress>,
        max_bytes: usize,
    ) -> AppResult<String> {
        if let Some(address) = address {
            self.select(address).await?;
        }
        self.send_line("++read eoi").await?;
        let bytes = self.conn.receive(max_bytes).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// `write` followed by `read`. Settle delays are the caller's business.
    pub async fn query(
        &mut self,
        cmd: &str,
        address: Option<GpibAddress>,
        max_bytes: usize,
    ) -> AppResult<String> {
        self.write(cmd, address).await?;
        self.read(address, max_bytes).await
    }

    /// Bridge firmware identification (`++ver`).
    pub async fn firmware_version(&mut self) -> AppResult<String> {
        self.send_line("++ver").await?;
        let bytes = self.conn.receive(256).await?;
        Ok(String::from_utf8_lossy(&bytes).trim_end().to_string())
    }

    /// Timeout of the underlying connection.
    pub fn timeout(&self) -> Duration {
        self.conn.timeout()
    }

    /// The wrapped connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Close the underlying connection.
    pub async fn close(&mut self) {
        self.conn.close().await;
    }

    async fn send_line(&mut self, line: &str) -> AppResult<()> {
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        self.conn.send(&bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scripted(builder: &mut tokio_test::io::Builder, timeout: Duration) -> Connection {
        Connection::from_stream("bridge", builder.build(), timeout)
    }

    fn expect_setup(builder: &mut tokio_test::io::Builder, tmo: &str) {
        builder
            .write(b"++mode 1\n")
            .write(b"++auto 0\n")
            .write(format!("++read_tmo_ms {}\n", tmo).as_bytes())
            .write(b"++eos 3\n");
    }

    #[tokio::test]
    async fn test_attach_sends_setup_sequence() {
        let mut builder = tokio_test::io::Builder::new();
        expect_setup(&mut builder, "2000");
        let bridge = GpibBridge::attach(scripted(&mut builder, Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(bridge.read_timeout_ms(), 2000);
    }

    #[tokio::test]
    async fn test_read_timeout_is_clamped() {
        let mut builder = tokio_test::io::Builder::new();
        expect_setup(&mut builder, "3000");
        let bridge = GpibBridge::attach(scripted(&mut builder, Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(bridge.read_timeout_ms(), 3000);

        let mut builder = tokio_test::io::Builder::new();
        expect_setup(&mut builder, "1");
        let bridge = GpibBridge::attach(scripted(&mut builder, Duration::from_micros(10)))
            .await
            .unwrap();
        assert_eq!(bridge.read_timeout_ms(), 1);
    }

    #[tokio::test]
    async fn test_query_selects_address_each_time() {
        let mut builder = tokio_test::io::Builder::new();
        expect_setup(&mut builder, "500");
        builder
            .write(b"++addr 20\n")
            .write(b"*IDN?\n")
            .write(b"++addr 20\n")
            .write(b"++read eoi\n")
            .read(b"HP,8563E,0,1.0\n");
        let mut bridge = GpibBridge::attach(scripted(&mut builder, Duration::from_millis(500)))
            .await
            .unwrap();

        let address = GpibAddress::new(20).unwrap();
        let reply = bridge.query("*IDN?", Some(address), 256).await.unwrap();
        assert_eq!(reply, "HP,8563E,0,1.0\n");
    }

    #[tokio::test]
    async fn test_unaddressed_write_skips_select() {
        let mut builder = tokio_test::io::Builder::new();
        expect_setup(&mut builder, "500");
        builder.write(b"FREQ 1GHZ\n");
        let mut bridge = GpibBridge::attach(scripted(&mut builder, Duration::from_millis(500)))
            .await
            .unwrap();
        bridge.write("FREQ 1GHZ", None).await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_bridge_surfaces_transport_error() {
        let mut builder = tokio_test::io::Builder::new();
        expect_setup(&mut builder, "500");
        let mut bridge = GpibBridge::attach(scripted(&mut builder, Duration::from_millis(500)))
            .await
            .unwrap();
        bridge.close().await;

        let err = bridge
            .write("*RST", Some(GpibAddress::new(5).unwrap()))
            .await
            .unwrap_err();
        assert!(matches!(err, InstrumentError::NotConnected));
    }

    #[test]
    fn test_address_bounds() {
        assert!(GpibAddress::new(0).is_err());
        assert_eq!(GpibAddress::new(1).unwrap().get(), 1);
        assert_eq!(GpibAddress::new(31).unwrap().get(), 31);
        assert!(GpibAddress::new(32).is_err());
    }
}
