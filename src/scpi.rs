//! SCPI command facade
//!
//! A byte pipe plus timing policy. Commands are passed through untouched; the facade only
//! adds the settle delay instruments need between receiving a command and being able to
//! answer the next one. Instrument-specific command strings live with the callers.
//!
//! ## Settle delay
//! - `write` sleeps for the configured delay after sending, when it is nonzero
//! - `query` uses a per-call override if given, else the configured delay
//! - the adapter lock is held across write, delay and read

use crate::adapters::{Adapter, ConnectionRegistry, InstrumentIo, Lease};
use crate::config::{InstrumentDefinition, ScpiConfig};
use crate::error::AppResult;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, instrument};

/// Default maximum response size.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// SCPI instrument reached through any [`InstrumentIo`] adapter.
#[derive(Debug)]
pub struct ScpiInstrument<A: InstrumentIo = Adapter> {
    id: String,
    adapter: A,
    settle_delay: Duration,
    buffer_size: usize,
    lease: Option<(ConnectionRegistry, Lease)>,
}

impl<A: InstrumentIo> ScpiInstrument<A> {
    /// Wrap an adapter with a default settle delay.
    pub fn new(id: impl Into<String>, adapter: A, settle_delay: Duration) -> Self {
        Self {
            id: id.into(),
            adapter,
            settle_delay,
            buffer_size: DEFAULT_BUFFER_SIZE,
            lease: None,
        }
    }

    /// Override the maximum response size.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// Instrument identifier used in logs.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The default settle delay.
    pub fn settle_delay(&self) -> Duration {
        self.settle_delay
    }

    /// Send `cmd`, then wait the settle delay.
    #[instrument(skip(self), fields(id = %self.id))]
    pub async fn write(&mut self, cmd: &str) -> AppResult<()> {
        self.adapter.write(cmd).await?;
        if !self.settle_delay.is_zero() {
            sleep(self.settle_delay).await;
        }
        Ok(())
    }

    /// Read one response.
    pub async fn read(&mut self) -> AppResult<String> {
        let raw = self.adapter.read(self.buffer_size).await?;
        Ok(strip_terminator(raw))
    }

    /// Send `cmd`, wait, read the answer. `delay_override` replaces the default delay.
    #[instrument(skip(self), fields(id = %self.id))]
    pub async fn query(
        &mut self,
        cmd: &str,
        delay_override: Option<Duration>,
    ) -> AppResult<String> {
        let delay = delay_override.unwrap_or(self.settle_delay);
        let raw = self.adapter.query(cmd, delay, self.buffer_size).await?;
        let reply = strip_terminator(raw);
        debug!(%reply, "query answered");
        Ok(reply)
    }

    /// `*IDN?`
    pub async fn identify(&mut self) -> AppResult<String> {
        self.query("*IDN?", None).await
    }

    /// `*RST`
    pub async fn reset(&mut self) -> AppResult<()> {
        self.write("*RST").await
    }

    /// `*CLS`
    pub async fn clear_status(&mut self) -> AppResult<()> {
        self.write("*CLS").await
    }

    /// Release the channel: hand the lease back if the registry supplied it, else close.
    pub async fn close(&mut self) -> AppResult<()> {
        match self.lease.take() {
            Some((registry, lease)) => {
                registry.release(lease).await;
                Ok(())
            }
            None => self.adapter.close().await,
        }
    }
}

impl ScpiInstrument<Adapter> {
    /// Claim the instrument's endpoint from `registry` and wrap it.
    pub async fn connect(
        registry: &ConnectionRegistry,
        def: &InstrumentDefinition,
    ) -> AppResult<Self> {
        let options = def.scpi.clone().unwrap_or_default();
        let lease = registry.acquire(&def.transport, &def.id).await?;
        let adapter = lease.adapter()?;
        let mut instrument = Self::from_options(&def.id, adapter, &options);
        instrument.lease = Some((registry.clone(), lease));
        Ok(instrument)
    }

    fn from_options(id: &str, adapter: Adapter, options: &ScpiConfig) -> Self {
        Self::new(id, adapter, Duration::from_millis(options.settle_delay_ms))
            .with_buffer_size(options.buffer_size)
    }
}

fn strip_terminator(raw: String) -> String {
    raw.trim_end_matches(['\r', '\n']).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{MockDevice, MockFraming};
    use std::sync::Arc;
    use tokio::sync::Mutex;
    use tokio::time::Instant;

    fn signal_generator() -> (Adapter, MockDevice) {
        let (conn, device) = MockDevice::spawn("sg", MockFraming::Lines, |req| match req {
            b"*IDN?" => Some(b"ACME,SG100,1234,1.0\r\n".to_vec()),
            b":FREQuency:FIXed?" => Some(b"1.5E9\n".to_vec()),
            _ => None,
        });
        (Adapter::direct(Arc::new(Mutex::new(conn))), device)
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_sleeps_settle_delay() {
        let (adapter, device) = signal_generator();
        let mut sg = ScpiInstrument::new("sg", adapter, Duration::from_millis(250));

        let start = Instant::now();
        sg.write(":FREQuency:FIXed 1.5E9").await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(250));
        assert_eq!(device.requests().await, vec![":FREQuency:FIXed 1.5E9"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_query_delay_override() {
        let (adapter, _device) = signal_generator();
        let mut sg = ScpiInstrument::new("sg", adapter, Duration::from_millis(300));

        let start = Instant::now();
        let reply = sg
            .query(":FREQuency:FIXed?", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(reply, "1.5E9");
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(20));
        assert!(elapsed < Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_identify_strips_terminator() {
        let (adapter, _device) = signal_generator();
        let mut sg = ScpiInstrument::new("sg", adapter, Duration::ZERO);
        assert_eq!(sg.identify().await.unwrap(), "ACME,SG100,1234,1.0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_instrument_times_out() {
        let (adapter, _device) = signal_generator();
        let mut sg = ScpiInstrument::new("sg", adapter, Duration::ZERO);
        let err = sg.query("SYST:ERR?", None).await.unwrap_err();
        assert_eq!(err.category(), crate::error::FailureCategory::Unreachable);
    }

    #[tokio::test]
    async fn test_close_then_write_fails() {
        let (adapter, _device) = signal_generator();
        let mut sg = ScpiInstrument::new("sg", adapter, Duration::ZERO);
        sg.close().await.unwrap();
        sg.close().await.unwrap();
        assert!(sg.reset().await.is_err());
    }
}
