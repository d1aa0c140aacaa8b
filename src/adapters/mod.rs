//! Instrument adapters
//!
//! This module contains the transport layer and the closed set of line adapters built on
//! top of it:
//!
//! - [`transport`]: one physical channel with timeout-bounded reads
//! - [`gpib_bridge`]: GPIB bus semantics over a bridge connection
//! - [`registry`]: at most one live handle per physical endpoint
//! - [`mock`]: in-memory instrument peer for tests and dry runs
//!
//! Drivers talk to instruments through the [`InstrumentIo`] capability, implemented by
//! [`Adapter`].

pub mod gpib_bridge;
pub mod mock;
pub mod registry;
pub mod transport;

pub use gpib_bridge::{GpibAddress, GpibBridge};
pub use mock::{MockDevice, MockFraming};
pub use registry::{ConnectionRegistry, Handle, Lease};
pub use transport::{Connection, Endpoint, LinkState};

use crate::config::TransportConfig;
use crate::error::AppResult;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// A connection shared by several drivers; the lock serializes whole transactions.
pub type SharedConnection = Arc<Mutex<Connection>>;

/// A bridge shared by every bus device behind it.
pub type SharedBridge = Arc<Mutex<GpibBridge>>;

/// Line terminator appended by direct socket and serial adapters.
pub const LINE_TERMINATOR: &str = "\n";

/// Byte-pipe capability every instrument driver is written against.
#[async_trait]
pub trait InstrumentIo: Send {
    /// Send one command.
    async fn write(&mut self, cmd: &str) -> AppResult<()>;

    /// Read one response of at most `max_bytes`.
    async fn read(&mut self, max_bytes: usize) -> AppResult<String>;

    /// Write, wait `settle`, then read, without letting another caller in between.
    async fn query(&mut self, cmd: &str, settle: Duration, max_bytes: usize) -> AppResult<String>;

    /// Release the channel.
    async fn close(&mut self) -> AppResult<()>;
}

/// The closed set of ways to reach an instrument.
#[derive(Debug, Clone)]
pub enum Adapter {
    /// Direct TCP socket
    Socket {
        link: SharedConnection,
        terminator: String,
    },
    /// Direct serial line
    Serial {
        link: SharedConnection,
        terminator: String,
    },
    /// A device on a GPIB bus behind a bridge
    GpibBridge {
        bridge: SharedBridge,
        address: GpibAddress,
    },
}

impl Adapter {
    /// Open a private channel for `config`.
    ///
    /// Use [`ConnectionRegistry::acquire`] instead when other drivers may need the same
    /// endpoint.
    pub async fn open(config: &TransportConfig) -> AppResult<Self> {
        let conn = Connection::open(config).await?;
        let handle = match config {
            TransportConfig::GpibBridge { .. } => {
                Handle::Bridge(Arc::new(Mutex::new(GpibBridge::attach(conn).await?)))
            }
            _ => Handle::Direct(Arc::new(Mutex::new(conn))),
        };
        Self::from_handle(handle, config)
    }

    /// Build the adapter variant matching `config` around an existing handle.
    pub fn from_handle(handle: Handle, config: &TransportConfig) -> AppResult<Self> {
        let mismatch = || {
            crate::error::InstrumentError::InvalidState(format!(
                "endpoint {} is already in use with a different transport kind",
                config
                    .endpoint()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|_| "?".to_string())
            ))
        };
        match (config, handle) {
            (TransportConfig::Socket { .. }, Handle::Direct(link)) => Ok(Adapter::Socket {
                link,
                terminator: LINE_TERMINATOR.to_string(),
            }),
            (TransportConfig::Serial { .. }, Handle::Direct(link)) => Ok(Adapter::Serial {
                link,
                terminator: LINE_TERMINATOR.to_string(),
            }),
            (TransportConfig::GpibBridge { address, .. }, Handle::Bridge(bridge)) => {
                Ok(Adapter::GpibBridge {
                    bridge,
                    address: GpibAddress::new(*address)?,
                })
            }
            _ => Err(mismatch()),
        }
    }

    /// Wrap a shared connection as a direct socket adapter.
    pub fn direct(link: SharedConnection) -> Self {
        Adapter::Socket {
            link,
            terminator: LINE_TERMINATOR.to_string(),
        }
    }

    async fn write_direct(conn: &mut Connection, cmd: &str, terminator: &str) -> AppResult<()> {
        let mut bytes = Vec::with_capacity(cmd.len() + terminator.len());
        bytes.extend_from_slice(cmd.as_bytes());
        bytes.extend_from_slice(terminator.as_bytes());
        conn.send(&bytes).await
    }

    async fn read_direct(conn: &mut Connection, max_bytes: usize) -> AppResult<String> {
        let bytes = conn.receive(max_bytes).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[async_trait]
impl InstrumentIo for Adapter {
    async fn write(&mut self, cmd: &str) -> AppResult<()> {
        match self {
            Adapter::Socket { link, terminator } | Adapter::Serial { link, terminator } => {
                let mut conn = link.lock().await;
                Self::write_direct(&mut conn, cmd, terminator).await
            }
            Adapter::GpibBridge { bridge, address } => {
                bridge.lock().await.write(cmd, Some(*address)).await
            }
        }
    }

    async fn read(&mut self, max_bytes: usize) -> AppResult<String> {
        match self {
            Adapter::Socket { link, .. } | Adapter::Serial { link, .. } => {
                let mut conn = link.lock().await;
                Self::read_direct(&mut conn, max_bytes).await
            }
            Adapter::GpibBridge { bridge, address } => {
                bridge.lock().await.read(Some(*address), max_bytes).await
            }
        }
    }

    async fn query(&mut self, cmd: &str, settle: Duration, max_bytes: usize) -> AppResult<String> {
        match self {
            Adapter::Socket { link, terminator } | Adapter::Serial { link, terminator } => {
                let mut conn = link.lock().await;
                Self::write_direct(&mut conn, cmd, terminator).await?;
                if !settle.is_zero() {
                    tokio::time::sleep(settle).await;
                }
                Self::read_direct(&mut conn, max_bytes).await
            }
            Adapter::GpibBridge { bridge, address } => {
                let mut bridge = bridge.lock().await;
                bridge.write(cmd, Some(*address)).await?;
                if !settle.is_zero() {
                    tokio::time::sleep(settle).await;
                }
                bridge.read(Some(*address), max_bytes).await
            }
        }
    }

    async fn close(&mut self) -> AppResult<()> {
        match self {
            Adapter::Socket { link, .. } | Adapter::Serial { link, .. } => {
                link.lock().await.close().await
            }
            Adapter::GpibBridge { bridge, .. } => bridge.lock().await.close().await,
        }
        Ok(())
    }
}
