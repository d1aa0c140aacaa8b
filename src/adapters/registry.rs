//! Connection registry
//!
//! Serial lines and many bridges accept a single client, so drivers never open endpoints on
//! their own when they may share them. The registry hands out at most one live handle per
//! physical [`Endpoint`] and tracks which drivers hold it. The handle is closed when its last
//! owner releases it.

use super::{Adapter, Connection, Endpoint, GpibBridge, SharedBridge, SharedConnection};
use crate::config::TransportConfig;
use crate::error::{AppResult, InstrumentError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// The live object behind an endpoint.
#[derive(Debug, Clone)]
pub enum Handle {
    /// Plain socket or serial connection
    Direct(SharedConnection),
    /// Bridge shared by all bus addresses behind it
    Bridge(SharedBridge),
}

impl Handle {
    async fn close(&self) {
        match self {
            Handle::Direct(conn) => conn.lock().await.close().await,
            Handle::Bridge(bridge) => bridge.lock().await.close().await,
        }
    }

    fn same_kind(&self, config: &TransportConfig) -> bool {
        matches!(
            (self, config),
            (Handle::Bridge(_), TransportConfig::GpibBridge { .. })
                | (Handle::Direct(_), TransportConfig::Socket { .. })
                | (Handle::Direct(_), TransportConfig::Serial { .. })
        )
    }
}

struct Entry {
    handle: Handle,
    owners: Vec<String>,
}

/// Hands out shared instrument connections with explicit acquire/release.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    entries: Arc<Mutex<HashMap<Endpoint, Entry>>>,
}

/// One owner's claim on a shared endpoint.
#[derive(Debug)]
pub struct Lease {
    owner: String,
    endpoint: Endpoint,
    transport: TransportConfig,
    handle: Handle,
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry").finish_non_exhaustive()
    }
}

impl Lease {
    /// Who holds this lease.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// The endpoint this lease refers to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The shared handle.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// The plain connection, for drivers that frame their own bytes.
    pub fn connection(&self) -> AppResult<SharedConnection> {
        match &self.handle {
            Handle::Direct(conn) => Ok(conn.clone()),
            Handle::Bridge(_) => Err(InstrumentError::InvalidState(format!(
                "{} is a GPIB bridge, not a raw byte channel",
                self.endpoint
            ))),
        }
    }

    /// A line adapter for this lease's transport.
    pub fn adapter(&self) -> AppResult<Adapter> {
        Adapter::from_handle(self.handle.clone(), &self.transport)
    }
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the endpoint of `transport` for `owner`, opening it if nobody holds it yet.
    pub async fn acquire(&self, transport: &TransportConfig, owner: &str) -> AppResult<Lease> {
        let endpoint = transport.endpoint()?;
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get_mut(&endpoint) {
            if !entry.handle.same_kind(transport) {
                return Err(InstrumentError::InvalidState(format!(
                    "{} is already open with a different transport kind",
                    endpoint
                )));
            }
            entry.owners.push(owner.to_string());
            debug!(%endpoint, owner, owners = entry.owners.len(), "Reusing shared connection");
            return Ok(Lease {
                owner: owner.to_string(),
                endpoint,
                transport: transport.clone(),
                handle: entry.handle.clone(),
            });
        }

        let conn = Connection::open(transport).await?;
        let handle = match transport {
            TransportConfig::GpibBridge { .. } => {
                Handle::Bridge(Arc::new(Mutex::new(GpibBridge::attach(conn).await?)))
            }
            _ => Handle::Direct(Arc::new(Mutex::new(conn))),
        };
        info!(%endpoint, owner, "Registered connection");

        entries.insert(
            endpoint.clone(),
            Entry {
                handle: handle.clone(),
                owners: vec![owner.to_string()],
            },
        );
        Ok(Lease {
            owner: owner.to_string(),
            endpoint,
            transport: transport.clone(),
            handle,
        })
    }

    /// Register an already-open connection under its endpoint, e.g. a simulator stream.
    pub async fn insert(
        &self,
        conn: Connection,
        owner: &str,
        transport: TransportConfig,
    ) -> AppResult<Lease> {
        let endpoint = conn.endpoint().clone();
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&endpoint) {
            return Err(InstrumentError::InvalidState(format!(
                "{} is already registered",
                endpoint
            )));
        }
        let handle = Handle::Direct(Arc::new(Mutex::new(conn)));
        entries.insert(
            endpoint.clone(),
            Entry {
                handle: handle.clone(),
                owners: vec![owner.to_string()],
            },
        );
        Ok(Lease {
            owner: owner.to_string(),
            endpoint,
            transport,
            handle,
        })
    }

    /// Give a lease back; the last release closes the connection.
    pub async fn release(&self, lease: Lease) {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(&lease.endpoint) else {
            return;
        };
        if let Some(pos) = entry.owners.iter().position(|o| *o == lease.owner) {
            entry.owners.remove(pos);
        }
        if entry.owners.is_empty() {
            if let Some(entry) = entries.remove(&lease.endpoint) {
                entry.handle.close().await;
                info!(endpoint = %lease.endpoint, "Released last owner, connection closed");
            }
        }
    }

    /// Current owners of `endpoint`.
    pub async fn owners(&self, endpoint: &Endpoint) -> Vec<String> {
        self.entries
            .lock()
            .await
            .get(endpoint)
            .map(|entry| entry.owners.clone())
            .unwrap_or_default()
    }

    /// Number of live endpoints.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether no endpoint is open.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Close everything, regardless of owners.
    pub async fn close_all(&self) {
        let mut entries = self.entries.lock().await;
        for (endpoint, entry) in entries.drain() {
            entry.handle.close().await;
            debug!(%endpoint, "Closed on shutdown");
        }
    }
}
