//! Backend factory.
//!
//! Creates anchor backends based on configuration.

use crate::anchor::backend::{AnchorBackend, BackendKind};
use crate::anchor::backends::{DistributedLedgerBackend, InMemoryLedgerClient, LedgerClient, LocalAnchorBackend};
use crate::anchor::config::{AnchorConfig, BackendConfig};
use crate::core::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Ledger clients keyed by backend name.
pub type LedgerClients = HashMap<String, Arc<dyn LedgerClient>>;

/// Create the enabled backends, in priority order.
///
/// Distributed-ledger backends need a client registered under their name.
pub async fn create_backends(
    config: &AnchorConfig,
    clients: &LedgerClients,
) -> Result<Vec<Arc<dyn AnchorBackend>>> {
    config.validate()?;
    let mut backends = Vec::new();
    for backend in config.enabled_backends() {
        let client = clients.get(&backend.name).cloned();
        backends.push(create_backend(backend, client).await?);
    }
    Ok(backends)
}

/// Like [`create_backends`], wiring an [`InMemoryLedgerClient`] to every
/// distributed-ledger backend that has no registered client.
pub async fn create_backends_simulated(
    config: &AnchorConfig,
    clients: &LedgerClients,
) -> Result<Vec<Arc<dyn AnchorBackend>>> {
    let mut clients = clients.clone();
    for backend in config.enabled_backends() {
        if backend.kind.is_distributed() && !clients.contains_key(&backend.name) {
            warn!(backend = %backend.name, kind = %backend.kind, "Using in-memory ledger client");
            clients.insert(backend.name.clone(), Arc::new(InMemoryLedgerClient::new()));
        }
    }
    create_backends(config, &clients).await
}

async fn create_backend(
    config: &BackendConfig,
    client: Option<Arc<dyn LedgerClient>>,
) -> Result<Arc<dyn AnchorBackend>> {
    match config.kind {
        BackendKind::Local => {
            let local_config = config.local.clone().unwrap_or_default();
            let backend = LocalAnchorBackend::open(&config.name, local_config).await?;
            Ok(Arc::new(backend) as Arc<dyn AnchorBackend>)
        }
        kind => {
            let client = client.ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "no ledger client registered for backend {}",
                    config.name
                ))
            })?;
            let network_config = config.network.clone().unwrap_or_default();
            let backend = DistributedLedgerBackend::new(&config.name, kind, network_config, client)?;
            Ok(Arc::new(backend) as Arc<dyn AnchorBackend>)
        }
    }
}
