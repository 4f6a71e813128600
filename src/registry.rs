use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::{ConnectionConfig, RuntimeConfig};
use crate::connection::{Connection, SafeOutcome};
use crate::errors::{McpRuntimeError, Result};
use crate::transports::{DefaultTransportFactory, TransportFactory};

/// Named collection of live [`Connection`]s.
///
/// Membership is the only thing tracked here; a registered connection may
/// still have lost its transport.
pub struct ConnectionRegistry {
    factory: Arc<dyn TransportFactory>,
    connections: RwLock<HashMap<String, Arc<Connection>>>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::with_factory(Arc::new(DefaultTransportFactory))
    }

    pub fn with_factory(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            factory,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Build a registry and register every connection listed in the config's
    /// connections file. Individual failures are logged and skipped.
    pub async fn from_config(config: &RuntimeConfig) -> Result<Self> {
        let registry = Self::new();
        if let Some(path) = &config.connections_file_path {
            let configs = crate::loader::load_connections_from_file(path, config).await?;
            registry.register_all(configs).await;
        }
        Ok(registry)
    }

    /// Connect and store. Nothing is stored when the connect fails.
    pub async fn register(&self, config: ConnectionConfig) -> Result<Arc<Connection>> {
        let name = config.name.clone();
        if self.is_registered(&name).await {
            return Err(McpRuntimeError::AlreadyRegistered(name));
        }

        let connection = Arc::new(Connection::new(config, Arc::clone(&self.factory)));
        connection.connect(None).await?;

        let mut connections = self.connections.write().await;
        if connections.contains_key(&name) {
            // Lost a race with a concurrent register of the same name.
            drop(connections);
            connection.safe_disconnect().await;
            return Err(McpRuntimeError::AlreadyRegistered(name));
        }
        connections.insert(name.clone(), Arc::clone(&connection));
        info!(connection = %name, "Registered connection");
        Ok(connection)
    }

    /// Register several connections concurrently; results are in input order.
    pub async fn register_all(
        &self,
        configs: Vec<ConnectionConfig>,
    ) -> Vec<Result<Arc<Connection>>> {
        join_all(configs.into_iter().map(|config| {
            let name = config.name.clone();
            async move {
                let result = self.register(config).await;
                if let Err(e) = &result {
                    warn!(connection = %name, error = %e, "Failed to register connection");
                }
                result
            }
        }))
        .await
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Connection>> {
        self.connections.read().await.get(name).cloned()
    }

    pub async fn get_or_err(&self, name: &str) -> Result<Arc<Connection>> {
        self.get(name)
            .await
            .ok_or_else(|| McpRuntimeError::NotRegistered(name.to_string()))
    }

    pub async fn is_registered(&self, name: &str) -> bool {
        self.connections.read().await.contains_key(name)
    }

    /// Disconnect and remove. The entry is removed even when disconnecting
    /// fails; `None` means the name was not registered.
    pub async fn unregister(&self, name: &str) -> Option<SafeOutcome<()>> {
        let connection = self.connections.write().await.remove(name)?;
        let outcome = connection.safe_disconnect().await;
        info!(connection = %name, success = outcome.is_success(), "Unregistered connection");
        Some(outcome)
    }

    /// Disconnect everything concurrently, then clear.
    pub async fn unregister_all(&self) {
        let connections: Vec<Arc<Connection>> =
            self.connections.read().await.values().cloned().collect();
        join_all(
            connections
                .iter()
                .map(|connection| connection.safe_disconnect()),
        )
        .await;
        self.connections.write().await.clear();
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.connections.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        let connections = self.connections.read().await;
        let mut all: Vec<Arc<Connection>> = connections.values().cloned().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }
}
