//! Connection manager.
//!
//! Lazily creates the single backend handle used by the access layer. The
//! first successful `get_connection` freezes the configuration; every later
//! call returns the same handle and ignores whatever config it passes.
//!
//! A [`Connector`] plays the role of the hosted store's app registry: it
//! creates the backend "app" at most once and reports
//! [`StoreError::DuplicateApp`] when asked again, in which case the manager
//! adopts the app that already exists.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use uuid::Uuid;

use crate::backend::{DocumentBackend, MemoryBackend, RocksBackend, RocksConfig};
use crate::config::ConnectionConfig;
use crate::error::{StoreError, StoreResult};

/// Creates backend apps from connection credentials.
#[async_trait]
pub trait Connector: Send + Sync {
    fn name(&self) -> &str;

    /// Create the app for `config`. Fails with `DuplicateApp` if one exists.
    async fn initialize(&self, config: &ConnectionConfig) -> StoreResult<Arc<dyn DocumentBackend>>;

    /// The app created earlier, if any.
    async fn existing(&self) -> Option<Arc<dyn DocumentBackend>>;
}

/// The established connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    backend: Arc<dyn DocumentBackend>,
    config: ConnectionConfig,
}

impl ConnectionHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn backend(&self) -> &Arc<dyn DocumentBackend> {
        &self.backend
    }

    /// Configuration the connection was created with.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("backend", &self.backend.name())
            .field("project_id", &self.config.project_id)
            .finish()
    }
}

/// Process-wide owner of the connection handle.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    defaults: ConnectionConfig,
    handle: OnceCell<ConnectionHandle>,
}

impl ConnectionManager {
    /// Manager falling back to [`ConnectionConfig::compiled_default`].
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self::with_defaults(connector, ConnectionConfig::compiled_default())
    }

    pub fn with_defaults(connector: Arc<dyn Connector>, defaults: ConnectionConfig) -> Self {
        Self {
            connector,
            defaults,
            handle: OnceCell::new(),
        }
    }

    /// Return the connection, creating it on first use.
    ///
    /// `config` only matters on the first successful call, and only when its
    /// key is usable; otherwise the defaults apply.
    pub async fn get_connection(
        &self,
        config: Option<&ConnectionConfig>,
    ) -> StoreResult<ConnectionHandle> {
        self.handle
            .get_or_try_init(|| self.connect(config))
            .await
            .cloned()
    }

    /// Whether a connection has been established.
    pub fn is_connected(&self) -> bool {
        self.handle.initialized()
    }

    async fn connect(&self, config: Option<&ConnectionConfig>) -> StoreResult<ConnectionHandle> {
        let config = match config {
            Some(custom) if custom.has_usable_key() => custom.clone(),
            _ if self.defaults.has_usable_key() => self.defaults.clone(),
            _ => {
                let err = StoreError::Configuration(
                    "no usable API key in supplied or default configuration".into(),
                );
                log::error!("Store configuration error: {err}");
                return Err(err);
            }
        };

        let backend = match self.connector.initialize(&config).await {
            Ok(backend) => backend,
            Err(StoreError::DuplicateApp(name)) => {
                log::warn!("Store app '{name}' already initialized; reusing it");
                self.connector.existing().await.ok_or_else(|| {
                    StoreError::Configuration(format!("app '{name}' reported but not found"))
                })?
            }
            Err(e) => {
                log::error!("Store initialization failed: {e}");
                return Err(e);
            }
        };

        log::info!(
            "Store connected: project '{}' via {} ({})",
            config.project_id,
            self.connector.name(),
            backend.name()
        );

        Ok(ConnectionHandle {
            id: Uuid::new_v4(),
            backend,
            config,
        })
    }
}

// ─── Connectors ─────────────────────────────────────────────────

/// In-process connector backed by [`MemoryBackend`].
pub struct MemoryConnector {
    app: Mutex<Option<Arc<dyn DocumentBackend>>>,
    change_capacity: usize,
}

impl MemoryConnector {
    pub fn new(change_capacity: usize) -> Self {
        Self {
            app: Mutex::new(None),
            change_capacity,
        }
    }

    /// A connector whose app already exists.
    pub fn with_backend(backend: Arc<dyn DocumentBackend>) -> Self {
        Self {
            app: Mutex::new(Some(backend)),
            change_capacity: 256,
        }
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn name(&self) -> &str {
        "memory"
    }

    async fn initialize(&self, config: &ConnectionConfig) -> StoreResult<Arc<dyn DocumentBackend>> {
        let mut app = self.app.lock().await;
        if app.is_some() {
            return Err(StoreError::DuplicateApp(config.project_id.clone()));
        }
        let backend: Arc<dyn DocumentBackend> = Arc::new(MemoryBackend::new(self.change_capacity));
        *app = Some(backend.clone());
        Ok(backend)
    }

    async fn existing(&self) -> Option<Arc<dyn DocumentBackend>> {
        self.app.lock().await.clone()
    }
}

/// Durable connector: one RocksDB directory per project under `data_dir`.
pub struct RocksConnector {
    data_dir: PathBuf,
    template: RocksConfig,
    app: Mutex<Option<Arc<dyn DocumentBackend>>>,
}

impl RocksConnector {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self::with_template(data_dir, RocksConfig::default())
    }

    /// `template` supplies every tuning knob except the path.
    pub fn with_template(data_dir: impl Into<PathBuf>, template: RocksConfig) -> Self {
        Self {
            data_dir: data_dir.into(),
            template,
            app: Mutex::new(None),
        }
    }

    fn project_dir(&self, project_id: &str) -> PathBuf {
        let name = if project_id.is_empty() { "default" } else { project_id };
        self.data_dir.join(name)
    }
}

#[async_trait]
impl Connector for RocksConnector {
    fn name(&self) -> &str {
        "rocksdb"
    }

    async fn initialize(&self, config: &ConnectionConfig) -> StoreResult<Arc<dyn DocumentBackend>> {
        let mut app = self.app.lock().await;
        if app.is_some() {
            return Err(StoreError::DuplicateApp(config.project_id.clone()));
        }
        let rocks = RocksConfig {
            path: self.project_dir(&config.project_id),
            ..self.template.clone()
        };
        let backend: Arc<dyn DocumentBackend> = Arc::new(RocksBackend::open(rocks)?);
        *app = Some(backend.clone());
        Ok(backend)
    }

    async fn existing(&self) -> Option<Arc<dyn DocumentBackend>> {
        self.app.lock().await.clone()
    }
}
