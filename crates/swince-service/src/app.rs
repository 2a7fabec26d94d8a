use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use swince_store_sqlite::{setup, StorageHandle};
use tokio::net::TcpListener;

use crate::config::AppConfig;
use crate::lifecycle::{ErrorSink, Shutdown};
use crate::secrets::DirVault;
use crate::server::{router, Server};

/// Everything swincebot owns while it runs.
#[derive(Debug)]
pub struct App {
    store: Arc<StorageHandle>,
    vault: DirVault,
    server: Server,
}

impl App {
    /// Open the secrets vault, bring storage to a valid state, then start
    /// listening. Nothing is left open when a later step fails.
    ///
    /// # Errors
    /// Fails when the secrets directory is unusable, storage cannot be set
    /// up, or the listen address cannot be bound.
    pub async fn init(config: AppConfig, errors: ErrorSink) -> Result<Arc<Self>> {
        let vault = DirVault::open(&config.secrets_path)?;

        let store_config = config.store.clone();
        let store = tokio::task::spawn_blocking(move || setup(&store_config))
            .await
            .context("storage bootstrap task failed")?
            .with_context(|| format!("failed to set up database {}", config.store.path.display()))?;
        let store = Arc::new(store);

        let listener = match TcpListener::bind(config.listen).await {
            Ok(listener) => listener,
            Err(err) => {
                close_store(&store);
                return Err(err).with_context(|| format!("failed to listen on {}", config.listen));
            }
        };
        let server = match Server::start(listener, router(Arc::clone(&store)), errors) {
            Ok(server) => server,
            Err(err) => {
                close_store(&store);
                return Err(err);
            }
        };

        Ok(Arc::new(Self { store, vault, server }))
    }

    pub fn store(&self) -> &Arc<StorageHandle> {
        &self.store
    }

    pub fn vault(&self) -> &DirVault {
        &self.vault
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }
}

#[async_trait]
impl Shutdown for App {
    async fn drain(&self) {
        self.server.stop().await;
    }

    fn release(&self) {
        close_store(&self.store);
    }
}

fn close_store(store: &StorageHandle) {
    if let Err(err) = store.close() {
        tracing::error!(path = %store.path().display(), error = %err, "failed to close database");
    }
}
