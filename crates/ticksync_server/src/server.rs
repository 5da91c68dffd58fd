//! Main sync server.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::handler::{HandlerResponse, RequestHandler};
use crate::manager::SyncManager;
use crate::models::ModelRegistry;
use parking_lot::Mutex;
use serde_json::Value;
use std::time::Duration;
use ticksync_protocol::SyncRoute;
use ticksync_store::Database;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Shortest interval between lapsed-session purges.
const MIN_PURGE_INTERVAL: Duration = Duration::from_secs(1);

/// The sync server.
///
/// Owns a [`SyncManager`] and the background tasks that keep it healthy:
/// the lookup table scheduler and the lapsed-session purge.
///
/// # Example
///
/// ```rust,no_run
/// use ticksync_server::{ModelRegistry, SyncConfig, SyncServer};
/// use ticksync_store::Database;
///
/// # async fn run() -> ticksync_server::SyncResult<()> {
/// let server = SyncServer::new(Database::new(), SyncConfig::default(), ModelRegistry::new())?;
/// server.start();
///
/// // Transports call server.handle(route, session_id, body).
///
/// server.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct SyncServer {
    handler: RequestHandler,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncServer {
    /// Creates a server over `db`.
    pub fn new(db: Database, config: SyncConfig, models: ModelRegistry) -> SyncResult<Self> {
        Ok(Self::with_manager(SyncManager::new(db, config, models)?))
    }

    /// Creates a server around an existing manager.
    pub fn with_manager(manager: SyncManager) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            handler: RequestHandler::new(manager),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// The manager behind the server.
    pub fn manager(&self) -> &SyncManager {
        self.handler.manager()
    }

    /// The request handler.
    pub fn handler(&self) -> &RequestHandler {
        &self.handler
    }

    /// Handles one request.
    pub async fn handle(&self, route: SyncRoute, session_id: Option<&str>, body: Value) -> HandlerResponse {
        self.handler.handle(route, session_id, body).await
    }

    /// Handles a request named by its wire route.
    pub async fn handle_named(&self, route: &str, session_id: Option<&str>, body: Value) -> HandlerResponse {
        match SyncRoute::parse(route) {
            Some(route) => self.handle(route, session_id, body).await,
            None => HandlerResponse::from_error(&SyncError::InvalidRequest(format!(
                "unknown route {route}"
            ))),
        }
    }

    /// Spawns the background tasks. Calling it again has no effect.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        let config = self.manager().config().clone();

        if config.lookup_table_enabled {
            if let Some(interval) = config.lookup_refresh_interval {
                tasks.push(self.spawn_lookup_scheduler(interval));
            }
        }
        let purge_interval = (config.lapsed_session_after / 4).max(MIN_PURGE_INTERVAL);
        tasks.push(self.spawn_purge(purge_interval));
        info!(background_tasks = tasks.len(), "sync server started");
    }

    fn spawn_lookup_scheduler(&self, interval: Duration) -> JoinHandle<()> {
        let lookup = self.manager().lookup().clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // Failures are logged and recorded by the updater.
                        let _ = lookup.run().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    fn spawn_purge(&self, interval: Duration) -> JoinHandle<()> {
        let sessions = self.manager().sessions().clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = sessions.purge_lapsed() {
                            error!(error = %e, "lapsed session purge failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    /// Stops the background tasks and waits for them to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        info!("sync server stopped");
    }

    /// Number of running background tasks.
    pub fn background_tasks(&self) -> usize {
        self.tasks.lock().len()
    }
}

impl Drop for SyncServer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
