use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use dashmap::DashMap;
use nbhost_protocol::paths::local_server_url;
use nbhost_protocol::{CellId, CellResult, EventKind, NotebookEvent, OpenNotebook, SessionId};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};

use crate::broker::{EventBus, Listener};
use crate::engine::EngineClient;
use crate::error::{HostError, HostResult};
use crate::orchestrator::ServerOrchestrator;

/// A live engine session bound to one notebook path.
#[derive(Debug)]
pub struct Worker {
    session_id: SessionId,
    path: PathBuf,
    /// Digest of the content the session was opened from, override or file.
    seed_digest: Vec<u8>,
}

impl Worker {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

enum Endpoint {
    Managed(ServerOrchestrator),
    Remote(String),
}

/// Maps notebook paths to engine sessions and publishes their lifecycle.
///
/// Repeated [`get_worker`](Self::get_worker) calls for a path return the same
/// `Arc<Worker>` until the notebook is closed or reseeded with different
/// content. Concurrent calls for one path are serialized so only one remote
/// session is ever opened for it.
pub struct SessionManager {
    endpoint: Endpoint,
    client: RwLock<Option<EngineClient>>,
    connect_lock: Mutex<()>,
    workers: DashMap<PathBuf, Arc<Worker>>,
    path_locks: DashMap<PathBuf, Arc<Mutex<()>>>,
    events: EventBus,
}

impl SessionManager {
    /// Sessions on a server this process launches (or adopts) on connect.
    pub fn with_orchestrator(orchestrator: ServerOrchestrator) -> Self {
        Self::new(Endpoint::Managed(orchestrator))
    }

    /// Sessions on an engine that is already running elsewhere.
    pub fn with_server_url(url: impl Into<String>) -> Self {
        Self::new(Endpoint::Remote(url.into()))
    }

    fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            client: RwLock::new(None),
            connect_lock: Mutex::new(()),
            workers: DashMap::new(),
            path_locks: DashMap::new(),
            events: EventBus::new(),
        }
    }

    fn client_slot(&self) -> RwLockReadGuard<'_, Option<EngineClient>> {
        self.client.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn client_slot_mut(&self) -> RwLockWriteGuard<'_, Option<EngineClient>> {
        self.client.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn client(&self) -> HostResult<EngineClient> {
        self.client_slot().clone().ok_or(HostError::NotConnected)
    }

    /// Bind to the engine. Calling it again while connected does nothing.
    pub async fn connect(&self) -> HostResult<()> {
        let _connecting = self.connect_lock.lock().await;
        if self.is_connected() {
            debug!("already connected");
            return Ok(());
        }

        let url = match &self.endpoint {
            Endpoint::Managed(orchestrator) => {
                match orchestrator.start().await {
                    Ok(_) | Err(HostError::AlreadyRunning) => {}
                    Err(err) => return Err(err),
                }
                if !orchestrator.wait_for_ready().await {
                    return Err(HostError::NotConnected);
                }
                orchestrator.server_url().ok_or(HostError::NotConnected)?
            }
            Endpoint::Remote(url) => url.clone(),
        };

        let client = EngineClient::new(url)?;
        if !client.ping().await {
            warn!(url = client.base_url(), "engine did not answer");
            return Err(HostError::NotConnected);
        }
        info!(url = client.base_url(), "connected to engine");
        *self.client_slot_mut() = Some(client);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.client_slot().is_some()
    }

    pub fn is_running(&self) -> bool {
        match &self.endpoint {
            Endpoint::Managed(orchestrator) => orchestrator.is_running(),
            Endpoint::Remote(_) => self.is_connected(),
        }
    }

    /// Where the engine is (or will be) served. Before a managed server
    /// starts this is the configured port.
    pub fn server_url(&self) -> String {
        if let Some(client) = self.client_slot().as_ref() {
            return client.base_url().to_string();
        }
        match &self.endpoint {
            Endpoint::Managed(orchestrator) => {
                let port = orchestrator.actual_port().unwrap_or(orchestrator.config().port);
                local_server_url(port)
            }
            Endpoint::Remote(url) => url.clone(),
        }
    }

    pub fn open_notebooks(&self) -> Vec<OpenNotebook> {
        let mut open: Vec<OpenNotebook> = self
            .workers
            .iter()
            .map(|entry| OpenNotebook {
                path: entry.key().clone(),
                session_id: entry.value().session_id.clone(),
            })
            .collect();
        open.sort_by(|a, b| a.path.cmp(&b.path));
        open
    }

    fn path_lock(&self, key: &Path) -> Arc<Mutex<()>> {
        self.path_locks.entry(key.to_path_buf()).or_default().clone()
    }

    /// Session for `path`, opening one on first use. A `content` override
    /// seeds the session instead of the file on disk; one that differs from
    /// what the cached session was opened from replaces it. The cached
    /// session stays in place if opening its replacement fails.
    pub async fn get_worker(&self, path: impl AsRef<Path>, content: Option<&str>) -> HostResult<Arc<Worker>> {
        let client = self.client()?;
        let key = normalize(path.as_ref());
        let override_digest = content.map(|text| seed_digest(text.as_bytes()));

        let _release = PathLockRelease {
            locks: &self.path_locks,
            key: &key,
        };
        let lock = self.path_lock(&key);
        let _held = lock.lock().await;

        let cached = self.workers.get(&key).map(|entry| Arc::clone(entry.value()));
        if let Some(existing) = &cached {
            match &override_digest {
                Some(digest) if *digest != existing.seed_digest => {
                    info!(path = %key.display(), "notebook content changed, reopening session");
                }
                _ => return Ok(Arc::clone(existing)),
            }
        }

        let digest = match override_digest {
            Some(digest) => digest,
            None => seed_digest(&read_notebook(&key).await?),
        };
        let session_id = client.open_session(&key, content).await?;
        let worker = Arc::new(Worker {
            session_id,
            path: key.clone(),
            seed_digest: digest,
        });
        if let Some(replaced) = self.workers.insert(key.clone(), Arc::clone(&worker)) {
            if let Err(err) = client.close_session(&replaced.session_id).await {
                warn!(session = %replaced.session_id, "failed to release replaced session: {err}");
            }
        }
        info!(path = %key.display(), session = %worker.session_id, "notebook opened");
        self.events.emit(NotebookEvent::NotebookOpened { path: key.clone() });
        Ok(worker)
    }

    pub async fn execute_cell(&self, worker: &Worker, cell_id: &str, code: &str) -> HostResult<CellResult> {
        let result = self.client()?.run_cell(&worker.session_id, cell_id, code).await?;
        self.emit_cell_updated(&worker.path, cell_id);
        Ok(result)
    }

    pub async fn add_cell(&self, worker: &Worker, index: usize, code: &str) -> HostResult<CellId> {
        let cell_id = self.client()?.add_cell(&worker.session_id, index, code).await?;
        debug!(session = %worker.session_id, cell = %cell_id, index, "cell added");
        Ok(cell_id)
    }

    /// Deleting a cell the engine no longer has succeeds.
    pub async fn delete_cell(&self, worker: &Worker, cell_id: &str) -> HostResult<()> {
        self.client()?.delete_cell(&worker.session_id, cell_id).await
    }

    /// Runs code in a transient cell that never becomes part of the notebook.
    pub async fn execute_code_ephemeral(&self, worker: &Worker, code: &str) -> HostResult<CellResult> {
        self.client()?.run_ephemeral(&worker.session_id, code).await
    }

    /// Release the session for `path`. Closing a path that is not open is a
    /// no-op. The close event fires even when releasing remotely fails.
    pub async fn close_notebook(&self, path: impl AsRef<Path>) -> HostResult<()> {
        let key = normalize(path.as_ref());
        let _release = PathLockRelease {
            locks: &self.path_locks,
            key: &key,
        };
        let lock = self.path_lock(&key);
        let _held = lock.lock().await;

        let Some((_, worker)) = self.workers.remove(&key) else {
            debug!(path = %key.display(), "close of notebook that is not open");
            return Ok(());
        };
        let released = match self.client() {
            Ok(client) => client.close_session(&worker.session_id).await,
            Err(_) => Ok(()),
        };
        info!(path = %key.display(), session = %worker.session_id, "notebook closed");
        self.events.emit(NotebookEvent::NotebookClosed { path: key.clone() });
        released
    }

    /// Publish a cell change driven from outside this manager.
    pub fn emit_cell_updated(&self, path: impl AsRef<Path>, cell_id: &str) {
        self.events.emit(NotebookEvent::CellUpdated {
            path: normalize(path.as_ref()),
            cell_id: cell_id.to_string(),
        });
    }

    pub fn on(&self, kind: EventKind, listener: Listener) {
        self.events.on(kind, listener);
    }

    pub fn off(&self, kind: EventKind, listener: &Listener) {
        self.events.off(kind, listener);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<NotebookEvent> {
        self.events.subscribe()
    }

    /// Release every session and drop the connection. Safe to call when never
    /// connected; failures to release are logged.
    pub async fn dispose(&self) {
        let client = self.client_slot_mut().take();
        let keys: Vec<PathBuf> = self.workers.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            let Some((_, worker)) = self.workers.remove(&key) else {
                continue;
            };
            if let Some(client) = &client {
                if let Err(err) = client.close_session(&worker.session_id).await {
                    warn!(session = %worker.session_id, "failed to release session: {err}");
                }
            }
            self.events.emit(NotebookEvent::NotebookClosed { path: key });
        }
        self.path_locks.clear();
        if client.is_some() {
            info!("session manager disposed");
        }
    }
}

fn normalize(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Removes a path's lock entry once the last user lets go of it. Declared
/// before the lock so it drops after the guard and the `Arc`.
struct PathLockRelease<'a> {
    locks: &'a DashMap<PathBuf, Arc<Mutex<()>>>,
    key: &'a Path,
}

impl Drop for PathLockRelease<'_> {
    fn drop(&mut self) {
        self.locks
            .remove_if(self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

fn seed_digest(content: &[u8]) -> Vec<u8> {
    Sha256::digest(content).to_vec()
}

async fn read_notebook(path: &Path) -> HostResult<Vec<u8>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(tokio::fs::read(path).await?),
        Ok(_) => Err(HostError::NotebookNotFound(path.to_path_buf())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            Err(HostError::NotebookNotFound(path.to_path_buf()))
        }
        Err(err) => Err(err.into()),
    }
}
