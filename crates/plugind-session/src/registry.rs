use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use plugind_types::{DaemonError, PluginAccessType, PluginDeclaration, PluginUniqueIdentifier};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use crate::stream::{bounded_stream, BoundedStreamReader, BoundedStreamWriter};

/// Inbound chunk channel capacity.
pub const INBOUND_CAPACITY: usize = 128;

/// Sessions idle longer than this are reclaimed by the janitor and carry a
/// hard deadline regardless of activity.
pub const SESSION_TTL: Duration = Duration::from_secs(240);

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session {0} already exists")]
    AlreadyExists(Uuid),
    #[error("session {0} not found")]
    NotFound(Uuid),
}

impl From<SessionError> for DaemonError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::AlreadyExists(id) => {
                DaemonError::BadRequest(format!("session {id} already exists"))
            }
            SessionError::NotFound(id) => DaemonError::NotFound(format!("session {id}")),
        }
    }
}

/// Pushes a framed request to the runtime that owns a session.
#[async_trait]
pub trait SessionWriter: Send + Sync {
    async fn write(&self, session_id: Uuid, data: &[u8]) -> Result<(), DaemonError>;
}

/// Short-lived correlation context binding an upstream caller, a plugin
/// runtime, and any backwards invocations made on its behalf.
pub struct Session {
    pub id: Uuid,
    pub tenant_id: String,
    pub user_id: String,
    pub plugin_identifier: PluginUniqueIdentifier,
    pub declaration: Arc<PluginDeclaration>,
    pub access_type: PluginAccessType,
    pub action: String,
    pub endpoint_id: Option<String>,
    inbound_tx: BoundedStreamWriter<Vec<u8>>,
    inbound_rx: Mutex<Option<BoundedStreamReader<Vec<u8>>>>,
    closed: AtomicBool,
    created_at: Instant,
    last_active: Mutex<Instant>,
    writer: Arc<dyn SessionWriter>,
}

impl Session {
    /// Takes ownership of the inbound-chunk reader; callable once.
    pub async fn take_inbound(&self) -> Option<BoundedStreamReader<Vec<u8>>> {
        self.inbound_rx.lock().await.take()
    }

    pub async fn push_inbound(&self, chunk: Vec<u8>) {
        self.touch().await;
        self.inbound_tx.write(chunk).await;
    }

    pub async fn write(&self, data: &[u8]) -> Result<(), DaemonError> {
        self.touch().await;
        self.writer.write(self.id, data).await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn idle_for(&self) -> Duration {
        self.last_active.lock().await.elapsed()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    async fn touch(&self) {
        *self.last_active.lock().await = Instant::now();
    }
}

/// `session_id -> Session` map with TTL-based janitor cleanup.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
    on_close: Mutex<Vec<Arc<dyn Fn(&Session) + Send + Sync>>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            on_close: Mutex::new(Vec::new()),
        }
    }

    pub async fn add_on_close(&self, f: impl Fn(&Session) + Send + Sync + 'static) {
        self.on_close.lock().await.push(Arc::new(f));
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn open(
        &self,
        id: Uuid,
        tenant_id: String,
        user_id: String,
        plugin_identifier: PluginUniqueIdentifier,
        declaration: Arc<PluginDeclaration>,
        access_type: PluginAccessType,
        action: String,
        endpoint_id: Option<String>,
        writer: Arc<dyn SessionWriter>,
    ) -> Result<Arc<Session>, SessionError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&id) {
            return Err(SessionError::AlreadyExists(id));
        }
        let (tx, rx) = bounded_stream(INBOUND_CAPACITY);
        let session = Arc::new(Session {
            id,
            tenant_id,
            user_id,
            plugin_identifier,
            declaration,
            access_type,
            action,
            endpoint_id,
            inbound_tx: tx,
            inbound_rx: Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
            created_at: Instant::now(),
            last_active: Mutex::new(Instant::now()),
            writer,
        });
        sessions.insert(id, session.clone());
        Ok(session)
    }

    pub async fn find(&self, id: Uuid) -> Result<Arc<Session>, SessionError> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(SessionError::NotFound(id))
    }

    /// Drains-and-closes the sink, removes the entry, and invokes every
    /// registered `on_close` callback exactly once.
    pub async fn close(&self, id: Uuid) -> Result<(), SessionError> {
        let session = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(&id).ok_or(SessionError::NotFound(id))?
        };
        if session
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            session.inbound_tx.close();
            let callbacks = self.on_close.lock().await.clone();
            for cb in callbacks {
                cb(&session);
            }
        }
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Closes every session idle for longer than `ttl`. Intended to be
    /// driven by a periodic background task.
    pub async fn reap_idle(&self, ttl: Duration) {
        let mut to_close = Vec::new();
        for (id, session) in self.sessions.read().await.iter() {
            if session.idle_for().await > ttl || session.age() > SESSION_TTL {
                to_close.push(*id);
            }
        }
        for id in to_close {
            let _ = self.close(id).await;
        }
    }

    /// Spawns the periodic janitor task; returns a handle to abort it.
    pub fn spawn_janitor(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                registry.reap_idle(SESSION_TTL).await;
            }
        })
    }
}
