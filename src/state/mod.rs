pub mod hub;
pub mod session;
pub mod state_machine;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, watch};
use uuid::Uuid;

use crate::{
    config::AppConfig,
    dao::{cache::SessionCache, quiz_catalog::QuizCatalog, session_store::SessionStore},
    error::ServiceError,
    services::code_allocator::CodeAllocator,
};

use self::{hub::HubHandle, session::SessionHandle};

pub use self::state_machine::{AbortError, ApplyError, Plan, PlanError, PlanId, Snapshot};

pub type SharedState = Arc<AppState>;

/// Central application state: storage handles, the hub and the live session index.
pub struct AppState {
    session_store: RwLock<Option<Arc<dyn SessionStore>>>,
    degraded: watch::Sender<bool>,
    cache: Arc<dyn SessionCache>,
    catalog: Arc<dyn QuizCatalog>,
    hub: HubHandle,
    sessions: DashMap<Uuid, SessionHandle>,
    codes: DashMap<String, Uuid>,
    quizzes: DashMap<Uuid, Uuid>,
    /// Serializes session creation; also owns the code generator.
    creation_gate: Mutex<CodeAllocator>,
    config: Arc<AppConfig>,
}

impl AppState {
    /// Construct a new [`AppState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    ///
    /// The application starts in degraded mode until a session store is installed.
    pub fn new(
        config: AppConfig,
        cache: Arc<dyn SessionCache>,
        catalog: Arc<dyn QuizCatalog>,
        hub: HubHandle,
    ) -> SharedState {
        let (degraded_tx, _rx) = watch::channel(true);
        Arc::new(Self {
            session_store: RwLock::new(None),
            degraded: degraded_tx,
            cache,
            catalog,
            hub,
            sessions: DashMap::new(),
            codes: DashMap::new(),
            quizzes: DashMap::new(),
            creation_gate: Mutex::new(CodeAllocator::new()),
            config: Arc::new(config),
        })
    }

    /// Obtain a handle to the current session store, if one is installed.
    pub async fn session_store(&self) -> Option<Arc<dyn SessionStore>> {
        let guard = self.session_store.read().await;
        guard.as_ref().cloned()
    }

    /// Current store, or [`ServiceError::Degraded`] while none is installed.
    pub async fn require_store(&self) -> Result<Arc<dyn SessionStore>, ServiceError> {
        self.session_store().await.ok_or(ServiceError::Degraded)
    }

    /// Install a new session store implementation and leave degraded mode.
    pub async fn install_session_store(&self, store: Arc<dyn SessionStore>) {
        {
            let mut guard = self.session_store.write().await;
            *guard = Some(store);
        }
        self.update_degraded(false).await;
    }

    /// Remove the current session store and enter degraded mode.
    pub async fn clear_session_store(&self) {
        {
            let mut guard = self.session_store.write().await;
            guard.take();
        }
        self.update_degraded(true).await;
    }

    /// Current degraded flag: no store installed, or the installed one is failing.
    pub async fn is_degraded(&self) -> bool {
        *self.degraded.borrow()
    }

    /// Subscribe to degraded mode updates.
    pub fn degraded_watcher(&self) -> watch::Receiver<bool> {
        self.degraded.subscribe()
    }

    pub fn cache(&self) -> Arc<dyn SessionCache> {
        self.cache.clone()
    }

    pub fn catalog(&self) -> Arc<dyn QuizCatalog> {
        self.catalog.clone()
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn creation_gate(&self) -> &Mutex<CodeAllocator> {
        &self.creation_gate
    }

    pub fn session_by_id(&self, id: Uuid) -> Option<SessionHandle> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    pub fn session_by_code(&self, code: &str) -> Option<SessionHandle> {
        let id = *self.codes.get(code)?.value();
        self.session_by_id(id)
    }

    pub fn session_by_quiz(&self, quiz_id: Uuid) -> Option<SessionHandle> {
        let id = *self.quizzes.get(&quiz_id)?.value();
        self.session_by_id(id)
    }

    /// Join codes currently held by live sessions.
    pub fn live_codes(&self) -> std::collections::HashSet<String> {
        self.codes.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn live_session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Add a live session to the index. Callers hold the creation gate.
    pub fn index_session(&self, handle: SessionHandle) {
        self.codes.insert(handle.code.clone(), handle.id);
        self.quizzes.insert(handle.quiz_id, handle.id);
        self.sessions.insert(handle.id, handle);
    }

    /// Drop a session from the index, releasing its code and quiz slot.
    pub fn remove_session(&self, id: Uuid) -> Option<SessionHandle> {
        let (_, handle) = self.sessions.remove(&id)?;
        self.codes.remove_if(&handle.code, |_, owner| *owner == id);
        self.quizzes.remove_if(&handle.quiz_id, |_, owner| *owner == id);
        Some(handle)
    }

    /// Update and broadcast the degraded flag when the value changes.
    pub async fn update_degraded(&self, value: bool) {
        if *self.degraded.borrow() == value {
            return;
        }

        self.degraded.send_replace(value);
    }
}
