//! Registry of agent sessions, keyed by agent id.

use std::{collections::HashMap, sync::Arc};

use agent_relay_core::{
    AgentConfig, AgentId, BootstrapProvider, ConfigError, NoBootstrap, SessionError, TokenStore,
    TracingUsageSink, UsageSink,
};
use tokio::sync::RwLock;

use crate::{AgentSession, storage::MemoryTokenStore};

/// Session manager error.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("Session not found: {0}")]
    NotFound(AgentId),
}

/// Opens one [`AgentSession`] per agent id on first address and shares
/// collaborators between them.
///
/// Sessions are independent; the registry lock is only held while looking
/// up, opening or removing an entry.
pub struct SessionManager {
    tokens: Arc<dyn TokenStore>,
    bootstrap: Arc<dyn BootstrapProvider>,
    usage: Arc<dyn UsageSink>,
    sessions: RwLock<HashMap<AgentId, AgentSession>>,
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(Arc::new(MemoryTokenStore::new()))
    }
}

impl SessionManager {
    /// Create a manager persisting tokens in `tokens`.
    #[must_use]
    pub fn new(tokens: Arc<dyn TokenStore>) -> Self {
        Self {
            tokens,
            bootstrap: Arc::new(NoBootstrap),
            usage: Arc::new(TracingUsageSink),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Use `bootstrap` for sessions opened from now on.
    #[must_use]
    pub fn with_bootstrap(mut self, bootstrap: Arc<dyn BootstrapProvider>) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    /// Use `usage` for sessions opened from now on.
    #[must_use]
    pub fn with_usage_sink(mut self, usage: Arc<dyn UsageSink>) -> Self {
        self.usage = usage;
        self
    }

    /// Return the session for `config.agent_id`, opening it if needed.
    ///
    /// An already open session is returned as is; `config` only applies
    /// when the session is first opened.
    ///
    /// # Errors
    /// Returns error if the config is invalid.
    pub async fn get_or_open(&self, config: AgentConfig) -> Result<AgentSession, ManagerError> {
        if let Some(session) = self.get(&config.agent_id).await {
            return Ok(session);
        }

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get(&config.agent_id) {
            return Ok(session.clone());
        }

        let id = config.agent_id.clone();
        let session = AgentSession::builder(config)
            .token_store(Arc::clone(&self.tokens))
            .bootstrap(Arc::clone(&self.bootstrap))
            .usage_sink(Arc::clone(&self.usage))
            .open()
            .await?;
        sessions.insert(id, session.clone());
        Ok(session)
    }

    /// Get an open session.
    pub async fn get(&self, id: &AgentId) -> Option<AgentSession> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Ids of all open sessions.
    pub async fn ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stop a session and forget it. Its persisted token is kept.
    ///
    /// # Errors
    /// Returns error if no session is open under `id`.
    pub async fn remove(&self, id: &AgentId) -> Result<(), ManagerError> {
        let session = self
            .sessions
            .write()
            .await
            .remove(id)
            .ok_or_else(|| ManagerError::NotFound(id.clone()))?;
        session.stop().await?;
        Ok(())
    }

    /// Stop every open session, keeping them registered.
    pub async fn stop_all(&self) {
        let sessions: Vec<AgentSession> = self.sessions.read().await.values().cloned().collect();
        let results = futures::future::join_all(sessions.iter().map(|session| session.stop())).await;
        for (session, result) in sessions.iter().zip(results) {
            if let Err(e) = result {
                tracing::warn!(agent_id = %session.id(), "Failed to stop session: {e}");
            }
        }
    }
}
