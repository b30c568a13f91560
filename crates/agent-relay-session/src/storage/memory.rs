//! In-memory token storage.

use std::{collections::HashMap, sync::RwLock};

use agent_relay_core::{AgentId, StorageError, TokenStore};
use async_trait::async_trait;

/// In-memory token store.
///
/// Useful for tests and single-process deployments.
/// Tokens are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    tokens: RwLock<HashMap<AgentId, String>>,
}

impl MemoryTokenStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn read(&self, id: &AgentId) -> Result<Option<String>, StorageError> {
        Ok(self
            .tokens
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .get(id)
            .cloned())
    }

    async fn write(&self, id: &AgentId, token: &str) -> Result<(), StorageError> {
        self.tokens
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .insert(id.clone(), token.to_string());
        Ok(())
    }

    async fn clear(&self, id: &AgentId) -> Result<(), StorageError> {
        self.tokens
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .remove(id);
        Ok(())
    }
}
