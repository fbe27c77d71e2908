use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    error::EvalError,
    types::TurnRecord,
};

/// Persistence for conversation turns, keyed by task id. Mirroring
/// turns into the store is observational: the driver's conversation
/// state is authoritative and store failures never fail a task.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn append(&self, task_id: &str, turn: TurnRecord) -> Result<(), EvalError>;

    async fn list(&self, task_id: &str) -> Result<Vec<TurnRecord>, EvalError>;

    /// Drops every stored conversation. The runner calls this once
    /// before a batch so trials never read stale turns.
    async fn clear_all(&self) -> Result<(), EvalError>;
}

/// In-memory store, suitable for tests and single-process runs.
#[derive(Default)]
pub struct InMemoryConversationStore {
    conversations: RwLock<HashMap<String, Vec<TurnRecord>>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn append(&self, task_id: &str, turn: TurnRecord) -> Result<(), EvalError> {
        let mut conversations = self.conversations.write().await;
        conversations
            .entry(task_id.to_string())
            .or_default()
            .push(turn);
        Ok(())
    }

    async fn list(&self, task_id: &str) -> Result<Vec<TurnRecord>, EvalError> {
        let conversations = self.conversations.read().await;
        Ok(conversations.get(task_id).cloned().unwrap_or_default())
    }

    async fn clear_all(&self) -> Result<(), EvalError> {
        self.conversations.write().await.clear();
        Ok(())
    }
}
