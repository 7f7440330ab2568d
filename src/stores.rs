//! Storage trait for task message logs and metadata.
//!
//! A task persists two logs:
//!
//! - the model-facing API history ([`ApiMessage`]s)
//! - the human-facing UI history ([`UiMessage`]s)
//!
//! plus a [`HistoryItem`] derived from them on every UI save.
//!
//! # Built-in Implementation
//!
//! [`InMemoryTaskStore`] is suitable for testing and single-process
//! deployments. For production, implement [`TaskPersistence`] against your
//! own storage backend.

use crate::llm::ApiMessage;
use crate::messages::UiMessage;
use crate::types::{HistoryItem, TaskId};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

#[async_trait]
pub trait TaskPersistence: Send + Sync {
    /// Replace the stored API history for a task.
    async fn save_api_messages(&self, task_id: &TaskId, messages: &[ApiMessage]) -> Result<()>;

    async fn load_api_messages(&self, task_id: &TaskId) -> Result<Vec<ApiMessage>>;

    /// Replace the stored UI history for a task.
    async fn save_ui_messages(&self, task_id: &TaskId, messages: &[UiMessage]) -> Result<()>;

    async fn load_ui_messages(&self, task_id: &TaskId) -> Result<Vec<UiMessage>>;

    async fn save_history_item(&self, item: &HistoryItem) -> Result<()>;

    async fn load_history_item(&self, task_id: &TaskId) -> Result<Option<HistoryItem>>;
}

#[derive(Default)]
pub struct InMemoryTaskStore {
    api: RwLock<HashMap<String, Vec<ApiMessage>>>,
    ui: RwLock<HashMap<String, Vec<UiMessage>>>,
    history: RwLock<HashMap<String, HistoryItem>>,
}

impl InMemoryTaskStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskPersistence for InMemoryTaskStore {
    async fn save_api_messages(&self, task_id: &TaskId, messages: &[ApiMessage]) -> Result<()> {
        self.api
            .write()
            .ok()
            .context("lock poisoned")?
            .insert(task_id.0.clone(), messages.to_vec());
        Ok(())
    }

    async fn load_api_messages(&self, task_id: &TaskId) -> Result<Vec<ApiMessage>> {
        let api = self.api.read().ok().context("lock poisoned")?;
        Ok(api.get(&task_id.0).cloned().unwrap_or_default())
    }

    async fn save_ui_messages(&self, task_id: &TaskId, messages: &[UiMessage]) -> Result<()> {
        self.ui
            .write()
            .ok()
            .context("lock poisoned")?
            .insert(task_id.0.clone(), messages.to_vec());
        Ok(())
    }

    async fn load_ui_messages(&self, task_id: &TaskId) -> Result<Vec<UiMessage>> {
        let ui = self.ui.read().ok().context("lock poisoned")?;
        Ok(ui.get(&task_id.0).cloned().unwrap_or_default())
    }

    async fn save_history_item(&self, item: &HistoryItem) -> Result<()> {
        self.history
            .write()
            .ok()
            .context("lock poisoned")?
            .insert(item.id.0.clone(), item.clone());
        Ok(())
    }

    async fn load_history_item(&self, task_id: &TaskId) -> Result<Option<HistoryItem>> {
        let history = self.history.read().ok().context("lock poisoned")?;
        Ok(history.get(&task_id.0).cloned())
    }
}
