use crate::llm::ContentBlock;
use crate::types::TaskSettings;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::{PoisonError, RwLock};

/// Host environment the task builds requests from.
///
/// Implementations resolve mentions and attachments in user content, render
/// environment details (open files, terminals, time) and supply the system
/// prompt for a mode.
#[async_trait]
pub trait TaskEnvironment: Send + Sync {
    /// System prompt for the given mode.
    ///
    /// # Errors
    /// Returns an error if the prompt cannot be generated.
    async fn system_prompt(&self, mode: &str) -> Result<String>;

    /// Expand mentions and attachments. Defaults to passing content through.
    async fn resolve_user_content(&self, content: Vec<ContentBlock>) -> Result<Vec<ContentBlock>> {
        Ok(content)
    }

    /// Environment details appended to each user turn.
    async fn environment_details(&self, _include_file_details: bool) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Environment with an empty system prompt and no details.
pub struct NullEnvironment;

#[async_trait]
impl TaskEnvironment for NullEnvironment {
    async fn system_prompt(&self, _mode: &str) -> Result<String> {
        Ok(String::new())
    }
}

/// Source of live settings and the mode switch callback.
#[async_trait]
pub trait ModeProvider: Send + Sync {
    async fn settings(&self) -> TaskSettings;

    /// Switch the active mode.
    ///
    /// # Errors
    /// Returns an error if the mode is unknown or the switch failed.
    async fn switch_mode(&self, mode: &str) -> Result<()>;

    async fn current_mode(&self) -> String {
        self.settings().await.mode
    }
}

/// Mode provider holding settings in memory.
#[derive(Default)]
pub struct StaticModeProvider {
    settings: RwLock<TaskSettings>,
}

impl StaticModeProvider {
    #[must_use]
    pub const fn new(settings: TaskSettings) -> Self {
        Self {
            settings: RwLock::new(settings),
        }
    }

    /// Apply a change to the held settings.
    pub fn update(&self, change: impl FnOnce(&mut TaskSettings)) {
        let mut settings = self
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        change(&mut settings);
    }
}

#[async_trait]
impl ModeProvider for StaticModeProvider {
    async fn settings(&self) -> TaskSettings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn switch_mode(&self, mode: &str) -> Result<()> {
        self.update(|settings| mode.clone_into(&mut settings.mode));
        Ok(())
    }
}
