//! Configuration for context condensation.

use crate::types::TaskSettings;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Controls when and how history is condensed or truncated.
///
/// # Example
///
/// ```
/// use agent_task::context::CondenseConfig;
///
/// let config = CondenseConfig::default()
///     .with_threshold_percent(80)
///     .with_messages_to_keep(4);
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CondenseConfig {
    /// Summarize automatically once the threshold is reached.
    /// Default: true
    pub auto_condense: bool,

    /// Context usage percentage that triggers summarization.
    /// Default: 100
    pub threshold_percent: u8,

    /// Per-profile threshold overrides. Values outside 5..=100 are ignored.
    pub profile_thresholds: HashMap<String, u8>,

    /// Profile whose override applies.
    pub profile_id: String,

    /// Replaces the built-in summarization instructions.
    pub custom_prompt: Option<String>,

    /// Most recent messages kept verbatim by a summary.
    /// Default: 3
    pub messages_to_keep: usize,

    /// Share of the context window held back as a safety margin.
    /// Default: 10
    pub buffer_percent: u8,

    /// Output budget reserved when the model declares none.
    /// Default: 8192
    pub default_max_tokens: u64,
}

impl Default for CondenseConfig {
    fn default() -> Self {
        Self {
            auto_condense: true,
            threshold_percent: 100,
            profile_thresholds: HashMap::new(),
            profile_id: String::from("default"),
            custom_prompt: None,
            messages_to_keep: 3,
            buffer_percent: 10,
            default_max_tokens: 8192,
        }
    }
}

impl CondenseConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive the configuration from live settings for a profile.
    #[must_use]
    pub fn from_settings(settings: &TaskSettings, profile_id: &str) -> Self {
        Self {
            auto_condense: settings.auto_condense_context,
            threshold_percent: settings.auto_condense_context_percent,
            profile_thresholds: settings.profile_thresholds.clone(),
            profile_id: profile_id.to_string(),
            custom_prompt: settings.custom_condensing_prompt.clone(),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_auto_condense(mut self, auto: bool) -> Self {
        self.auto_condense = auto;
        self
    }

    #[must_use]
    pub const fn with_threshold_percent(mut self, percent: u8) -> Self {
        self.threshold_percent = percent;
        self
    }

    #[must_use]
    pub const fn with_messages_to_keep(mut self, count: usize) -> Self {
        self.messages_to_keep = count;
        self
    }

    #[must_use]
    pub fn with_custom_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.custom_prompt = Some(prompt.into());
        self
    }

    /// Threshold for the active profile, falling back to the global value.
    #[must_use]
    pub fn effective_threshold(&self) -> u8 {
        match self.profile_thresholds.get(&self.profile_id) {
            Some(&percent) if (5..=100).contains(&percent) => percent,
            Some(&percent) => {
                log::warn!(
                    "Ignoring out-of-range condense threshold profile={} percent={percent}",
                    self.profile_id
                );
                self.threshold_percent
            }
            None => self.threshold_percent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CondenseConfig::default();
        assert!(config.auto_condense);
        assert_eq!(config.threshold_percent, 100);
        assert_eq!(config.messages_to_keep, 3);
        assert_eq!(config.default_max_tokens, 8192);
    }

    #[test]
    fn test_profile_threshold_override() {
        let mut config = CondenseConfig::default().with_threshold_percent(90);
        config.profile_id = "fast".to_string();
        config.profile_thresholds.insert("fast".to_string(), 60);
        config.profile_thresholds.insert("other".to_string(), 20);
        assert_eq!(config.effective_threshold(), 60);

        config.profile_thresholds.insert("fast".to_string(), 2);
        assert_eq!(config.effective_threshold(), 90);
    }

    #[test]
    fn test_from_settings() {
        let settings = TaskSettings {
            auto_condense_context: false,
            auto_condense_context_percent: 75,
            custom_condensing_prompt: Some("be brief".to_string()),
            ..TaskSettings::default()
        };
        let config = CondenseConfig::from_settings(&settings, "default");
        assert!(!config.auto_condense);
        assert_eq!(config.effective_threshold(), 75);
        assert_eq!(config.custom_prompt.as_deref(), Some("be brief"));
    }
}
