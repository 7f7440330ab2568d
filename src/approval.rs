//! Auto-approval limits.
//!
//! When auto-approval is on, the task proceeds without confirmation until
//! either the number of requests or their accumulated cost since the last
//! reset passes the configured maximum. At that point the task escalates to
//! an `auto_approval_max_req_reached` ask; an affirmative answer resets the
//! window, anything else ends the task.

use crate::messages::{SayKind, UiMessage, api_metrics};
use crate::types::TaskSettings;
use serde_json::json;

/// Which limit was passed.
#[derive(Clone, Debug, PartialEq)]
pub enum ApprovalLimit {
    Requests { count: u64, limit: u64 },
    Cost { cost: f64, limit: f64 },
}

impl ApprovalLimit {
    /// JSON payload carried by the escalation ask.
    #[must_use]
    pub fn ask_text(&self) -> String {
        match self {
            Self::Requests { count, .. } => json!({ "count": count, "type": "requests" }),
            Self::Cost { cost, .. } => json!({ "count": cost, "type": "cost" }),
        }
        .to_string()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ApprovalDecision {
    Proceed,
    Exceeded(ApprovalLimit),
}

/// Tracks the start of the current auto-approval window in the UI log.
#[derive(Clone, Debug, Default)]
pub struct AutoApprovalLimiter {
    reset_index: usize,
}

impl AutoApprovalLimiter {
    #[must_use]
    pub const fn new() -> Self {
        Self { reset_index: 0 }
    }

    /// Evaluate the limits against UI entries recorded since the last reset.
    #[must_use]
    pub fn check(&self, settings: &TaskSettings, messages: &[UiMessage]) -> ApprovalDecision {
        if !settings.auto_approval_enabled {
            return ApprovalDecision::Proceed;
        }
        let window = messages.get(self.reset_index..).unwrap_or_default();

        if let Some(limit) = settings.allowed_max_requests {
            let count = window
                .iter()
                .filter(|m| m.is_say(SayKind::ApiReqStarted))
                .count() as u64;
            if count > limit {
                return ApprovalDecision::Exceeded(ApprovalLimit::Requests { count, limit });
            }
        }

        if let Some(limit) = settings.allowed_max_cost {
            let cost = api_metrics(window).total_cost;
            if cost > limit {
                return ApprovalDecision::Exceeded(ApprovalLimit::Cost { cost, limit });
            }
        }

        ApprovalDecision::Proceed
    }

    /// Start a new window at `index`.
    pub const fn reset(&mut self, index: usize) {
        self.reset_index = index;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ApiRequestInfo;

    fn request(cost: f64) -> UiMessage {
        UiMessage {
            api_request: Some(ApiRequestInfo {
                cost: Some(cost),
                ..ApiRequestInfo::default()
            }),
            ..UiMessage::say(SayKind::ApiReqStarted)
        }
    }

    fn settings(max_requests: Option<u64>, max_cost: Option<f64>) -> TaskSettings {
        TaskSettings {
            auto_approval_enabled: true,
            allowed_max_requests: max_requests,
            allowed_max_cost: max_cost,
            ..TaskSettings::default()
        }
    }

    #[test]
    fn disabled_auto_approval_always_proceeds() {
        let limiter = AutoApprovalLimiter::new();
        let messages = vec![request(1.0); 10];
        let settings = TaskSettings {
            auto_approval_enabled: false,
            ..settings(Some(1), Some(0.1))
        };
        assert_eq!(limiter.check(&settings, &messages), ApprovalDecision::Proceed);
    }

    #[test]
    fn request_count_over_limit_escalates() {
        let limiter = AutoApprovalLimiter::new();
        let settings = settings(Some(2), None);

        assert_eq!(
            limiter.check(&settings, &vec![request(0.0); 2]),
            ApprovalDecision::Proceed
        );
        assert_eq!(
            limiter.check(&settings, &vec![request(0.0); 3]),
            ApprovalDecision::Exceeded(ApprovalLimit::Requests { count: 3, limit: 2 })
        );
    }

    #[test]
    fn reset_starts_a_new_window() {
        let mut limiter = AutoApprovalLimiter::new();
        let settings = settings(Some(2), None);
        let mut messages = vec![request(0.0); 3];

        limiter.reset(messages.len());
        messages.push(request(0.0));
        assert_eq!(limiter.check(&settings, &messages), ApprovalDecision::Proceed);
    }

    #[test]
    fn accumulated_cost_over_limit_escalates() {
        let limiter = AutoApprovalLimiter::new();
        let settings = settings(None, Some(1.0));
        let messages = vec![request(0.4), request(0.4), request(0.4)];

        match limiter.check(&settings, &messages) {
            ApprovalDecision::Exceeded(ApprovalLimit::Cost { cost, limit }) => {
                assert!(cost > limit);
            }
            other => panic!("expected cost limit, got {other:?}"),
        }
    }

    #[test]
    fn ask_text_is_json() {
        let text = ApprovalLimit::Requests { count: 5, limit: 4 }.ask_text();
        let value: serde_json::Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value["count"], 5);
    }
}
