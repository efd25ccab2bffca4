//! Capability rules — ordered `path pattern → capability` table.

use serde::{Deserialize, Serialize};

/// Schedule a job derived from the intent.
pub const SCHEDULER_JOB_RUN: &str = "scheduler.job.run";
/// Inbound webhooks. Resolves, but has no handler.
pub const WEBHOOK_RECEIVE: &str = "webhook.receive";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRule {
    /// Substring looked for in the intent path.
    pub pattern: String,
    pub capability: String,
}

/// Rules are checked in insertion order; the first match wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilityRules {
    rules: Vec<CapabilityRule>,
}

impl CapabilityRules {
    /// Empty table. Every path is unresolved.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// "/jobs" and "/tasks" schedule jobs, "/webhook" receives webhooks.
    pub fn standard() -> Self {
        Self::empty()
            .with_rule("/jobs", SCHEDULER_JOB_RUN)
            .with_rule("/tasks", SCHEDULER_JOB_RUN)
            .with_rule("/webhook", WEBHOOK_RECEIVE)
    }

    pub fn with_rule(mut self, pattern: &str, capability: &str) -> Self {
        self.push(pattern, capability);
        self
    }

    pub fn push(&mut self, pattern: &str, capability: &str) {
        self.rules.push(CapabilityRule {
            pattern: pattern.to_string(),
            capability: capability.to_string(),
        });
    }

    pub fn resolve(&self, path: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|rule| path.contains(&rule.pattern))
            .map(|rule| rule.capability.as_str())
    }

    pub fn rules(&self) -> &[CapabilityRule] {
        &self.rules
    }
}
