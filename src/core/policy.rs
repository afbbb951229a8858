//! Orchestration policy: retry ceiling, step timeouts and prompt limits.
//!
//! Loaded from the `policy:` section of the config file, or from standalone
//! YAML in tests.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::safety::SqlSafetyPolicy;
use crate::domain::StepName;

/// Limits applied to every request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Retries allowed after the first generation attempt, shared by
    /// validation and execution failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Timeout for any step without an override
    #[serde(default = "default_step_timeout")]
    pub step_timeout_seconds: u64,

    /// Per-step overrides, keyed by step name
    #[serde(default)]
    pub step_timeouts: HashMap<StepName, u64>,

    /// Characters of serialized rows shown to the synthesis prompt
    #[serde(default = "default_synthesis_context_chars")]
    pub synthesis_context_chars: usize,

    /// Finished turns kept per thread; the oldest are dropped first
    #[serde(default = "default_max_turns_per_thread")]
    pub max_turns_per_thread: usize,

    /// Threads kept in memory; idle threads untouched the longest are dropped
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,

    #[serde(default)]
    pub safety: SqlSafetyPolicy,
}

fn default_max_retries() -> u32 {
    3
}
fn default_step_timeout() -> u64 {
    60
}
fn default_synthesis_context_chars() -> usize {
    10_000
}
fn default_max_turns_per_thread() -> usize {
    100
}
fn default_max_threads() -> usize {
    10_000
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            step_timeout_seconds: default_step_timeout(),
            step_timeouts: HashMap::new(),
            synthesis_context_chars: default_synthesis_context_chars(),
            max_turns_per_thread: default_max_turns_per_thread(),
            max_threads: default_max_threads(),
            safety: SqlSafetyPolicy::default(),
        }
    }
}

impl Policy {
    /// Parse a policy from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        let policy: Policy = serde_yaml::from_str(content).context("Failed to parse policy YAML")?;
        policy.validate()?;
        Ok(policy)
    }

    /// Reject settings that would stall or disable the pipeline
    pub fn validate(&self) -> Result<()> {
        if self.step_timeout_seconds == 0 {
            anyhow::bail!("step_timeout_seconds must be greater than zero");
        }
        if let Some((step, _)) = self.step_timeouts.iter().find(|(_, secs)| **secs == 0) {
            anyhow::bail!("timeout override for step '{}' must be greater than zero", step);
        }
        if self.max_turns_per_thread == 0 || self.max_threads == 0 {
            anyhow::bail!("max_turns_per_thread and max_threads must be greater than zero");
        }
        if self.safety.denylist.is_empty() {
            anyhow::bail!("safety denylist cannot be empty");
        }
        Ok(())
    }

    /// Effective timeout for a step
    pub fn timeout(&self, step: StepName) -> Duration {
        let seconds = self
            .step_timeouts
            .get(&step)
            .copied()
            .unwrap_or(self.step_timeout_seconds);
        Duration::from_secs(seconds)
    }

    /// Whether another generation attempt is allowed at this retry count
    pub fn has_retry_budget(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Override the timeout of one step
    pub fn with_step_timeout(mut self, step: StepName, timeout: Duration) -> Self {
        self.step_timeouts.insert(step, timeout.as_secs().max(1));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = Policy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.timeout(StepName::Generation), Duration::from_secs(60));
        assert_eq!(policy.synthesis_context_chars, 10_000);
        assert_eq!(policy.max_turns_per_thread, 100);
        assert_eq!(policy.max_threads, 10_000);
    }

    #[test]
    fn test_zero_history_limits_are_rejected() {
        assert!(Policy::from_yaml("max_turns_per_thread: 0").is_err());
        assert!(Policy::from_yaml("max_threads: 0").is_err());
        assert_eq!(Policy::from_yaml("max_turns_per_thread: 5").unwrap().max_turns_per_thread, 5);
    }

    #[test]
    fn test_policy_parsing() {
        let yaml = r#"
max_retries: 2
step_timeout_seconds: 30
step_timeouts:
  generation: 90
  execution: 10
"#;
        let policy = Policy::from_yaml(yaml).unwrap();

        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.timeout(StepName::Generation), Duration::from_secs(90));
        assert_eq!(policy.timeout(StepName::Execution), Duration::from_secs(10));
        assert_eq!(policy.timeout(StepName::Routing), Duration::from_secs(30));
        assert_eq!(policy.safety, SqlSafetyPolicy::default());
    }

    #[test]
    fn test_unknown_step_in_overrides_is_rejected() {
        let yaml = r#"
step_timeouts:
  sql_generator: 5
"#;
        assert!(Policy::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        assert!(Policy::from_yaml("step_timeout_seconds: 0").is_err());
        assert!(Policy::from_yaml("step_timeouts:\n  synthesis: 0").is_err());
    }

    #[test]
    fn test_retry_budget() {
        let policy = Policy::default();
        assert!(policy.has_retry_budget(0));
        assert!(policy.has_retry_budget(2));
        assert!(!policy.has_retry_budget(3));

        let none = Policy {
            max_retries: 0,
            ..Default::default()
        };
        assert!(!none.has_retry_budget(0));
    }
}
