//! Ledger data model
//!
//! The whole [`LedgerData`] aggregate is the unit of durability: it is
//! loaded once, mutated in memory, and written back after every mutation.
//! Field names serialize in camelCase so the file stays readable by the
//! dashboards that consume `learning.json`.

use ags_core::{AgsError, ErrorKind, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Improvement log capacity; oldest entries are evicted first
pub const MAX_IMPROVEMENTS: usize = 100;

/// Learned strategies kept per `agent:message` key
pub const MAX_STRATEGIES_PER_PATTERN: usize = 5;

/// Everything the ledger persists
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerData {
    /// Keyed by `agent:error_kind`
    pub error_patterns: BTreeMap<String, ErrorPatternRecord>,
    /// Keyed by agent name
    pub agent_health: BTreeMap<String, AgentHealthRecord>,
    /// Keyed by `agent:error message`, most useful strategy first
    #[serde(default)]
    pub recovery_strategies: BTreeMap<String, Vec<String>>,
    /// Append-only, capped at [`MAX_IMPROVEMENTS`]
    #[serde(default)]
    pub improvements: Vec<Improvement>,
}

impl LedgerData {
    /// Structural checks applied to anything read from disk
    pub fn validate(&self) -> Result<()> {
        for (agent, health) in &self.agent_health {
            if !health.success_rate.is_finite() || !(0.0..=1.0).contains(&health.success_rate) {
                return Err(AgsError::InvalidLedger(format!(
                    "success rate for {} out of range: {}",
                    agent, health.success_rate
                )));
            }
        }
        if self.improvements.len() > MAX_IMPROVEMENTS {
            return Err(AgsError::InvalidLedger(format!(
                "{} improvements exceed the cap of {}",
                self.improvements.len(),
                MAX_IMPROVEMENTS
            )));
        }
        Ok(())
    }

    /// Parse and validate serialized ledger content
    pub fn from_json(content: &str) -> Result<Self> {
        let data: Self = serde_json::from_str(content)?;
        data.validate()?;
        Ok(data)
    }
}

/// Success/failure statistics for one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHealthRecord {
    /// Exponential moving average in [0, 1]
    pub success_rate: f64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    /// Reset to zero by any success
    pub consecutive_failures: u32,
}

impl Default for AgentHealthRecord {
    fn default() -> Self {
        Self {
            success_rate: 1.0,
            last_success: None,
            last_failure: None,
            consecutive_failures: 0,
        }
    }
}

impl AgentHealthRecord {
    pub(crate) fn apply_failure(&mut self, at: DateTime<Utc>) {
        self.last_failure = Some(at);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.success_rate *= 0.9;
    }

    pub(crate) fn apply_success(&mut self, at: DateTime<Utc>) {
        self.last_success = Some(at);
        self.consecutive_failures = 0;
        self.success_rate = (self.success_rate * 0.95 + 0.05).min(1.0);
    }
}

/// How often one kind of error has hit one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPatternRecord {
    pub count: u32,
    pub last_occurred: DateTime<Utc>,
    /// Cached diagnostic, set once the pattern has recurred
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
}

/// Effect of a recorded change to the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Impact {
    Positive,
    Negative,
    Neutral,
}

impl std::fmt::Display for Impact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Positive => write!(f, "positive"),
            Self::Negative => write!(f, "negative"),
            Self::Neutral => write!(f, "neutral"),
        }
    }
}

/// One entry of the improvement log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Improvement {
    pub timestamp: DateTime<Utc>,
    pub change: String,
    pub impact: Impact,
}

/// Ledger key for an error pattern
pub fn pattern_key(agent: &str, kind: ErrorKind) -> String {
    format!("{}:{}", agent, kind.as_str())
}

/// Ledger key for a learned recovery strategy
pub fn strategy_key(agent: &str, message: &str) -> String {
    format!("{}:{}", agent, message)
}
