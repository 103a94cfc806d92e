//! The health ledger
//!
//! [`HealthLedger`] owns the in-memory [`LedgerData`] and writes it back to
//! its storage after every mutation. It records outcomes and answers health
//! queries; deciding what to do with those answers is left to the callers.

use ags_core::{AgentError, ErrorKind, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::model::{
    pattern_key, strategy_key, AgentHealthRecord, ErrorPatternRecord, Impact, Improvement,
    LedgerData, MAX_IMPROVEMENTS, MAX_STRATEGIES_PER_PATTERN,
};
use crate::storage::LedgerStorage;

/// Free-form details about a failed call; logged, never persisted
pub type ErrorContext = BTreeMap<String, String>;

/// Pattern count from which a suggested fix is attached
const SUGGESTION_THRESHOLD: u32 = 3;

/// Consecutive failures after which an agent may be skipped
const SKIP_FAILURES: u32 = 5;

/// Health view of one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHealth {
    pub success_rate: f64,
    pub consecutive_failures: u32,
    pub is_healthy: bool,
    pub suggested_action: Option<String>,
}

impl AgentHealth {
    fn from_record(record: &AgentHealthRecord) -> Self {
        let is_healthy =
            record.success_rate > 0.5 && record.consecutive_failures < SKIP_FAILURES;

        let suggested_action = if record.consecutive_failures >= 3 {
            Some("Consider skipping this agent temporarily or using fallback strategy".to_string())
        } else if record.success_rate < 0.3 {
            Some("Agent showing poor performance. Review error patterns and adjust approach".to_string())
        } else {
            None
        };

        Self {
            success_rate: record.success_rate,
            consecutive_failures: record.consecutive_failures,
            is_healthy,
            suggested_action,
        }
    }
}

/// Overall system status derived from the number of unhealthy agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// No unhealthy agents
    Healthy,
    /// One or two unhealthy agents
    Degraded,
    /// Three or more unhealthy agents
    Critical,
}

impl HealthStatus {
    fn from_unhealthy_count(count: usize) -> Self {
        match count {
            0 => Self::Healthy,
            1 | 2 => Self::Degraded,
            _ => Self::Critical,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Snapshot of every agent the ledger knows about
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub unhealthy_agents: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Durable per-agent health bookkeeping
pub struct HealthLedger<S: LedgerStorage> {
    storage: S,
    data: LedgerData,
}

impl<S: LedgerStorage> HealthLedger<S> {
    /// Load the ledger from storage
    pub async fn open(storage: S) -> Result<Self> {
        let data = storage.load().await?;
        debug!(
            agents = data.agent_health.len(),
            patterns = data.error_patterns.len(),
            "Opened health ledger"
        );
        Ok(Self { storage, data })
    }

    /// Record a failed call and persist
    pub async fn record_failure(
        &mut self,
        agent: &str,
        error: &AgentError,
        context: &ErrorContext,
    ) -> Result<()> {
        let now = Utc::now();
        debug!(agent, kind = %error.kind, ?context, "Recording failure: {}", error.message);

        let key = pattern_key(agent, error.kind);
        let pattern = self
            .data
            .error_patterns
            .entry(key.clone())
            .or_insert_with(|| ErrorPatternRecord {
                count: 0,
                last_occurred: now,
                suggested_fix: None,
            });
        pattern.count = pattern.count.saturating_add(1);
        pattern.last_occurred = now;

        if pattern.count >= SUGGESTION_THRESHOLD && pattern.suggested_fix.is_none() {
            if let Some(fix) = error.kind.suggested_fix() {
                info!("Suggested fix for {}: {}", key, fix);
                pattern.suggested_fix = Some(fix.to_string());
            }
        }

        self.data
            .agent_health
            .entry(agent.to_string())
            .or_default()
            .apply_failure(now);

        self.persist().await
    }

    /// Record a successful call and persist
    pub async fn record_success(&mut self, agent: &str) -> Result<()> {
        self.data
            .agent_health
            .entry(agent.to_string())
            .or_default()
            .apply_success(Utc::now());

        self.persist().await
    }

    /// Health view of one agent; unknown agents are healthy
    pub fn agent_health(&self, agent: &str) -> AgentHealth {
        match self.data.agent_health.get(agent) {
            Some(record) => AgentHealth::from_record(record),
            None => AgentHealth::from_record(&AgentHealthRecord::default()),
        }
    }

    /// Raw record of one agent, if it has ever been called
    pub fn agent_record(&self, agent: &str) -> Option<&AgentHealthRecord> {
        self.data.agent_health.get(agent)
    }

    /// Classify every known agent and summarise
    pub fn system_health(&self) -> SystemHealth {
        let mut unhealthy_agents = Vec::new();
        let mut recommendations = Vec::new();

        for (agent, health) in &self.data.agent_health {
            if health.success_rate < 0.5 || health.consecutive_failures >= SKIP_FAILURES {
                unhealthy_agents.push(agent.clone());

                if health.consecutive_failures >= SKIP_FAILURES {
                    recommendations.push(format!(
                        "{} has {} consecutive failures. Consider disabling temporarily.",
                        agent, health.consecutive_failures
                    ));
                } else if health.success_rate < 0.3 {
                    recommendations.push(format!(
                        "{} has low success rate ({:.1}%). Review error patterns.",
                        agent,
                        health.success_rate * 100.0
                    ));
                }
            }
        }

        SystemHealth {
            status: HealthStatus::from_unhealthy_count(unhealthy_agents.len()),
            unhealthy_agents,
            recommendations,
        }
    }

    /// Whether an agent is failing badly enough to be left out
    pub fn should_skip_agent(&self, agent: &str) -> bool {
        let health = self.agent_health(agent);
        !health.is_healthy && health.consecutive_failures >= SKIP_FAILURES
    }

    /// Append to the improvement log, evicting the oldest entries
    pub async fn record_improvement(&mut self, change: impl Into<String>, impact: Impact) -> Result<()> {
        let change = change.into();
        info!("Recorded improvement: {} ({})", change, impact);

        self.data.improvements.push(Improvement {
            timestamp: Utc::now(),
            change,
            impact,
        });
        if self.data.improvements.len() > MAX_IMPROVEMENTS {
            let excess = self.data.improvements.len() - MAX_IMPROVEMENTS;
            self.data.improvements.drain(..excess);
        }

        self.persist().await
    }

    /// First learned strategy for this exact error message
    pub fn learned_strategy(&self, agent: &str, message: &str) -> Option<&str> {
        self.data
            .recovery_strategies
            .get(&strategy_key(agent, message))
            .and_then(|strategies| strategies.first())
            .map(String::as_str)
    }

    /// Remember a strategy that worked for this exact error message
    ///
    /// Duplicates are ignored; once a key holds the maximum number of
    /// strategies further ones are dropped.
    pub async fn record_recovery_strategy(
        &mut self,
        agent: &str,
        message: &str,
        strategy: impl Into<String>,
    ) -> Result<()> {
        let strategy = strategy.into();
        let strategies = self
            .data
            .recovery_strategies
            .entry(strategy_key(agent, message))
            .or_default();

        if strategies.contains(&strategy) {
            return Ok(());
        }
        if strategies.len() >= MAX_STRATEGIES_PER_PATTERN {
            debug!(agent, "Strategy list full, not recording: {}", strategy);
            return Ok(());
        }

        debug!(agent, "Learned recovery strategy: {}", strategy);
        strategies.push(strategy);
        self.persist().await
    }

    pub fn error_pattern(&self, agent: &str, kind: ErrorKind) -> Option<&ErrorPatternRecord> {
        self.data.error_patterns.get(&pattern_key(agent, kind))
    }

    /// Improvement log, oldest first
    pub fn improvements(&self) -> &[Improvement] {
        &self.data.improvements
    }

    /// Names of every agent with a health record
    pub fn agents(&self) -> impl Iterator<Item = &str> {
        self.data.agent_health.keys().map(String::as_str)
    }

    pub fn data(&self) -> &LedgerData {
        &self.data
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Forget everything and persist the empty ledger
    pub async fn reset(&mut self) -> Result<()> {
        warn!("Resetting health ledger");
        self.data = LedgerData::default();
        self.persist().await
    }

    /// Write the current state without mutating it
    pub async fn flush(&self) -> Result<()> {
        self.persist().await
    }

    /// Replace the in-memory state with what storage holds
    pub async fn reload(&mut self) -> Result<()> {
        self.data = self.storage.load().await?;
        Ok(())
    }

    async fn persist(&self) -> Result<()> {
        self.storage.save(&self.data).await
    }
}
