//! Health monitor
//!
//! Façade over the circuit breakers, the recovery engine and the ledger.
//! The run controller talks only to this type: it asks whether an agent may
//! be called, reports every outcome once, and asks how to recover.

use ags_core::{AgentError, AgsConfig, Result, RunConfig};
use ags_ledger::{ErrorContext, HealthLedger, HealthStatus, Impact, LedgerStorage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

use crate::circuit_breaker::{CircuitBreakers, CircuitState, CircuitStatus};
use crate::recovery::{RecoveryDirective, RecoveryEngine};

/// Whether an agent may be called right now, and why
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateDecision {
    pub can_proceed: bool,
    pub reason: String,
}

/// Per-agent entry of a health check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCheck {
    pub healthy: bool,
    pub success_rate: f64,
    pub consecutive_failures: u32,
}

/// Point-in-time health report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub timestamp: DateTime<Utc>,
    pub status: HealthStatus,
    pub agents: BTreeMap<String, AgentCheck>,
    pub recommendations: Vec<String>,
}

/// Restart advice for the run supervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartDecision {
    pub should_restart: bool,
    pub reason: String,
    #[serde(rename = "waitTimeMs")]
    pub wait_ms: u64,
}

/// Wait before restarting a system in critical health
const CRITICAL_RESTART_WAIT_MS: u64 = 60_000;

/// Wait before restarting because a critical agent is being skipped
const CRITICAL_AGENT_RESTART_WAIT_MS: u64 = 120_000;

/// Gate, outcome recorder and health reporter for every agent call
pub struct HealthMonitor<S: LedgerStorage> {
    ledger: HealthLedger<S>,
    breakers: CircuitBreakers,
    engine: RecoveryEngine,
    run: RunConfig,
}

impl<S: LedgerStorage> HealthMonitor<S> {
    /// Agents the ledger already skips start with an open circuit
    pub fn new(ledger: HealthLedger<S>, config: &AgsConfig) -> Self {
        let mut monitor = Self {
            ledger,
            breakers: CircuitBreakers::new(config.circuit_breaker.clone()),
            engine: RecoveryEngine::new(config.recovery.clone()),
            run: config.run.clone(),
        };
        let now = Utc::now();
        for agent in monitor.skipped_agents() {
            monitor.breakers.trip_at(&agent, now);
        }
        monitor
    }

    /// Agents on a failure streak
    ///
    /// A fresh closed circuit would leave such an agent behind the skip rule
    /// with no way to make the trial call that clears its streak, so these
    /// get an open circuit instead.
    fn skipped_agents(&self) -> Vec<String> {
        self.ledger
            .agents()
            .filter(|agent| self.ledger.should_skip_agent(agent))
            .map(str::to_string)
            .collect()
    }

    /// May `agent` be called now?
    ///
    /// The circuit breaker is checked first, then the ledger's skip rule.
    /// A half-open circuit bypasses the skip rule: its trial call is the only
    /// call that can clear an agent's failure streak.
    pub fn can_proceed(&mut self, agent: &str) -> GateDecision {
        self.can_proceed_at(agent, Utc::now())
    }

    pub fn can_proceed_at(&mut self, agent: &str, now: DateTime<Utc>) -> GateDecision {
        if self.breakers.is_open_at(agent, now) {
            return GateDecision {
                can_proceed: false,
                reason: format!(
                    "Agent {} circuit breaker is open. Too many failures detected.",
                    agent
                ),
            };
        }

        let half_open = self
            .breakers
            .circuit(agent)
            .is_some_and(|circuit| circuit.state() == CircuitState::HalfOpen);
        if half_open {
            return GateDecision {
                can_proceed: true,
                reason: format!(
                    "Agent {} circuit is half-open. Admitting recovery trial call.",
                    agent
                ),
            };
        }

        if self.ledger.should_skip_agent(agent) {
            let failures = self.ledger.agent_health(agent).consecutive_failures;
            return GateDecision {
                can_proceed: false,
                reason: format!(
                    "Agent {} has {} consecutive failures. Skipping to prevent further errors.",
                    agent, failures
                ),
            };
        }

        GateDecision {
            can_proceed: true,
            reason: "Agent is healthy".to_string(),
        }
    }

    /// Record a successful call in the ledger, then the breaker
    pub async fn record_success(&mut self, agent: &str) {
        self.record_success_at(agent, Utc::now()).await
    }

    pub async fn record_success_at(&mut self, agent: &str, now: DateTime<Utc>) {
        if let Err(e) = self.ledger.record_success(agent).await {
            warn!(agent, "Failed to persist success: {}", e);
        }
        self.breakers.record_success_at(agent, &self.ledger, now);
    }

    /// Record a failed call in the ledger, then the breaker
    pub async fn record_failure(&mut self, agent: &str, error: &AgentError, context: &ErrorContext) {
        self.record_failure_at(agent, error, context, Utc::now()).await
    }

    pub async fn record_failure_at(
        &mut self,
        agent: &str,
        error: &AgentError,
        context: &ErrorContext,
        now: DateTime<Utc>,
    ) {
        if let Err(e) = self.ledger.record_failure(agent, error, context).await {
            warn!(agent, "Failed to persist failure: {}", e);
        }
        self.breakers.record_failure_at(agent, now);
    }

    /// How to recover from `error`; call before recording it
    pub fn recovery_strategy(&self, agent: &str, error: &AgentError) -> RecoveryDirective {
        self.engine.classify(agent, error, &self.ledger)
    }

    /// Remember that `strategy` got `agent` past this exact error
    pub async fn record_recovery_strategy(&mut self, agent: &str, message: &str, strategy: &str) {
        if let Err(e) = self
            .ledger
            .record_recovery_strategy(agent, message, strategy)
            .await
        {
            warn!(agent, "Failed to persist recovery strategy: {}", e);
        }
    }

    pub async fn record_improvement(&mut self, change: impl Into<String>, impact: Impact) {
        if let Err(e) = self.ledger.record_improvement(change, impact).await {
            warn!("Failed to persist improvement: {}", e);
        }
    }

    /// Health of the system and of every tracked agent
    pub fn health_check(&self) -> HealthCheck {
        let system = self.ledger.system_health();
        info!(status = %system.status, "Performed health check");
        if !system.unhealthy_agents.is_empty() {
            info!("Unhealthy agents: {}", system.unhealthy_agents.join(", "));
        }
        for recommendation in &system.recommendations {
            info!("Recommendation: {}", recommendation);
        }

        let agents = self
            .run
            .tracked_agents
            .iter()
            .map(|agent| {
                let health = self.ledger.agent_health(agent);
                (
                    agent.clone(),
                    AgentCheck {
                        healthy: health.is_healthy,
                        success_rate: health.success_rate,
                        consecutive_failures: health.consecutive_failures,
                    },
                )
            })
            .collect();

        HealthCheck {
            timestamp: Utc::now(),
            status: system.status,
            agents,
            recommendations: system.recommendations,
        }
    }

    /// Whether the ledger alone says the system needs a restart
    pub fn should_restart(&self) -> RestartDecision {
        if self.ledger.system_health().status == HealthStatus::Critical {
            return RestartDecision {
                should_restart: true,
                reason: "System health is critical. Multiple agents failing.".to_string(),
                wait_ms: CRITICAL_RESTART_WAIT_MS,
            };
        }

        let failing: Vec<&str> = self
            .run
            .critical_agents
            .iter()
            .map(String::as_str)
            .filter(|agent| self.ledger.should_skip_agent(agent))
            .collect();
        if !failing.is_empty() {
            return RestartDecision {
                should_restart: true,
                reason: format!("Critical agents failing: {}", failing.join(", ")),
                wait_ms: CRITICAL_AGENT_RESTART_WAIT_MS,
            };
        }

        RestartDecision {
            should_restart: false,
            reason: "System is operational".to_string(),
            wait_ms: 0,
        }
    }

    /// Run the circuit recovery sweep
    pub fn test_recovery(&mut self) -> Vec<String> {
        self.breakers.test_recovery(&self.ledger)
    }

    pub fn circuit_status(&mut self, agent: &str) -> CircuitStatus {
        self.breakers.status(agent)
    }

    pub fn circuit_summary(&mut self) -> BTreeMap<String, CircuitStatus> {
        self.breakers.summary()
    }

    /// Manual override for one circuit
    pub fn reset_circuit(&mut self, agent: &str) {
        self.breakers.reset(agent);
    }

    pub fn ledger(&self) -> &HealthLedger<S> {
        &self.ledger
    }

    pub fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    /// Persist the ledger as it stands
    pub async fn flush(&self) -> Result<()> {
        self.ledger.flush().await
    }

    /// Start over the way a fresh process would
    ///
    /// Flushes the ledger, reloads it from storage and replaces every
    /// circuit with a new one. Agents the ledger skips get an open circuit
    /// whose deadline is already due, so their next call is the half-open
    /// trial; the restart wait stands in for the open timeout.
    pub async fn restart(&mut self) -> Result<()> {
        self.ledger.flush().await?;
        self.ledger.reload().await?;
        self.breakers = CircuitBreakers::new(self.breakers.config().clone());
        let now = Utc::now();
        for agent in self.skipped_agents() {
            self.breakers.trip_until(&agent, now);
        }
        info!("Health monitor restarted with fresh circuits");
        Ok(())
    }

    /// Wait the supervisor should use before the next restart attempt
    pub fn restart_wait(&self, consecutive_failures: usize) -> Duration {
        restart_wait(&self.run, consecutive_failures)
    }
}

/// `min(base * 2^min(failures - 1, 3), max)`
pub fn restart_wait(run: &RunConfig, consecutive_failures: usize) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1).min(3) as u32;
    let wait = run
        .restart_base_wait_ms
        .saturating_mul(2u64.pow(exponent))
        .min(run.restart_max_wait_ms);
    Duration::from_millis(wait)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ags_core::ErrorKind;
    use ags_ledger::MemoryLedgerStorage;
    use std::sync::Arc;

    async fn monitor() -> HealthMonitor<Arc<MemoryLedgerStorage>> {
        let ledger = HealthLedger::open(Arc::new(MemoryLedgerStorage::new()))
            .await
            .unwrap();
        HealthMonitor::new(ledger, &AgsConfig::default())
    }

    async fn fail(monitor: &mut HealthMonitor<Arc<MemoryLedgerStorage>>, agent: &str, n: usize) {
        let error = AgentError::new(ErrorKind::Parse, "Unexpected token in JSON");
        for _ in 0..n {
            monitor.record_failure(agent, &error, &ErrorContext::new()).await;
        }
    }

    #[tokio::test]
    async fn test_gate_allows_healthy_agent() {
        let mut monitor = monitor().await;
        let decision = monitor.can_proceed("formatter");
        assert!(decision.can_proceed);
        assert_eq!(decision.reason, "Agent is healthy");
    }

    #[tokio::test]
    async fn test_gate_reports_open_circuit_first() {
        let mut monitor = monitor().await;
        fail(&mut monitor, "formatter", 5).await;

        let decision = monitor.can_proceed("formatter");
        assert!(!decision.can_proceed);
        assert!(decision.reason.contains("circuit breaker is open"));
    }

    #[tokio::test]
    async fn test_gate_skips_after_circuit_reset() {
        let mut monitor = monitor().await;
        fail(&mut monitor, "formatter", 5).await;
        monitor.reset_circuit("formatter");

        let decision = monitor.can_proceed("formatter");
        assert!(!decision.can_proceed);
        assert!(decision.reason.contains("5 consecutive failures"));
    }

    #[tokio::test]
    async fn test_half_open_trial_bypasses_skip_rule() {
        let mut monitor = monitor().await;
        fail(&mut monitor, "formatter", 5).await;

        let later = Utc::now() + chrono::Duration::seconds(61);
        let decision = monitor.can_proceed_at("formatter", later);
        assert!(decision.can_proceed);
        assert!(decision.reason.contains("recovery trial call"));
        assert!(monitor.ledger().should_skip_agent("formatter"));
    }

    #[tokio::test]
    async fn test_outcomes_are_dual_written() {
        let mut monitor = monitor().await;
        fail(&mut monitor, "publisher", 2).await;
        monitor.record_success("publisher").await;

        assert_eq!(monitor.ledger().storage().save_count(), 3);
        assert_eq!(
            monitor.ledger().agent_health("publisher").consecutive_failures,
            0
        );
        let circuit = monitor.breakers().circuit("publisher").unwrap();
        assert_eq!(circuit.failures(), 0);
        assert!(circuit.last_failure_time().is_some());
    }

    #[tokio::test]
    async fn test_health_check_lists_tracked_agents() {
        let mut monitor = monitor().await;
        fail(&mut monitor, "formatter", 5).await;

        let check = monitor.health_check();
        assert_eq!(check.status, HealthStatus::Degraded);
        assert_eq!(check.agents.len(), 8);
        assert!(!check.agents["formatter"].healthy);
        assert!(check.agents["publisher"].healthy);
        assert_eq!(check.recommendations.len(), 1);
    }

    #[tokio::test]
    async fn test_restart_when_critical() {
        let mut monitor = monitor().await;
        for agent in ["formatter", "interlinker", "publisher"] {
            fail(&mut monitor, agent, 7).await;
        }

        let decision = monitor.should_restart();
        assert!(decision.should_restart);
        assert_eq!(decision.wait_ms, 60_000);
    }

    #[tokio::test]
    async fn test_restart_when_critical_agent_skipped() {
        let mut monitor = monitor().await;
        fail(&mut monitor, "safety_officer", 5).await;

        let decision = monitor.should_restart();
        assert!(decision.should_restart);
        assert_eq!(decision.reason, "Critical agents failing: safety_officer");
        assert_eq!(decision.wait_ms, 120_000);
    }

    #[tokio::test]
    async fn test_no_restart_for_non_critical_agent() {
        let mut monitor = monitor().await;
        fail(&mut monitor, "formatter", 5).await;

        let decision = monitor.should_restart();
        assert!(!decision.should_restart);
        assert_eq!(decision.wait_ms, 0);
    }

    #[tokio::test]
    async fn test_restart_keeps_ledger_and_renews_circuits() {
        let mut monitor = monitor().await;
        fail(&mut monitor, "formatter", 5).await;
        fail(&mut monitor, "publisher", 2).await;

        monitor.restart().await.unwrap();

        assert!(monitor.breakers().circuit("publisher").is_none());
        assert_eq!(
            monitor.ledger().agent_health("formatter").consecutive_failures,
            5
        );
        // The streak survives, so the new circuit starts open but already due
        let circuit = monitor.breakers().circuit("formatter").unwrap();
        assert_eq!(circuit.state(), CircuitState::Open);
        assert_eq!(circuit.failures(), 0);
        assert!(circuit.next_retry_time().unwrap() <= Utc::now());

        let gate = monitor.can_proceed("formatter");
        assert!(gate.can_proceed);
        assert_eq!(
            monitor.breakers().circuit("formatter").unwrap().state(),
            CircuitState::HalfOpen
        );
    }

    #[tokio::test]
    async fn test_new_monitor_trips_agents_on_a_streak() {
        let storage = Arc::new(MemoryLedgerStorage::new());
        let mut ledger = HealthLedger::open(storage.clone()).await.unwrap();
        let error = AgentError::untagged("fetch failed");
        for _ in 0..5 {
            ledger
                .record_failure("interlinker", &error, &ErrorContext::new())
                .await
                .unwrap();
        }

        let monitor = HealthMonitor::new(ledger, &AgsConfig::default());
        assert_eq!(
            monitor.breakers().circuit("interlinker").unwrap().state(),
            CircuitState::Open
        );
    }

    #[test]
    fn test_restart_wait_backoff() {
        let run = RunConfig::default();
        assert_eq!(restart_wait(&run, 1), Duration::from_secs(60));
        assert_eq!(restart_wait(&run, 2), Duration::from_secs(120));
        assert_eq!(restart_wait(&run, 4), Duration::from_secs(480));
        assert_eq!(restart_wait(&run, 9), Duration::from_secs(480));

        let capped = RunConfig {
            restart_base_wait_ms: 100_000,
            ..RunConfig::default()
        };
        assert_eq!(restart_wait(&capped, 4), Duration::from_secs(600));
    }
}
