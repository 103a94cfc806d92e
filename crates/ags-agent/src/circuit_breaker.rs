//! Per-agent circuit breakers
//!
//! Implements the circuit breaker pattern to stop calling an agent that
//! keeps failing, then cautiously let it back in.
//!
//! Breaker state lives in memory only; the durable side of agent health is
//! the ledger, which the half-open to closed transition and the recovery
//! sweep consult.

use ags_core::CircuitBreakerConfig;
use ags_ledger::{HealthLedger, LedgerStorage};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation - calls allowed
    #[default]
    Closed,
    /// Too many failures - reject calls until the retry deadline
    Open,
    /// Testing recovery - calls allowed, the next outcome decides
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Breaker state of one agent
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Circuit {
    state: CircuitState,
    failures: u32,
    last_failure_time: Option<DateTime<Utc>>,
    last_success_time: Option<DateTime<Utc>>,
    /// Set iff the circuit is open
    next_retry_time: Option<DateTime<Utc>>,
}

impl Circuit {
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Failures since the circuit last closed or went half-open
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn last_failure_time(&self) -> Option<DateTime<Utc>> {
        self.last_failure_time
    }

    pub fn last_success_time(&self) -> Option<DateTime<Utc>> {
        self.last_success_time
    }

    /// When an open circuit will admit a trial call
    pub fn next_retry_time(&self) -> Option<DateTime<Utc>> {
        self.next_retry_time
    }

    fn open(&mut self, deadline: DateTime<Utc>) {
        self.state = CircuitState::Open;
        self.next_retry_time = Some(deadline);
    }

    fn half_open(&mut self) {
        self.state = CircuitState::HalfOpen;
        self.failures = 0;
        self.next_retry_time = None;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.failures = 0;
        self.next_retry_time = None;
    }
}

/// Reporting view of one circuit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitStatus {
    pub state: CircuitState,
    pub failures: u32,
    pub can_proceed: bool,
    pub next_retry_time: Option<DateTime<Utc>>,
}

/// Registry of per-agent breakers, created lazily in the closed state
#[derive(Debug, Clone)]
pub struct CircuitBreakers {
    config: CircuitBreakerConfig,
    circuits: BTreeMap<String, Circuit>,
}

impl CircuitBreakers {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current circuit of an agent, if it has one yet
    pub fn circuit(&self, agent: &str) -> Option<&Circuit> {
        self.circuits.get(agent)
    }

    fn circuit_mut(&mut self, agent: &str) -> &mut Circuit {
        self.circuits.entry(agent.to_string()).or_default()
    }

    /// Whether calls to `agent` are currently blocked
    ///
    /// Side effect: an open circuit whose retry deadline has passed moves to
    /// half-open here and admits the call as its recovery trial.
    pub fn is_open(&mut self, agent: &str) -> bool {
        self.is_open_at(agent, Utc::now())
    }

    pub fn is_open_at(&mut self, agent: &str, now: DateTime<Utc>) -> bool {
        let circuit = self.circuit_mut(agent);
        match circuit.state {
            CircuitState::Closed | CircuitState::HalfOpen => false,
            CircuitState::Open => match circuit.next_retry_time {
                Some(deadline) if now >= deadline => {
                    circuit.half_open();
                    info!(agent, "Circuit entering half-open state for recovery testing");
                    false
                }
                _ => true,
            },
        }
    }

    /// Record a successful call
    ///
    /// A half-open circuit closes only when the ledger, already updated with
    /// this success, shows no consecutive failures and a success rate above
    /// 0.5. Otherwise it stays half-open.
    pub fn record_success<S: LedgerStorage>(&mut self, agent: &str, ledger: &HealthLedger<S>) {
        self.record_success_at(agent, ledger, Utc::now());
    }

    pub fn record_success_at<S: LedgerStorage>(
        &mut self,
        agent: &str,
        ledger: &HealthLedger<S>,
        now: DateTime<Utc>,
    ) {
        let health = ledger.agent_health(agent);
        let circuit = self.circuit_mut(agent);
        circuit.last_success_time = Some(now);

        match circuit.state {
            CircuitState::HalfOpen => {
                if health.consecutive_failures == 0 && health.success_rate > 0.5 {
                    circuit.close();
                    info!(agent, "Circuit closed after successful recovery");
                }
            }
            CircuitState::Closed => circuit.failures = 0,
            CircuitState::Open => {}
        }
    }

    /// Record a failed call
    pub fn record_failure(&mut self, agent: &str) {
        self.record_failure_at(agent, Utc::now());
    }

    pub fn record_failure_at(&mut self, agent: &str, now: DateTime<Utc>) {
        let threshold = self.config.failure_threshold;
        let reopen_at = after(now, self.config.open_timeout_secs);

        let circuit = self.circuit_mut(agent);
        circuit.failures = circuit.failures.saturating_add(1);
        circuit.last_failure_time = Some(now);

        match circuit.state {
            CircuitState::Closed if circuit.failures >= threshold => {
                circuit.open(reopen_at);
                warn!(
                    agent,
                    failures = circuit.failures,
                    next_retry_time = %reopen_at.to_rfc3339(),
                    "Circuit opened"
                );
            }
            CircuitState::HalfOpen => {
                circuit.open(reopen_at);
                warn!(agent, "Circuit reopened after failure in half-open state");
            }
            _ => {}
        }
    }

    /// Move open circuits whose deadline has passed towards recovery
    ///
    /// Health-based: the ledger shows no consecutive failures and a success
    /// rate above 0.3. Forced: the deadline passed more than the configured
    /// interval ago. A failing forced trial call reopens the circuit one open
    /// timeout after the failure, never earlier than one timeout after the
    /// sweep.
    ///
    /// Returns the agents moved to half-open.
    pub fn test_recovery<S: LedgerStorage>(&mut self, ledger: &HealthLedger<S>) -> Vec<String> {
        self.test_recovery_at(ledger, Utc::now())
    }

    pub fn test_recovery_at<S: LedgerStorage>(
        &mut self,
        ledger: &HealthLedger<S>,
        now: DateTime<Utc>,
    ) -> Vec<String> {
        let forced_after = self.config.forced_trial_after_secs;
        let mut tested = Vec::new();

        for (agent, circuit) in self.circuits.iter_mut() {
            let deadline = match (circuit.state, circuit.next_retry_time) {
                (CircuitState::Open, Some(deadline)) if now >= deadline => deadline,
                _ => continue,
            };

            let health = ledger.agent_health(agent);
            if health.consecutive_failures == 0 && health.success_rate > 0.3 {
                circuit.half_open();
                info!(agent = %agent, "Circuit entering half-open state (health-based)");
                tested.push(agent.clone());
            } else if now > after(deadline, forced_after) {
                circuit.half_open();
                info!(agent = %agent, "Circuit entering half-open state for forced recovery test");
                tested.push(agent.clone());
            }
        }

        if !tested.is_empty() {
            info!("Tested recovery for {} circuit(s)", tested.len());
        }
        tested
    }

    /// Manual override: force the circuit closed
    pub fn reset(&mut self, agent: &str) {
        let circuit = self.circuit_mut(agent);
        circuit.close();
        circuit.last_failure_time = None;
        info!(agent, "Circuit manually reset");
    }

    /// Open the circuit now, whatever its state
    ///
    /// Used for agents that start out with a failure streak so they still
    /// get a recovery trial call once the open timeout has passed.
    pub fn trip_at(&mut self, agent: &str, now: DateTime<Utc>) {
        let reopen_at = after(now, self.config.open_timeout_secs);
        self.trip_until(agent, reopen_at);
    }

    /// Open the circuit until `reopen_at`
    ///
    /// A deadline that has already passed leaves the circuit open but lets the
    /// next call go through as the half-open trial.
    pub fn trip_until(&mut self, agent: &str, reopen_at: DateTime<Utc>) {
        self.circuit_mut(agent).open(reopen_at);
        info!(agent, next_retry_time = %reopen_at.to_rfc3339(), "Circuit tripped");
    }

    /// Status of one circuit
    ///
    /// Computing `can_proceed` goes through [`Self::is_open_at`] and may move
    /// an expired open circuit to half-open.
    pub fn status(&mut self, agent: &str) -> CircuitStatus {
        self.status_at(agent, Utc::now())
    }

    pub fn status_at(&mut self, agent: &str, now: DateTime<Utc>) -> CircuitStatus {
        let can_proceed = !self.is_open_at(agent, now);
        let circuit = self.circuit_mut(agent);
        CircuitStatus {
            state: circuit.state,
            failures: circuit.failures,
            can_proceed,
            next_retry_time: circuit.next_retry_time,
        }
    }

    /// Status of every known circuit
    pub fn summary(&mut self) -> BTreeMap<String, CircuitStatus> {
        self.summary_at(Utc::now())
    }

    pub fn summary_at(&mut self, now: DateTime<Utc>) -> BTreeMap<String, CircuitStatus> {
        let agents: Vec<String> = self.circuits.keys().cloned().collect();
        agents
            .into_iter()
            .map(|agent| {
                let status = self.status_at(&agent, now);
                (agent, status)
            })
            .collect()
    }
}

impl Default for CircuitBreakers {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

/// `now + secs`, saturating at the latest representable time
fn after(now: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
