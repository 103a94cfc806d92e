//! Recovery strategy engine
//!
//! Stateless classifier that turns a failed call into a retry directive. It
//! reads the ledger (learned strategies, consecutive failures) but never
//! writes to it, and must be consulted before the failure is recorded so
//! that backoff reflects the failures that came before this one.

use ags_core::{AgentError, ErrorKind, RecoveryConfig};
use ags_ledger::{HealthLedger, LedgerStorage};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What to do about a failed call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryDirective {
    pub should_retry: bool,
    #[serde(rename = "waitTimeMs", with = "millis")]
    pub wait: Duration,
    pub strategy: String,
}

impl RecoveryDirective {
    fn retry(wait: Duration, strategy: impl Into<String>) -> Self {
        Self {
            should_retry: true,
            wait,
            strategy: strategy.into(),
        }
    }

    fn give_up(strategy: impl Into<String>) -> Self {
        Self {
            should_retry: false,
            wait: Duration::ZERO,
            strategy: strategy.into(),
        }
    }
}

/// Rule-based retry policy
#[derive(Debug, Clone, Default)]
pub struct RecoveryEngine {
    config: RecoveryConfig,
}

impl RecoveryEngine {
    pub fn new(config: RecoveryConfig) -> Self {
        Self { config }
    }

    /// Decide whether and when to retry a failed call to `agent`
    pub fn classify<S: LedgerStorage>(
        &self,
        agent: &str,
        error: &AgentError,
        ledger: &HealthLedger<S>,
    ) -> RecoveryDirective {
        let failures = ledger.agent_health(agent).consecutive_failures;

        // A learned strategy never waits less than its kind's fixed wait
        if let Some(strategy) = ledger.learned_strategy(agent, &error.message) {
            let wait = self
                .calculate_wait_time(failures)
                .max(self.fixed_wait(error.kind).unwrap_or_default());
            return RecoveryDirective::retry(wait, strategy);
        }

        if let Some(wait) = self.fixed_wait(error.kind) {
            let strategy = match error.kind {
                ErrorKind::RateLimited => "Rate limit detected. Waiting before retry.",
                ErrorKind::Timeout => "Timeout error. Retrying with short delay.",
                _ => "Network error. Retrying with delay.",
            };
            return RecoveryDirective::retry(wait, strategy);
        }

        match error.kind {
            ErrorKind::QuotaExhausted => {
                RecoveryDirective::give_up("Quota exceeded. Cannot recover automatically.")
            }
            _ => RecoveryDirective::retry(
                self.calculate_wait_time(failures),
                "Generic error. Retrying with exponential backoff.",
            ),
        }
    }

    /// The configured wait for kinds that don't back off
    fn fixed_wait(&self, kind: ErrorKind) -> Option<Duration> {
        let ms = match kind {
            ErrorKind::RateLimited => self.config.rate_limit_wait_ms,
            ErrorKind::Timeout => self.config.timeout_wait_ms,
            ErrorKind::Network => self.config.network_wait_ms,
            _ => return None,
        };
        Some(Duration::from_millis(ms))
    }

    /// Exponential backoff plus up to `jitter_ratio` of random jitter
    ///
    /// Jitter is only ever added, so the result lies in
    /// `[backoff, backoff * (1 + jitter_ratio)]`.
    pub fn calculate_wait_time(&self, consecutive_failures: u32) -> Duration {
        let backoff = self.backoff_ms(consecutive_failures);
        let jitter = backoff as f64 * self.config.jitter_ratio * rand::rng().random::<f64>();
        Duration::from_millis(backoff.saturating_add(jitter as u64))
    }

    /// `min(base * 2^failures, max)` in milliseconds, without jitter
    pub fn backoff_ms(&self, consecutive_failures: u32) -> u64 {
        let factor = 2u64.saturating_pow(consecutive_failures);
        self.config
            .base_wait_ms
            .saturating_mul(factor)
            .min(self.config.max_wait_ms)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(wait: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(wait.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
