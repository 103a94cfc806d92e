//! Scripted agents and millisecond-scale configs for controller tests

use ags_agent::HealthMonitor;
use ags_core::{AgentError, AgsConfig, RecoveryConfig, RunConfig};
use ags_ledger::{HealthLedger, MemoryLedgerStorage};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::agent::{Agent, AgentReply};

pub fn fast_config() -> AgsConfig {
    AgsConfig {
        recovery: RecoveryConfig {
            base_wait_ms: 1,
            max_wait_ms: 10,
            jitter_ratio: 0.0,
            rate_limit_wait_ms: 1,
            timeout_wait_ms: 1,
            network_wait_ms: 1,
        },
        run: fast_run_config(),
        ..AgsConfig::default()
    }
}

pub fn fast_run_config() -> RunConfig {
    RunConfig {
        interval_secs: 0,
        failure_wait_ms: 1,
        restart_base_wait_ms: 1,
        restart_max_wait_ms: 10,
        poll_interval_ms: 5,
        ..RunConfig::default()
    }
}

pub async fn monitor() -> HealthMonitor<MemoryLedgerStorage> {
    let ledger = HealthLedger::open(MemoryLedgerStorage::new()).await.unwrap();
    HealthMonitor::new(ledger, &fast_config())
}

#[derive(Debug, Clone)]
enum Step {
    Reply(AgentReply),
    Fail(AgentError),
}

/// Agent that plays back a fixed script, then echoes or fails
#[derive(Debug, Clone)]
pub struct ScriptedAgent {
    name: String,
    script: Arc<Mutex<VecDeque<Step>>>,
    echo_prefix: Option<String>,
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl ScriptedAgent {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            script: Arc::new(Mutex::new(VecDeque::new())),
            echo_prefix: None,
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Once the script runs out, reply with `prefix` + input
    pub fn echo(name: &str, prefix: &str) -> Self {
        Self {
            echo_prefix: Some(prefix.to_string()),
            ..Self::new(name)
        }
    }

    pub fn outputs<const N: usize>(self, outputs: [&str; N]) -> Self {
        for output in outputs {
            self.push(Step::Reply(AgentReply::Output(output.to_string())));
        }
        self
    }

    pub fn veto(self, reason: &str) -> Self {
        self.push(Step::Reply(AgentReply::Veto(reason.to_string())));
        self
    }

    pub fn error(self, error: AgentError) -> Self {
        self.push(Step::Fail(error));
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn push(&self, step: Step) {
        self.script.lock().unwrap().push_back(step);
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, input: &str) -> Result<AgentReply, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(Step::Reply(reply)) => Ok(reply),
            Some(Step::Fail(error)) => Err(error),
            None => match &self.echo_prefix {
                Some(prefix) => Ok(AgentReply::Output(format!("{}{}", prefix, input))),
                None => Err(AgentError::untagged(format!("{} script exhausted", self.name))),
            },
        }
    }
}
