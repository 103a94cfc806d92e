//! Run controller
//!
//! One run: ask the work source for a batch, then pass every work item
//! through the stage list. Each agent call goes through the health monitor
//! (gate, dual-write outcome recording) and failed calls get exactly one
//! retry after the wait the recovery engine advises.

use ags_agent::{HealthCheck, HealthMonitor};
use ags_core::{AgentError, RunConfig, StageRole};
use ags_ledger::{ErrorContext, LedgerStorage};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentReply};
use crate::shutdown::Shutdown;

/// One pipeline stage
pub struct Stage {
    pub agent: Box<dyn Agent>,
    pub role: StageRole,
}

impl Stage {
    pub fn new(agent: Box<dyn Agent>, role: StageRole) -> Self {
        Self { agent, role }
    }
}

/// One unit of work flowing through the stages
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkItem {
    /// 1-based position in the batch
    pub index: usize,
    pub payload: String,
}

/// How a work item left the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    /// Passed every stage
    Completed { output: String },
    /// Discarded by an agent or a safety gate
    Vetoed { agent: String, reason: String },
    /// A required stage could not process it
    Failed { agent: String, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemReport {
    pub index: usize,
    #[serde(flatten)]
    pub outcome: ItemOutcome,
}

/// Result of one run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Why no batch was produced, if none was
    pub source_error: Option<String>,
    pub items: Vec<ItemReport>,
    /// Shutdown cut the run short
    pub interrupted: bool,
}

impl RunReport {
    fn count(&self, matches: impl Fn(&ItemOutcome) -> bool) -> usize {
        self.items.iter().filter(|item| matches(&item.outcome)).count()
    }

    pub fn completed(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Completed { .. }))
    }

    pub fn vetoed(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Vetoed { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, ItemOutcome::Failed { .. }))
    }

    /// A run fails when it got no batch, or when every item of a
    /// non-empty batch failed
    pub fn is_failure(&self) -> bool {
        if self.source_error.is_some() {
            return true;
        }
        !self.items.is_empty() && self.failed() == self.items.len()
    }

    /// One-line reason for a failed run
    pub fn failure_reason(&self) -> Option<String> {
        if let Some(error) = &self.source_error {
            return Some(format!("Work source failed: {}", error));
        }
        if self.is_failure() {
            return Some(format!("All {} work items failed", self.items.len()));
        }
        None
    }
}

/// Outcome of one guarded agent call
#[derive(Debug, Clone, PartialEq, Eq)]
enum CallOutcome {
    /// The agent produced output
    Output(String),
    /// The gate or the agent itself refused
    Vetoed(String),
    /// The call failed, after its retry if one was advised
    Failed(AgentError),
    /// Shutdown stopped the call
    Interrupted,
}

/// Drives runs over a work source and a stage list
pub struct RunController<S: LedgerStorage> {
    monitor: HealthMonitor<S>,
    source: Box<dyn Agent>,
    stages: Vec<Stage>,
    shutdown: Shutdown,
    config: RunConfig,
}

impl<S: LedgerStorage> RunController<S> {
    pub fn new(
        monitor: HealthMonitor<S>,
        source: Box<dyn Agent>,
        stages: Vec<Stage>,
        shutdown: Shutdown,
        config: RunConfig,
    ) -> Self {
        Self {
            monitor,
            source,
            stages,
            shutdown,
            config,
        }
    }

    pub fn monitor(&self) -> &HealthMonitor<S> {
        &self.monitor
    }

    pub fn monitor_mut(&mut self) -> &mut HealthMonitor<S> {
        &mut self.monitor
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    /// Execute one run
    pub async fn run_once(&mut self) -> RunReport {
        let started_at = Utc::now();
        let recovered = self.monitor.test_recovery();
        if !recovered.is_empty() {
            debug!("Circuits half-open for this run: {}", recovered.join(", "));
        }

        let Self {
            monitor,
            source,
            stages,
            shutdown,
            config,
        } = self;

        let mut report = RunReport {
            started_at,
            finished_at: started_at,
            source_error: None,
            items: Vec::new(),
            interrupted: false,
        };

        let context = ErrorContext::from([("role".to_string(), "source".to_string())]);
        let batch = match guarded_call(monitor, shutdown, config, source.as_ref(), "", context).await
        {
            CallOutcome::Output(output) => parse_batch(&output),
            CallOutcome::Vetoed(reason) => {
                report.source_error = Some(reason);
                Vec::new()
            }
            CallOutcome::Failed(error) => {
                report.source_error = Some(error.message);
                Vec::new()
            }
            CallOutcome::Interrupted => {
                report.interrupted = true;
                Vec::new()
            }
        };
        info!("Work source produced {} item(s)", batch.len());

        for item in batch {
            if shutdown.is_triggered() {
                report.interrupted = true;
                break;
            }
            match process_item(monitor, shutdown, config, stages, &item).await {
                Some(outcome) => report.items.push(ItemReport {
                    index: item.index,
                    outcome,
                }),
                None => {
                    report.interrupted = true;
                    break;
                }
            }
        }

        report.finished_at = Utc::now();
        info!(
            completed = report.completed(),
            vetoed = report.vetoed(),
            failed = report.failed(),
            interrupted = report.interrupted,
            "Run finished in {:.2}s",
            (report.finished_at - report.started_at).num_milliseconds() as f64 / 1000.0
        );
        report
    }

    /// Health check across tracked agents
    pub fn health_check(&self) -> HealthCheck {
        self.monitor.health_check()
    }
}

/// Each non-empty line of the source output is one work item
fn parse_batch(output: &str) -> Vec<WorkItem> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .enumerate()
        .map(|(i, line)| WorkItem {
            index: i + 1,
            payload: line.to_string(),
        })
        .collect()
}

/// Pass one item through every stage; `None` when shutdown interrupted it
async fn process_item<S: LedgerStorage>(
    monitor: &mut HealthMonitor<S>,
    shutdown: &Shutdown,
    config: &RunConfig,
    stages: &[Stage],
    item: &WorkItem,
) -> Option<ItemOutcome> {
    info!("Processing work item {}", item.index);
    let mut payload = item.payload.clone();

    for stage in stages {
        let name = stage.agent.name();
        let context = ErrorContext::from([
            ("item".to_string(), item.index.to_string()),
            ("role".to_string(), stage.role.to_string()),
        ]);

        match guarded_call(monitor, shutdown, config, stage.agent.as_ref(), &payload, context).await {
            CallOutcome::Output(output) => payload = output,
            CallOutcome::Interrupted => return None,
            CallOutcome::Vetoed(reason) => match stage.role {
                StageRole::Optional => {
                    info!(agent = name, "Optional stage skipped, passing input through: {}", reason);
                }
                StageRole::SafetyCritical => {
                    warn!(agent = name, "Work item {} discarded: {}", item.index, reason);
                    return Some(ItemOutcome::Vetoed {
                        agent: name.to_string(),
                        reason,
                    });
                }
                StageRole::Required => {
                    warn!(agent = name, "Work item {} failed: {}", item.index, reason);
                    return Some(ItemOutcome::Failed {
                        agent: name.to_string(),
                        error: reason,
                    });
                }
            },
            CallOutcome::Failed(error) => match stage.role {
                StageRole::Optional => {
                    warn!(
                        agent = name,
                        "Optional stage failed, continuing with original input: {}", error
                    );
                }
                StageRole::SafetyCritical | StageRole::Required => {
                    warn!(agent = name, "Work item {} failed: {}", item.index, error);
                    return Some(ItemOutcome::Failed {
                        agent: name.to_string(),
                        error: error.message,
                    });
                }
            },
        }
    }

    info!("Work item {} completed", item.index);
    Some(ItemOutcome::Completed { output: payload })
}

/// Gate, invoke, and on failure classify, wait, and retry once
async fn guarded_call<S: LedgerStorage>(
    monitor: &mut HealthMonitor<S>,
    shutdown: &Shutdown,
    config: &RunConfig,
    agent: &dyn Agent,
    input: &str,
    context: ErrorContext,
) -> CallOutcome {
    let name = agent.name();

    let first_error = match attempt(monitor, shutdown, config, agent, input).await {
        Attempt::Done(outcome) => return outcome,
        Attempt::Blocked(reason) => return CallOutcome::Vetoed(reason),
        Attempt::Errored(error) => error,
    };

    // Classify before recording so backoff reflects the failures before this one
    let directive = monitor.recovery_strategy(name, &first_error);
    monitor.record_failure(name, &first_error, &context).await;

    if !directive.should_retry {
        warn!(agent = name, "Not retrying: {}", directive.strategy);
        return CallOutcome::Failed(first_error);
    }

    info!(
        agent = name,
        wait_ms = directive.wait.as_millis() as u64,
        "{}",
        directive.strategy
    );
    if !shutdown.sleep(directive.wait, config.poll_interval()).await {
        return CallOutcome::Interrupted;
    }

    match attempt(monitor, shutdown, config, agent, input).await {
        Attempt::Done(CallOutcome::Output(output)) => {
            monitor
                .record_recovery_strategy(name, &first_error.message, &directive.strategy)
                .await;
            CallOutcome::Output(output)
        }
        Attempt::Done(outcome) => outcome,
        // The first failure tripped the breaker; the call still failed
        Attempt::Blocked(_) => CallOutcome::Failed(first_error),
        Attempt::Errored(error) => {
            monitor.record_failure(name, &error, &context).await;
            CallOutcome::Failed(error)
        }
    }
}

enum Attempt {
    Done(CallOutcome),
    /// The gate refused the call
    Blocked(String),
    /// Failed and not yet recorded
    Errored(AgentError),
}

/// One gated invocation; successes are recorded here, failures by the caller
async fn attempt<S: LedgerStorage>(
    monitor: &mut HealthMonitor<S>,
    shutdown: &Shutdown,
    config: &RunConfig,
    agent: &dyn Agent,
    input: &str,
) -> Attempt {
    let name = agent.name();

    if shutdown.is_triggered() {
        return Attempt::Done(CallOutcome::Interrupted);
    }

    let gate = monitor.can_proceed(name);
    if !gate.can_proceed {
        warn!(agent = name, "Gate closed: {}", gate.reason);
        return Attempt::Blocked(gate.reason);
    }

    let started = std::time::Instant::now();
    let result = match invoke_until_grace(agent, input, shutdown, config).await {
        Some(result) => result,
        None => {
            warn!(agent = name, "Abandoned in-flight call after shutdown grace period");
            return Attempt::Done(CallOutcome::Interrupted);
        }
    };
    debug!(agent = name, elapsed_ms = started.elapsed().as_millis() as u64, "Call returned");

    match result {
        Ok(reply) => {
            monitor.record_success(name).await;
            match reply {
                AgentReply::Output(output) => Attempt::Done(CallOutcome::Output(output)),
                AgentReply::Veto(reason) => {
                    info!(agent = name, "Input vetoed: {}", reason);
                    Attempt::Done(CallOutcome::Vetoed(reason))
                }
            }
        }
        Err(error) => {
            warn!(agent = name, kind = %error.kind, "Call failed: {}", error);
            Attempt::Errored(error)
        }
    }
}

/// Run the call to completion, or until the shutdown grace period expires
async fn invoke_until_grace(
    agent: &dyn Agent,
    input: &str,
    shutdown: &Shutdown,
    config: &RunConfig,
) -> Option<std::result::Result<AgentReply, AgentError>> {
    let call = agent.invoke(input);
    tokio::pin!(call);

    tokio::select! {
        result = &mut call => Some(result),
        _ = shutdown.triggered(config.poll_interval()) => {
            info!(
                agent = agent.name(),
                "Waiting up to {}s for in-flight call",
                config.shutdown_grace_secs
            );
            tokio::time::timeout(config.shutdown_grace(), &mut call).await.ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fast_config, fast_run_config, monitor, ScriptedAgent};
    use ags_core::ErrorKind;
    use ags_ledger::{HealthLedger, MemoryLedgerStorage};
    use std::time::Duration;

    fn stage(agent: ScriptedAgent, role: StageRole) -> Stage {
        Stage::new(Box::new(agent), role)
    }

    #[test]
    fn test_parse_batch_skips_blank_lines() {
        let batch = parse_batch("grace\n\n  mercy  \n");
        assert_eq!(
            batch,
            vec![
                WorkItem {
                    index: 1,
                    payload: "grace".to_string()
                },
                WorkItem {
                    index: 2,
                    payload: "mercy".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_items_flow_through_stages() {
        let source = ScriptedAgent::new("topic_researcher").outputs(["grace\nmercy"]);
        let composer = ScriptedAgent::echo("content_composer", "article: ");
        let mut controller = RunController::new(
            monitor().await,
            Box::new(source),
            vec![stage(composer, StageRole::Required)],
            Shutdown::new(),
            fast_run_config(),
        );

        let report = controller.run_once().await;
        assert!(!report.is_failure());
        assert_eq!(report.completed(), 2);
        assert_eq!(
            report.items[1].outcome,
            ItemOutcome::Completed {
                output: "article: mercy".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_retry_once_then_succeed_learns_strategy() {
        let source = ScriptedAgent::new("topic_researcher").outputs(["grace"]);
        let composer = ScriptedAgent::new("content_composer")
            .error(AgentError::new(ErrorKind::Timeout, "ETIMEDOUT"))
            .outputs(["article"]);
        let calls = composer.clone();

        let mut controller = RunController::new(
            monitor().await,
            Box::new(source),
            vec![stage(composer, StageRole::Required)],
            Shutdown::new(),
            fast_run_config(),
        );

        let report = controller.run_once().await;
        assert_eq!(report.completed(), 1);
        assert_eq!(calls.calls(), 2);

        let ledger = controller.monitor().ledger();
        assert_eq!(ledger.agent_health("content_composer").consecutive_failures, 0);
        assert!(ledger.learned_strategy("content_composer", "ETIMEDOUT").is_some());
    }

    #[tokio::test]
    async fn test_learned_strategy_keeps_rate_limit_wait() {
        let mut config = fast_config();
        config.recovery.rate_limit_wait_ms = 7;
        let ledger = HealthLedger::open(MemoryLedgerStorage::new()).await.unwrap();
        let monitor = HealthMonitor::new(ledger, &config);

        let error = AgentError::untagged("HTTP 429 Too Many Requests");
        assert_eq!(error.kind, ErrorKind::RateLimited);
        let source = ScriptedAgent::new("topic_researcher").outputs(["grace"]);
        let composer = ScriptedAgent::new("content_composer")
            .error(error.clone())
            .outputs(["article"]);

        let mut controller = RunController::new(
            monitor,
            Box::new(source),
            vec![stage(composer, StageRole::Required)],
            Shutdown::new(),
            config.run.clone(),
        );
        let report = controller.run_once().await;
        assert_eq!(report.completed(), 1);

        let monitor = controller.monitor();
        assert!(monitor
            .ledger()
            .learned_strategy("content_composer", &error.message)
            .is_some());
        let directive = monitor.recovery_strategy("content_composer", &error);
        assert_eq!(directive.wait, Duration::from_millis(7));
    }

    #[tokio::test]
    async fn test_retry_refused_by_tripped_breaker_reports_failure() {
        let mut monitor = monitor().await;
        let error = AgentError::untagged("fetch failed");
        for _ in 0..4 {
            monitor
                .record_failure("safety_officer", &error, &ErrorContext::new())
                .await;
        }

        let source = ScriptedAgent::new("topic_researcher").outputs(["grace"]);
        let safety = ScriptedAgent::new("safety_officer").error(AgentError::untagged("checker crashed"));
        let calls = safety.clone();

        let mut controller = RunController::new(
            monitor,
            Box::new(source),
            vec![stage(safety, StageRole::SafetyCritical)],
            Shutdown::new(),
            fast_run_config(),
        );

        let report = controller.run_once().await;
        assert_eq!(calls.calls(), 1);
        assert_eq!(
            report.items[0].outcome,
            ItemOutcome::Failed {
                agent: "safety_officer".to_string(),
                error: "checker crashed".to_string()
            }
        );
        assert!(report.is_failure());
    }

    #[tokio::test]
    async fn test_quota_error_is_not_retried() {
        let source = ScriptedAgent::new("topic_researcher").outputs(["grace"]);
        let composer = ScriptedAgent::new("content_composer")
            .error(AgentError::untagged("insufficient_quota"));
        let calls = composer.clone();

        let mut controller = RunController::new(
            monitor().await,
            Box::new(source),
            vec![stage(composer, StageRole::Required)],
            Shutdown::new(),
            fast_run_config(),
        );

        let report = controller.run_once().await;
        assert_eq!(calls.calls(), 1);
        assert!(report.is_failure());
        assert_eq!(
            report.failure_reason().as_deref(),
            Some("All 1 work items failed")
        );
    }

    #[tokio::test]
    async fn test_optional_stage_failure_passes_input_through() {
        let source = ScriptedAgent::new("topic_researcher").outputs(["draft"]);
        let formatter = ScriptedAgent::new("formatter")
            .error(AgentError::untagged("boom"))
            .error(AgentError::untagged("boom again"));
        let publisher = ScriptedAgent::echo("publisher", "published: ");

        let mut controller = RunController::new(
            monitor().await,
            Box::new(source),
            vec![
                stage(formatter, StageRole::Optional),
                stage(publisher, StageRole::Required),
            ],
            Shutdown::new(),
            fast_run_config(),
        );

        let report = controller.run_once().await;
        assert_eq!(
            report.items[0].outcome,
            ItemOutcome::Completed {
                output: "published: draft".to_string()
            }
        );
        assert_eq!(
            controller
                .monitor()
                .ledger()
                .agent_health("formatter")
                .consecutive_failures,
            2
        );
    }

    #[tokio::test]
    async fn test_agent_veto_discards_item() {
        let source = ScriptedAgent::new("topic_researcher").outputs(["one\ntwo"]);
        let safety = ScriptedAgent::new("safety_officer")
            .veto("doctrinal concern")
            .outputs(["approved"]);

        let mut controller = RunController::new(
            monitor().await,
            Box::new(source),
            vec![stage(safety, StageRole::SafetyCritical)],
            Shutdown::new(),
            fast_run_config(),
        );

        let report = controller.run_once().await;
        assert_eq!(report.vetoed(), 1);
        assert_eq!(report.completed(), 1);
        assert!(!report.is_failure());
    }

    #[tokio::test]
    async fn test_gate_veto_by_role() {
        let mut monitor = monitor().await;
        let error = AgentError::untagged("fetch failed");
        for agent in ["safety_officer", "formatter", "publisher"] {
            for _ in 0..5 {
                monitor.record_failure(agent, &error, &ErrorContext::new()).await;
            }
        }

        let source = ScriptedAgent::new("topic_researcher").outputs(["a\nb"]);
        let formatter = ScriptedAgent::echo("formatter", "x");
        let safety = ScriptedAgent::echo("safety_officer", "y");
        let untouched = safety.clone();

        let mut controller = RunController::new(
            monitor,
            Box::new(source),
            vec![
                stage(formatter, StageRole::Optional),
                stage(safety, StageRole::SafetyCritical),
            ],
            Shutdown::new(),
            fast_run_config(),
        );

        let report = controller.run_once().await;
        assert_eq!(report.vetoed(), 2);
        assert_eq!(untouched.calls(), 0);
        assert!(matches!(
            &report.items[0].outcome,
            ItemOutcome::Vetoed { agent, .. } if agent == "safety_officer"
        ));
    }

    #[tokio::test]
    async fn test_source_failure_fails_run() {
        let source = ScriptedAgent::new("topic_researcher")
            .error(AgentError::untagged("insufficient_quota"));

        let mut controller = RunController::new(
            monitor().await,
            Box::new(source),
            Vec::new(),
            Shutdown::new(),
            fast_run_config(),
        );

        let report = controller.run_once().await;
        assert!(report.is_failure());
        assert!(report.items.is_empty());
        assert!(report.failure_reason().unwrap().contains("insufficient_quota"));
    }

    #[tokio::test]
    async fn test_empty_batch_is_not_a_failure() {
        let source = ScriptedAgent::new("topic_researcher").outputs(["   "]);
        let mut controller = RunController::new(
            monitor().await,
            Box::new(source),
            Vec::new(),
            Shutdown::new(),
            fast_run_config(),
        );

        let report = controller.run_once().await;
        assert!(!report.is_failure());
        assert!(report.items.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_before_run_interrupts() {
        let shutdown = Shutdown::new();
        shutdown.trigger();

        let source = ScriptedAgent::new("topic_researcher").outputs(["a"]);
        let calls = source.clone();
        let mut controller = RunController::new(
            monitor().await,
            Box::new(source),
            Vec::new(),
            shutdown,
            fast_run_config(),
        );

        let report = controller.run_once().await;
        assert!(report.interrupted);
        assert!(!report.is_failure());
        assert_eq!(calls.calls(), 0);
    }

    #[tokio::test]
    async fn test_in_flight_call_abandoned_after_grace() {
        let shutdown = Shutdown::new();
        let mut config = fast_run_config();
        config.shutdown_grace_secs = 0;

        let source = ScriptedAgent::new("topic_researcher")
            .delay(Duration::from_secs(30))
            .outputs(["a"]);

        let mut controller = RunController::new(
            monitor().await,
            Box::new(source),
            Vec::new(),
            shutdown.clone(),
            config,
        );

        let trigger = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.trigger();
        });

        let started = std::time::Instant::now();
        let report = controller.run_once().await;
        assert!(report.interrupted);
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
