//! Run supervisor
//!
//! Repeats runs until shutdown or `max_runs`, counts consecutive failed
//! runs, and restarts the health monitor in-process when the system needs
//! it. Whatever ends the loop, including a panic, the ledger gets a final
//! best-effort flush.

use ags_agent::{restart_wait, RestartDecision};
use ags_core::fail_open::fail_open;
use ags_core::{AgsError, Result, RunConfig};
use ags_ledger::{Impact, LedgerStorage};
use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::controller::RunController;

/// Counters kept across runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SupervisorStats {
    pub runs: usize,
    pub failed_runs: usize,
    /// Failed runs since the last successful one
    pub consecutive_failures: usize,
    pub restarts: usize,
    /// Restarts since the last run that needed none
    pub restart_streak: usize,
}

/// What to do after a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextStep {
    /// Sleep, then run again
    Wait(Duration),
    /// Sleep, restart the monitor, then run again
    Restart { reason: String, wait: Duration },
}

/// Pick the next step after a run
///
/// Reaching `max_consecutive_failures` restarts with exponential backoff.
/// A restart the monitor asks for on health grounds waits as long as it
/// advises, capped at `restart_max_wait_ms`.
pub fn decide(
    run: &RunConfig,
    consecutive_failures: usize,
    run_failed: bool,
    restart: &RestartDecision,
) -> NextStep {
    if run_failed && consecutive_failures >= run.max_consecutive_failures {
        return NextStep::Restart {
            reason: format!("{} consecutive run failures", consecutive_failures),
            wait: restart_wait(run, consecutive_failures),
        };
    }
    if restart.should_restart {
        return NextStep::Restart {
            reason: restart.reason.clone(),
            wait: Duration::from_millis(restart.wait_ms.min(run.restart_max_wait_ms)),
        };
    }
    if run_failed {
        NextStep::Wait(Duration::from_millis(run.failure_wait_ms))
    } else {
        NextStep::Wait(run.interval())
    }
}

pub struct Supervisor<S: LedgerStorage> {
    controller: RunController<S>,
    config: RunConfig,
    stats: SupervisorStats,
}

impl<S: LedgerStorage> Supervisor<S> {
    pub fn new(controller: RunController<S>, config: RunConfig) -> Self {
        Self {
            controller,
            config,
            stats: SupervisorStats::default(),
        }
    }

    pub fn controller(&self) -> &RunController<S> {
        &self.controller
    }

    pub fn stats(&self) -> &SupervisorStats {
        &self.stats
    }

    /// Supervise runs until shutdown, `max_runs`, or the restart limit
    pub async fn run(&mut self) -> Result<SupervisorStats> {
        let outcome = AssertUnwindSafe(self.supervise()).catch_unwind().await;

        let monitor = self.controller.monitor();
        if fail_open("final ledger flush", || monitor.flush()).await.is_some() {
            info!("Ledger flushed");
        }

        match outcome {
            Ok(result) => result,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("Supervisor panicked: {}", message);
                Err(AgsError::Other(format!("Supervisor panicked: {}", message)))
            }
        }
    }

    async fn supervise(&mut self) -> Result<SupervisorStats> {
        let poll = self.config.poll_interval();
        info!("Supervisor started");

        loop {
            if self.controller.shutdown().is_triggered() {
                info!("Shutdown requested, stopping supervisor");
                break;
            }

            let report = self.controller.run_once().await;
            self.stats.runs += 1;
            let failed = report.is_failure();

            if failed {
                self.stats.failed_runs += 1;
                self.stats.consecutive_failures += 1;
                let reason = report.failure_reason().unwrap_or_default();
                error!(
                    consecutive_failures = self.stats.consecutive_failures,
                    "Run {} failed: {}", self.stats.runs, reason
                );
                self.controller
                    .monitor_mut()
                    .record_improvement(format!("Run failed: {}", reason), Impact::Negative)
                    .await;
            } else if !report.interrupted {
                if self.stats.consecutive_failures > 0 {
                    let change = format!(
                        "Recovered after {} consecutive failed runs",
                        self.stats.consecutive_failures
                    );
                    info!("{}", change);
                    self.controller
                        .monitor_mut()
                        .record_improvement(change, Impact::Positive)
                        .await;
                }
                self.stats.consecutive_failures = 0;
            }

            self.controller.health_check();

            if self.controller.shutdown().is_triggered() {
                info!("Shutdown requested, stopping supervisor");
                break;
            }
            if self.config.max_runs > 0 && self.stats.runs >= self.config.max_runs {
                info!("Completed {} run(s), stopping", self.stats.runs);
                break;
            }

            let restart = self.controller.monitor().should_restart();
            match decide(&self.config, self.stats.consecutive_failures, failed, &restart) {
                NextStep::Wait(wait) => {
                    if !failed {
                        self.stats.restart_streak = 0;
                    }
                    info!("Next run in {:.1}s", wait.as_secs_f64());
                    if !self.controller.shutdown().sleep(wait, poll).await {
                        break;
                    }
                }
                NextStep::Restart { reason, wait } => {
                    if let Some(max) = self.config.max_restarts {
                        if self.stats.restart_streak >= max {
                            error!("Restart needed ({}) but the limit of {} is reached", reason, max);
                            return Err(AgsError::RestartLimit(self.stats.restart_streak));
                        }
                    }

                    warn!("Restarting in {:.1}s: {}", wait.as_secs_f64(), reason);
                    if !self.controller.shutdown().sleep(wait, poll).await {
                        break;
                    }

                    let monitor = self.controller.monitor_mut();
                    if let Err(e) = monitor.restart().await {
                        warn!("Restart could not reload the ledger: {}", e);
                    }
                    monitor
                        .record_improvement(format!("Restarted: {}", reason), Impact::Neutral)
                        .await;
                    self.stats.restarts += 1;
                    self.stats.restart_streak += 1;
                }
            }
        }

        Ok(self.stats.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, AgentReply};
    use crate::controller::Stage;
    use crate::shutdown::Shutdown;
    use crate::testing::{fast_config, fast_run_config, monitor, ScriptedAgent};
    use ags_agent::HealthMonitor;
    use ags_core::{AgentError, StageRole};
    use ags_ledger::{ErrorContext, HealthLedger, MemoryLedgerStorage};
    use async_trait::async_trait;

    fn no_restart() -> RestartDecision {
        RestartDecision {
            should_restart: false,
            reason: "System is operational".to_string(),
            wait_ms: 0,
        }
    }

    async fn supervisor(
        source: ScriptedAgent,
        stages: Vec<Stage>,
        config: RunConfig,
    ) -> Supervisor<MemoryLedgerStorage> {
        let controller = RunController::new(
            monitor().await,
            Box::new(source),
            stages,
            Shutdown::new(),
            config.clone(),
        );
        Supervisor::new(controller, config)
    }

    fn negative_entries(supervisor: &Supervisor<MemoryLedgerStorage>) -> usize {
        supervisor
            .controller()
            .monitor()
            .ledger()
            .improvements()
            .iter()
            .filter(|i| i.impact == Impact::Negative)
            .count()
    }

    #[test]
    fn test_decide_waits_interval_after_success() {
        let run = RunConfig::default();
        assert_eq!(
            decide(&run, 0, false, &no_restart()),
            NextStep::Wait(Duration::from_secs(3_600))
        );
    }

    #[test]
    fn test_decide_waits_after_failure_below_max() {
        let run = RunConfig::default();
        assert_eq!(
            decide(&run, 2, true, &no_restart()),
            NextStep::Wait(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_decide_restarts_at_max_failures() {
        let run = RunConfig::default();
        match decide(&run, 4, true, &no_restart()) {
            NextStep::Restart { reason, wait } => {
                assert_eq!(reason, "4 consecutive run failures");
                assert_eq!(wait, Duration::from_secs(480));
            }
            other => panic!("expected restart, got {:?}", other),
        }
    }

    #[test]
    fn test_decide_follows_monitor_restart_advice() {
        let run = RunConfig::default();
        let advice = RestartDecision {
            should_restart: true,
            reason: "Critical agents failing: safety_officer".to_string(),
            wait_ms: 120_000,
        };
        assert_eq!(
            decide(&run, 0, false, &advice),
            NextStep::Restart {
                reason: "Critical agents failing: safety_officer".to_string(),
                wait: Duration::from_secs(120),
            }
        );
    }

    #[tokio::test]
    async fn test_stops_after_max_runs() {
        let mut config = fast_run_config();
        config.max_runs = 3;
        let source = ScriptedAgent::echo("topic_researcher", "topic");

        let mut supervisor = supervisor(source, Vec::new(), config).await;
        let stats = supervisor.run().await.unwrap();

        assert_eq!(stats.runs, 3);
        assert_eq!(stats.failed_runs, 0);
        assert_eq!(stats.restarts, 0);
    }

    #[tokio::test]
    async fn test_failed_runs_restart_in_process() {
        let mut config = fast_run_config();
        config.max_runs = 4;
        // Exhausted script: every call fails
        let source = ScriptedAgent::new("topic_researcher");

        let mut supervisor = supervisor(source, Vec::new(), config).await;
        let stats = supervisor.run().await.unwrap();

        assert_eq!(stats.runs, 4);
        assert_eq!(stats.failed_runs, 4);
        assert_eq!(stats.consecutive_failures, 4);
        assert_eq!(stats.restarts, 1);
        assert_eq!(negative_entries(&supervisor), 4);
    }

    #[tokio::test]
    async fn test_restart_limit_is_terminal() {
        let mut config = fast_run_config();
        config.max_restarts = Some(1);
        let source = ScriptedAgent::new("topic_researcher");

        let mut supervisor = supervisor(source, Vec::new(), config).await;
        let err = supervisor.run().await.unwrap_err();

        assert!(matches!(err, AgsError::RestartLimit(1)));
        assert_eq!(supervisor.stats().runs, 4);
    }

    #[tokio::test]
    async fn test_restart_gives_skipped_critical_agent_its_trial_call() {
        let mut ledger = HealthLedger::open(MemoryLedgerStorage::new()).await.unwrap();
        let error = AgentError::untagged("fetch failed");
        for _ in 0..5 {
            ledger
                .record_failure("topic_researcher", &error, &ErrorContext::new())
                .await
                .unwrap();
        }
        // The streak opens the source's circuit for the full open timeout
        let monitor = HealthMonitor::new(ledger, &fast_config());

        let mut config = fast_run_config();
        config.max_runs = 2;
        let source = ScriptedAgent::echo("topic_researcher", "topic");
        let controller = RunController::new(
            monitor,
            Box::new(source.clone()),
            Vec::new(),
            Shutdown::new(),
            config.clone(),
        );
        let mut supervisor = Supervisor::new(controller, config);
        let stats = supervisor.run().await.unwrap();

        assert_eq!(stats.runs, 2);
        assert_eq!(stats.failed_runs, 1);
        assert_eq!(stats.restarts, 1);
        assert_eq!(stats.consecutive_failures, 0);
        assert_eq!(source.calls(), 1);
        assert_eq!(
            supervisor
                .controller()
                .monitor()
                .ledger()
                .agent_health("topic_researcher")
                .consecutive_failures,
            0
        );
    }

    #[tokio::test]
    async fn test_recovery_records_positive_improvement() {
        let mut config = fast_run_config();
        config.max_runs = 2;
        let source = ScriptedAgent::new("topic_researcher")
            .error(AgentError::untagged("fetch failed"))
            .error(AgentError::untagged("fetch failed"))
            .outputs(["grace"]);
        let composer = ScriptedAgent::echo("content_composer", "article: ");

        let mut supervisor = supervisor(
            source,
            vec![Stage::new(Box::new(composer), StageRole::Required)],
            config,
        )
        .await;
        let stats = supervisor.run().await.unwrap();

        assert_eq!(stats.failed_runs, 1);
        assert_eq!(stats.consecutive_failures, 0);
        let last = supervisor
            .controller()
            .monitor()
            .ledger()
            .improvements()
            .last()
            .cloned()
            .unwrap();
        assert_eq!(last.impact, Impact::Positive);
        assert_eq!(last.change, "Recovered after 1 consecutive failed runs");
    }

    #[tokio::test]
    async fn test_shutdown_ends_interval_wait() {
        let mut config = fast_run_config();
        config.interval_secs = 3_600;
        let source = ScriptedAgent::echo("topic_researcher", "");

        let mut supervisor = supervisor(source, Vec::new(), config).await;
        let trigger = supervisor.controller().shutdown().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.trigger();
        });

        let stats = tokio::time::timeout(Duration::from_secs(10), supervisor.run())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.runs, 1);
    }

    struct PanickingAgent;

    #[async_trait]
    impl Agent for PanickingAgent {
        fn name(&self) -> &str {
            "topic_researcher"
        }

        async fn invoke(&self, _input: &str) -> std::result::Result<AgentReply, AgentError> {
            panic!("boom")
        }
    }

    #[tokio::test]
    async fn test_panic_is_caught_and_ledger_flushed() {
        let controller = RunController::new(
            monitor().await,
            Box::new(PanickingAgent),
            Vec::new(),
            Shutdown::new(),
            fast_run_config(),
        );
        let mut supervisor = Supervisor::new(controller, fast_run_config());
        let saves_before = supervisor.controller().monitor().ledger().storage().save_count();

        let err = supervisor.run().await.unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert_eq!(
            supervisor.controller().monitor().ledger().storage().save_count(),
            saves_before + 1
        );
    }
}
