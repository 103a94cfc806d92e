//! # ags-orchestrator
//!
//! Drives the AGS pipeline through the reliability layers.
//!
//! - [`RunController`] executes one run: fetch a batch from the work source,
//!   pass each item through the stages, gate every call through the
//!   [`ags_agent::HealthMonitor`] and retry a failed call once
//! - [`Supervisor`] repeats runs, counts failed ones and restarts the
//!   monitor in-process when the system needs it
//! - [`Shutdown`] is the cooperative signal every wait re-checks

pub mod agent;
pub mod controller;
pub mod shutdown;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use agent::{Agent, AgentReply, CommandAgent, VETO_EXIT_CODE};
pub use controller::{ItemOutcome, ItemReport, RunController, RunReport, Stage, WorkItem};
pub use shutdown::Shutdown;
pub use supervisor::{decide, NextStep, Supervisor, SupervisorStats};
