//! # ags-agent
//!
//! Reliability policy for AGS agent calls.
//!
//! This crate provides:
//! - Per-agent circuit breakers (closed / open / half-open)
//! - A rule-based recovery engine that maps failures to retry directives
//! - [`HealthMonitor`], the gate every agent call passes through
//!
//! ## Key Pattern
//!
//! Breaker state is in memory and resets with the process; the durable view
//! of agent health is the ledger from `ags-ledger`. The monitor writes every
//! outcome to both, ledger first, so the breaker always sees the ledger as
//! it stands after the call.

mod circuit_breaker;
mod monitor;
mod recovery;

pub use circuit_breaker::{Circuit, CircuitBreakers, CircuitState, CircuitStatus};
pub use monitor::{
    restart_wait, AgentCheck, GateDecision, HealthCheck, HealthMonitor, RestartDecision,
};
pub use recovery::{RecoveryDirective, RecoveryEngine};
