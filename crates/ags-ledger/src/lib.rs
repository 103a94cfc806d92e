//! # ags-ledger
//!
//! Durable bookkeeping of agent health for the AGS pipeline.
//!
//! This crate provides:
//! - The ledger data model (agent health, error patterns, learned recovery
//!   strategies, improvement log)
//! - Injected storage with a crash-safe file implementation
//! - [`HealthLedger`], the only writer of agent health records
//! - CI artifact import/export so health survives ephemeral runners
//!
//! The ledger knows nothing about circuit breaker policy; it records what
//! happened and answers health queries.

pub mod artifact;
mod ledger;
mod model;
mod storage;

pub use ledger::{AgentHealth, ErrorContext, HealthLedger, HealthStatus, SystemHealth};
pub use model::{
    pattern_key, strategy_key, AgentHealthRecord, ErrorPatternRecord, Impact, Improvement,
    LedgerData, MAX_IMPROVEMENTS, MAX_STRATEGIES_PER_PATTERN,
};
pub use storage::{FileLedgerStorage, LedgerStorage, MemoryLedgerStorage};
