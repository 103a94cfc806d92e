//! # ags-core
//!
//! Core types for the AGS agent reliability subsystem.
//!
//! The content pipeline is a fixed sequence of LLM-backed agents (topic
//! research, composition, safety review, publishing, ...). This crate holds
//! what every reliability layer shares:
//!
//! - The unified [`AgsError`] type and [`Result`] alias
//! - [`AgentError`] and [`ErrorKind`], the tagged failure values agents report
//! - [`AgsConfig`], loaded from `.ags/config.toml`
//! - Fail-open helpers for infrastructure work that must never abort a run

pub mod config;
mod error;
pub mod fail_open;
mod types;

pub use config::{
    AgsConfig, CircuitBreakerConfig, LedgerConfig, PipelineConfig, RecoveryConfig, RunConfig,
    SourceSpec, StageRole, StageSpec,
};
pub use error::{AgsError, Result};
pub use types::*;
