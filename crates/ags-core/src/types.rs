//! Agent failure classification
//!
//! Agents report failures as [`AgentError`] values carrying an [`ErrorKind`].
//! Callers that know why a call failed (an HTTP 429, a request timeout, a
//! JSON decode error) tag the error when they create it. Errors whose origin
//! cannot tag them fall back to keyword inference over the message text.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// What kind of failure an agent call produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Provider quota is exhausted; retrying cannot help
    QuotaExhausted,
    /// Provider is throttling requests
    RateLimited,
    /// The call did not finish in time
    Timeout,
    /// Connection-level failure
    Network,
    /// Model output could not be parsed or failed validation
    Parse,
    /// The model returned nothing usable
    EmptyResponse,
    /// Anything else
    Unknown,
}

impl ErrorKind {
    /// Stable name used in ledger keys (`agent:kind`)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QuotaExhausted => "quota_exhausted",
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::Parse => "parse",
            Self::EmptyResponse => "empty_response",
            Self::Unknown => "unknown",
        }
    }

    /// Infer a kind from free-form error text.
    ///
    /// Rules are tested in order against the lowercased message, so a
    /// message mentioning both a 429 and a quota is treated as throttling.
    pub fn infer(message: &str) -> Self {
        let lower = message.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

        if has(&["rate_limit", "rate limit", "429"]) {
            Self::RateLimited
        } else if has(&["quota"]) {
            Self::QuotaExhausted
        } else if has(&["timeout", "timed out", "etimedout"]) {
            Self::Timeout
        } else if has(&["network", "fetch", "econnreset", "econnrefused"]) {
            Self::Network
        } else if has(&["parse", "json"]) {
            Self::Parse
        } else if has(&["empty", "null"]) {
            Self::EmptyResponse
        } else {
            Self::Unknown
        }
    }

    /// Advisory fix for a recurring error of this kind.
    ///
    /// Purely diagnostic: the suggestion is cached in the ledger for
    /// operators and never changes retry behaviour.
    pub fn suggested_fix(&self) -> Option<&'static str> {
        match self {
            Self::QuotaExhausted => Some(
                "API quota exceeded. Consider reducing batch size or adding rate limiting delays.",
            ),
            Self::RateLimited => Some("Rate limit hit. Implement exponential backoff with jitter."),
            Self::Timeout => Some(
                "Request timeout. Consider increasing timeout duration or breaking into smaller chunks.",
            ),
            Self::Parse => Some("Parsing error. Add validation and fallback parsing strategies."),
            Self::Network => Some("Network error. Implement retry logic with exponential backoff."),
            Self::EmptyResponse => Some("Empty response. Add validation checks before processing."),
            Self::Unknown => None,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed agent call, as reported by the collaborator that made it
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct AgentError {
    /// Failure classification
    pub kind: ErrorKind,
    /// Human-readable error text
    pub message: String,
}

impl AgentError {
    /// Create an error whose kind is known at the call site
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Create an error from text alone, inferring its kind
    pub fn untagged(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: ErrorKind::infer(&message),
            message,
        }
    }
}
