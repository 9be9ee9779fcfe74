//! Error taxonomy for service-to-service calls
//!
//! Every failure that leaves this crate is a [`CommsError`]. Transport
//! implementations report raw failures as [`CommsError::Transport`]; the
//! retry layer normalizes them with [`CommsError::classify`] so that
//! authentication, validation and other client-side failures are never retried.

use std::time::Duration;
use thiserror::Error;

use crate::strategies::StrategyKind;

pub type CommsResult<T> = Result<T, CommsError>;

/// Keywords that mark a failure as caused by the request itself
const NON_RETRYABLE_MARKERS: &[&str] = &[
    "authentication",
    "unauthenticated",
    "unauthorized",
    "authorization",
    "forbidden",
    "not found",
    "not_found",
    "bad request",
    "bad_request",
    "validation",
    "invalid argument",
];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommsError {
    #[error("{service}.{operation} timed out after {timeout:?}")]
    Timeout {
        service: String,
        operation: String,
        timeout: Duration,
    },

    #[error("circuit breaker open for service {service}")]
    CircuitOpen { service: String },

    #[error("non-retryable failure from {service}: {message}")]
    NonRetryable {
        service: String,
        status: Option<u16>,
        message: String,
    },

    #[error("transport failure from {service}: {message}")]
    Transport {
        service: String,
        status: Option<u16>,
        message: String,
    },

    #[error("all strategies failed for {service}.{operation} (tried {attempted:?}): {last}")]
    StrategyExhausted {
        service: String,
        operation: String,
        attempted: Vec<StrategyKind>,
        #[source]
        last: Box<CommsError>,
    },

    #[error("no fallback produced a result for {service}.{operation}")]
    FallbackExhausted { service: String, operation: String },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("service communicator is shut down")]
    Shutdown,
}

impl CommsError {
    /// Build a transport failure; transports should prefer this constructor
    pub fn transport(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            service: service.into(),
            status: None,
            message: message.into(),
        }
    }

    /// Build a transport failure carrying an HTTP-style status code
    pub fn from_status(service: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        Self::Transport {
            service: service.into(),
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn timeout(service: &str, operation: &str, timeout: Duration) -> Self {
        Self::Timeout {
            service: service.to_string(),
            operation: operation.to_string(),
            timeout,
        }
    }

    /// HTTP-style status attached to the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transport { status, .. } | Self::NonRetryable { status, .. } => *status,
            Self::StrategyExhausted { last, .. } => last.status(),
            _ => None,
        }
    }

    /// Whether a local retry can reasonably succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Transport {
                status, message, ..
            } => !is_non_retryable(*status, message),
            Self::NonRetryable { .. }
            | Self::CircuitOpen { .. }
            | Self::Configuration(_)
            | Self::Shutdown
            | Self::FallbackExhausted { .. } => false,
            Self::StrategyExhausted { last, .. } => last.is_retryable(),
        }
    }

    /// Rewrite a transport failure that matches the non-retryable rules
    /// into [`CommsError::NonRetryable`]; everything else passes through.
    pub fn classify(self) -> Self {
        match self {
            Self::Transport {
                service,
                status,
                message,
            } if is_non_retryable(status, &message) => Self::NonRetryable {
                service,
                status,
                message,
            },
            other => other,
        }
    }

    /// Short machine-readable category, used in events and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::NonRetryable { .. } => "non_retryable",
            Self::Transport { .. } => "transport",
            Self::StrategyExhausted { .. } => "strategy_exhausted",
            Self::FallbackExhausted { .. } => "fallback_exhausted",
            Self::Configuration(_) => "configuration",
            Self::Shutdown => "shutdown",
        }
    }
}

/// 4xx statuses are client errors except 408 (request timeout) and 429
/// (rate limited); without a status the message decides.
fn is_non_retryable(status: Option<u16>, message: &str) -> bool {
    if let Some(code) = status {
        if code == 408 || code == 429 {
            return false;
        }
        if (400..500).contains(&code) {
            return true;
        }
    }

    let lowered = message.to_lowercase();
    NON_RETRYABLE_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}
