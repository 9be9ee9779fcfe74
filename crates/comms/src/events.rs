//! Lifecycle events published by the communicator
//!
//! Events fan out over a `tokio::sync::broadcast` channel. Publishing never
//! blocks; when nobody listens the event is dropped, and slow subscribers
//! observe `RecvError::Lagged` instead of stalling calls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use tracing::trace;

use crate::metrics::OperationStats;
use crate::types::CallId;

/// Where the value returned to the caller came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    Cache,
    Service,
    Fallback(FallbackKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackKind {
    StaleCache,
    Degraded,
    AlternativeService,
    DefaultResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommsEvent {
    CallStart {
        call_id: CallId,
        service: String,
        operation: String,
        timestamp: DateTime<Utc>,
    },
    CallComplete {
        call_id: CallId,
        service: String,
        operation: String,
        source: ResponseSource,
        duration_ms: f64,
        timestamp: DateTime<Utc>,
    },
    CallError {
        call_id: CallId,
        service: String,
        operation: String,
        error: String,
        kind: String,
        duration_ms: f64,
        timestamp: DateTime<Utc>,
    },
    PerformanceAlert {
        severity: AlertSeverity,
        service: String,
        operation: String,
        duration_ms: f64,
        threshold_ms: u64,
        timestamp: DateTime<Utc>,
    },
    PerformanceSummary {
        operations: BTreeMap<String, OperationStats>,
        timestamp: DateTime<Utc>,
    },
}

impl CommsEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CommsEvent::CallStart { .. } => "call_start",
            CommsEvent::CallComplete { .. } => "call_complete",
            CommsEvent::CallError { .. } => "call_error",
            CommsEvent::PerformanceAlert { .. } => "performance_alert",
            CommsEvent::PerformanceSummary { .. } => "performance_summary",
        }
    }
}

#[derive(Clone)]
pub struct EventHub {
    sender: broadcast::Sender<CommsEvent>,
}

impl EventHub {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: CommsEvent) {
        let name = event.name();
        if self.sender.send(event).is_err() {
            trace!(event = name, "no event subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CommsEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(1024)
    }
}
