//! Per-operation latency and outcome tracking with threshold alerts

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::PerformanceThresholds;
use crate::events::{AlertSeverity, CommsEvent, EventHub};
use crate::types::OperationKey;

/// Samples kept for percentile estimates
pub const RECENT_WINDOW: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Success,
    Error,
    CacheHit,
    /// Refused by an open circuit breaker before any network call
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceGrade {
    Excellent,
    Good,
    Acceptable,
    Slow,
    Critical,
}

impl PerformanceGrade {
    pub fn classify(duration_ms: f64, thresholds: &PerformanceThresholds) -> Self {
        let ms = duration_ms;
        if ms <= thresholds.excellent_ms as f64 {
            Self::Excellent
        } else if ms <= thresholds.good_ms as f64 {
            Self::Good
        } else if ms <= thresholds.acceptable_ms as f64 {
            Self::Acceptable
        } else if ms <= thresholds.critical_ms as f64 {
            Self::Slow
        } else {
            Self::Critical
        }
    }
}

#[derive(Debug, Clone, Default)]
struct PerformanceMetrics {
    total_calls: u64,
    success_count: u64,
    error_count: u64,
    cache_hits: u64,
    rejected: u64,
    total_duration_ms: f64,
    min_duration_ms: Option<f64>,
    max_duration_ms: f64,
    recent_durations: VecDeque<f64>,
}

impl PerformanceMetrics {
    fn record(&mut self, duration_ms: f64, status: CallStatus) {
        self.total_calls += 1;
        match status {
            CallStatus::Success => self.success_count += 1,
            CallStatus::Error => self.error_count += 1,
            CallStatus::CacheHit => self.cache_hits += 1,
            CallStatus::Rejected => self.rejected += 1,
        }

        self.total_duration_ms += duration_ms;
        self.min_duration_ms = Some(self.min_duration_ms.map_or(duration_ms, |m| m.min(duration_ms)));
        self.max_duration_ms = self.max_duration_ms.max(duration_ms);

        if self.recent_durations.len() == RECENT_WINDOW {
            self.recent_durations.pop_front();
        }
        self.recent_durations.push_back(duration_ms);
    }

    fn stats(&self, thresholds: &PerformanceThresholds) -> OperationStats {
        let avg = if self.total_calls == 0 {
            0.0
        } else {
            self.total_duration_ms / self.total_calls as f64
        };
        let served = self.success_count + self.cache_hits;
        let success_rate = if self.total_calls == 0 {
            0.0
        } else {
            served as f64 / self.total_calls as f64 * 100.0
        };

        let mut sorted: Vec<f64> = self.recent_durations.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);

        OperationStats {
            total_calls: self.total_calls,
            success_count: self.success_count,
            error_count: self.error_count,
            cache_hits: self.cache_hits,
            rejected: self.rejected,
            success_rate,
            avg_duration_ms: avg,
            min_duration_ms: self.min_duration_ms.unwrap_or(0.0),
            max_duration_ms: self.max_duration_ms,
            p50: percentile(&sorted, 50.0),
            p95: percentile(&sorted, 95.0),
            p99: percentile(&sorted, 99.0),
            grade: PerformanceGrade::classify(avg, thresholds),
        }
    }
}

/// Snapshot of one operation's metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationStats {
    pub total_calls: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub cache_hits: u64,
    pub rejected: u64,
    /// Percentage of calls answered by the service or the cache
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub min_duration_ms: f64,
    pub max_duration_ms: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub grade: PerformanceGrade,
}

/// Nearest-rank percentile of an ascending slice; 0 when empty
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p * sorted.len() as f64 / 100.0).ceil() as usize;
    let index = rank.clamp(1, sorted.len()) - 1;
    sorted[index]
}

pub struct PerformanceRecorder {
    metrics: DashMap<OperationKey, PerformanceMetrics>,
    thresholds: PerformanceThresholds,
    breakers: Arc<CircuitBreakerRegistry>,
    events: EventHub,
}

impl PerformanceRecorder {
    pub fn new(
        thresholds: PerformanceThresholds,
        breakers: Arc<CircuitBreakerRegistry>,
        events: EventHub,
    ) -> Self {
        Self {
            metrics: DashMap::new(),
            thresholds,
            breakers,
            events,
        }
    }

    /// Record one finished call.
    ///
    /// `Success` and `Error` also feed the circuit breaker of `service`;
    /// cache hits and breaker rejections never reached the network and
    /// leave it untouched.
    pub fn record_metric(
        &self,
        service: &str,
        operation: &str,
        duration: Duration,
        status: CallStatus,
    ) -> Option<AlertSeverity> {
        let duration_ms = duration.as_micros() as f64 / 1000.0;
        self.metrics
            .entry(OperationKey::new(service, operation))
            .or_default()
            .record(duration_ms, status);

        match status {
            CallStatus::Success => self.breakers.record_outcome(service, true),
            CallStatus::Error => self.breakers.record_outcome(service, false),
            CallStatus::CacheHit | CallStatus::Rejected => {}
        }

        self.check_thresholds(service, operation, duration_ms)
    }

    fn check_thresholds(&self, service: &str, operation: &str, duration_ms: f64) -> Option<AlertSeverity> {
        let (severity, threshold_ms) = if duration_ms > self.thresholds.critical_ms as f64 {
            error!(service, operation, duration_ms, "Critical call latency");
            (AlertSeverity::Critical, self.thresholds.critical_ms)
        } else if duration_ms > self.thresholds.slow_ms as f64 {
            warn!(service, operation, duration_ms, "Slow call");
            (AlertSeverity::Warning, self.thresholds.slow_ms)
        } else {
            return None;
        };

        self.events.publish(CommsEvent::PerformanceAlert {
            severity,
            service: service.to_string(),
            operation: operation.to_string(),
            duration_ms,
            threshold_ms,
            timestamp: Utc::now(),
        });
        Some(severity)
    }

    /// Snapshot keyed by `"service.operation"`, optionally filtered
    pub fn get_stats(
        &self,
        service_filter: Option<&str>,
        operation_filter: Option<&str>,
    ) -> BTreeMap<String, OperationStats> {
        self.metrics
            .iter()
            .filter(|entry| service_filter.map_or(true, |s| entry.key().service == s))
            .filter(|entry| operation_filter.map_or(true, |o| entry.key().operation == o))
            .map(|entry| (entry.key().to_string(), entry.value().stats(&self.thresholds)))
            .collect()
    }

    /// Publish a [`CommsEvent::PerformanceSummary`] of every operation
    pub fn publish_summary(&self) {
        let operations = self.get_stats(None, None);
        if operations.is_empty() {
            return;
        }
        self.events.publish(CommsEvent::PerformanceSummary {
            operations,
            timestamp: Utc::now(),
        });
    }

    pub fn reset(&self) {
        self.metrics.clear();
    }
}
