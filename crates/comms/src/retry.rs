//! Bounded retry with exponential backoff
//!
//! Each attempt is a direct call. The per-attempt deadline shrinks to
//! `timeout / attempt` so that late attempts fail fast instead of stacking
//! latency, and the delay before attempt `n` is
//! `min(retry_delay * multiplier^(n-1), 10s)`.

use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::CallConfig;
use crate::error::{CommsError, CommsResult};
use crate::strategies::DirectExecutor;
use crate::transport::Target;
use crate::types::CallParameters;

/// Upper bound of a single backoff delay
pub const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Delay slept before `attempt` (1-based); zero for the first attempt
pub fn backoff_delay(attempt: u32, retry_delay: Duration, multiplier: f64) -> Duration {
    if attempt <= 1 {
        return Duration::ZERO;
    }
    let base = retry_delay.as_millis() as f64;
    let exponential = base * multiplier.powi(attempt as i32 - 1);
    let capped = exponential.min(MAX_BACKOFF.as_millis() as f64);
    Duration::from_millis(capped.max(0.0) as u64)
}

/// Deadline of `attempt` (1-based)
pub fn attempt_timeout(timeout: Duration, attempt: u32) -> Duration {
    timeout / attempt.max(1)
}

#[derive(Clone)]
pub struct RetryExecutor {
    direct: DirectExecutor,
}

impl RetryExecutor {
    pub fn new(direct: DirectExecutor) -> Self {
        Self { direct }
    }

    /// Run up to `config.max_retries` attempts; returns the last error when
    /// they are exhausted or a non-retryable error as soon as it is seen.
    pub async fn execute_with_retry(
        &self,
        service: &str,
        operation: &str,
        params: &CallParameters,
        config: &CallConfig,
    ) -> CommsResult<Value> {
        let target = Target::service(service);
        let max_attempts = config.max_retries.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            let delay = backoff_delay(attempt, config.retry_delay, config.backoff_multiplier);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let timeout = attempt_timeout(config.timeout, attempt);
            debug!(
                service,
                operation,
                attempt,
                max_attempts,
                timeout_ms = timeout.as_millis() as u64,
                "Retry attempt"
            );

            match self.direct.execute(&target, operation, params, timeout).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(service, operation, attempt, "Call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) if !error.is_retryable() => {
                    warn!(
                        service,
                        operation,
                        attempt,
                        error = %error,
                        "Non-retryable failure, giving up"
                    );
                    return Err(error);
                }
                Err(error) => {
                    if attempt < max_attempts {
                        let next_delay =
                            backoff_delay(attempt + 1, config.retry_delay, config.backoff_multiplier);
                        warn!(
                            service,
                            operation,
                            attempt,
                            delay_ms = next_delay.as_millis() as u64,
                            error = %error,
                            "Attempt failed, retrying"
                        );
                    }
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            CommsError::Configuration(format!("no attempts made for {service}.{operation}"))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CallOptions, CommsConfig};
    use crate::transport::{Scripted, SimulatedTransport};
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::Arc;

    fn executor(transport: Arc<SimulatedTransport>) -> RetryExecutor {
        RetryExecutor::new(DirectExecutor::new(transport))
    }

    fn call_config(max_retries: u32) -> CallConfig {
        CallOptions::new()
            .with_max_retries(max_retries)
            .with_timeout(Duration::from_millis(900))
            .resolve(&CommsConfig::default())
    }

    #[test]
    fn test_backoff_schedule() {
        let delay = Duration::from_millis(1000);
        assert_eq!(backoff_delay(1, delay, 2.0), Duration::ZERO);
        assert_eq!(backoff_delay(2, delay, 2.0), Duration::from_millis(2000));
        assert_eq!(backoff_delay(3, delay, 2.0), Duration::from_millis(4000));
        assert_eq!(backoff_delay(4, delay, 2.0), Duration::from_millis(8000));
        assert_eq!(backoff_delay(5, delay, 2.0), MAX_BACKOFF);
    }

    #[test]
    fn test_attempt_timeout_shrinks() {
        let timeout = Duration::from_millis(900);
        assert_eq!(attempt_timeout(timeout, 1), Duration::from_millis(900));
        assert_eq!(attempt_timeout(timeout, 2), Duration::from_millis(450));
        assert_eq!(attempt_timeout(timeout, 3), Duration::from_millis(300));
    }

    proptest! {
        #[test]
        fn prop_backoff_is_monotonic_and_capped(
            delay_ms in 1u64..5_000,
            multiplier in 1.0f64..4.0,
            attempts in 2u32..12,
        ) {
            let delay = Duration::from_millis(delay_ms);
            let mut previous = Duration::ZERO;
            for attempt in 1..=attempts {
                let current = backoff_delay(attempt, delay, multiplier);
                prop_assert!(current >= previous);
                prop_assert!(current <= MAX_BACKOFF);
                previous = current;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_max_attempts() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.script(
            "ragService",
            "indexDocument",
            Scripted::Fail(CommsError::from_status("ragService", 503, "unavailable")),
        );

        let error = executor(transport.clone())
            .execute_with_retry("ragService", "indexDocument", &CallParameters::new(), &call_config(3))
            .await
            .expect_err("Test operation should fail");

        assert_eq!(error.status(), Some(503));
        assert_eq!(transport.calls("ragService", "indexDocument"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_error_stops_after_one_attempt() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.script(
            "agentService",
            "createAgent",
            Scripted::Fail(CommsError::transport("agentService", "Validation failed: name")),
        );

        let error = executor(transport.clone())
            .execute_with_retry("agentService", "createAgent", &CallParameters::new(), &call_config(3))
            .await
            .expect_err("Test operation should fail");

        assert!(matches!(error, CommsError::NonRetryable { .. }));
        assert_eq!(transport.calls("agentService", "createAgent"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_call_is_retried_until_success() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.script_sequence(
            "billingService",
            "chargeInvoice",
            vec![
                Scripted::Fail(CommsError::from_status("billingService", 429, "slow down")),
                Scripted::Respond(json!({"charged": true})),
            ],
        );

        let started = tokio::time::Instant::now();
        let value = executor(transport.clone())
            .execute_with_retry("billingService", "chargeInvoice", &CallParameters::new(), &call_config(3))
            .await
            .expect("Test operation should succeed");

        assert_eq!(value, json!({"charged": true}));
        assert_eq!(transport.calls("billingService", "chargeInvoice"), 2);
        // one backoff of retry_delay * 2
        assert_eq!(started.elapsed(), Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_use_shrinking_deadlines() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.script("ragService", "queryKnowledge", Scripted::Hang);

        let started = tokio::time::Instant::now();
        let error = executor(transport.clone())
            .execute_with_retry("ragService", "queryKnowledge", &CallParameters::new(), &call_config(3))
            .await
            .expect_err("Test operation should fail");

        assert!(matches!(error, CommsError::Timeout { timeout, .. } if timeout == Duration::from_millis(300)));
        // 900 + 2000 + 450 + 4000 + 300
        assert_eq!(started.elapsed(), Duration::from_millis(7650));
        assert_eq!(transport.calls("ragService", "queryKnowledge"), 3);
    }
}
