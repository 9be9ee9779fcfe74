//! Execution strategies and the selector that orders them
//!
//! A call runs through the selected strategies in order until one returns.
//! The resulting order is `[streaming?, batch?, parallel?, retry|direct]`:
//! the specialised strategies come first, and the retry strategy, whose first
//! attempt is a plain direct call, is always the last resort.

mod batch;
mod direct;
mod parallel;
mod streaming;

pub use batch::BatchExecutor;
pub use direct::DirectExecutor;
pub use parallel::ParallelExecutor;
pub use streaming::{combine_chunks, StreamingExecutor};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{CallConfig, CommsConfig};
use crate::error::{CommsError, CommsResult};
use crate::retry::RetryExecutor;
use crate::transport::{ServiceRegistry, Target, Transport};
use crate::types::{CallParameters, OperationDescriptor, OperationKey, Priority};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Direct,
    Parallel,
    Batch,
    Streaming,
    Retry,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StrategyKind::Direct => "direct",
            StrategyKind::Parallel => "parallel",
            StrategyKind::Batch => "batch",
            StrategyKind::Streaming => "streaming",
            StrategyKind::Retry => "retry",
        };
        f.write_str(name)
    }
}

/// Order the strategies for one call
pub fn select_strategies(descriptor: &OperationDescriptor, config: &CallConfig) -> Vec<StrategyKind> {
    let mut strategies = Vec::with_capacity(4);

    if config.priority != Priority::Critical && descriptor.supports_replicas {
        strategies.insert(0, StrategyKind::Parallel);
    }
    if descriptor.batchable {
        strategies.insert(0, StrategyKind::Batch);
    }
    if descriptor.streaming {
        strategies.insert(0, StrategyKind::Streaming);
    }

    if config.max_retries > 1 {
        strategies.push(StrategyKind::Retry);
    } else {
        strategies.push(StrategyKind::Direct);
    }
    strategies
}

/// Successful strategy run
#[derive(Debug, Clone, PartialEq)]
pub struct Executed {
    pub value: Value,
    pub strategy: StrategyKind,
}

/// Owns one executor per strategy and runs a selected list in order
pub struct StrategyExecutor {
    direct: DirectExecutor,
    retry: RetryExecutor,
    parallel: ParallelExecutor,
    batch: BatchExecutor,
    streaming: StreamingExecutor,
}

impl StrategyExecutor {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<dyn ServiceRegistry>,
        config: &CommsConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let direct = DirectExecutor::new(Arc::clone(&transport));
        Self {
            retry: RetryExecutor::new(direct.clone()),
            parallel: ParallelExecutor::new(direct.clone(), registry, config.max_parallel_replicas),
            batch: BatchExecutor::new(
                Arc::clone(&transport),
                config.batch_max_size,
                config.batch_window(),
                shutdown.clone(),
            ),
            streaming: StreamingExecutor::new(transport, shutdown),
            direct,
        }
    }

    pub async fn execute(
        &self,
        strategy: StrategyKind,
        key: &OperationKey,
        params: &CallParameters,
        config: &CallConfig,
    ) -> CommsResult<Value> {
        let target = Target::service(&key.service);
        match strategy {
            StrategyKind::Direct => {
                self.direct
                    .execute(&target, &key.operation, params, config.timeout)
                    .await
            }
            StrategyKind::Retry => {
                self.retry
                    .execute_with_retry(&key.service, &key.operation, params, config)
                    .await
            }
            StrategyKind::Parallel => {
                self.parallel
                    .execute(&key.service, &key.operation, params, config.timeout)
                    .await
            }
            StrategyKind::Batch => {
                self.batch
                    .execute(key, params.clone(), config.timeout)
                    .await
            }
            StrategyKind::Streaming => {
                self.streaming
                    .execute(&target, &key.operation, params, config.timeout)
                    .await
            }
        }
    }

    /// Run the selected strategies in order.
    ///
    /// Non-retryable and shutdown errors stop the chain immediately and are
    /// returned as-is; otherwise exhausting every strategy yields
    /// [`CommsError::StrategyExhausted`] wrapping the last failure.
    pub async fn run(
        &self,
        key: &OperationKey,
        params: &CallParameters,
        descriptor: &OperationDescriptor,
        config: &CallConfig,
    ) -> CommsResult<Executed> {
        let strategies = select_strategies(descriptor, config);
        debug!(key = %key, ?strategies, "Selected strategies");

        let mut attempted = Vec::with_capacity(strategies.len());
        let mut last_error = None;

        for strategy in strategies {
            attempted.push(strategy);
            match self.execute(strategy, key, params, config).await {
                Ok(value) => return Ok(Executed { value, strategy }),
                Err(error @ (CommsError::NonRetryable { .. } | CommsError::Shutdown)) => {
                    return Err(error)
                }
                Err(error) => {
                    warn!(key = %key, strategy = %strategy, error = %error, "Strategy failed");
                    last_error = Some(error);
                }
            }
        }

        let last = last_error.unwrap_or_else(|| {
            CommsError::Configuration(format!("no strategy selected for {key}"))
        });
        Err(CommsError::StrategyExhausted {
            service: key.service.clone(),
            operation: key.operation.clone(),
            attempted,
            last: Box::new(last),
        })
    }

    /// Fail calls still waiting in a batch
    pub fn fail_pending(&self) {
        self.batch.fail_pending();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CallOptions;
    use crate::transport::{Scripted, SimulatedTransport, StaticRegistry};
    use rstest::rstest;
    use serde_json::json;
    use std::time::Duration;

    fn resolve(options: CallOptions) -> CallConfig {
        options.resolve(&CommsConfig::default())
    }

    #[rstest]
    #[case(OperationDescriptor::default(), CallOptions::new(), vec![StrategyKind::Retry])]
    #[case(OperationDescriptor::default(), CallOptions::new().with_max_retries(1), vec![StrategyKind::Direct])]
    #[case(OperationDescriptor::replicated(), CallOptions::new(), vec![StrategyKind::Parallel, StrategyKind::Retry])]
    #[case(OperationDescriptor::replicated(), CallOptions::critical(), vec![StrategyKind::Retry])]
    #[case(OperationDescriptor::batchable(), CallOptions::new(), vec![StrategyKind::Batch, StrategyKind::Retry])]
    #[case(OperationDescriptor::streaming(), CallOptions::new(), vec![StrategyKind::Streaming, StrategyKind::Retry])]
    #[case(
        OperationDescriptor { cacheable: false, supports_replicas: true, batchable: true, streaming: true },
        CallOptions::new(),
        vec![StrategyKind::Streaming, StrategyKind::Batch, StrategyKind::Parallel, StrategyKind::Retry]
    )]
    fn test_strategy_selection(
        #[case] descriptor: OperationDescriptor,
        #[case] options: CallOptions,
        #[case] expected: Vec<StrategyKind>,
    ) {
        assert_eq!(select_strategies(&descriptor, &resolve(options)), expected);
    }

    fn executor(transport: Arc<SimulatedTransport>, registry: StaticRegistry) -> StrategyExecutor {
        StrategyExecutor::new(
            transport,
            Arc::new(registry),
            &CommsConfig::default(),
            CancellationToken::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_through_to_retry_when_parallel_misconfigured() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.script("ragService", "searchDocuments", Scripted::Respond(json!(["doc"])));
        let strategies = executor(transport.clone(), StaticRegistry::new());

        let executed = strategies
            .run(
                &OperationKey::new("ragService", "searchDocuments"),
                &CallParameters::new(),
                &OperationDescriptor::replicated(),
                &resolve(CallOptions::new()),
            )
            .await
            .expect("Test operation should succeed");

        assert_eq!(executed.strategy, StrategyKind::Retry);
        assert_eq!(executed.value, json!(["doc"]));
        assert_eq!(transport.calls("ragService", "searchDocuments"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_aborts_remaining_strategies() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.script(
            "billingService",
            "batchCharge",
            Scripted::Fail(CommsError::from_status("billingService", 403, "forbidden")),
        );
        let strategies = executor(transport.clone(), StaticRegistry::new());

        let error = strategies
            .run(
                &OperationKey::new("billingService", "batchCharge"),
                &CallParameters::new(),
                &OperationDescriptor::batchable(),
                &resolve(CallOptions::new()),
            )
            .await
            .expect_err("Test operation should fail");

        assert!(matches!(error, CommsError::NonRetryable { status: Some(403), .. }));
        // only the batch attempt reached the transport
        assert_eq!(transport.calls("billingService", "batchCharge"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_lists_attempted_strategies() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.script("ragService", "searchDocuments", Scripted::Hang);
        let registry = StaticRegistry::new().with_service("ragService", ["a", "b"]);
        let strategies = executor(transport.clone(), registry);

        let error = strategies
            .run(
                &OperationKey::new("ragService", "searchDocuments"),
                &CallParameters::new(),
                &OperationDescriptor::replicated(),
                &resolve(CallOptions::new().with_timeout(Duration::from_millis(100))),
            )
            .await
            .expect_err("Test operation should fail");

        match error {
            CommsError::StrategyExhausted { attempted, last, .. } => {
                assert_eq!(attempted, vec![StrategyKind::Parallel, StrategyKind::Retry]);
                assert!(matches!(*last, CommsError::Timeout { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        // two replicas raced, then three retry attempts
        assert_eq!(transport.calls("ragService", "searchDocuments"), 5);
    }
}
