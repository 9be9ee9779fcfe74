use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::DirectExecutor;
use crate::error::{CommsError, CommsResult};
use crate::transport::{ServiceRegistry, Target};
use crate::types::CallParameters;

/// Races the same call against several replicas of a service.
///
/// Each replica gets half of the call timeout. The first success wins and
/// the remaining in-flight calls are dropped.
#[derive(Clone)]
pub struct ParallelExecutor {
    direct: DirectExecutor,
    registry: Arc<dyn ServiceRegistry>,
    max_replicas: usize,
}

impl ParallelExecutor {
    pub fn new(
        direct: DirectExecutor,
        registry: Arc<dyn ServiceRegistry>,
        max_replicas: usize,
    ) -> Self {
        Self {
            direct,
            registry,
            max_replicas,
        }
    }

    pub async fn execute(
        &self,
        service: &str,
        operation: &str,
        params: &CallParameters,
        timeout: Duration,
    ) -> CommsResult<Value> {
        let replicas = self.registry.resolve(service);
        if replicas.len() < 2 {
            return Err(CommsError::Configuration(format!(
                "parallel strategy needs at least 2 replicas of {service}, registry knows {}",
                replicas.len()
            )));
        }

        let per_replica = timeout / 2;
        let mut racing: FuturesUnordered<_> = replicas
            .into_iter()
            .take(self.max_replicas)
            .map(|replica| {
                let target = Target::replica(service, replica);
                async move {
                    let result = self
                        .direct
                        .execute(&target, operation, params, per_replica)
                        .await;
                    (target, result)
                }
            })
            .collect();

        let mut last_error = None;
        while let Some((target, result)) = racing.next().await {
            match result {
                Ok(value) => {
                    debug!(target = %target, operation, "Replica won the race");
                    return Ok(value);
                }
                Err(error) => {
                    debug!(target = %target, operation, error = %error, "Replica failed");
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| CommsError::timeout(service, operation, per_replica)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockServiceRegistry, Scripted, SimulatedTransport};
    use serde_json::json;

    fn registry_with(replicas: &'static [&'static str]) -> Arc<dyn ServiceRegistry> {
        let mut registry = MockServiceRegistry::new();
        registry
            .expect_resolve()
            .returning(move |_| replicas.iter().map(|r| r.to_string()).collect());
        Arc::new(registry)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fastest_replica_wins() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.script_replica(
            "ragService",
            "rag-a",
            Scripted::delayed(Duration::from_millis(300), Scripted::Respond(json!("slow"))),
        );
        transport.script_replica(
            "ragService",
            "rag-b",
            Scripted::delayed(Duration::from_millis(20), Scripted::Respond(json!("fast"))),
        );

        let parallel = ParallelExecutor::new(
            DirectExecutor::new(transport.clone()),
            registry_with(&["rag-a", "rag-b"]),
            3,
        );
        let value = parallel
            .execute("ragService", "searchDocuments", &CallParameters::new(), Duration::from_secs(1))
            .await
            .expect("Test operation should succeed");

        assert_eq!(value, json!("fast"));
        assert_eq!(transport.replica_calls("rag-a"), 1);
        assert_eq!(transport.replica_calls("rag-b"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_replica_does_not_win() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.script_replica(
            "ragService",
            "rag-a",
            Scripted::Fail(CommsError::from_status("ragService", 500, "boom")),
        );
        transport.script_replica(
            "ragService",
            "rag-b",
            Scripted::delayed(Duration::from_millis(50), Scripted::Respond(json!("ok"))),
        );

        let parallel = ParallelExecutor::new(
            DirectExecutor::new(transport),
            registry_with(&["rag-a", "rag-b"]),
            3,
        );
        let value = parallel
            .execute("ragService", "searchDocuments", &CallParameters::new(), Duration::from_secs(1))
            .await
            .expect("Test operation should succeed");

        assert_eq!(value, json!("ok"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_races_at_most_three_replicas_with_half_timeout() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.script("ragService", "searchDocuments", Scripted::Hang);

        let parallel = ParallelExecutor::new(
            DirectExecutor::new(transport.clone()),
            registry_with(&["r1", "r2", "r3", "r4"]),
            3,
        );
        let error = parallel
            .execute("ragService", "searchDocuments", &CallParameters::new(), Duration::from_secs(1))
            .await
            .expect_err("Test operation should fail");

        assert!(
            matches!(error, CommsError::Timeout { timeout, .. } if timeout == Duration::from_millis(500))
        );
        assert_eq!(transport.calls("ragService", "searchDocuments"), 3);
        assert_eq!(transport.replica_calls("r4"), 0);
    }

    #[tokio::test]
    async fn test_single_replica_is_a_configuration_error() {
        let transport = Arc::new(SimulatedTransport::new());
        let parallel = ParallelExecutor::new(
            DirectExecutor::new(transport.clone()),
            registry_with(&["only-one"]),
            3,
        );

        let error = parallel
            .execute("ragService", "searchDocuments", &CallParameters::new(), Duration::from_secs(1))
            .await
            .expect_err("Test operation should fail");

        assert!(matches!(error, CommsError::Configuration(_)));
        assert_eq!(transport.total_calls(), 0);
    }
}
