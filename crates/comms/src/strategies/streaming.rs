use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{CommsError, CommsResult};
use crate::transport::{StreamEvent, Target, Transport};
use crate::types::CallParameters;

/// Collects a streamed response into one payload.
///
/// The subscription is torn down through its cancellation token on every
/// exit path: completion, stream error, deadline or communicator shutdown.
#[derive(Clone)]
pub struct StreamingExecutor {
    transport: Arc<dyn Transport>,
    shutdown: CancellationToken,
}

impl StreamingExecutor {
    pub fn new(transport: Arc<dyn Transport>, shutdown: CancellationToken) -> Self {
        Self {
            transport,
            shutdown,
        }
    }

    pub async fn execute(
        &self,
        target: &Target,
        operation: &str,
        params: &CallParameters,
        timeout: Duration,
    ) -> CommsResult<Value> {
        let cancel = self.shutdown.child_token();
        let _teardown = cancel.clone().drop_guard();

        let collect = async {
            let mut events = self
                .transport
                .subscribe(target, operation, params, cancel.clone())
                .await?;

            let mut chunks = Vec::new();
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(StreamEvent::Data(chunk)) => chunks.push(chunk),
                        Some(StreamEvent::End) => {
                            debug!(target = %target, operation, chunks = chunks.len(), "Stream completed");
                            return Ok(combine_chunks(chunks));
                        }
                        Some(StreamEvent::Error(error)) => return Err(error.classify()),
                        None => {
                            return Err(CommsError::transport(
                                &target.service,
                                "stream closed before completion",
                            ))
                        }
                    },
                    _ = cancel.cancelled() => return Err(CommsError::Shutdown),
                }
            }
        };

        match tokio::time::timeout(timeout, collect).await {
            Ok(result) => result,
            Err(_) => Err(CommsError::timeout(&target.service, operation, timeout)),
        }
    }
}

/// Text chunks are concatenated; anything else becomes a JSON array
pub fn combine_chunks(chunks: Vec<Value>) -> Value {
    if !chunks.is_empty() && chunks.iter().all(Value::is_string) {
        let text: String = chunks.iter().filter_map(Value::as_str).collect();
        Value::String(text)
    } else {
        Value::Array(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SimulatedTransport;
    use serde_json::json;

    fn target() -> Target {
        Target::service("conversationService")
    }

    #[test]
    fn test_combine_chunks() {
        assert_eq!(combine_chunks(vec![json!("Hel"), json!("lo")]), json!("Hello"));
        assert_eq!(
            combine_chunks(vec![json!({"token": 1}), json!("x")]),
            json!([{"token": 1}, "x"])
        );
        assert_eq!(combine_chunks(Vec::new()), json!([]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_collects_until_end() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.script_stream(
            "conversationService",
            "streamReply",
            vec![
                StreamEvent::Data(json!("Hi ")),
                StreamEvent::Data(json!("there")),
                StreamEvent::End,
            ],
            Duration::from_millis(10),
        );
        let streaming = StreamingExecutor::new(transport.clone(), CancellationToken::new());

        let value = streaming
            .execute(&target(), "streamReply", &CallParameters::new(), Duration::from_secs(1))
            .await
            .expect("Test operation should succeed");

        assert_eq!(value, json!("Hi there"));
        tokio::task::yield_now().await;
        assert_eq!(transport.active_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_tears_down_subscription() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.script_stream(
            "conversationService",
            "streamReply",
            vec![StreamEvent::Data(json!("partial"))],
            Duration::from_millis(10),
        );
        let streaming = StreamingExecutor::new(transport.clone(), CancellationToken::new());

        let error = streaming
            .execute(&target(), "streamReply", &CallParameters::new(), Duration::from_millis(200))
            .await
            .expect_err("Test operation should fail");

        assert!(matches!(error, CommsError::Timeout { .. }));
        tokio::task::yield_now().await;
        assert_eq!(transport.active_streams(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_error_is_classified() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.script_stream(
            "conversationService",
            "streamReply",
            vec![
                StreamEvent::Data(json!("a")),
                StreamEvent::Error(CommsError::from_status("conversationService", 401, "token expired")),
            ],
            Duration::from_millis(1),
        );
        let streaming = StreamingExecutor::new(transport.clone(), CancellationToken::new());

        let error = streaming
            .execute(&target(), "streamReply", &CallParameters::new(), Duration::from_secs(1))
            .await
            .expect_err("Test operation should fail");

        assert!(matches!(error, CommsError::NonRetryable { status: Some(401), .. }));
        tokio::task::yield_now().await;
        assert_eq!(transport.active_streams(), 0);
    }
}
