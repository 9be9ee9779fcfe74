use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::{CommsError, CommsResult};
use crate::transport::{Target, Transport};
use crate::types::CallParameters;

/// One transport call raced against a deadline.
///
/// When the deadline wins, the in-flight invoke future is dropped.
#[derive(Clone)]
pub struct DirectExecutor {
    transport: Arc<dyn Transport>,
}

impl DirectExecutor {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub async fn execute(
        &self,
        target: &Target,
        operation: &str,
        params: &CallParameters,
        timeout: Duration,
    ) -> CommsResult<Value> {
        let call = self.transport.invoke(target, operation, params, timeout);
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result.map_err(CommsError::classify),
            Err(_) => {
                debug!(
                    target = %target,
                    operation,
                    timeout_ms = timeout.as_millis() as u64,
                    "Direct call hit its deadline"
                );
                Err(CommsError::timeout(&target.service, operation, timeout))
            }
        }
    }
}
