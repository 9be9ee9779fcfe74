//! Request coalescing for batchable operations
//!
//! Calls to the same `(service, operation)` accumulate in a pending batch
//! that is flushed when it reaches `max_size` or when its window timer
//! fires, whichever comes first. The flush issues one
//! [`Transport::invoke_batch`] and hands result `i` to caller `i` through a
//! dedicated oneshot channel, so a caller can never observe another
//! caller's response. If the transport answers with the wrong number of
//! results, every caller in that batch gets an error.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{CommsError, CommsResult};
use crate::transport::{Target, Transport};
use crate::types::{CallParameters, OperationKey};

struct PendingCall {
    params: CallParameters,
    timeout: Duration,
    reply: oneshot::Sender<CommsResult<Value>>,
}

struct PendingBatch {
    id: Uuid,
    calls: Vec<PendingCall>,
}

struct BatchInner {
    transport: Arc<dyn Transport>,
    max_size: usize,
    window: Duration,
    pending: Mutex<HashMap<OperationKey, PendingBatch>>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct BatchExecutor {
    inner: Arc<BatchInner>,
}

impl BatchExecutor {
    pub fn new(
        transport: Arc<dyn Transport>,
        max_size: usize,
        window: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(BatchInner {
                transport,
                max_size: max_size.max(1),
                window,
                pending: Mutex::new(HashMap::new()),
                shutdown,
            }),
        }
    }

    pub async fn execute(
        &self,
        key: &OperationKey,
        params: CallParameters,
        timeout: Duration,
    ) -> CommsResult<Value> {
        if self.inner.shutdown.is_cancelled() {
            return Err(CommsError::Shutdown);
        }

        let (reply, response) = oneshot::channel();
        let full = {
            let mut pending = self.inner.pending.lock();
            let batch = pending.entry(key.clone()).or_insert_with(|| {
                let id = Uuid::new_v4();
                tokio::spawn(flush_on_window(Arc::clone(&self.inner), key.clone(), id));
                PendingBatch {
                    id,
                    calls: Vec::new(),
                }
            });
            batch.calls.push(PendingCall {
                params,
                timeout,
                reply,
            });

            if batch.calls.len() >= self.inner.max_size {
                pending.remove(key)
            } else {
                None
            }
        };

        if let Some(batch) = full {
            debug!(key = %key, batch_id = %batch.id, size = batch.calls.len(), "Batch full, flushing");
            tokio::spawn(flush(Arc::clone(&self.inner), key.clone(), batch));
        }

        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CommsError::transport(
                &key.service,
                "batch was dropped before answering",
            )),
            Err(_) => Err(CommsError::timeout(&key.service, &key.operation, timeout)),
        }
    }

    /// Number of calls waiting for a flush
    pub fn pending_calls(&self) -> usize {
        self.inner
            .pending
            .lock()
            .values()
            .map(|batch| batch.calls.len())
            .sum()
    }

    /// Fail every pending call with [`CommsError::Shutdown`]
    pub fn fail_pending(&self) {
        let drained: Vec<PendingBatch> = self.inner.pending.lock().drain().map(|(_, b)| b).collect();
        for batch in drained {
            reply_all(batch.calls, &CommsError::Shutdown);
        }
    }
}

async fn flush_on_window(inner: Arc<BatchInner>, key: OperationKey, id: Uuid) {
    tokio::select! {
        _ = tokio::time::sleep(inner.window) => {}
        _ = inner.shutdown.cancelled() => {}
    }

    let batch = {
        let mut pending = inner.pending.lock();
        match pending.get(&key) {
            Some(batch) if batch.id == id => pending.remove(&key),
            // already flushed because it filled up
            _ => None,
        }
    };

    if let Some(batch) = batch {
        if inner.shutdown.is_cancelled() {
            reply_all(batch.calls, &CommsError::Shutdown);
        } else {
            debug!(key = %key, batch_id = %batch.id, size = batch.calls.len(), "Batch window elapsed, flushing");
            flush(inner, key, batch).await;
        }
    }
}

async fn flush(inner: Arc<BatchInner>, key: OperationKey, batch: PendingBatch) {
    let timeout = batch
        .calls
        .iter()
        .map(|call| call.timeout)
        .max()
        .unwrap_or(inner.window);
    let (params, replies): (Vec<_>, Vec<_>) = batch
        .calls
        .into_iter()
        .map(|call| (call.params, call.reply))
        .unzip();

    let target = Target::service(&key.service);
    let call = inner
        .transport
        .invoke_batch(&target, &key.operation, &params, timeout);

    let outcome = tokio::select! {
        result = tokio::time::timeout(timeout, call) => result,
        _ = inner.shutdown.cancelled() => {
            for reply in replies {
                let _ = reply.send(Err(CommsError::Shutdown));
            }
            return;
        }
    };

    match outcome {
        Ok(Ok(results)) if results.len() == replies.len() => {
            for (reply, result) in replies.into_iter().zip(results) {
                // the caller may have timed out already
                let _ = reply.send(result.map_err(CommsError::classify));
            }
        }
        Ok(Ok(results)) => {
            warn!(
                key = %key,
                batch_id = %batch.id,
                expected = replies.len(),
                received = results.len(),
                "Batch result count mismatch"
            );
            let error = CommsError::transport(
                &key.service,
                format!(
                    "batch {} returned {} results for {} calls",
                    batch.id,
                    results.len(),
                    replies.len()
                ),
            );
            for reply in replies {
                let _ = reply.send(Err(error.clone()));
            }
        }
        Ok(Err(error)) => {
            let error = error.classify();
            for reply in replies {
                let _ = reply.send(Err(error.clone()));
            }
        }
        Err(_) => {
            let error = CommsError::timeout(&key.service, &key.operation, timeout);
            for reply in replies {
                let _ = reply.send(Err(error.clone()));
            }
        }
    }
}

fn reply_all(calls: Vec<PendingCall>, error: &CommsError) {
    for call in calls {
        let _ = call.reply.send(Err(error.clone()));
    }
}
