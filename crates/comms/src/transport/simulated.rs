//! In-process transport double used by tests and `commsctl simulate`.
//!
//! Every operation answers with an echo of its request unless scripted.
//! Scripts are consumed in order and the last step repeats.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::{StreamEvent, Target, Transport};
use crate::error::{CommsError, CommsResult};
use crate::types::{CallParameters, OperationKey};

/// One scripted answer
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Reply with the request echoed back
    Echo,
    Respond(Value),
    Fail(CommsError),
    /// Never answer; only the caller's deadline ends the call
    Hang,
    Delayed(Duration, Box<Scripted>),
}

impl Scripted {
    pub fn delayed(delay: Duration, then: Scripted) -> Self {
        Self::Delayed(delay, Box::new(then))
    }
}

#[derive(Debug, Default)]
struct Script {
    steps: VecDeque<Scripted>,
}

impl Script {
    fn next(&mut self) -> Option<Scripted> {
        if self.steps.len() > 1 {
            self.steps.pop_front()
        } else {
            self.steps.front().cloned()
        }
    }
}

#[derive(Debug, Clone)]
struct StreamScript {
    events: Vec<StreamEvent>,
    interval: Duration,
}

#[derive(Default)]
pub struct SimulatedTransport {
    latency: Duration,
    failure_rate: f64,
    scripts: DashMap<OperationKey, Mutex<Script>>,
    replica_scripts: DashMap<(String, String), Mutex<Script>>,
    streams: DashMap<OperationKey, StreamScript>,
    truncated_batches: DashMap<OperationKey, ()>,
    calls: DashMap<OperationKey, usize>,
    replica_calls: DashMap<String, usize>,
    batch_calls: DashMap<OperationKey, usize>,
    subscriptions: DashMap<OperationKey, usize>,
    active_streams: Arc<AtomicUsize>,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Base latency of unscripted calls, jittered by up to ±50%
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Probability that an unscripted call fails with a 503
    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn script(&self, service: &str, operation: &str, step: Scripted) {
        self.script_sequence(service, operation, vec![step]);
    }

    pub fn script_sequence(&self, service: &str, operation: &str, steps: Vec<Scripted>) {
        self.scripts.insert(
            OperationKey::new(service, operation),
            Mutex::new(Script {
                steps: steps.into(),
            }),
        );
    }

    /// Script every call routed to one replica, regardless of operation
    pub fn script_replica(&self, service: &str, replica: &str, step: Scripted) {
        self.replica_scripts.insert(
            (service.to_string(), replica.to_string()),
            Mutex::new(Script {
                steps: VecDeque::from([step]),
            }),
        );
    }

    /// Events are emitted one per `interval`. Without a trailing
    /// [`StreamEvent::End`] the stream stays open until cancelled.
    pub fn script_stream(
        &self,
        service: &str,
        operation: &str,
        events: Vec<StreamEvent>,
        interval: Duration,
    ) {
        self.streams.insert(
            OperationKey::new(service, operation),
            StreamScript { events, interval },
        );
    }

    /// Batches of this operation answer with one result too few
    pub fn truncate_batches(&self, service: &str, operation: &str) {
        self.truncated_batches
            .insert(OperationKey::new(service, operation), ());
    }

    pub fn calls(&self, service: &str, operation: &str) -> usize {
        self.calls
            .get(&OperationKey::new(service, operation))
            .map(|count| *count)
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.iter().map(|entry| *entry.value()).sum()
    }

    pub fn replica_calls(&self, replica: &str) -> usize {
        self.replica_calls
            .get(replica)
            .map(|count| *count)
            .unwrap_or(0)
    }

    pub fn batch_calls(&self, service: &str, operation: &str) -> usize {
        self.batch_calls
            .get(&OperationKey::new(service, operation))
            .map(|count| *count)
            .unwrap_or(0)
    }

    pub fn subscriptions(&self, service: &str, operation: &str) -> usize {
        self.subscriptions
            .get(&OperationKey::new(service, operation))
            .map(|count| *count)
            .unwrap_or(0)
    }

    /// Stream producer tasks still running
    pub fn active_streams(&self) -> usize {
        self.active_streams.load(Ordering::SeqCst)
    }

    fn next_step(&self, key: &OperationKey, target: &Target) -> Scripted {
        if let Some(replica) = &target.replica {
            let replica_key = (target.service.clone(), replica.clone());
            if let Some(script) = self.replica_scripts.get(&replica_key) {
                if let Some(step) = script.lock().next() {
                    return step;
                }
            }
        }

        if let Some(script) = self.scripts.get(key) {
            if let Some(step) = script.lock().next() {
                return step;
            }
        }

        let mut rng = rand::thread_rng();
        let step = if self.failure_rate > 0.0 && rng.gen_bool(self.failure_rate) {
            Scripted::Fail(CommsError::from_status(
                target.service.clone(),
                503,
                "simulated upstream failure",
            ))
        } else {
            Scripted::Echo
        };

        if self.latency.is_zero() {
            step
        } else {
            let base = self.latency.as_millis() as u64;
            let jittered = rng.gen_range(base / 2..=base + base / 2);
            Scripted::delayed(Duration::from_millis(jittered), step)
        }
    }

    async fn play(
        mut step: Scripted,
        target: &Target,
        operation: &str,
        params: &CallParameters,
    ) -> CommsResult<Value> {
        loop {
            match step {
                Scripted::Echo => {
                    return Ok(json!({
                        "service": target.service,
                        "operation": operation,
                        "replica": target.replica,
                        "params": params,
                    }))
                }
                Scripted::Respond(value) => return Ok(value),
                Scripted::Fail(error) => return Err(error),
                Scripted::Hang => {
                    futures::future::pending::<()>().await;
                }
                Scripted::Delayed(delay, then) => {
                    tokio::time::sleep(delay).await;
                    step = *then;
                }
            }
        }
    }
}

fn bump<K: std::hash::Hash + Eq>(map: &DashMap<K, usize>, key: K) {
    *map.entry(key).or_insert(0) += 1;
}

struct ActiveStream(Arc<AtomicUsize>);

impl Drop for ActiveStream {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn invoke(
        &self,
        target: &Target,
        operation: &str,
        params: &CallParameters,
        _timeout: Duration,
    ) -> CommsResult<Value> {
        let key = OperationKey::new(&target.service, operation);
        bump(&self.calls, key.clone());
        if let Some(replica) = &target.replica {
            bump(&self.replica_calls, replica.clone());
        }
        trace!(target = %target, operation, "simulated invoke");

        let step = self.next_step(&key, target);
        Self::play(step, target, operation, params).await
    }

    async fn invoke_batch(
        &self,
        target: &Target,
        operation: &str,
        batch: &[CallParameters],
        timeout: Duration,
    ) -> CommsResult<Vec<CommsResult<Value>>> {
        let key = OperationKey::new(&target.service, operation);
        bump(&self.batch_calls, key.clone());

        let calls = batch
            .iter()
            .map(|params| self.invoke(target, operation, params, timeout));
        let mut results = futures::future::join_all(calls).await;

        if self.truncated_batches.contains_key(&key) {
            results.pop();
        }
        Ok(results)
    }

    async fn subscribe(
        &self,
        target: &Target,
        operation: &str,
        params: &CallParameters,
        cancel: CancellationToken,
    ) -> CommsResult<mpsc::Receiver<StreamEvent>> {
        let key = OperationKey::new(&target.service, operation);
        bump(&self.subscriptions, key.clone());

        let script = self.streams.get(&key).map(|s| s.clone()).unwrap_or_else(|| {
            let echo = json!({
                "service": target.service,
                "operation": operation,
                "params": params,
            });
            StreamScript {
                events: vec![StreamEvent::Data(echo), StreamEvent::End],
                interval: Duration::ZERO,
            }
        });

        let (tx, rx) = mpsc::channel(16);
        self.active_streams.fetch_add(1, Ordering::SeqCst);
        let guard = ActiveStream(Arc::clone(&self.active_streams));

        tokio::spawn(async move {
            let _guard = guard;
            for event in script.events {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(script.interval) => {}
                }
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            cancel.cancelled().await;
        });

        Ok(rx)
    }
}
