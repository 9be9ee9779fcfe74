//! The call orchestrator
//!
//! [`ServiceCommunicator::optimized_call`] sequences one call through the
//! result cache, the circuit breaker gate, the selected execution
//! strategies and, when everything failed, the fallback chain. All shared
//! state is owned by the communicator; background maintenance (cache sweep,
//! periodic performance summary) runs on tasks that stop when the
//! communicator is shut down or dropped.

use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::cache::ResultCache;
use crate::circuit_breaker::{BreakerSnapshot, CircuitBreakerConfig, CircuitBreakerRegistry};
use crate::config::{CallConfig, CallOptions, CommsConfig};
use crate::error::{CommsError, CommsResult};
use crate::events::{CommsEvent, EventHub, ResponseSource};
use crate::fallback::FallbackChain;
use crate::metrics::{CallStatus, OperationStats, PerformanceRecorder};
use crate::strategies::{StrategyExecutor, StrategyKind};
use crate::transport::{ServiceRegistry, StaticRegistry, Transport};
use crate::types::{CacheKey, CallId, CallParameters, OperationDescriptor, OperationKey};

/// What a successful `optimized_call` hands back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallOutcome {
    pub call_id: CallId,
    pub value: Value,
    pub source: ResponseSource,
    /// The value is synthetic or reduced-fidelity
    pub degraded: bool,
    /// Strategy that produced a service response
    pub strategy: Option<StrategyKind>,
}

pub struct ServiceCommunicatorBuilder {
    config: CommsConfig,
    transport: Arc<dyn Transport>,
    registry: Arc<dyn ServiceRegistry>,
    descriptors: HashMap<OperationKey, OperationDescriptor>,
    fallback: FallbackChain,
}

impl ServiceCommunicatorBuilder {
    pub fn registry(mut self, registry: Arc<dyn ServiceRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Declare the capabilities of one operation
    pub fn operation(
        mut self,
        service: impl Into<String>,
        operation: impl Into<String>,
        descriptor: OperationDescriptor,
    ) -> Self {
        self.descriptors
            .insert(OperationKey::new(service, operation), descriptor);
        self
    }

    pub fn degraded_response(
        mut self,
        service: impl Into<String>,
        operation: impl Into<String>,
        body: Value,
    ) -> Self {
        self.fallback
            .register_degraded(OperationKey::new(service, operation), body);
        self
    }

    pub fn alternative(mut self, service: impl Into<String>, alternative: impl Into<String>) -> Self {
        self.fallback.register_alternative(service, alternative);
        self
    }

    pub fn default_response(mut self, value: Value) -> Self {
        self.fallback.set_default_response(value);
        self
    }

    /// Replace the fallback chain, dropping the built-in degraded responses
    pub fn fallback_chain(mut self, chain: FallbackChain) -> Self {
        self.fallback = chain;
        self
    }

    /// Validate the configuration and start the background tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> CommsResult<ServiceCommunicator> {
        self.config
            .validate()
            .map_err(|e| CommsError::Configuration(format!("{e:#}")))?;

        let shutdown = CancellationToken::new();
        let events = EventHub::new(self.config.event_buffer);
        let cache = Arc::new(ResultCache::new(
            self.config.cache_ttl(),
            self.config.stale_ceiling_factor,
        ));
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::from(
            &self.config,
        )));
        let recorder = Arc::new(PerformanceRecorder::new(
            self.config.thresholds.clone(),
            Arc::clone(&breakers),
            events.clone(),
        ));
        let strategies =
            StrategyExecutor::new(self.transport, self.registry, &self.config, shutdown.clone());

        let tasks = vec![
            spawn_cache_sweeper(
                Arc::clone(&cache),
                self.config.cache_sweep_interval(),
                shutdown.clone(),
            ),
            spawn_summary_publisher(
                Arc::clone(&recorder),
                self.config.summary_interval(),
                shutdown.clone(),
            ),
        ];

        info!(
            operations = self.descriptors.len(),
            cache_ttl_ms = self.config.cache_ttl_ms,
            breaker_threshold = self.config.circuit_breaker_threshold,
            "Service communicator started"
        );

        Ok(ServiceCommunicator {
            inner: Arc::new(Inner {
                config: self.config,
                cache,
                breakers,
                recorder,
                strategies,
                fallback: self.fallback,
                descriptors: self.descriptors.into_iter().collect(),
                events,
                shutdown,
            }),
            tasks: Mutex::new(tasks),
        })
    }
}

struct Inner {
    config: CommsConfig,
    cache: Arc<ResultCache>,
    breakers: Arc<CircuitBreakerRegistry>,
    recorder: Arc<PerformanceRecorder>,
    strategies: StrategyExecutor,
    fallback: FallbackChain,
    descriptors: DashMap<OperationKey, OperationDescriptor>,
    events: EventHub,
    shutdown: CancellationToken,
}

pub struct ServiceCommunicator {
    inner: Arc<Inner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Alternative services are only tried from the top-level call
const MAX_FALLBACK_DEPTH: u8 = 1;

impl ServiceCommunicator {
    pub fn builder(config: CommsConfig, transport: Arc<dyn Transport>) -> ServiceCommunicatorBuilder {
        ServiceCommunicatorBuilder {
            config,
            transport,
            registry: Arc::new(StaticRegistry::new()),
            descriptors: HashMap::new(),
            fallback: FallbackChain::default(),
        }
    }

    /// Call `operation` on `service` with every resilience layer applied
    pub async fn optimized_call(
        &self,
        service: &str,
        operation: &str,
        params: CallParameters,
        options: CallOptions,
    ) -> CommsResult<CallOutcome> {
        let config = options.resolve(&self.inner.config);
        let key = OperationKey::new(service, operation);
        self.call_at_depth(key, params, config, 0).await
    }

    fn call_at_depth(
        &self,
        key: OperationKey,
        params: CallParameters,
        config: CallConfig,
        depth: u8,
    ) -> BoxFuture<'_, CommsResult<CallOutcome>> {
        let call_id = CallId::new();
        let span = info_span!(
            "optimized_call",
            %call_id,
            service = %key.service,
            operation = %key.operation,
            depth
        );
        async move { self.orchestrate(call_id, key, params, config, depth).await }
            .instrument(span)
            .boxed()
    }

    async fn orchestrate(
        &self,
        call_id: CallId,
        key: OperationKey,
        params: CallParameters,
        config: CallConfig,
        depth: u8,
    ) -> CommsResult<CallOutcome> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(CommsError::Shutdown);
        }

        let started = Instant::now();
        let descriptor = self.descriptor(&key);
        let cache_key = CacheKey::new(&key.service, &key.operation, &params);
        let use_cache = config.enable_cache && descriptor.cacheable;

        inner.events.publish(CommsEvent::CallStart {
            call_id,
            service: key.service.clone(),
            operation: key.operation.clone(),
            timestamp: chrono::Utc::now(),
        });

        if use_cache {
            if let Some(entry) = inner.cache.get(&cache_key) {
                debug!("Fresh cache hit");
                inner
                    .recorder
                    .record_metric(&key.service, &key.operation, started.elapsed(), CallStatus::CacheHit);
                self.publish_complete(call_id, &key, ResponseSource::Cache, started);
                return Ok(CallOutcome {
                    call_id,
                    value: entry.data,
                    source: ResponseSource::Cache,
                    degraded: false,
                    strategy: None,
                });
            }
        }

        if inner.breakers.is_open(&key.service) {
            let error = CommsError::CircuitOpen {
                service: key.service.clone(),
            };
            inner
                .recorder
                .record_metric(&key.service, &key.operation, started.elapsed(), CallStatus::Rejected);
            self.publish_error(call_id, &key, &error, started);
            return if config.enable_fallback {
                self.fallback(call_id, error, key, cache_key, params, config, depth, started)
                    .await
            } else {
                Err(error)
            };
        }

        let executed = tokio::select! {
            result = inner.strategies.run(&key, &params, &descriptor, &config) => result,
            _ = inner.shutdown.cancelled() => Err(CommsError::Shutdown),
        };

        match executed {
            Ok(executed) => {
                inner
                    .recorder
                    .record_metric(&key.service, &key.operation, started.elapsed(), CallStatus::Success);
                if use_cache {
                    inner.cache.set(cache_key, executed.value.clone());
                }
                self.publish_complete(call_id, &key, ResponseSource::Service, started);
                Ok(CallOutcome {
                    call_id,
                    value: executed.value,
                    source: ResponseSource::Service,
                    degraded: false,
                    strategy: Some(executed.strategy),
                })
            }
            Err(CommsError::Shutdown) => Err(CommsError::Shutdown),
            Err(error) => {
                inner
                    .recorder
                    .record_metric(&key.service, &key.operation, started.elapsed(), CallStatus::Error);
                self.publish_error(call_id, &key, &error, started);
                if config.enable_fallback {
                    self.fallback(call_id, error, key, cache_key, params, config, depth, started)
                        .await
                } else {
                    Err(error)
                }
            }
        }
    }

    /// Run the fallback chain; the primary error is returned when it comes up empty
    #[allow(clippy::too_many_arguments)]
    async fn fallback(
        &self,
        call_id: CallId,
        primary: CommsError,
        key: OperationKey,
        cache_key: CacheKey,
        params: CallParameters,
        config: CallConfig,
        depth: u8,
        started: Instant,
    ) -> CommsResult<CallOutcome> {
        let alternative = (depth < MAX_FALLBACK_DEPTH).then(|| {
            let operation = key.operation.clone();
            // the alternative answers for itself, without its own fallback chain
            let nested_config = CallConfig {
                enable_fallback: false,
                ..config
            };
            move |service: String| {
                let nested = OperationKey::new(service, operation);
                self.call_at_depth(nested, params, nested_config, depth + 1)
                    .map(|result| result.map(|outcome| (outcome.value, outcome.degraded)))
            }
        });

        match self
            .inner
            .fallback
            .resolve(&key, &cache_key, &self.inner.cache, alternative)
            .await
        {
            Ok(result) => {
                let source = ResponseSource::Fallback(result.kind);
                info!(kind = ?result.kind, error = %primary, "Served fallback response");
                self.publish_complete(call_id, &key, source, started);
                Ok(CallOutcome {
                    call_id,
                    value: result.value,
                    source,
                    degraded: result.degraded,
                    strategy: None,
                })
            }
            Err(_) => {
                warn!(error = %primary, "No fallback available");
                Err(primary)
            }
        }
    }

    fn descriptor(&self, key: &OperationKey) -> OperationDescriptor {
        *self
            .inner
            .descriptors
            .entry(key.clone())
            .or_insert_with(|| OperationDescriptor::infer(&key.operation))
    }

    fn publish_complete(&self, call_id: CallId, key: &OperationKey, source: ResponseSource, started: Instant) {
        self.inner.events.publish(CommsEvent::CallComplete {
            call_id,
            service: key.service.clone(),
            operation: key.operation.clone(),
            source,
            duration_ms: elapsed_ms(started),
            timestamp: chrono::Utc::now(),
        });
    }

    fn publish_error(&self, call_id: CallId, key: &OperationKey, error: &CommsError, started: Instant) {
        self.inner.events.publish(CommsEvent::CallError {
            call_id,
            service: key.service.clone(),
            operation: key.operation.clone(),
            error: error.to_string(),
            kind: error.kind().to_string(),
            duration_ms: elapsed_ms(started),
            timestamp: chrono::Utc::now(),
        });
    }

    /// Declare or replace the capabilities of an operation after startup
    pub fn register_operation(&self, service: &str, operation: &str, descriptor: OperationDescriptor) {
        self.inner
            .descriptors
            .insert(OperationKey::new(service, operation), descriptor);
    }

    pub fn get_performance_stats(
        &self,
        service_filter: Option<&str>,
        operation_filter: Option<&str>,
    ) -> BTreeMap<String, OperationStats> {
        self.inner.recorder.get_stats(service_filter, operation_filter)
    }

    pub fn get_circuit_breaker_status(&self) -> BTreeMap<String, BreakerSnapshot> {
        self.inner.breakers.status()
    }

    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<CommsEvent> {
        self.inner.events.subscribe()
    }

    pub fn config(&self) -> &CommsConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &ResultCache {
        &self.inner.cache
    }

    pub fn circuit_breakers(&self) -> &CircuitBreakerRegistry {
        &self.inner.breakers
    }

    pub fn reset_metrics(&self) {
        self.inner.recorder.reset();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stop background tasks and fail calls still waiting in a batch.
    ///
    /// Idempotent; calls made afterwards fail with [`CommsError::Shutdown`].
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.strategies.fail_pending();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        info!("Service communicator shut down");
    }
}

impl Drop for ServiceCommunicator {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_micros() as f64 / 1000.0
}

fn spawn_cache_sweeper(
    cache: Arc<ResultCache>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    cache.sweep();
                }
            }
        }
        debug!("Cache sweeper stopped");
    })
}

fn spawn_summary_publisher(
    recorder: Arc<PerformanceRecorder>,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => recorder.publish_summary(),
            }
        }
        debug!("Performance summary publisher stopped");
    })
}
