//! Resilient, latency-optimized service-to-service calls.
//!
//! The entry point is [`ServiceCommunicator::optimized_call`], which runs
//! one logical call through:
//!
//! 1. a short-TTL [`ResultCache`] for read-style operations,
//! 2. a per-service [`CircuitBreakerRegistry`] gate,
//! 3. the execution strategies chosen by [`select_strategies`]
//!    (streaming, batch, parallel replicas, retry with backoff),
//! 4. the [`FallbackChain`] (stale cache, degraded response, alternative
//!    service, default response) when execution is exhausted,
//!
//! while the [`PerformanceRecorder`] tracks latency percentiles and raises
//! alerts on the [`EventHub`].
//!
//! Network I/O is delegated to a [`Transport`] supplied by the embedding
//! application.
//!
//! ```no_run
//! use comms::{params, CallOptions, CommsConfig, ServiceCommunicator, SimulatedTransport};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn run() -> comms::CommsResult<()> {
//! let comms = ServiceCommunicator::builder(CommsConfig::default(), Arc::new(SimulatedTransport::new()))
//!     .build()?;
//! let outcome = comms
//!     .optimized_call("agentService", "listAgents", params([("tenant", json!("t-1"))]), CallOptions::fast())
//!     .await?;
//! println!("{:?} -> {}", outcome.source, outcome.value);
//! comms.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod circuit_breaker;
pub mod communicator;
pub mod config;
pub mod error;
pub mod events;
pub mod fallback;
pub mod metrics;
pub mod retry;
pub mod strategies;
pub mod transport;
pub mod types;

pub use cache::{CacheEntry, ResultCache};
pub use circuit_breaker::{BreakerSnapshot, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
pub use communicator::{CallOutcome, ServiceCommunicator, ServiceCommunicatorBuilder};
pub use config::{CallConfig, CallOptions, CommsConfig, ConfigLoader, LatencyClass, PerformanceThresholds};
pub use error::{CommsError, CommsResult};
pub use events::{AlertSeverity, CommsEvent, EventHub, FallbackKind, ResponseSource};
pub use fallback::{FallbackChain, FallbackResult};
pub use metrics::{CallStatus, OperationStats, PerformanceGrade, PerformanceRecorder};
pub use retry::RetryExecutor;
pub use strategies::{select_strategies, StrategyExecutor, StrategyKind};
pub use transport::{
    Scripted, ServiceRegistry, SimulatedTransport, StaticRegistry, StreamEvent, Target, Transport,
};
pub use types::{params, CacheKey, CallId, CallParameters, OperationDescriptor, OperationKey, Priority};
