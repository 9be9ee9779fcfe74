//! Graceful degradation once primary execution has failed
//!
//! Sources are tried in a fixed order and the first hit wins:
//! stale cache, the degraded-response table, an alternative service, and
//! finally a static default response.

use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::future::Future;
use tracing::{debug, info};

use crate::cache::ResultCache;
use crate::error::{CommsError, CommsResult};
use crate::events::FallbackKind;
use crate::types::{CacheKey, OperationKey};

/// Value produced by the fallback chain
#[derive(Debug, Clone, PartialEq)]
pub struct FallbackResult {
    pub kind: FallbackKind,
    pub value: Value,
    /// Synthetic or reduced-fidelity payload
    pub degraded: bool,
}

/// Answer of an alternative service call: the value and whether it was itself degraded
pub type AlternativeResult = CommsResult<(Value, bool)>;

pub struct FallbackChain {
    degraded: HashMap<OperationKey, Value>,
    alternatives: HashMap<String, String>,
    default_response: Option<Value>,
}

impl Default for FallbackChain {
    fn default() -> Self {
        Self::with_builtin_responses()
    }
}

impl FallbackChain {
    /// Chain without any degraded responses
    pub fn empty() -> Self {
        Self {
            degraded: HashMap::new(),
            alternatives: HashMap::new(),
            default_response: None,
        }
    }

    /// Chain preloaded with degraded responses for the platform services
    pub fn with_builtin_responses() -> Self {
        let mut chain = Self::empty();
        let builtin = [
            ("agentService", "listAgents", json!({ "agents": [], "total": 0 })),
            ("agentService", "getAgent", json!({ "agent": null })),
            ("ragService", "queryKnowledge", json!({ "results": [], "answer": null })),
            ("ragService", "searchDocuments", json!({ "documents": [], "total": 0 })),
            ("billingService", "getUsage", json!({ "usage": null })),
            ("billingService", "getSubscription", json!({ "subscription": null })),
            ("conversationService", "getHistory", json!({ "messages": [] })),
            ("analyticsService", "getMetrics", json!({ "metrics": {} })),
        ];
        for (service, operation, body) in builtin {
            chain.register_degraded(OperationKey::new(service, operation), body);
        }
        chain
    }

    /// Register the synthetic payload served for `key` while it is down
    pub fn register_degraded(&mut self, key: OperationKey, body: Value) {
        let payload = degraded_payload(&key.service, body);
        self.degraded.insert(key, payload);
    }

    pub fn register_alternative(&mut self, service: impl Into<String>, alternative: impl Into<String>) {
        self.alternatives.insert(service.into(), alternative.into());
    }

    pub fn set_default_response(&mut self, value: Value) {
        self.default_response = Some(value);
    }

    pub fn alternative_for(&self, service: &str) -> Option<&str> {
        self.alternatives.get(service).map(String::as_str)
    }

    pub fn degraded_response(&self, key: &OperationKey) -> Option<&Value> {
        self.degraded.get(key)
    }

    /// Walk the chain for one failed call.
    ///
    /// `call_alternative` is `None` when alternatives are not allowed, which
    /// is how nested calls are kept to a depth of one.
    pub async fn resolve<F, Fut>(
        &self,
        key: &OperationKey,
        cache_key: &CacheKey,
        cache: &ResultCache,
        call_alternative: Option<F>,
    ) -> CommsResult<FallbackResult>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = AlternativeResult>,
    {
        if let Some(entry) = cache.get_stale(cache_key) {
            debug!(key = %key, age_ms = entry.age().as_millis() as u64, "Serving stale cache entry");
            return Ok(FallbackResult {
                kind: FallbackKind::StaleCache,
                value: entry.data,
                degraded: false,
            });
        }

        if let Some(value) = self.degraded.get(key) {
            debug!(key = %key, "Serving degraded response");
            return Ok(FallbackResult {
                kind: FallbackKind::Degraded,
                value: value.clone(),
                degraded: true,
            });
        }

        if let (Some(alternative), Some(call)) = (self.alternative_for(&key.service), call_alternative) {
            info!(key = %key, alternative, "Trying alternative service");
            match call(alternative.to_string()).await {
                Ok((value, degraded)) => {
                    return Ok(FallbackResult {
                        kind: FallbackKind::AlternativeService,
                        value,
                        degraded,
                    })
                }
                Err(error) => debug!(key = %key, alternative, error = %error, "Alternative service failed"),
            }
        }

        if let Some(value) = &self.default_response {
            debug!(key = %key, "Serving default response");
            return Ok(FallbackResult {
                kind: FallbackKind::DefaultResponse,
                value: value.clone(),
                degraded: true,
            });
        }

        Err(CommsError::FallbackExhausted {
            service: key.service.clone(),
            operation: key.operation.clone(),
        })
    }
}

/// Mark `body` as degraded; non-object bodies are wrapped under `data`
pub fn degraded_payload(service: &str, body: Value) -> Value {
    let mut payload = match body {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
    };
    payload.insert("degraded".to_string(), Value::Bool(true));
    payload.insert(
        "message".to_string(),
        Value::String(format!("{service} is temporarily unavailable")),
    );
    Value::Object(payload)
}
