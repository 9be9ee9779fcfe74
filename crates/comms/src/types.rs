//! Identifiers and descriptors shared by every component

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Ordered call arguments; ordering keeps cache keys stable
pub type CallParameters = BTreeMap<String, Value>;

/// Build [`CallParameters`] from `(name, value)` pairs
pub fn params<I, K>(pairs: I) -> CallParameters
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// `(service, operation)` pair that scopes metrics, descriptors and fallbacks
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationKey {
    pub service: String,
    pub operation: String,
}

impl OperationKey {
    pub fn new(service: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            operation: operation.into(),
        }
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service, self.operation)
    }
}

/// Fingerprint of a call used by the result cache
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(service: &str, operation: &str, params: &CallParameters) -> Self {
        // BTreeMap serializes in key order; serialization of a map of Values cannot fail
        let fingerprint = serde_json::to_string(params).unwrap_or_default();
        Self(format!("{service}:{operation}:{fingerprint}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-invocation correlation token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(uuid::Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller-specified urgency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    /// Critical calls never race replicas
    Critical,
}

/// Capabilities of one operation, registered alongside the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OperationDescriptor {
    /// Results may be served from and written to the result cache
    pub cacheable: bool,
    /// The service runs several interchangeable replicas worth racing
    pub supports_replicas: bool,
    /// Calls may be coalesced into one transport batch
    pub batchable: bool,
    /// The operation answers with a stream of chunks
    pub streaming: bool,
}

impl OperationDescriptor {
    pub fn cacheable() -> Self {
        Self {
            cacheable: true,
            ..Self::default()
        }
    }

    pub fn replicated() -> Self {
        Self {
            supports_replicas: true,
            ..Self::default()
        }
    }

    pub fn batchable() -> Self {
        Self {
            batchable: true,
            ..Self::default()
        }
    }

    pub fn streaming() -> Self {
        Self {
            streaming: true,
            ..Self::default()
        }
    }

    pub fn with_cache(mut self) -> Self {
        self.cacheable = true;
        self
    }

    pub fn with_replicas(mut self) -> Self {
        self.supports_replicas = true;
        self
    }

    /// Descriptor for an operation nobody registered, derived from its name.
    ///
    /// Read-style verbs (`get`, `list`, `search`, `query`, `health`) are
    /// cacheable; `batch` and `stream` in the name select those strategies.
    /// Replica racing is never inferred.
    pub fn infer(operation: &str) -> Self {
        let name = operation.to_lowercase();
        let cacheable = ["get", "list", "search", "query", "health"]
            .iter()
            .any(|verb| name.contains(verb));

        Self {
            cacheable,
            supports_replicas: false,
            batchable: name.contains("batch"),
            streaming: name.contains("stream"),
        }
    }
}
