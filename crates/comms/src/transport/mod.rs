//! Transport boundary
//!
//! The communication layer never performs network I/O itself. Embedding
//! applications supply a [`Transport`] (HTTP, gRPC, ...) and a
//! [`ServiceRegistry`] that knows the replicas of each service.
//!
//! # Cancellation
//!
//! Deadlines are enforced by dropping the future returned from
//! [`Transport::invoke`]. A transport whose future owns its request is torn
//! down with it. A transport that hands the request to a detached task
//! (`tokio::spawn`, a connection pool worker, a blocking thread) keeps that
//! work running after the caller has already received a timeout; those
//! requests leak until the remote side answers. Implementations should keep
//! request state inside the returned future, or observe the
//! [`CancellationToken`] given to [`Transport::subscribe`].

pub mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{CommsError, CommsResult};
use crate::types::CallParameters;

pub use simulated::{Scripted, SimulatedTransport};

/// Where a call is sent: a logical service, optionally pinned to one replica
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub service: String,
    pub replica: Option<String>,
}

impl Target {
    pub fn service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            replica: None,
        }
    }

    pub fn replica(service: impl Into<String>, replica: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            replica: Some(replica.into()),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.replica {
            Some(replica) => write!(f, "{}@{}", self.service, replica),
            None => f.write_str(&self.service),
        }
    }
}

/// One message of a streaming response
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Data(Value),
    End,
    Error(CommsError),
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform one unary call. `timeout` is advisory; the caller enforces it.
    async fn invoke(
        &self,
        target: &Target,
        operation: &str,
        params: &CallParameters,
        timeout: Duration,
    ) -> CommsResult<Value>;

    /// Perform several calls of the same operation in one round trip.
    ///
    /// Must return exactly one result per entry of `batch`, in order. The
    /// default issues concurrent [`Transport::invoke`] calls.
    async fn invoke_batch(
        &self,
        target: &Target,
        operation: &str,
        batch: &[CallParameters],
        timeout: Duration,
    ) -> CommsResult<Vec<CommsResult<Value>>> {
        let calls = batch
            .iter()
            .map(|params| self.invoke(target, operation, params, timeout));
        Ok(futures::future::join_all(calls).await)
    }

    /// Open a streaming call. The transport must stop producing events once
    /// `cancel` fires or the receiver is dropped.
    async fn subscribe(
        &self,
        target: &Target,
        operation: &str,
        _params: &CallParameters,
        _cancel: CancellationToken,
    ) -> CommsResult<mpsc::Receiver<StreamEvent>> {
        Err(CommsError::Configuration(format!(
            "streaming not supported by transport for {}.{}",
            target.service, operation
        )))
    }
}

/// Resolves a logical service to the replicas backing it
#[cfg_attr(test, mockall::automock)]
pub trait ServiceRegistry: Send + Sync {
    fn resolve(&self, service: &str) -> Vec<String>;
}

/// Fixed service → replicas table
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    services: HashMap<String, Vec<String>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service<I, S>(mut self, service: impl Into<String>, replicas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.services.insert(
            service.into(),
            replicas.into_iter().map(Into::into).collect(),
        );
        self
    }
}

impl ServiceRegistry for StaticRegistry {
    fn resolve(&self, service: &str) -> Vec<String> {
        self.services.get(service).cloned().unwrap_or_default()
    }
}
