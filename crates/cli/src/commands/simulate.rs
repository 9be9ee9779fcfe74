use anyhow::Result;
use clap::Args;
use common::{OperationTimer, RequestContext};
use comms::{
    params, CallOptions, CommsConfig, CommsError, OperationDescriptor, ResponseSource,
    ServiceCommunicator, SimulatedTransport, StaticRegistry,
};
use futures::stream::{self, StreamExt};
use rand::seq::SliceRandom;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Instrument};

use super::load_config;

/// Operations exercised by the simulation, one entry per (service, operation)
const MESH: &[(&str, &str)] = &[
    ("agentService", "listAgents"),
    ("agentService", "getAgent"),
    ("ragService", "queryKnowledge"),
    ("ragService", "searchDocuments"),
    ("ragService", "streamAnswer"),
    ("billingService", "getUsage"),
    ("billingService", "batchRecordUsage"),
    ("conversationService", "getHistory"),
    ("conversationService", "appendMessage"),
];

#[derive(Debug, Args)]
pub struct SimulateCommand {
    /// Total number of calls to issue
    #[arg(long, default_value_t = 200)]
    pub calls: usize,

    /// Calls in flight at once
    #[arg(long, default_value_t = 16, value_parser = clap::value_parser!(u16).range(1..))]
    pub concurrency: u16,

    /// Probability that a simulated upstream call fails
    #[arg(long, default_value_t = 0.1, value_parser = parse_rate)]
    pub failure_rate: f64,

    /// Base upstream latency, jittered by up to 50%
    #[arg(long, default_value_t = 20)]
    pub latency_ms: u64,

    /// Configuration file to load before environment overrides
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr
    #[arg(long)]
    pub json_logs: bool,
}

fn parse_rate(raw: &str) -> Result<f64, String> {
    let rate: f64 = raw.parse().map_err(|e| format!("{e}"))?;
    if (0.0..=1.0).contains(&rate) {
        Ok(rate)
    } else {
        Err(format!("{rate} is not between 0 and 1"))
    }
}

#[derive(Debug, Default)]
struct Tally {
    succeeded: usize,
    failed: usize,
    degraded: usize,
    sources: BTreeMap<String, usize>,
    errors: BTreeMap<String, usize>,
}

impl Tally {
    fn record(&mut self, result: &Result<comms::CallOutcome, CommsError>) {
        match result {
            Ok(outcome) => {
                self.succeeded += 1;
                if outcome.degraded {
                    self.degraded += 1;
                }
                *self.sources.entry(source_label(outcome.source)).or_insert(0) += 1;
            }
            Err(error) => {
                self.failed += 1;
                *self.errors.entry(error.kind().to_string()).or_insert(0) += 1;
            }
        }
    }
}

fn source_label(source: ResponseSource) -> String {
    match source {
        ResponseSource::Cache => "cache".to_string(),
        ResponseSource::Service => "service".to_string(),
        ResponseSource::Fallback(kind) => {
            format!("fallback:{}", json!(kind).as_str().unwrap_or("unknown"))
        }
    }
}

impl SimulateCommand {
    pub async fn execute(&self) -> Result<()> {
        let request = RequestContext::new();
        let span = request.span("simulate");

        async {
            let config = load_config(self.config.as_deref())?;
            let transport = Arc::new(
                SimulatedTransport::new()
                    .with_latency(Duration::from_millis(self.latency_ms))
                    .with_failure_rate(self.failure_rate),
            );
            let communicator = build_mesh(config, transport)?;

            let mut timer = OperationTimer::new("simulate");
            timer.add_field("calls", self.calls);
            timer.add_field("concurrency", self.concurrency);

            let tally = self.drive(&communicator).await;
            let elapsed = timer.finish();

            let report = json!({
                "request_id": &request.request_id,
                "calls": self.calls,
                "elapsed_ms": elapsed.as_millis() as u64,
                "succeeded": tally.succeeded,
                "failed": tally.failed,
                "degraded": tally.degraded,
                "sources": tally.sources,
                "errors": tally.errors,
                "stats": communicator.get_performance_stats(None, None),
                "circuit_breakers": communicator.get_circuit_breaker_status(),
            });

            communicator.shutdown().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok::<_, anyhow::Error>(())
        }
        .instrument(span)
        .await
    }

    async fn drive(&self, communicator: &ServiceCommunicator) -> Tally {
        let plan: Vec<(&str, &str, Value)> = {
            let mut rng = rand::thread_rng();
            (0..self.calls)
                .filter_map(|i| {
                    MESH.choose(&mut rng)
                        .map(|(service, operation)| (*service, *operation, json!(i % 10)))
                })
                .collect()
        };

        info!(calls = plan.len(), concurrency = self.concurrency, "Starting simulation");

        let results: Vec<_> = stream::iter(plan)
            .map(|(service, operation, tenant)| {
                communicator.optimized_call(
                    service,
                    operation,
                    params([("tenant", tenant)]),
                    CallOptions::fast(),
                )
            })
            .buffer_unordered(usize::from(self.concurrency))
            .collect()
            .await;

        let mut tally = Tally::default();
        for result in &results {
            tally.record(result);
        }
        tally
    }
}

fn build_mesh(
    config: CommsConfig,
    transport: Arc<SimulatedTransport>,
) -> Result<ServiceCommunicator> {
    let registry = StaticRegistry::new()
        .with_service("agentService", ["agent-1", "agent-2", "agent-3"])
        .with_service("ragService", ["rag-1", "rag-2"]);

    let communicator = ServiceCommunicator::builder(config, transport)
        .registry(Arc::new(registry))
        .operation("agentService", "listAgents", OperationDescriptor::cacheable().with_replicas())
        .operation("ragService", "queryKnowledge", OperationDescriptor::cacheable().with_replicas())
        .alternative("agentService", "agentServiceBackup")
        .default_response(json!({ "status": "unavailable" }))
        .build()?;
    Ok(communicator)
}
