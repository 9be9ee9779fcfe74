//! Execution strategies driven end to end through the communicator

use comms::{
    params, CallOptions, CallParameters, CommsConfig, CommsError, OperationDescriptor,
    ResponseSource, Scripted, ServiceCommunicator, SimulatedTransport, StaticRegistry,
    StrategyKind, StreamEvent,
};
use futures::future::join_all;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn replicated_agents(transport: &Arc<SimulatedTransport>) -> ServiceCommunicator {
    let registry =
        StaticRegistry::new().with_service("agentService", ["agent-a", "agent-b", "agent-c"]);
    ServiceCommunicator::builder(CommsConfig::default(), transport.clone())
        .registry(Arc::new(registry))
        .operation("agentService", "listAgents", OperationDescriptor::cacheable().with_replicas())
        .build()
        .expect("Test operation should succeed")
}

#[tokio::test(start_paused = true)]
async fn test_parallel_replicas_first_success_wins() {
    let transport = Arc::new(SimulatedTransport::new());
    transport.script_replica("agentService", "agent-a", Scripted::Hang);
    transport.script_replica(
        "agentService",
        "agent-b",
        Scripted::Fail(CommsError::from_status("agentService", 503, "overloaded")),
    );
    let comms = replicated_agents(&transport);

    let outcome = comms
        .optimized_call("agentService", "listAgents", CallParameters::new(), CallOptions::new())
        .await
        .expect("Test operation should succeed");

    assert_eq!(outcome.source, ResponseSource::Service);
    assert_eq!(outcome.strategy, Some(StrategyKind::Parallel));
    assert_eq!(outcome.value["replica"], json!("agent-c"));
    assert_eq!(transport.replica_calls("agent-c"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_critical_priority_skips_replica_fan_out() {
    let transport = Arc::new(SimulatedTransport::new());
    let comms = replicated_agents(&transport);

    let outcome = tokio_test::assert_ok!(
        comms
            .optimized_call("agentService", "listAgents", CallParameters::new(), CallOptions::critical())
            .await
    );

    assert_eq!(outcome.strategy, Some(StrategyKind::Retry));
    assert_eq!(outcome.value["replica"], json!(null));
    assert_eq!(transport.replica_calls("agent-a"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_all_replicas_failing_falls_through_to_retry() {
    let transport = Arc::new(SimulatedTransport::new());
    for replica in ["agent-a", "agent-b", "agent-c"] {
        transport.script_replica(
            "agentService",
            replica,
            Scripted::Fail(CommsError::from_status("agentService", 503, "overloaded")),
        );
    }
    let comms = replicated_agents(&transport);

    let outcome = comms
        .optimized_call("agentService", "listAgents", CallParameters::new(), CallOptions::new())
        .await
        .expect("Test operation should succeed");

    assert_eq!(outcome.strategy, Some(StrategyKind::Retry));
    assert_eq!(transport.calls("agentService", "listAgents"), 4);
}

#[tokio::test(start_paused = true)]
async fn test_batch_calls_are_coalesced_and_demultiplexed() {
    let transport = Arc::new(SimulatedTransport::new());
    let comms = ServiceCommunicator::builder(CommsConfig::default(), transport.clone())
        .build()
        .expect("Test operation should succeed");

    let calls = (0..3).map(|i| {
        comms.optimized_call(
            "billingService",
            "batchRecordUsage",
            params([("units", json!(i))]),
            CallOptions::new(),
        )
    });
    let outcomes = join_all(calls).await;

    for (i, outcome) in outcomes.into_iter().enumerate() {
        let outcome = outcome.expect("Test operation should succeed");
        assert_eq!(outcome.strategy, Some(StrategyKind::Batch));
        assert_eq!(outcome.value["params"]["units"], json!(i));
    }
    assert_eq!(transport.batch_calls("billingService", "batchRecordUsage"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_streaming_chunks_are_combined() {
    let transport = Arc::new(SimulatedTransport::new());
    transport.script_stream(
        "ragService",
        "streamAnswer",
        vec![
            StreamEvent::Data(json!("Refunds are ")),
            StreamEvent::Data(json!("processed within 5 days")),
            StreamEvent::End,
        ],
        Duration::from_millis(10),
    );
    let comms = ServiceCommunicator::builder(CommsConfig::default(), transport.clone())
        .build()
        .expect("Test operation should succeed");

    let outcome = comms
        .optimized_call(
            "ragService",
            "streamAnswer",
            params([("question", json!("refunds"))]),
            CallOptions::new(),
        )
        .await
        .expect("Test operation should succeed");

    assert_eq!(outcome.strategy, Some(StrategyKind::Streaming));
    assert_eq!(outcome.value, json!("Refunds are processed within 5 days"));
    assert_eq!(transport.subscriptions("ragService", "streamAnswer"), 1);

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(transport.active_streams(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_stream_times_out_and_falls_back_to_direct_call() {
    let transport = Arc::new(SimulatedTransport::new());
    transport.script_stream(
        "ragService",
        "streamAnswer",
        vec![StreamEvent::Data(json!("partial"))],
        Duration::from_millis(10),
    );
    let comms = ServiceCommunicator::builder(CommsConfig::default(), transport.clone())
        .build()
        .expect("Test operation should succeed");

    let outcome = comms
        .optimized_call(
            "ragService",
            "streamAnswer",
            CallParameters::new(),
            CallOptions::new().with_timeout(Duration::from_millis(500)),
        )
        .await
        .expect("Test operation should succeed");

    assert_eq!(outcome.strategy, Some(StrategyKind::Retry));
    assert_eq!(transport.calls("ragService", "streamAnswer"), 1);

    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(transport.active_streams(), 0);
}
