use common::{JsonFormatter, LoggingConfig, OperationTimer, RequestContext, StructuredLogEntry};
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

#[derive(Clone, Default)]
struct CapturedLines(Arc<Mutex<Vec<u8>>>);

impl Write for CapturedLines {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .expect("Test operation should succeed")
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl CapturedLines {
    fn entries(&self) -> Vec<StructuredLogEntry> {
        let bytes = self.0.lock().expect("Test operation should succeed").clone();
        String::from_utf8(bytes)
            .expect("Test operation should succeed")
            .lines()
            .map(|line| serde_json::from_str(line).expect("Test operation should succeed"))
            .collect()
    }
}

fn capture<F: FnOnce()>(f: F) -> Vec<StructuredLogEntry> {
    let lines = CapturedLines::default();
    let writer = lines.clone();
    let layer = JsonFormatter::new(move || writer.clone()).with_context(false);
    let subscriber = Registry::default().with(layer);

    tracing::subscriber::with_default(subscriber, f);
    lines.entries()
}

#[test]
fn test_event_is_written_as_json_line() {
    let entries = capture(|| {
        tracing::warn!(service = "ragService", attempt = 2u64, "Attempt failed, retrying");
    });

    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.level, "WARN");
    assert_eq!(entry.message, "Attempt failed, retrying");
    assert!(entry.context.is_none());

    let call = entry.call.as_ref().expect("Test operation should succeed");
    assert_eq!(call.service.as_deref(), Some("ragService"));
    assert_eq!(call.attempt, Some(2));
}

#[test]
fn test_span_fields_are_inherited_by_events() {
    let entries = capture(|| {
        let span = tracing::info_span!("optimized_call", call_id = "c-42", operation = "listAgents");
        let _guard = span.enter();
        tracing::info!(duration_ms = 1.5, "Call completed");
    });

    let call = entries[0].call.as_ref().expect("Test operation should succeed");
    assert_eq!(call.call_id.as_deref(), Some("c-42"));
    assert_eq!(call.operation.as_deref(), Some("listAgents"));
    assert_eq!(call.duration_ms, Some(1.5));
}

#[test]
fn test_event_fields_override_span_fields() {
    let entries = capture(|| {
        let span = tracing::info_span!("outer", service = "agentService");
        let _guard = span.enter();
        tracing::info!(service = "agentServiceBackup", "Trying alternative service");
    });

    assert_eq!(
        entries[0].fields.get("service").and_then(|v| v.as_str()),
        Some("agentServiceBackup")
    );
}

#[test]
fn test_plain_events_have_no_call_section() {
    let entries = capture(|| tracing::info!("Service communicator started"));
    assert!(entries[0].call.is_none());
}

#[test]
fn test_operation_timer_logs_failure() {
    let entries = capture(|| {
        let timer = OperationTimer::new("simulate");
        let result: Result<(), String> = Err("boom".to_string());
        timer.finish_with_result(&result);
    });

    assert_eq!(entries[0].level, "ERROR");
    assert_eq!(entries[0].message, "Operation failed");
    assert_eq!(
        entries[0].fields.get("success").and_then(|v| v.as_bool()),
        Some(false)
    );
}

#[test]
fn test_request_context_ids_are_unique() {
    let a = RequestContext::new();
    let b = RequestContext::default();
    assert_ne!(a.request_id, b.request_id);
}

#[test]
fn test_logging_config_defaults() {
    let config = LoggingConfig::default();
    assert_eq!(config.level, tracing::Level::INFO);
    assert!(!config.json_output);
    assert!(config.include_context);
}
