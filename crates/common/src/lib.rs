pub mod structured_logging;

pub use structured_logging::{
    init_structured_logging, CallMetrics, ExecutionContext, JsonFormatter, LoggingConfig,
    OperationTimer, RequestContext, StructuredLogEntry,
};
