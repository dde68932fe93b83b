//! Application-facing log sink
//!
//! A cheap, cloneable handle the application uses to record runtime log
//! entries directly. Entries pick up the correlation id of the request that
//! is executing on the current task.

use crate::error::ObserverError;
use crate::observability::hub::DispatchHub;
use crate::observability::model::{LogLevel, Payload};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

#[derive(Clone)]
pub struct LogSink {
    hub: Arc<DispatchHub>,
}

impl LogSink {
    pub fn new(hub: Arc<DispatchHub>) -> Self {
        Self { hub }
    }

    /// Record an entry without a level.
    ///
    /// Objects are recorded as-is; a string becomes `{"message": ...}` and any
    /// other value `{"value": ...}`.
    pub fn emit(&self, payload: impl Into<Value>) -> Result<Option<u64>, ObserverError> {
        self.hub.emit_runtime_log(to_payload(payload.into()), None)
    }

    pub fn emit_at(
        &self,
        level: LogLevel,
        payload: impl Into<Value>,
    ) -> Result<Option<u64>, ObserverError> {
        self.hub.emit_runtime_log(to_payload(payload.into()), Some(level))
    }

    /// Record any serializable value
    pub fn emit_serialized<T: Serialize>(
        &self,
        level: Option<LogLevel>,
        payload: &T,
    ) -> Result<Option<u64>, ObserverError> {
        let value = serde_json::to_value(payload)?;
        self.hub.emit_runtime_log(to_payload(value), level)
    }

    pub(crate) fn hub(&self) -> &Arc<DispatchHub> {
        &self.hub
    }
}

fn to_payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        Value::String(message) => {
            let mut payload = Payload::new();
            payload.insert("message".to_string(), Value::String(message));
            payload
        }
        other => {
            let mut payload = Payload::new();
            payload.insert("value".to_string(), other);
            payload
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ObserverConfig;
    use crate::observability::context::RequestContext;
    use crate::observability::health::PipelineHealth;
    use crate::observability::live::LiveStore;
    use serde_json::json;

    fn sink() -> LogSink {
        let config = ObserverConfig::default();
        let live = Arc::new(LiveStore::new(&config.live));
        LogSink::new(Arc::new(DispatchHub::new(
            &config,
            live,
            Arc::new(PipelineHealth::new()),
            None,
            1,
        )))
    }

    #[test]
    fn test_payload_normalization() {
        assert_eq!(to_payload(json!({"a": 1}))["a"], json!(1));
        assert_eq!(to_payload(json!("hello"))["message"], json!("hello"));
        assert_eq!(to_payload(json!([1, 2]))["value"], json!([1, 2]));
    }

    #[test]
    fn test_empty_object_rejected() {
        let sink = sink();
        assert!(matches!(sink.emit(json!({})), Err(ObserverError::InvalidEvent(_))));
    }

    #[tokio::test]
    async fn test_entries_carry_request_correlation() {
        let sink = sink();
        sink.emit("outside").unwrap();

        let ctx = RequestContext::new("GET", "/users");
        let correlation = ctx.correlation_id().to_string();
        ctx.scope(async {
            sink.emit_at(LogLevel::Warn, json!({"message": "inside", "user": 7}))
                .unwrap();
        })
        .await;

        let logs = sink.hub().live().logs.snapshot();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].correlation_id, None);
        assert_eq!(logs[1].correlation_id.as_deref(), Some(correlation.as_str()));
        assert_eq!(logs[1].level, Some(LogLevel::Warn));
        assert_eq!(logs[1].payload["user"], json!(7));
    }

    #[derive(Serialize)]
    struct Audit {
        action: &'static str,
        actor: u32,
    }

    #[test]
    fn test_emit_serialized() {
        let sink = sink();
        sink.emit_serialized(Some(LogLevel::Info), &Audit { action: "login", actor: 3 })
            .unwrap();

        let logs = sink.hub().live().logs.snapshot();
        assert_eq!(logs[0].payload["action"], json!("login"));
    }
}
