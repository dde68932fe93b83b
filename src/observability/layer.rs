//! Tracing layer that turns `tracing` events into runtime log entries
//!
//! Events emitted while a captured request is executing carry its
//! correlation id. Events from the pipeline itself are skipped, as is
//! everything emitted inside the durable writer's suppression scope, so the
//! pipeline never observes its own work.

use crate::observability::context;
use crate::observability::model::{LogLevel, Payload};
use crate::observability::sink::LogSink;
use serde_json::Value;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::{layer::Context, Layer};

const PIPELINE_TARGET: &str = "request_lens::observability";

pub struct RuntimeLogLayer {
    sink: LogSink,
}

impl RuntimeLogLayer {
    pub fn new(sink: LogSink) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for RuntimeLogLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if metadata.target().starts_with(PIPELINE_TARGET) || context::is_suppressed() {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        visitor
            .fields
            .insert("target".to_string(), Value::String(metadata.target().to_string()));

        // Rejections are already counted in pipeline health
        let _ = self
            .sink
            .hub()
            .emit_runtime_log(visitor.fields, Some(LogLevel::from(metadata.level())));
    }
}

#[derive(Default)]
struct FieldVisitor {
    fields: Payload,
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.fields
            .insert(field.name().to_string(), Value::String(format!("{:?}", value)));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.fields
            .insert(field.name().to_string(), Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), Value::Bool(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ObserverConfig;
    use crate::observability::context::RequestContext;
    use crate::observability::health::PipelineHealth;
    use crate::observability::hub::DispatchHub;
    use crate::observability::live::LiveStore;
    use serde_json::json;
    use std::sync::Arc;
    use tracing_subscriber::layer::SubscriberExt;

    fn hub() -> Arc<DispatchHub> {
        let config = ObserverConfig::default();
        let live = Arc::new(LiveStore::new(&config.live));
        Arc::new(DispatchHub::new(&config, live, Arc::new(PipelineHealth::new()), None, 1))
    }

    #[tokio::test]
    async fn test_tracing_events_become_runtime_logs() {
        let hub = hub();
        let subscriber = tracing_subscriber::registry()
            .with(RuntimeLogLayer::new(LogSink::new(hub.clone())));
        let _guard = tracing::subscriber::set_default(subscriber);

        let ctx = RequestContext::new("GET", "/orders");
        let correlation = ctx.correlation_id().to_string();
        ctx.scope(async {
            tracing::warn!(target: "shop::orders", order_id = 42u64, paid = false, "Order lookup slow");
        })
        .await;

        let logs = hub.live().logs.snapshot();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].level, Some(LogLevel::Warn));
        assert_eq!(logs[0].message(), Some("Order lookup slow"));
        assert_eq!(logs[0].payload["order_id"], json!(42));
        assert_eq!(logs[0].payload["paid"], json!(false));
        assert_eq!(logs[0].payload["target"], json!("shop::orders"));
        assert_eq!(logs[0].correlation_id.as_deref(), Some(correlation.as_str()));
    }

    #[tokio::test]
    async fn test_pipeline_and_suppressed_events_skipped() {
        let hub = hub();
        let subscriber = tracing_subscriber::registry()
            .with(RuntimeLogLayer::new(LogSink::new(hub.clone())));
        let _guard = tracing::subscriber::set_default(subscriber);

        tracing::info!(target: "request_lens::observability::writer", "Flushed event batch");
        context::suppressed(async {
            tracing::info!(target: "sqlx::query", "INSERT OR IGNORE");
        })
        .await;
        tracing::info!(target: "app", "kept");

        let logs = hub.live().logs.snapshot();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message(), Some("kept"));
    }
}
