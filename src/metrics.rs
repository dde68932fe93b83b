use crate::observability::model::EventKind;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics exporter
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;

    init_metric_descriptions();

    Ok(handle)
}

/// Initialize metric descriptions (can be called multiple times safely)
fn init_metric_descriptions() {
    describe_counter!(
        "lens_events_admitted_total",
        "Events admitted into the live store"
    );
    describe_counter!(
        "lens_events_rejected_total",
        "Malformed events rejected at submission"
    );
    describe_counter!(
        "lens_live_evicted_total",
        "Events evicted from live ring buffers by newer ones"
    );
    describe_counter!(
        "lens_durable_dropped_total",
        "Events dropped from the durable path"
    );
    describe_counter!(
        "lens_durable_persisted_total",
        "Events written to the durable store"
    );
    describe_histogram!(
        "lens_request_duration_seconds",
        "Duration of captured requests in seconds"
    );
    describe_gauge!("lens_info", "request-lens version information");

    gauge!("lens_info", "version" => env!("CARGO_PKG_VERSION")).set(1.0);
}

pub fn record_admitted(kind: EventKind) {
    counter!("lens_events_admitted_total", "kind" => kind.as_str()).increment(1);
}

pub fn record_rejected(kind: EventKind) {
    counter!("lens_events_rejected_total", "kind" => kind.as_str()).increment(1);
}

pub fn record_live_eviction(kind: EventKind) {
    counter!("lens_live_evicted_total", "kind" => kind.as_str()).increment(1);
}

/// Record an event lost from the durable path (`queue_full` or `write_failed`)
pub fn record_durable_drop(reason: &'static str) {
    counter!("lens_durable_dropped_total", "reason" => reason).increment(1);
}

pub fn record_persisted(count: u64) {
    counter!("lens_durable_persisted_total").increment(count);
}

/// Label used for requests no route matched
pub const UNMATCHED_ROUTE: &str = "unmatched";

/// Record a captured request's duration, labelled by route template.
/// Raw paths never become labels.
pub fn record_request_duration(method: &str, route: Option<&str>, duration: Duration) {
    histogram!(
        "lens_request_duration_seconds",
        "method" => method.to_string(),
        "route" => route.unwrap_or(UNMATCHED_ROUTE).to_string(),
    )
    .record(duration.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_metrics() {
        init_metric_descriptions();

        record_admitted(EventKind::Hit);
        record_rejected(EventKind::Log);
        record_live_eviction(EventKind::Exception);
        record_durable_drop("queue_full");
        record_persisted(10);
        record_request_duration("GET", Some("/users"), Duration::from_millis(12));

        // No recorder is installed here; the calls must simply not panic
    }

    #[test]
    fn test_rendered_output_contains_counters() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            record_admitted(EventKind::Hit);
            record_durable_drop("write_failed");
        });

        let rendered = handle.render();
        assert!(rendered.contains("lens_events_admitted_total"));
        assert!(rendered.contains("reason=\"write_failed\""));
    }

    #[test]
    fn test_unrouted_requests_share_one_label() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        let mut config = crate::config::ObserverConfig::default();
        config.storage.enabled = false;
        let observer = crate::observability::Observer::in_memory(&config);

        metrics::with_local_recorder(&recorder, || {
            for path in ["/wp-admin/setup.php", "/.env"] {
                let hit = crate::observability::RequestHit::new("GET", path, 404, Duration::from_millis(1));
                observer.hub().submit_request_hit(hit).unwrap();
            }
            record_request_duration("GET", Some("/users/:id"), Duration::from_millis(3));
        });

        let rendered = handle.render();
        assert!(rendered.contains("route=\"unmatched\""));
        assert!(rendered.contains("route=\"/users/:id\""));
        assert!(!rendered.contains("wp-admin"));
        assert!(!rendered.contains(".env"));
    }
}
