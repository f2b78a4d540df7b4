use crate::config::MetricsConfig;
use crate::types::{LinkEvent, LinkState};
use log::{error, info};
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Prometheus error: {0}")]
    PrometheusError(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type MetricsResult<T> = Result<T, MetricsError>;

/// Prometheus metrics collector for the monitor
pub struct MonitorMetrics {
    registry: Arc<Registry>,

    // Polling round metrics
    pub rounds_total: IntCounterVec,
    pub round_duration: Histogram,
    pub endpoint_errors_total: IntCounter,

    // Link metrics
    pub events_total: IntCounterVec,
    pub links_by_state: IntGaugeVec,

    // Notification metrics
    pub notifications_total: IntCounterVec,

    // Storage metrics
    pub storage_size_bytes: IntGauge,

    // System metrics
    pub uptime_seconds: IntGauge,
}

impl MonitorMetrics {
    pub fn new() -> MetricsResult<Self> {
        let registry = Registry::new();

        let rounds_total = IntCounterVec::new(
            Opts::new("monitor_rounds_total", "Total polling rounds"),
            &["result"],
        )?;
        registry.register(Box::new(rounds_total.clone()))?;

        let round_duration = Histogram::with_opts(
            HistogramOpts::new("monitor_round_duration_seconds", "Duration of polling rounds")
                .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
        )?;
        registry.register(Box::new(round_duration.clone()))?;

        let endpoint_errors_total = IntCounter::new(
            "monitor_endpoint_errors_total",
            "Endpoints skipped because of collaborator errors",
        )?;
        registry.register(Box::new(endpoint_errors_total.clone()))?;

        let events_total = IntCounterVec::new(
            Opts::new("monitor_link_events_total", "Link events emitted"),
            &["kind"],
        )?;
        registry.register(Box::new(events_total.clone()))?;

        let links_by_state = IntGaugeVec::new(
            Opts::new("monitor_links_by_state", "Tracked links per classification"),
            &["state"],
        )?;
        registry.register(Box::new(links_by_state.clone()))?;

        let notifications_total = IntCounterVec::new(
            Opts::new("monitor_notifications_total", "Notification delivery attempts"),
            &["result"],
        )?;
        registry.register(Box::new(notifications_total.clone()))?;

        let storage_size_bytes = IntGauge::new(
            "monitor_storage_size_bytes",
            "Database size in bytes",
        )?;
        registry.register(Box::new(storage_size_bytes.clone()))?;

        let uptime_seconds = IntGauge::new(
            "monitor_uptime_seconds",
            "Monitor uptime in seconds",
        )?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            rounds_total,
            round_duration,
            endpoint_errors_total,
            events_total,
            links_by_state,
            notifications_total,
            storage_size_bytes,
            uptime_seconds,
        })
    }

    pub fn record_round(&self, success: bool, duration_secs: f64) {
        let result = if success { "success" } else { "failure" };
        self.rounds_total.with_label_values(&[result]).inc();
        self.round_duration.observe(duration_secs);
    }

    pub fn record_endpoint_skips(&self, count: usize) {
        self.endpoint_errors_total.inc_by(count as u64);
    }

    pub fn record_events(&self, events: &[LinkEvent]) {
        for event in events {
            self.events_total.with_label_values(&[event.kind()]).inc();
        }
    }

    /// Set the per-state link gauges; absent states drop to zero
    pub fn update_link_states(&self, counts: &HashMap<LinkState, usize>) {
        for state in LinkState::ALL {
            let count = counts.get(&state).copied().unwrap_or(0);
            self.links_by_state.with_label_values(&[state.as_str()]).set(count as i64);
        }
    }

    pub fn record_notification(&self, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.notifications_total.with_label_values(&[result]).inc();
    }

    pub fn update_storage_size(&self, size_bytes: u64) {
        self.storage_size_bytes.set(size_bytes as i64);
    }

    pub fn update_uptime(&self, seconds: i64) {
        self.uptime_seconds.set(seconds);
    }

    /// Get metrics as Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder.encode_to_string(&metric_families).unwrap_or_default()
    }

    /// Start the metrics HTTP server
    pub async fn start_server(self: Arc<Self>, config: MetricsConfig) -> MetricsResult<()> {
        if !config.enabled {
            info!("Metrics server is disabled");
            return Ok(());
        }

        info!("Starting metrics server on {}", config.address);

        let listener = TcpListener::bind(&config.address).await?;

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((mut stream, _addr)) => {
                        let metrics_text = self.gather();

                        let response = format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\n\r\n{}",
                            metrics_text.len(),
                            metrics_text
                        );

                        if let Err(e) = stream.write_all(response.as_bytes()).await {
                            error!("Failed to write metrics response: {}", e);
                        }
                    }
                    Err(e) => {
                        error!("Failed to accept metrics connection: {}", e);
                    }
                }
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LinkRef;

    fn link() -> LinkRef {
        LinkRef {
            src: "a".to_string(),
            dst: "b".to_string(),
            src_name: "A".to_string(),
            dst_name: "B".to_string(),
        }
    }

    #[test]
    fn test_metrics_creation() {
        let metrics = MonitorMetrics::new().unwrap();
        assert_eq!(metrics.endpoint_errors_total.get(), 0);
    }

    #[test]
    fn test_record_round_and_events() {
        let metrics = MonitorMetrics::new().unwrap();
        metrics.record_round(true, 0.4);
        metrics.record_events(&[
            LinkEvent::Tx { link: link(), seq: 0, count: 2 },
            LinkEvent::State { link: link(), before: LinkState::Unknown, after: LinkState::Good },
        ]);
        assert_eq!(metrics.rounds_total.with_label_values(&["success"]).get(), 1);
        assert_eq!(metrics.events_total.with_label_values(&["tx"]).get(), 1);
        assert_eq!(metrics.events_total.with_label_values(&["state"]).get(), 1);

        metrics.record_endpoint_skips(2);
        assert_eq!(metrics.endpoint_errors_total.get(), 2);
    }

    #[test]
    fn test_link_state_gauges_reset() {
        let metrics = MonitorMetrics::new().unwrap();
        let mut counts = HashMap::new();
        counts.insert(LinkState::Good, 3usize);
        metrics.update_link_states(&counts);
        assert_eq!(metrics.links_by_state.with_label_values(&["good"]).get(), 3);

        metrics.update_link_states(&HashMap::new());
        assert_eq!(metrics.links_by_state.with_label_values(&["good"]).get(), 0);
    }

    #[test]
    fn test_gather_metrics() {
        let metrics = MonitorMetrics::new().unwrap();
        metrics.record_round(false, 1.0);
        let output = metrics.gather();
        assert!(output.contains("monitor_rounds_total"));
    }
}
