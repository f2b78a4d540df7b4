use crate::api::{ApiError, StatusApi};
use crate::bmc::ProxyFactory;
use crate::config::MonitorConfig;
use crate::links::{Links, MonitorError};
use crate::metrics::{MetricsError, MonitorMetrics};
use crate::notify::{NotifyError, SlackNotifier};
use crate::storage::{Storage, StorageError};
use crate::types::LinkEvent;
use chrono::Utc;
use log::{error, info, warn};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Monitor error: {0}")]
    Monitor(#[from] MonitorError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),

    #[error("Notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("API error: {0}")]
    Api(#[from] ApiError),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The long-running monitor: owns storage, the link orchestrator, metrics
/// and the optional notifier, and drives the periodic polling loop.
///
/// Built in main, started once and shut down explicitly; the polling loop is
/// a single interval task stopped through an mpsc channel.
pub struct MonitorService {
    config: MonitorConfig,
    storage: Arc<Storage>,
    links: Arc<RwLock<Links>>,
    metrics: Arc<MonitorMetrics>,
    notifier: Option<Arc<SlackNotifier>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl MonitorService {
    pub fn new(config: MonitorConfig) -> ServiceResult<Self> {
        let storage = Arc::new(Storage::open(&config.database)?);
        let links = Links::new(&config.networks, storage.clone())?;
        Self::assemble(config, storage, links)
    }

    /// Construct with a custom collaborator factory; tests use this to run
    /// the service against mock endpoints.
    pub fn with_factory(config: MonitorConfig, factory: ProxyFactory) -> ServiceResult<Self> {
        let storage = Arc::new(Storage::open(&config.database)?);
        let links = Links::with_factory(&config.networks, storage.clone(), factory)?;
        Self::assemble(config, storage, links)
    }

    fn assemble(config: MonitorConfig, storage: Arc<Storage>, links: Links) -> ServiceResult<Self> {
        let metrics = Arc::new(MonitorMetrics::new()?);
        let notifier = if config.slack.enabled {
            Some(Arc::new(SlackNotifier::new(&config.slack)?))
        } else {
            None
        };
        Ok(Self {
            config,
            storage,
            links: Arc::new(RwLock::new(links)),
            metrics,
            notifier,
            shutdown_tx: None,
        })
    }

    pub fn storage(&self) -> Arc<Storage> {
        self.storage.clone()
    }

    pub fn links(&self) -> Arc<RwLock<Links>> {
        self.links.clone()
    }

    pub fn metrics(&self) -> Arc<MonitorMetrics> {
        self.metrics.clone()
    }

    /// Start the metrics server, status API and the polling loop
    pub async fn start(&mut self) -> ServiceResult<()> {
        self.metrics
            .clone()
            .start_server(self.config.metrics.clone())
            .await?;

        let api = Arc::new(StatusApi::new(self.storage.clone(), self.links.clone(), VERSION));
        api.start(self.config.api.clone()).await?;

        self.storage
            .write_log(Utc::now(), "", "", "log", &json!(format!("START {}", VERSION)))?;

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        let interval_secs = self.config.monitor.interval_secs;
        let storage = self.storage.clone();
        let links = self.links.clone();
        let metrics = self.metrics.clone();
        let notifier = self.notifier.clone();

        info!("Starting polling loop, interval {}s", interval_secs);
        tokio::spawn(async move {
            let started = Instant::now();
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        Self::run_round(&storage, &links, &metrics, notifier.as_deref()).await;
                        metrics.update_uptime(started.elapsed().as_secs() as i64);
                        match storage.database_size() {
                            Ok(size) => metrics.update_storage_size(size),
                            Err(e) => warn!("cannot read database size: {}", e),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Polling loop stopped");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    /// One polling round: query the endpoints, count the skipped ones, feed
    /// the snapshot to the links, log and count the events, dispatch
    /// notifications on state changes.
    async fn run_round(
        storage: &Arc<Storage>,
        links: &Arc<RwLock<Links>>,
        metrics: &Arc<MonitorMetrics>,
        notifier: Option<&SlackNotifier>,
    ) {
        let round_start = Instant::now();
        let result = {
            let mut guard = links.write().await;
            match guard.query_status(false).await {
                Ok(status) => {
                    metrics.record_endpoint_skips(status.skipped().len());
                    guard.apply_status(&status, Utc::now())
                }
                Err(e) => Err(e),
            }
        };
        let now = Utc::now();

        match result {
            Ok((changed, events)) => {
                metrics.record_round(true, round_start.elapsed().as_secs_f64());
                for event in &events {
                    info!("{}", event);
                    if let Err(e) = storage.write_log(
                        now,
                        &event.link().src,
                        &event.link().dst,
                        event.kind(),
                        &event.extra(),
                    ) {
                        error!("Failed to log event: {}", e);
                    }
                }
                metrics.record_events(&events);
                {
                    let guard = links.read().await;
                    metrics.update_link_states(&guard.state_counts());
                }
                if changed {
                    if let Some(notifier) = notifier {
                        Self::dispatch_notification(notifier, metrics, &events).await;
                    }
                }
            }
            Err(e) => {
                metrics.record_round(false, round_start.elapsed().as_secs_f64());
                error!("Polling round failed: {}", e);
                if let Err(log_err) =
                    storage.write_log(now, "", "", "log", &json!(format!("Exception:{}", e)))
                {
                    error!("Failed to log round failure: {}", log_err);
                }
            }
        }
    }

    async fn dispatch_notification(
        notifier: &SlackNotifier,
        metrics: &Arc<MonitorMetrics>,
        events: &[LinkEvent],
    ) {
        match notifier.notify(events).await {
            Ok(()) => metrics.record_notification(true),
            Err(e) => {
                metrics.record_notification(false);
                warn!("Notification failed: {}", e);
            }
        }
    }

    /// Stop the polling loop and write the shutdown marker
    pub async fn shutdown(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(()).await;
        }
        if let Err(e) =
            self.storage
                .write_log(Utc::now(), "", "", "log", &json!(format!("SHUTDOWN {}", VERSION)))
        {
            error!("Failed to write shutdown marker: {}", e);
        }
        info!("Monitor service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LogFilter;

    #[tokio::test]
    async fn test_start_and_shutdown_write_markers() {
        let mut config = MonitorConfig::default();
        config.networks.clear();
        config.database.path = ":memory:".into();
        config.database.enable_wal = false;
        config.api.enabled = false;
        config.metrics.enabled = false;
        config.monitor.interval_secs = 3600;

        let mut service = MonitorService::new(config).unwrap();
        service.start().await.unwrap();
        service.shutdown().await;

        let logs = service
            .storage()
            .get_logs(&LogFilter { event: Some("log".to_string()), ..Default::default() })
            .unwrap();
        assert_eq!(logs.len(), 2);
        // newest first
        assert!(logs[0].extra.as_str().unwrap().starts_with("SHUTDOWN"));
        assert!(logs[1].extra.as_str().unwrap().starts_with("START"));
    }

    #[tokio::test]
    async fn test_slack_misconfiguration_rejected() {
        let mut config = MonitorConfig::default();
        config.networks.clear();
        config.database.path = ":memory:".into();
        config.slack.enabled = true;
        assert!(matches!(MonitorService::new(config), Err(ServiceError::Notify(_))));
    }
}
