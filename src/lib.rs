// BTP Bridge Monitor - Cross-chain link health tracker
//
// This library provides the core components for monitoring the links of a
// BTP (Blockchain Transmission Protocol) bridge topology:
// 1. Polling each network's BMC contract for its links and counters
// 2. Discovering further bridge endpoints mentioned by those links
// 3. Classifying every directed connection (good / bad / broken / unknown)
//    from routing presence and pending-message age
// 4. Persisting state, history and an event log transactionally in SQLite
// 5. Exposing the results over an HTTP API, Prometheus metrics and Slack

pub mod api;
pub mod bmc;
pub mod config;
pub mod link;
pub mod links;
pub mod metrics;
pub mod notify;
pub mod service;
pub mod storage;
pub mod types;

// Re-export commonly used types
pub use api::StatusApi;
pub use bmc::{Bmc, BmcError, IconBmc, ProxyFactory};
pub use config::{ApiConfig, DatabaseConfig, MetricsConfig, MonitorConfig, NetworkConfig, PollingConfig, SlackConfig};
pub use link::Link;
pub use links::{Links, MonitorError, NetworkStatus};
pub use metrics::MonitorMetrics;
pub use notify::SlackNotifier;
pub use service::MonitorService;
pub use storage::{ConnectionState, LogFilter, Storage, StorageError, TxRecord};
pub use types::{merge_status, EdgeState, LinkEvent, LinkState, LinkStatus, LinkUpdate};
