//! Integration tests for the BTP bridge monitor
//!
//! These tests drive full polling rounds against mock BMC endpoints that
//! share a mutable "world" of link statuses.

use async_trait::async_trait;
use btp_monitor::bmc::{Bmc, BmcError, BmcResult, ProxyFactory};
use btp_monitor::config::{DatabaseConfig, MonitorConfig, NetworkConfig};
use btp_monitor::links::Links;
use btp_monitor::service::MonitorService;
use btp_monitor::storage::{LogFilter, Storage};
use btp_monitor::types::{LinkState, LinkStatus, VerifierStatus};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;

/// Shared state of all mock endpoints: per-endpoint link statuses plus a set
/// of endpoints currently refusing to answer.
#[derive(Debug, Default)]
struct World {
    statuses: HashMap<String, HashMap<String, LinkStatus>>,
    offline: Vec<String>,
}

impl World {
    fn set_status(&mut self, endpoint: &str, peer: &str, tx_seq: u64, rx_seq: u64) {
        self.statuses.entry(endpoint.to_string()).or_default().insert(
            peer.to_string(),
            LinkStatus {
                rx_seq,
                tx_seq,
                verifier: VerifierStatus { height: 50, extra: None },
                current_height: 100,
            },
        );
    }

    fn remove_link(&mut self, endpoint: &str, peer: &str) {
        if let Some(links) = self.statuses.get_mut(endpoint) {
            links.remove(peer);
        }
    }

    fn set_offline(&mut self, endpoint: &str, offline: bool) {
        if offline {
            if !self.offline.contains(&endpoint.to_string()) {
                self.offline.push(endpoint.to_string());
            }
        } else {
            self.offline.retain(|e| e != endpoint);
        }
    }
}

#[derive(Debug)]
struct MockBmc {
    address: String,
    world: Arc<Mutex<World>>,
}

#[async_trait]
impl Bmc for MockBmc {
    fn address(&self) -> &str {
        &self.address
    }

    async fn get_links(&self) -> BmcResult<Vec<String>> {
        let world = self.world.lock();
        if world.offline.contains(&self.address) {
            return Err(BmcError::Rpc("endpoint offline".to_string()));
        }
        let mut links: Vec<String> = world
            .statuses
            .get(&self.address)
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default();
        links.sort();
        Ok(links)
    }

    async fn get_status(&self, link: &str) -> BmcResult<LinkStatus> {
        let world = self.world.lock();
        if world.offline.contains(&self.address) {
            return Err(BmcError::Rpc("endpoint offline".to_string()));
        }
        world
            .statuses
            .get(&self.address)
            .and_then(|s| s.get(link))
            .cloned()
            .ok_or_else(|| BmcError::InvalidStatus(format!("no status for {}", link)))
    }

    async fn get_routes(&self) -> BmcResult<HashMap<String, String>> {
        let mut routes = HashMap::new();
        routes.insert("0x3.bsc".to_string(), "btp://0x3.bsc/0xabc".to_string());
        Ok(routes)
    }

    async fn get_fee(&self, _dst: &str, response: bool) -> BmcResult<u128> {
        Ok(if response { 250 } else { 100 })
    }
}

fn mock_factory(world: Arc<Mutex<World>>) -> ProxyFactory {
    Box::new(move |config: &NetworkConfig| {
        Ok(Box::new(MockBmc { address: config.address(), world: world.clone() }) as Box<dyn Bmc>)
    })
}

fn network(id: &str, name: &str, bmc: &str) -> NetworkConfig {
    NetworkConfig {
        network: id.to_string(),
        name: Some(name.to_string()),
        kind: "icon".to_string(),
        endpoint: format!("http://{}.test/api/v3", name.to_lowercase()),
        bmc: bmc.to_string(),
        tx_limit: 30,
        rx_limit: 30,
        symbol: None,
        decimal: 18,
    }
}

const ICON: &str = "btp://0x1.icon/cx1";
const BSC: &str = "btp://0x2.bsc/0xb1";

fn two_network_setup(world: &Arc<Mutex<World>>) -> Links {
    {
        let mut w = world.lock();
        w.set_status(ICON, BSC, 0, 0);
        w.set_status(BSC, ICON, 0, 0);
    }
    let networks = vec![network("0x1.icon", "ICON", "cx1"), network("0x2.bsc", "BSC", "0xb1")];
    let storage = Arc::new(Storage::in_memory().unwrap());
    Links::with_factory(&networks, storage, mock_factory(world.clone())).unwrap()
}

#[tokio::test]
async fn test_round_classifies_and_tracks_sequences() {
    let world = Arc::new(Mutex::new(World::default()));
    let mut links = two_network_setup(&world);

    // first round: both directions observed active
    let (changed, events) = links.update(true).await.unwrap();
    assert!(changed);
    let state_events: Vec<_> = events.iter().filter(|e| e.kind() == "state").collect();
    assert_eq!(state_events.len(), 2);
    assert_eq!(links.find_link(ICON, BSC).unwrap().state(), LinkState::Good);
    assert_eq!(links.find_link(BSC, ICON).unwrap().state(), LinkState::Good);

    // ICON sends three messages toward BSC
    world.lock().set_status(ICON, BSC, 3, 0);
    let (changed, events) = links.update(true).await.unwrap();
    assert!(!changed);
    let tx_events: Vec<_> = events.iter().filter(|e| e.kind() == "tx").collect();
    assert_eq!(tx_events.len(), 1);
    let link = links.find_link(ICON, BSC).unwrap();
    assert_eq!(link.tx_seq(), Some(3));
    assert_eq!(link.pending_count(), 3);

    // BSC acknowledges them
    world.lock().set_status(BSC, ICON, 0, 3);
    let (_, events) = links.update(true).await.unwrap();
    let rx_events: Vec<_> = events.iter().filter(|e| e.kind() == "rx").collect();
    assert_eq!(rx_events.len(), 1);
    let link = links.find_link(ICON, BSC).unwrap();
    assert_eq!(link.rx_seq(), Some(3));
    assert_eq!(link.pending_count(), 0);
    assert_eq!(link.state(), LinkState::Good);
}

#[tokio::test]
async fn test_discovered_endpoint_polled_same_round() {
    let world = Arc::new(Mutex::new(World::default()));
    let second = "btp://0x1.icon/cx2";
    {
        let mut w = world.lock();
        // the configured BMC routes to a second BMC on the same network
        w.set_status(ICON, second, 1, 0);
        w.set_status(second, ICON, 0, 1);
    }
    let networks = vec![network("0x1.icon", "ICON", "cx1")];
    let storage = Arc::new(Storage::in_memory().unwrap());
    let mut links = Links::with_factory(&networks, storage, mock_factory(world.clone())).unwrap();

    let (changed, _) = links.update(true).await.unwrap();
    assert!(changed);

    assert_eq!(links.endpoints(), &[ICON.to_string(), second.to_string()]);
    // discovered endpoint carries the cloned config with a contract suffix
    assert_eq!(links.name_of(second), "ICON(cx2)");
    assert_eq!(links.find_link(ICON, second).unwrap().state(), LinkState::Good);
    assert_eq!(links.find_link(second, ICON).unwrap().state(), LinkState::Good);
}

#[tokio::test]
async fn test_unconfigured_network_not_discovered() {
    let world = Arc::new(Mutex::new(World::default()));
    let foreign = "btp://0x9.far/0xdead";
    {
        let mut w = world.lock();
        w.set_status(ICON, foreign, 1, 0);
    }
    let networks = vec![network("0x1.icon", "ICON", "cx1")];
    let storage = Arc::new(Storage::in_memory().unwrap());
    let mut links = Links::with_factory(&networks, storage, mock_factory(world.clone())).unwrap();

    links.update(true).await.unwrap();
    assert_eq!(links.endpoints(), &[ICON.to_string()]);
    // the link is tracked but stays UNKNOWN: its far side is never observed
    assert_eq!(links.find_link(ICON, foreign).unwrap().state(), LinkState::Unknown);
}

#[tokio::test]
async fn test_offline_endpoint_skipped_unless_strict() {
    let world = Arc::new(Mutex::new(World::default()));
    let mut links = two_network_setup(&world);
    links.update(true).await.unwrap();
    assert_eq!(links.find_link(ICON, BSC).unwrap().state(), LinkState::Good);

    world.lock().set_offline(BSC, true);

    assert!(links.update(true).await.is_err());

    // non-strict: the offline side is reported skipped and falls back to
    // its last known state
    let snapshot = links.query_status(false).await.unwrap();
    assert_eq!(snapshot.skipped(), &[BSC.to_string()]);
    let (changed, events) = links.apply_status(&snapshot, chrono::Utc::now()).unwrap();
    assert!(!changed);
    assert!(events.is_empty());
    assert_eq!(links.find_link(ICON, BSC).unwrap().state(), LinkState::Good);
    assert_eq!(links.find_link(BSC, ICON).unwrap().state(), LinkState::Good);
}

#[tokio::test]
async fn test_offline_endpoint_increments_error_counter() {
    let world = Arc::new(Mutex::new(World::default()));
    {
        let mut w = world.lock();
        w.set_status(ICON, BSC, 0, 0);
        w.set_status(BSC, ICON, 0, 0);
        w.set_offline(BSC, true);
    }

    let mut config = MonitorConfig::default();
    config.networks = vec![network("0x1.icon", "ICON", "cx1"), network("0x2.bsc", "BSC", "0xb1")];
    config.database.path = ":memory:".into();
    config.database.enable_wal = false;
    config.api.enabled = false;
    config.metrics.enabled = false;
    config.monitor.interval_secs = 3600;

    let mut service = MonitorService::with_factory(config, mock_factory(world.clone())).unwrap();
    let metrics = service.metrics();
    service.start().await.unwrap();
    // the interval ticks immediately; give the first round time to finish
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    service.shutdown().await;

    assert_eq!(metrics.endpoint_errors_total.get(), 1);
}

#[tokio::test]
async fn test_route_withdrawal_breaks_link() {
    let world = Arc::new(Mutex::new(World::default()));
    let mut links = two_network_setup(&world);
    links.update(true).await.unwrap();

    world.lock().remove_link(ICON, BSC);
    let (changed, _) = links.update(true).await.unwrap();
    assert!(changed);
    // tx side withdrawn: both directions involving that side degrade
    assert_eq!(links.find_link(ICON, BSC).unwrap().state(), LinkState::Broken);
    assert_eq!(links.find_link(BSC, ICON).unwrap().state(), LinkState::Broken);
    assert!(links.get_connected_links().is_empty());

    // routing restored
    world.lock().set_status(ICON, BSC, 0, 0);
    let (changed, _) = links.update(true).await.unwrap();
    assert!(changed);
    assert_eq!(links.find_link(ICON, BSC).unwrap().state(), LinkState::Good);
    assert_eq!(links.get_connected_links().len(), 2);
}

#[tokio::test]
async fn test_state_survives_restart() {
    let temp_dir = TempDir::new().unwrap();
    let db_config = DatabaseConfig { path: temp_dir.path().join("monitor.db"), enable_wal: false };
    let world = Arc::new(Mutex::new(World::default()));
    {
        let mut w = world.lock();
        w.set_status(ICON, BSC, 5, 0);
        w.set_status(BSC, ICON, 0, 2);
    }
    let networks = vec![network("0x1.icon", "ICON", "cx1"), network("0x2.bsc", "BSC", "0xb1")];

    {
        let storage = Arc::new(Storage::open(&db_config).unwrap());
        let mut links = Links::with_factory(&networks, storage, mock_factory(world.clone())).unwrap();
        links.update(true).await.unwrap();
        let link = links.find_link(ICON, BSC).unwrap();
        assert_eq!(link.tx_seq(), Some(5));
        assert_eq!(link.rx_seq(), Some(2));
    }

    // reopen: counters and classification come back from the database
    let storage = Arc::new(Storage::open(&db_config).unwrap());
    let mut links = Links::with_factory(&networks, storage, mock_factory(world.clone())).unwrap();
    let (changed, events) = links.update(true).await.unwrap();
    assert!(!changed);
    assert!(events.is_empty());
    let link = links.find_link(ICON, BSC).unwrap();
    assert_eq!(link.state(), LinkState::Good);
    assert_eq!(link.tx_seq(), Some(5));
    assert_eq!(link.rx_seq(), Some(2));
    assert_eq!(link.pending_count(), 3);
}

#[tokio::test]
async fn test_relay_fee_table() {
    let world = Arc::new(Mutex::new(World::default()));
    let links = two_network_setup(&world);

    let table = links.get_relay_fee_table("0x1.icon").await.unwrap();
    assert_eq!(table.symbol, "ICX");
    assert_eq!(table.decimal, 18);
    // destinations: the routed 0x3.bsc plus the linked 0x2.bsc
    let ids: Vec<&str> = table.table.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["0x2.bsc", "0x3.bsc"]);
    let linked = &table.table[0];
    assert_eq!(linked.name, "BSC");
    assert_eq!(linked.fees, ["100".to_string(), "250".to_string()]);

    assert!(links.get_relay_fee_table("0x9.far").await.is_err());
}

#[tokio::test]
async fn test_events_are_logged_per_round() {
    let world = Arc::new(Mutex::new(World::default()));
    let storage = Arc::new(Storage::in_memory().unwrap());
    {
        let mut w = world.lock();
        w.set_status(ICON, BSC, 0, 0);
        w.set_status(BSC, ICON, 0, 0);
    }
    let networks = vec![network("0x1.icon", "ICON", "cx1"), network("0x2.bsc", "BSC", "0xb1")];
    let mut links = Links::with_factory(&networks, storage.clone(), mock_factory(world.clone())).unwrap();

    let (_, events) = links.update(true).await.unwrap();
    let now = chrono::Utc::now();
    for event in &events {
        storage
            .write_log(now, &event.link().src, &event.link().dst, event.kind(), &event.extra())
            .unwrap();
    }

    let logs = storage
        .get_logs(&LogFilter { event: Some("state".to_string()), ..Default::default() })
        .unwrap();
    assert_eq!(logs.len(), 2);
    for log in &logs {
        assert_eq!(log.extra["before"], serde_json::json!("unknown"));
        assert_eq!(log.extra["after"], serde_json::json!("good"));
    }
}
