use crate::bmc::{build_proxy, Bmc, BmcError, ProxyFactory};
use crate::config::NetworkConfig;
use crate::link::Link;
use crate::storage::{Storage, StorageError};
use crate::types::{BtpAddress, EdgeState, FeeEntry, FeeTable, LinkEvent, LinkState, LinkStatus, LinkUpdate};
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Collaborator error: {0}")]
    Bmc(#[from] BmcError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown network: {0}")]
    UnknownNetwork(String),
}

pub type MonitorResult<T> = Result<T, MonitorError>;

const DEFAULT_LIMIT_SECS: i64 = 30;

/// One polling round's snapshot: endpoint address -> (link address, status),
/// in the order endpoints were polled and links were reported.
#[derive(Debug, Default)]
pub struct NetworkStatus {
    statuses: HashMap<String, Vec<(String, LinkStatus)>>,
    order: Vec<String>,
    skipped: Vec<String>,
}

impl NetworkStatus {
    pub fn set_link_statuses(&mut self, address: &str, links: Vec<(String, LinkStatus)>) {
        if !self.statuses.contains_key(address) {
            self.order.push(address.to_string());
        }
        self.statuses.insert(address.to_string(), links);
    }

    fn get(&self, src: &str, dst: &str) -> Option<&LinkStatus> {
        self.statuses
            .get(src)?
            .iter()
            .find(|(addr, _)| addr == dst)
            .map(|(_, status)| status)
    }

    /// Endpoints that failed to answer this round and were skipped
    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    /// Every (src, dst) pair mentioned by any polled endpoint
    pub fn get_known_links(&self) -> Vec<(String, String)> {
        let mut links = Vec::new();
        for src in &self.order {
            if let Some(statuses) = self.statuses.get(src) {
                for (dst, _) in statuses {
                    links.push((src.clone(), dst.clone()));
                }
            }
        }
        links
    }

    /// Sender-side observation for (src, dst): None when src was not polled,
    /// Inactive when src no longer lists dst, otherwise the send counter at
    /// src's current chain height.
    pub fn get_tx_update(&self, src: &str, dst: &str) -> Option<EdgeState> {
        let statuses = self.statuses.get(src)?;
        match statuses.iter().find(|(addr, _)| addr == dst) {
            Some((_, status)) => Some(EdgeState::Active {
                seq: status.tx_seq,
                height: status.current_height,
            }),
            None => Some(EdgeState::Inactive),
        }
    }

    /// Receiver-side observation for (src, dst), read from dst's entry for
    /// src: the receive counter at the verifier's height.
    pub fn get_rx_update(&self, src: &str, dst: &str) -> Option<EdgeState> {
        let statuses = self.statuses.get(dst)?;
        match statuses.iter().find(|(addr, _)| addr == src) {
            Some((_, status)) => Some(EdgeState::Active {
                seq: status.rx_seq,
                height: status.verifier.height,
            }),
            None => Some(EdgeState::Inactive),
        }
    }

    pub fn get_link_update(&self, src: &str, dst: &str) -> LinkUpdate {
        LinkUpdate::new(self.get_tx_update(src, dst), self.get_rx_update(src, dst))
    }
}

/// The monitored topology: one collaborator per endpoint, lazily created
/// `Link` state machines per directed connection, and the polling logic that
/// ties a round's snapshot to the stored state.
pub struct Links {
    storage: Arc<Storage>,
    factory: ProxyFactory,
    /// base configs by network id, used for discovery and naming
    configs: HashMap<String, NetworkConfig>,
    /// collaborators by endpoint address, with polling order preserved
    bmcs: HashMap<String, Box<dyn Bmc>>,
    bmc_order: Vec<String>,
    /// effective config by endpoint address (discovered ones are clones)
    networks: HashMap<String, NetworkConfig>,
    links: BTreeMap<(String, String), Link>,
}

impl Links {
    pub fn new(networks: &[NetworkConfig], storage: Arc<Storage>) -> MonitorResult<Self> {
        Self::with_factory(networks, storage, Box::new(build_proxy))
    }

    /// Construct with a custom collaborator factory; tests use this to plug
    /// in mock endpoints.
    pub fn with_factory(
        networks: &[NetworkConfig],
        storage: Arc<Storage>,
        factory: ProxyFactory,
    ) -> MonitorResult<Self> {
        let mut links = Self {
            storage,
            factory,
            configs: HashMap::new(),
            bmcs: HashMap::new(),
            bmc_order: Vec::new(),
            networks: HashMap::new(),
            links: BTreeMap::new(),
        };
        for network in networks {
            if links.configs.contains_key(&network.network) {
                return Err(MonitorError::Config(format!(
                    "duplicate network id: {}",
                    network.network
                )));
            }
            links.configs.insert(network.network.clone(), network.clone());
            let address = network.address();
            let bmc = (links.factory)(network)?;
            links.bmcs.insert(address.clone(), bmc);
            links.bmc_order.push(address.clone());
            links.networks.insert(address, network.clone());
        }
        Ok(links)
    }

    pub fn name_of(&self, address: &str) -> String {
        self.networks
            .get(address)
            .map(|n| n.display_name())
            .unwrap_or_else(|| address.to_string())
    }

    pub fn get_network(&self, address: &str) -> Option<&NetworkConfig> {
        self.networks.get(address)
    }

    /// Configured and discovered endpoint addresses, in polling order
    pub fn endpoints(&self) -> &[String] {
        &self.bmc_order
    }

    /// Resolve a network id (or full BTP address) to the first matching
    /// endpoint address.
    pub fn resolve_endpoint(&self, id: &str) -> Option<String> {
        if self.bmcs.contains_key(id) {
            return Some(id.to_string());
        }
        self.bmc_order
            .iter()
            .find(|addr| {
                addr.parse::<BtpAddress>()
                    .map(|a| a.network == id)
                    .unwrap_or(false)
            })
            .cloned()
    }

    fn tx_limit(&self, address: &str) -> Duration {
        Duration::seconds(
            self.networks
                .get(address)
                .map(|n| n.tx_limit)
                .unwrap_or(DEFAULT_LIMIT_SECS),
        )
    }

    fn rx_limit(&self, address: &str) -> Duration {
        Duration::seconds(
            self.networks
                .get(address)
                .map(|n| n.rx_limit)
                .unwrap_or(DEFAULT_LIMIT_SECS),
        )
    }

    /// Get or lazily create the Link for (src, dst). The BAD threshold is
    /// src's tx_limit plus dst's rx_limit.
    pub fn get_link(&mut self, src: &str, dst: &str) -> MonitorResult<&mut Link> {
        let key = (src.to_string(), dst.to_string());
        if !self.links.contains_key(&key) {
            let time_limit = self.tx_limit(src) + self.rx_limit(dst);
            let link = Link::new(
                self.storage.clone(),
                src,
                dst,
                time_limit,
                &self.name_of(src),
                &self.name_of(dst),
            )?;
            debug!("tracking link {} -> {}", src, dst);
            self.links.insert(key.clone(), link);
        }
        self.links
            .get_mut(&key)
            .ok_or_else(|| MonitorError::Config(format!("missing link {} -> {}", src, dst)))
    }

    pub fn find_link(&self, src: &str, dst: &str) -> Option<&Link> {
        self.links.get(&(src.to_string(), dst.to_string()))
    }

    /// Directed connections whose routing is established on both sides
    pub fn get_connected_links(&self) -> Vec<(String, String)> {
        self.links
            .iter()
            .filter(|(_, link)| link.state() != LinkState::Broken)
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn state_counts(&self) -> HashMap<LinkState, usize> {
        let mut counts = HashMap::new();
        for link in self.links.values() {
            *counts.entry(link.state()).or_insert(0) += 1;
        }
        counts
    }

    /// Register a newly discovered endpoint address. Returns false when the
    /// address does not parse or its network id is not configured.
    fn add_proxy(&mut self, address: &str) -> MonitorResult<bool> {
        let parsed: BtpAddress = match address.parse() {
            Ok(parsed) => parsed,
            Err(_) => return Ok(false),
        };
        let Some(base) = self.configs.get(&parsed.network) else {
            return Ok(false);
        };
        let mut network = base.clone();
        let prefix: String = parsed.contract.chars().take(6).collect();
        network.name = Some(format!("{}({})", base.display_name(), prefix));
        network.bmc = parsed.contract.clone();
        let bmc = (self.factory)(&network)?;
        info!("discovered endpoint {} ({})", address, network.display_name());
        self.bmcs.insert(address.to_string(), bmc);
        self.bmc_order.push(address.to_string());
        self.networks.insert(address.to_string(), network);
        Ok(true)
    }

    /// Poll every endpoint for its links and per-link status. Link addresses
    /// on a configured network that are not yet tracked become discovered
    /// endpoints and are polled in the same round. With strict=true any
    /// collaborator failure aborts the round; otherwise the endpoint is
    /// skipped and the affected links simply see no update.
    pub async fn query_status(&mut self, strict: bool) -> MonitorResult<NetworkStatus> {
        let mut status = NetworkStatus::default();
        let mut worklist: VecDeque<String> = self.bmc_order.iter().cloned().collect();

        while let Some(address) = worklist.pop_front() {
            let polled = match self.bmcs.get(&address) {
                Some(bmc) => poll_endpoint(bmc.as_ref()).await,
                None => continue,
            };
            match polled {
                Ok(link_statuses) => {
                    for (link, _) in &link_statuses {
                        if self.bmcs.contains_key(link) {
                            continue;
                        }
                        match self.add_proxy(link) {
                            Ok(true) => worklist.push_back(link.clone()),
                            Ok(false) => {}
                            Err(e) if strict => return Err(e),
                            Err(e) => warn!("cannot track discovered endpoint {}: {}", link, e),
                        }
                    }
                    status.set_link_statuses(&address, link_statuses);
                }
                Err(e) if strict => return Err(e.into()),
                Err(e) => {
                    warn!("skipping endpoint {} this round: {}", address, e);
                    status.skipped.push(address);
                }
            }
        }
        Ok(status)
    }

    /// Feed one round's snapshot to every tracked link, inside a single
    /// transaction. Links already known keep getting updates even when the
    /// snapshot no longer mentions them (their endpoint was skipped).
    pub fn apply_status(
        &mut self,
        status: &NetworkStatus,
        now: DateTime<Utc>,
    ) -> MonitorResult<(bool, Vec<LinkEvent>)> {
        let mut keys: Vec<(String, String)> = self.links.keys().cloned().collect();
        for key in status.get_known_links() {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }

        let storage = self.storage.clone();
        storage.do_batch(|| {
            let mut any_change = false;
            let mut all_events = Vec::new();
            for (src, dst) in &keys {
                let update = status.get_link_update(src, dst);
                let link = self.get_link(src, dst)?;
                let (changed, events) = link.handle_update(&update, now)?;
                any_change |= changed;
                all_events.extend(events);
            }
            Ok((any_change, all_events))
        })
    }

    /// One full polling round: query then apply
    pub async fn update(&mut self, strict: bool) -> MonitorResult<(bool, Vec<LinkEvent>)> {
        let status = self.query_status(strict).await?;
        self.apply_status(&status, Utc::now())
    }

    /// Relay fee table for one endpoint: fees toward every network reachable
    /// through its routes and links.
    pub async fn get_relay_fee_table(&self, id: &str) -> MonitorResult<FeeTable> {
        let address = self
            .resolve_endpoint(id)
            .ok_or_else(|| MonitorError::UnknownNetwork(id.to_string()))?;
        let bmc = self
            .bmcs
            .get(&address)
            .ok_or_else(|| MonitorError::UnknownNetwork(id.to_string()))?;
        let network = self
            .networks
            .get(&address)
            .ok_or_else(|| MonitorError::UnknownNetwork(id.to_string()))?;

        let mut destinations: BTreeSet<String> = bmc.get_routes().await?.into_keys().collect();
        for link in bmc.get_links().await? {
            if let Ok(parsed) = link.parse::<BtpAddress>() {
                destinations.insert(parsed.network);
            }
        }

        let mut table = Vec::with_capacity(destinations.len());
        for dst in destinations {
            let one_way = bmc.get_fee(&dst, false).await?;
            let round_trip = bmc.get_fee(&dst, true).await?;
            let name = self
                .configs
                .get(&dst)
                .map(|n| n.display_name())
                .unwrap_or_else(|| dst.clone());
            table.push(FeeEntry {
                id: dst,
                name,
                fees: [one_way.to_string(), round_trip.to_string()],
            });
        }
        Ok(FeeTable {
            decimal: network.decimal,
            symbol: network.symbol(),
            table,
        })
    }
}

async fn poll_endpoint(bmc: &dyn Bmc) -> Result<Vec<(String, LinkStatus)>, BmcError> {
    let links = bmc.get_links().await?;
    let mut statuses = Vec::with_capacity(links.len());
    for link in links {
        let status = bmc.get_status(&link).await?;
        statuses.push((link, status));
    }
    Ok(statuses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::VerifierStatus;

    fn status(tx_seq: u64, rx_seq: u64) -> LinkStatus {
        LinkStatus {
            rx_seq,
            tx_seq,
            verifier: VerifierStatus { height: 50, extra: None },
            current_height: 100,
        }
    }

    #[test]
    fn test_network_status_updates() {
        let mut snapshot = NetworkStatus::default();
        snapshot.set_link_statuses("a", vec![("b".to_string(), status(7, 2))]);
        snapshot.set_link_statuses("b", vec![("a".to_string(), status(3, 5))]);

        // tx for a->b comes from a's entry, rx from b's entry for a
        assert_eq!(
            snapshot.get_tx_update("a", "b"),
            Some(EdgeState::Active { seq: 7, height: 100 })
        );
        assert_eq!(
            snapshot.get_rx_update("a", "b"),
            Some(EdgeState::Active { seq: 5, height: 50 })
        );

        // endpoint not polled at all
        assert_eq!(snapshot.get_tx_update("c", "a"), None);
        // polled but no entry for that peer: routing withdrawn
        snapshot.set_link_statuses("c", vec![]);
        assert_eq!(snapshot.get_tx_update("c", "a"), Some(EdgeState::Inactive));
        assert_eq!(snapshot.get_rx_update("a", "c"), Some(EdgeState::Inactive));

        assert_eq!(
            snapshot.get_known_links(),
            vec![("a".to_string(), "b".to_string()), ("b".to_string(), "a".to_string())]
        );
    }

    #[test]
    fn test_known_links_preserve_order() {
        let mut snapshot = NetworkStatus::default();
        snapshot.set_link_statuses("z", vec![("a".to_string(), status(1, 1))]);
        snapshot.set_link_statuses("a", vec![("z".to_string(), status(1, 1))]);
        let links = snapshot.get_known_links();
        assert_eq!(links[0].0, "z");
        assert_eq!(links[1].0, "a");
    }
}
