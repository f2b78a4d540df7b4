use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("Invalid BTP address: {0}")]
    InvalidAddress(String),
}

/// Overall health classification of one directed connection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    /// One or both sides never observed
    Unknown,
    /// Routing withdrawn on at least one side
    Broken,
    /// Oldest pending message older than the connection's time limit
    Bad,
    /// Both sides active, pending age within limit
    Good,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Unknown => "unknown",
            LinkState::Broken => "broken",
            LinkState::Bad => "bad",
            LinkState::Good => "good",
        }
    }

    pub const ALL: [LinkState; 4] = [LinkState::Unknown, LinkState::Broken, LinkState::Bad, LinkState::Good];
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinkState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(LinkState::Unknown),
            "broken" => Ok(LinkState::Broken),
            "bad" => Ok(LinkState::Bad),
            "good" => Ok(LinkState::Good),
            other => Err(format!("unknown link state: {}", other)),
        }
    }
}

/// One observed side of a directed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeState {
    /// The endpoint reports this link with a sequence number and block height
    Active { seq: u64, height: u64 },
    /// The endpoint no longer reports this link (routing withdrawn)
    Inactive,
}

impl EdgeState {
    pub fn tag(&self) -> &'static str {
        match self {
            EdgeState::Active { .. } => "active",
            EdgeState::Inactive => "inactive",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, EdgeState::Active { .. })
    }

    pub fn seq(&self) -> Option<u64> {
        match self {
            EdgeState::Active { seq, .. } => Some(*seq),
            EdgeState::Inactive => None,
        }
    }

    pub fn height(&self) -> Option<u64> {
        match self {
            EdgeState::Active { height, .. } => Some(*height),
            EdgeState::Inactive => None,
        }
    }
}

/// Paired observation of one directed connection in one polling round.
///
/// Either side is `None` when the owning endpoint could not be reached this
/// round; the link falls back to its last known state for that side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkUpdate {
    pub tx: Option<EdgeState>,
    pub rx: Option<EdgeState>,
}

impl LinkUpdate {
    pub fn new(tx: Option<EdgeState>, rx: Option<EdgeState>) -> Self {
        Self { tx, rx }
    }
}

/// Display identity of the link an event belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRef {
    pub src: String,
    pub dst: String,
    pub src_name: String,
    pub dst_name: String,
}

impl fmt::Display for LinkRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src_name, self.dst_name)
    }
}

/// A notable change observed on one link during a polling round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// New messages sent: tx_seq advanced past `seq` by `count`
    Tx { link: LinkRef, seq: u64, count: u64 },
    /// Messages acknowledged: rx_seq advanced past `seq` by `count`,
    /// `delay` is the age of the pending record that covered them
    Rx { link: LinkRef, seq: u64, count: u64, delay: Duration },
    /// Overall classification changed
    State { link: LinkRef, before: LinkState, after: LinkState },
}

impl LinkEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            LinkEvent::Tx { .. } => "tx",
            LinkEvent::Rx { .. } => "rx",
            LinkEvent::State { .. } => "state",
        }
    }

    pub fn link(&self) -> &LinkRef {
        match self {
            LinkEvent::Tx { link, .. } => link,
            LinkEvent::Rx { link, .. } => link,
            LinkEvent::State { link, .. } => link,
        }
    }

    /// JSON payload written to the event log
    pub fn extra(&self) -> serde_json::Value {
        match self {
            LinkEvent::Tx { count, .. } => serde_json::json!({ "count": count }),
            LinkEvent::Rx { count, delay, .. } => serde_json::json!({
                "count": count,
                "delta": delay.num_milliseconds() as f64 / 1000.0,
            }),
            LinkEvent::State { before, after, .. } => serde_json::json!({
                "before": before.as_str(),
                "after": after.as_str(),
            }),
        }
    }
}

impl fmt::Display for LinkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkEvent::Tx { link, count, .. } => {
                write!(f, "{} : TX count={}", link, count)
            }
            LinkEvent::Rx { link, count, delay, .. } => {
                write!(f, "{} : RX count={} delay={}", link, count, format_delta(*delay))
            }
            LinkEvent::State { link, after, .. } => {
                write!(f, "{} : {}", link, after.as_str().to_uppercase())
            }
        }
    }
}

/// Verifier portion of a raw BMC link status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifierStatus {
    pub height: u64,
    /// Chain-specific opaque payload, kept as received
    pub extra: Option<String>,
}

/// Raw per-link status reported by one endpoint's BMC contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStatus {
    pub rx_seq: u64,
    pub tx_seq: u64,
    pub verifier: VerifierStatus,
    pub current_height: u64,
}

/// A BTP endpoint address of the form `btp://<network>/<contract>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BtpAddress {
    pub network: String,
    pub contract: String,
}

impl BtpAddress {
    pub fn new(network: &str, contract: &str) -> Self {
        Self { network: network.to_string(), contract: contract.to_string() }
    }
}

impl fmt::Display for BtpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "btp://{}/{}", self.network, self.contract)
    }
}

impl FromStr for BtpAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("btp://")
            .ok_or_else(|| AddressError::InvalidAddress(s.to_string()))?;
        let (network, contract) = rest
            .split_once('/')
            .ok_or_else(|| AddressError::InvalidAddress(s.to_string()))?;
        if network.is_empty() || contract.is_empty() {
            return Err(AddressError::InvalidAddress(s.to_string()));
        }
        Ok(Self { network: network.to_string(), contract: contract.to_string() })
    }
}

/// Relay fee table for one network, built from the BMC's routes and fees
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeTable {
    pub decimal: u32,
    pub symbol: String,
    pub table: Vec<FeeEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeEntry {
    pub id: String,
    pub name: String,
    /// [one-way fee, round-trip fee], stringified to survive JSON precision
    pub fees: [String; 2],
}

/// Pair up both directions of every connection keyed by the unordered pair
pub fn merge_status<T>(status: HashMap<(String, String), T>) -> HashMap<(String, String), [Option<T>; 2]> {
    let mut merged: HashMap<(String, String), [Option<T>; 2]> = HashMap::new();
    for ((src, dst), value) in status {
        let reverse = src > dst;
        let key = if reverse { (dst, src) } else { (src, dst) };
        let slot = merged.entry(key).or_insert([None, None]);
        slot[reverse as usize] = Some(value);
    }
    merged
}

/// Render a duration as a compact `1d2h3m4s` form
pub fn format_delta(d: Duration) -> String {
    let total = d.num_milliseconds();
    if total < 0 {
        return format!("-{}", format_delta(-d));
    }
    if total < 1000 {
        return format!("{}s", total as f64 / 1000.0);
    }
    let mut remainder = total / 1000;
    let mut items: Vec<String> = Vec::new();
    for (suffix, modulo) in [("s", 60), ("m", 60), ("h", 24), ("d", 0)] {
        let value = if modulo != 0 {
            let v = remainder % modulo;
            remainder /= modulo;
            v
        } else {
            remainder
        };
        if value > 0 {
            items.insert(0, format!("{}{}", value, suffix));
        }
        if remainder == 0 {
            break;
        }
    }
    items.join("")
}
