use crate::config::NetworkConfig;
use crate::types::{LinkStatus, VerifierStatus};
use async_trait::async_trait;
use log::debug;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BmcError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Invalid status payload: {0}")]
    InvalidStatus(String),

    #[error("Unsupported network type: {0}")]
    UnsupportedNetwork(String),
}

pub type BmcResult<T> = Result<T, BmcError>;

/// Read-only view of one endpoint's BTP Message Center contract
#[async_trait]
pub trait Bmc: Send + Sync + std::fmt::Debug {
    /// Full BTP address of this endpoint, `btp://<network>/<contract>`
    fn address(&self) -> &str;

    /// BTP addresses of the peers this BMC currently routes to
    async fn get_links(&self) -> BmcResult<Vec<String>>;

    /// Per-link sequence counters and verifier state
    async fn get_status(&self, link: &str) -> BmcResult<LinkStatus>;

    /// Reachable network id -> next-hop BTP address
    async fn get_routes(&self) -> BmcResult<HashMap<String, String>>;

    /// Relay fee toward a network, one-way or round-trip
    async fn get_fee(&self, dst: &str, response: bool) -> BmcResult<u128>;
}

/// Builds the collaborator for a network config; the indirection lets tests
/// substitute mock endpoints.
pub type ProxyFactory = Box<dyn Fn(&NetworkConfig) -> BmcResult<Box<dyn Bmc>> + Send + Sync>;

pub fn build_proxy(config: &NetworkConfig) -> BmcResult<Box<dyn Bmc>> {
    match config.kind.as_str() {
        "icon" => Ok(Box::new(IconBmc::new(config)?)),
        other => Err(BmcError::UnsupportedNetwork(other.to_string())),
    }
}

const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// BMC client over ICON JSON-RPC: every read goes through `icx_call` against
/// the contract.
#[derive(Debug)]
pub struct IconBmc {
    client: reqwest::Client,
    endpoint: String,
    bmc: String,
    address: String,
}

impl IconBmc {
    pub fn new(config: &NetworkConfig) -> BmcResult<Self> {
        let client = reqwest::Client::builder().timeout(RPC_TIMEOUT).build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            bmc: config.bmc.clone(),
            address: config.address(),
        })
    }

    async fn call(&self, method: &str, params: Option<Value>) -> BmcResult<Value> {
        let mut data = json!({ "method": method });
        if let Some(params) = params {
            data["params"] = params;
        }
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "icx_call",
            "params": {
                "to": self.bmc,
                "dataType": "call",
                "data": data,
            },
        });
        debug!("icx_call {} on {}", method, self.bmc);
        let response: Value = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;
        if let Some(error) = response.get("error") {
            return Err(BmcError::Rpc(error.to_string()));
        }
        response
            .get("result")
            .cloned()
            .ok_or_else(|| BmcError::Rpc("response carries no result".to_string()))
    }
}

#[async_trait]
impl Bmc for IconBmc {
    fn address(&self) -> &str {
        &self.address
    }

    async fn get_links(&self) -> BmcResult<Vec<String>> {
        let result = self.call("getLinks", None).await?;
        let entries = result
            .as_array()
            .ok_or_else(|| BmcError::InvalidStatus(format!("getLinks: expected array, got {}", result)))?;
        entries
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| BmcError::InvalidStatus(format!("getLinks: non-string entry {}", v)))
            })
            .collect()
    }

    async fn get_status(&self, link: &str) -> BmcResult<LinkStatus> {
        let result = self.call("getStatus", Some(json!({ "_link": link }))).await?;
        parse_link_status(&result)
    }

    async fn get_routes(&self) -> BmcResult<HashMap<String, String>> {
        let result = self.call("getRoutes", None).await?;
        let entries = result
            .as_object()
            .ok_or_else(|| BmcError::InvalidStatus(format!("getRoutes: expected object, got {}", result)))?;
        entries
            .iter()
            .map(|(network, next)| {
                next.as_str()
                    .map(|n| (network.clone(), n.to_string()))
                    .ok_or_else(|| BmcError::InvalidStatus(format!("getRoutes: non-string route {}", next)))
            })
            .collect()
    }

    async fn get_fee(&self, dst: &str, response: bool) -> BmcResult<u128> {
        let result = self
            .call("getFee", Some(json!({ "_to": dst, "_response": response })))
            .await?;
        parse_u128(&result)
    }
}

/// Parse a `getStatus` payload: integers arrive as 0x-prefixed hex strings
pub fn parse_link_status(value: &Value) -> BmcResult<LinkStatus> {
    let verifier = value
        .get("verifier")
        .ok_or_else(|| invalid(value, "verifier"))?;
    Ok(LinkStatus {
        rx_seq: parse_uint(value, "rx_seq")?,
        tx_seq: parse_uint(value, "tx_seq")?,
        verifier: VerifierStatus {
            height: parse_uint(verifier, "height")?,
            extra: verifier
                .get("extra")
                .and_then(Value::as_str)
                .map(str::to_string),
        },
        current_height: parse_uint(value, "cur_height")?,
    })
}

fn invalid(value: &Value, field: &str) -> BmcError {
    BmcError::InvalidStatus(format!("missing or malformed `{}` in {}", field, value))
}

fn parse_uint(value: &Value, field: &str) -> BmcResult<u64> {
    let field_value = value.get(field).ok_or_else(|| invalid(value, field))?;
    match field_value {
        Value::String(s) => {
            let parsed = match s.strip_prefix("0x") {
                Some(hex) => u64::from_str_radix(hex, 16),
                None => s.parse(),
            };
            parsed.map_err(|_| invalid(value, field))
        }
        Value::Number(n) => n.as_u64().ok_or_else(|| invalid(value, field)),
        _ => Err(invalid(value, field)),
    }
}

fn parse_u128(value: &Value) -> BmcResult<u128> {
    match value {
        Value::String(s) => {
            let parsed = match s.strip_prefix("0x") {
                Some(hex) => u128::from_str_radix(hex, 16),
                None => s.parse(),
            };
            parsed.map_err(|_| BmcError::InvalidStatus(format!("not an integer: {}", value)))
        }
        Value::Number(n) => n
            .as_u64()
            .map(u128::from)
            .ok_or_else(|| BmcError::InvalidStatus(format!("not an integer: {}", value))),
        _ => Err(BmcError::InvalidStatus(format!("not an integer: {}", value))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;

    #[test]
    fn test_parse_link_status_hex() {
        let payload = json!({
            "rx_seq": "0x1a",
            "tx_seq": "0x20",
            "verifier": { "height": "0x64", "extra": "0xdead" },
            "cur_height": "0xc8",
        });
        let status = parse_link_status(&payload).unwrap();
        assert_eq!(status.rx_seq, 26);
        assert_eq!(status.tx_seq, 32);
        assert_eq!(status.verifier.height, 100);
        assert_eq!(status.verifier.extra.as_deref(), Some("0xdead"));
        assert_eq!(status.current_height, 200);
    }

    #[test]
    fn test_parse_link_status_decimal_and_numbers() {
        let payload = json!({
            "rx_seq": "26",
            "tx_seq": 32,
            "verifier": { "height": 100, "extra": null },
            "cur_height": "200",
        });
        let status = parse_link_status(&payload).unwrap();
        assert_eq!(status.rx_seq, 26);
        assert_eq!(status.tx_seq, 32);
        assert_eq!(status.verifier.extra, None);
    }

    #[test]
    fn test_parse_link_status_rejects_malformed() {
        assert!(parse_link_status(&json!({})).is_err());
        assert!(parse_link_status(&json!({
            "rx_seq": "zz",
            "tx_seq": "0x1",
            "verifier": { "height": "0x1", "extra": null },
            "cur_height": "0x1",
        }))
        .is_err());
        assert!(parse_link_status(&json!({
            "rx_seq": "0x1",
            "tx_seq": "0x1",
            "cur_height": "0x1",
        }))
        .is_err());
    }

    #[test]
    fn test_parse_u128_fee() {
        assert_eq!(parse_u128(&json!("0xde0b6b3a7640000")).unwrap(), 1_000_000_000_000_000_000);
        assert_eq!(parse_u128(&json!("42")).unwrap(), 42);
        assert!(parse_u128(&json!({})).is_err());
    }

    #[test]
    fn test_factory_rejects_unsupported_kind() {
        let mut config = NetworkConfig::example();
        config.kind = "eth".to_string();
        let err = build_proxy(&config).unwrap_err();
        assert!(matches!(err, BmcError::UnsupportedNetwork(kind) if kind == "eth"));
    }

    #[test]
    fn test_icon_bmc_address() {
        let config = NetworkConfig::example();
        let bmc = IconBmc::new(&config).unwrap();
        assert_eq!(bmc.address(), config.address());
    }
}
