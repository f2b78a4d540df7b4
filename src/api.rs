use crate::config::ApiConfig;
use crate::links::Links;
use crate::storage::{LogFilter, Storage};
use crate::types::{merge_status, BtpAddress};
use log::{error, info};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Read-only JSON API over the monitor's state: connected links, per-link
/// detail, network configs, fee tables and the event log.
pub struct StatusApi {
    storage: Arc<Storage>,
    links: Arc<RwLock<Links>>,
    version: String,
}

impl StatusApi {
    pub fn new(storage: Arc<Storage>, links: Arc<RwLock<Links>>, version: &str) -> Self {
        Self { storage, links, version: version.to_string() }
    }

    /// Start serving; requests are answered on a spawned accept loop
    pub async fn start(self: Arc<Self>, config: ApiConfig) -> ApiResult<()> {
        if !config.enabled {
            info!("Status API is disabled");
            return Ok(());
        }

        info!("Starting status API on {}", config.address);
        let listener = TcpListener::bind(&config.address).await?;

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((mut stream, _addr)) => {
                        let api = self.clone();
                        tokio::spawn(async move {
                            let mut buffer = [0u8; 4096];
                            let request = match stream.read(&mut buffer).await {
                                Ok(n) => String::from_utf8_lossy(&buffer[..n]).to_string(),
                                Err(e) => {
                                    error!("Failed to read API request: {}", e);
                                    return;
                                }
                            };
                            let (status, body) = api.dispatch(&request).await;
                            let body_text = body.to_string();
                            let response = format!(
                                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nAccess-Control-Allow-Origin: *\r\nContent-Length: {}\r\n\r\n{}",
                                status_line(status),
                                body_text.len(),
                                body_text
                            );
                            if let Err(e) = stream.write_all(response.as_bytes()).await {
                                error!("Failed to write API response: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept API connection: {}", e);
                    }
                }
            }
        });

        Ok(())
    }

    async fn dispatch(&self, request: &str) -> (u16, Value) {
        let Some(first_line) = request.lines().next() else {
            return (400, json!({ "error": "empty request" }));
        };
        let mut parts = first_line.split_whitespace();
        let method = parts.next().unwrap_or("");
        let target = parts.next().unwrap_or("");
        if method != "GET" {
            return (405, json!({ "error": "method not allowed" }));
        }
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, query),
            None => (target, ""),
        };
        self.handle(path, query).await
    }

    async fn handle(&self, path: &str, query: &str) -> (u16, Value) {
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        match segments.as_slice() {
            ["version"] => (200, json!(self.version)),
            ["links"] => self.handle_links().await,
            ["links", src, dst] => self.handle_link_info(src, dst).await,
            ["networks", id] => self.handle_network(id).await,
            ["networks", id, "feetable"] => self.handle_fee_table(id).await,
            ["events"] => self.handle_events(query).await,
            _ => (404, json!({ "error": "not found" })),
        }
    }

    /// Connected links, one entry per unordered pair, as network ids
    async fn handle_links(&self) -> (u16, Value) {
        let links = self.links.read().await;
        let connected: HashMap<(String, String), ()> =
            links.get_connected_links().into_iter().map(|key| (key, ())).collect();
        let mut pairs: Vec<(String, String)> = merge_status(connected).into_keys().collect();
        pairs.sort();
        let out = pairs
            .into_iter()
            .map(|(src, dst)| {
                json!({
                    "src": network_id(&src),
                    "dst": network_id(&dst),
                })
            })
            .collect();
        (200, Value::Array(out))
    }

    async fn handle_link_info(&self, src: &str, dst: &str) -> (u16, Value) {
        let links = self.links.read().await;
        let (Some(src_addr), Some(dst_addr)) = (links.resolve_endpoint(src), links.resolve_endpoint(dst)) else {
            return (404, json!({ "error": "unknown network" }));
        };
        match links.find_link(&src_addr, &dst_addr) {
            Some(link) => (
                200,
                json!({
                    "src": network_id(&src_addr),
                    "dst": network_id(&dst_addr),
                    "src_name": link.src_name(),
                    "dst_name": link.dst_name(),
                    "state": link.state().as_str(),
                    "tx_seq": link.tx_seq(),
                    "rx_seq": link.rx_seq(),
                    "tx_height": link.tx_height(),
                    "rx_height": link.rx_height(),
                    "pending_count": link.pending_count(),
                    "pending_delay": link.pending_duration().num_milliseconds() as f64 / 1000.0,
                }),
            ),
            None => (404, json!({ "error": "unknown link" })),
        }
    }

    async fn handle_network(&self, id: &str) -> (u16, Value) {
        let links = self.links.read().await;
        let network = links
            .resolve_endpoint(id)
            .and_then(|addr| links.get_network(&addr).cloned());
        match network {
            Some(network) => match serde_json::to_value(&network) {
                Ok(value) => (200, value),
                Err(e) => (500, json!({ "error": e.to_string() })),
            },
            None => (404, json!({ "error": "unknown network" })),
        }
    }

    async fn handle_fee_table(&self, id: &str) -> (u16, Value) {
        let links = self.links.read().await;
        match links.get_relay_fee_table(id).await {
            Ok(table) => match serde_json::to_value(&table) {
                Ok(value) => (200, value),
                Err(e) => (500, json!({ "error": e.to_string() })),
            },
            Err(crate::links::MonitorError::UnknownNetwork(id)) => {
                (404, json!({ "error": format!("unknown network: {}", id) }))
            }
            Err(e) => (500, json!({ "error": e.to_string() })),
        }
    }

    async fn handle_events(&self, query: &str) -> (u16, Value) {
        let params = parse_query(query);
        let parse_sn = |key: &str| params.get(key).and_then(|v| v.parse::<i64>().ok());
        let filter = LogFilter {
            src: params.get("src").cloned(),
            dst: params.get("dst").cloned(),
            event: params.get("event").cloned(),
            limit: params.get("limit").and_then(|v| v.parse().ok()),
            after: parse_sn("after"),
            before: parse_sn("before"),
        };
        let logs = match self.storage.get_logs(&filter) {
            Ok(logs) => logs,
            Err(e) => return (500, json!({ "error": e.to_string() })),
        };

        let links = self.links.read().await;
        let out: Vec<Value> = logs
            .into_iter()
            .map(|log| {
                let mut value = json!({
                    "sn": log.sn,
                    "ts": log.ts,
                    "src": log.src,
                    "dst": log.dst,
                    "event": log.event,
                    "extra": log.extra,
                });
                if !log.src.is_empty() {
                    value["src_name"] = json!(links.name_of(&log.src));
                }
                if !log.dst.is_empty() {
                    value["dst_name"] = json!(links.name_of(&log.dst));
                }
                value
            })
            .collect();
        (200, Value::Array(out))
    }
}

/// Shorten a BTP address to its network id for API payloads
fn network_id(address: &str) -> String {
    address
        .parse::<BtpAddress>()
        .map(|a| a.network)
        .unwrap_or_else(|_| address.to_string())
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

fn status_line(status: u16) -> &'static str {
    match status {
        200 => "200 OK",
        400 => "400 Bad Request",
        404 => "404 Not Found",
        405 => "405 Method Not Allowed",
        _ => "500 Internal Server Error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_api() -> StatusApi {
        let storage = Arc::new(Storage::in_memory().unwrap());
        let links = Links::new(&[], storage.clone()).unwrap();
        StatusApi::new(storage, Arc::new(RwLock::new(links)), "test")
    }

    #[tokio::test]
    async fn test_version_and_unknown_routes() {
        let api = test_api();
        let (status, body) = api.dispatch("GET /version HTTP/1.1\r\n\r\n").await;
        assert_eq!(status, 200);
        assert_eq!(body, json!("test"));

        let (status, _) = api.dispatch("GET /nope HTTP/1.1\r\n\r\n").await;
        assert_eq!(status, 404);

        let (status, _) = api.dispatch("POST /version HTTP/1.1\r\n\r\n").await;
        assert_eq!(status, 405);
    }

    #[tokio::test]
    async fn test_links_endpoint_pairs_once() {
        let api = test_api();
        {
            let mut links = api.links.write().await;
            let icon = "btp://0x1.icon/cx1";
            let bsc = "btp://0x2.bsc/0xb1";
            links.get_link(icon, bsc).unwrap();
            links.get_link(bsc, icon).unwrap();
        }

        let (status, body) = api.dispatch("GET /links HTTP/1.1\r\n\r\n").await;
        assert_eq!(status, 200);
        // both directions collapse into one entry
        assert_eq!(body, json!([{ "src": "0x1.icon", "dst": "0x2.bsc" }]));
    }

    #[tokio::test]
    async fn test_events_endpoint_with_query() {
        let api = test_api();
        api.storage
            .write_log(chrono::Utc::now(), "", "", "log", &json!("START test"))
            .unwrap();
        api.storage
            .write_log(
                chrono::Utc::now(),
                "btp://0x7.icon/cx1",
                "btp://0x8.bsc/0x2",
                "tx",
                &json!({ "count": 1 }),
            )
            .unwrap();

        let (status, body) = api.dispatch("GET /events HTTP/1.1\r\n\r\n").await;
        assert_eq!(status, 200);
        assert_eq!(body.as_array().unwrap().len(), 2);

        let (status, body) = api.dispatch("GET /events?event=tx HTTP/1.1\r\n\r\n").await;
        assert_eq!(status, 200);
        let events = body.as_array().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["extra"], json!({ "count": 1 }));
        // addresses not tracked by any config fall back verbatim
        assert_eq!(events[0]["src_name"], json!("btp://0x7.icon/cx1"));
    }

    #[test]
    fn test_parse_query() {
        let params = parse_query("limit=10&after=5&=bad&flag");
        assert_eq!(params.get("limit").map(String::as_str), Some("10"));
        assert_eq!(params.get("after").map(String::as_str), Some("5"));
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_network_id_shortening() {
        assert_eq!(network_id("btp://0x7.icon/cx1234"), "0x7.icon");
        assert_eq!(network_id("not-an-address"), "not-an-address");
    }
}
