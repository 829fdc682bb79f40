/// Coin daemon RPC client
///
/// `CoinDaemon` is the seam the template updater, share processor and
/// stratum handler talk through; `HttpCoinDaemon` is the bitcoind-style
/// JSON-RPC implementation over a single long-lived hyper client.
///
/// Transport failures rebuild the client once and surface the error; the
/// failed call is not retried, the next poll tick does that naturally.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::{Method, Request};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::template::TemplateResponse;
use crate::config::DaemonConfig;
use crate::metrics::prometheus as metrics;

pub const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RpcError {
    /// The daemon does not implement the method; the caller skips the feature.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("daemon error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("invalid response: {0}")]
    Decode(String),
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockSubsidy {
    pub miner: f64,
    #[serde(default)]
    pub founders: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MiningInfo {
    pub blocks: u64,
    #[serde(default)]
    pub difficulty: Option<Value>,
    #[serde(default)]
    pub powdifficulty: Option<f64>,
    #[serde(default)]
    pub networkhashps: Option<f64>,
    #[serde(default)]
    pub hashespersec: Option<f64>,
}

impl MiningInfo {
    /// `powdifficulty` when present, else a numeric `difficulty`.
    pub fn network_difficulty(&self) -> Option<f64> {
        self.powdifficulty
            .or_else(|| self.difficulty.as_ref().and_then(Value::as_f64))
    }

    pub fn network_hashrate(&self) -> Option<f64> {
        self.networkhashps.or(self.hashespersec)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockStatus {
    pub confirmations: i64,
    #[serde(default)]
    pub hash: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TransactionStatus {
    pub txid: String,
    pub confirmations: i64,
    pub block_hash: Option<String>,
    pub fee: Decimal,
}

#[derive(Debug, Clone, Default)]
pub struct TotalBalance {
    pub transparent: Decimal,
    pub private: Decimal,
    pub total: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShieldResult {
    pub opid: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperationStatus {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl OperationStatus {
    pub fn txid(&self) -> Option<String> {
        self.result
            .as_ref()
            .and_then(|r| r.get("txid"))
            .and_then(Value::as_str)
            .map(String::from)
    }

    pub fn error_message(&self) -> Option<String> {
        self.error
            .as_ref()
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .map(String::from)
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, RpcError> {
    serde_json::from_value(value).map_err(|e| RpcError::Decode(e.to_string()))
}

/// Daemon amounts arrive as JSON floats; keep 8 decimal places.
pub fn decimal_of(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => n.as_f64().and_then(Decimal::from_f64).map(|d| d.round_dp(8)),
        Value::String(s) => s.parse::<Decimal>().ok(),
        _ => None,
    }
}

/// Amounts go out as JSON numbers, the way daemons expect them.
fn amount_json(amount: &Decimal) -> Value {
    json!(amount.round_dp(8).to_f64().unwrap_or(0.0))
}

#[async_trait]
pub trait CoinDaemon: Send + Sync {
    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError>;

    async fn get_block_template(&self) -> Result<TemplateResponse, RpcError> {
        decode(self.call("getblocktemplate", json!([])).await?)
    }

    async fn get_block_subsidy(&self) -> Result<BlockSubsidy, RpcError> {
        decode(self.call("getblocksubsidy", json!([])).await?)
    }

    async fn get_mining_info(&self) -> Result<MiningInfo, RpcError> {
        decode(self.call("getmininginfo", json!([])).await?)
    }

    /// Raw `submitblock` result; `null` means the block was accepted.
    async fn submit_block(&self, block_hex: &str) -> Result<Value, RpcError> {
        self.call("submitblock", json!([block_hex])).await
    }

    async fn get_block(&self, hash: &str) -> Result<BlockStatus, RpcError> {
        decode(self.call("getblock", json!([hash])).await?)
    }

    async fn get_block_hash(&self, height: u64) -> Result<String, RpcError> {
        decode(self.call("getblockhash", json!([height])).await?)
    }

    async fn validate_address(&self, address: &str) -> Result<Value, RpcError> {
        self.call("validateaddress", json!([address])).await
    }

    /// Pay several addresses in one transaction. Returns the txid.
    async fn send_many(&self, amounts: &BTreeMap<String, Decimal>) -> Result<String, RpcError> {
        let to: serde_json::Map<String, Value> = amounts
            .iter()
            .map(|(addr, amount)| (addr.clone(), amount_json(amount)))
            .collect();
        decode(self.call("sendmany", json!(["", to])).await?)
    }

    async fn get_transaction(&self, txid: &str) -> Result<TransactionStatus, RpcError> {
        let v = self.call("gettransaction", json!([txid])).await?;
        Ok(TransactionStatus {
            txid: v
                .get("txid")
                .and_then(Value::as_str)
                .unwrap_or(txid)
                .to_string(),
            confirmations: v.get("confirmations").and_then(Value::as_i64).unwrap_or(0),
            block_hash: v.get("blockhash").and_then(Value::as_str).map(String::from),
            fee: v.get("fee").and_then(decimal_of).unwrap_or_default(),
        })
    }

    async fn get_total_balance(&self) -> Result<TotalBalance, RpcError> {
        let v = self.call("z_gettotalbalance", json!([])).await?;
        let field = |k: &str| v.get(k).and_then(decimal_of).unwrap_or_default();
        Ok(TotalBalance {
            transparent: field("transparent"),
            private: field("private"),
            total: field("total"),
        })
    }

    async fn z_shield_coinbase(&self, to_address: &str) -> Result<ShieldResult, RpcError> {
        decode(self.call("z_shieldcoinbase", json!(["*", to_address])).await?)
    }

    async fn z_get_operation_status(&self, ids: &[String]) -> Result<Vec<OperationStatus>, RpcError> {
        decode(self.call("z_getoperationstatus", json!([ids])).await?)
    }

    /// Returns the operation id.
    async fn z_send_many(&self, from: &str, to: &[(String, Decimal)]) -> Result<String, RpcError> {
        let outputs: Vec<Value> = to
            .iter()
            .map(|(address, amount)| json!({ "address": address, "amount": amount_json(amount) }))
            .collect();
        decode(self.call("z_sendmany", json!([from, outputs])).await?)
    }
}

type HttpClient = Client<HttpConnector, Full<Bytes>>;

fn build_client() -> HttpClient {
    Client::builder(TokioExecutor::new()).build_http()
}

pub struct HttpCoinDaemon {
    url: hyper::Uri,
    auth_header: String,
    timeout: Duration,
    client: RwLock<HttpClient>,
    next_id: AtomicU64,
}

impl HttpCoinDaemon {
    pub fn new(cfg: &DaemonConfig) -> Result<Self, RpcError> {
        let url: hyper::Uri = cfg
            .url
            .parse()
            .map_err(|e| RpcError::Transport(format!("invalid daemon url {}: {}", cfg.url, e)))?;
        let auth_header = format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", cfg.user, cfg.password))
        );

        tracing::info!("Coin daemon RPC client initialized: {}", url);

        Ok(Self {
            url,
            auth_header,
            timeout: Duration::from_secs(cfg.timeout_secs.max(1)),
            client: RwLock::new(build_client()),
            next_id: AtomicU64::new(1),
        })
    }

    fn client(&self) -> HttpClient {
        match self.client.read() {
            Ok(c) => c.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn reconnect(&self) {
        tracing::warn!("Rebuilding coin daemon connection");
        match self.client.write() {
            Ok(mut c) => *c = build_client(),
            Err(poisoned) => *poisoned.into_inner() = build_client(),
        }
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let payload = RpcRequest {
            jsonrpc: "1.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        let body = serde_json::to_vec(&payload).map_err(|e| RpcError::Decode(e.to_string()))?;

        let req = Request::builder()
            .method(Method::POST)
            .uri(self.url.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, self.auth_header.as_str())
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let response = match tokio::time::timeout(self.timeout, self.client().request(req)).await {
            Err(_) => return Err(RpcError::Timeout),
            Ok(Err(e)) => {
                self.reconnect();
                return Err(RpcError::Transport(e.to_string()));
            }
            Ok(Ok(r)) => r,
        };

        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?
            .to_bytes();

        // bitcoind answers JSON-RPC errors with HTTP 500 and a normal body
        let parsed: RpcResponse = match serde_json::from_slice(&bytes) {
            Ok(p) => p,
            Err(e) if status.is_success() => return Err(RpcError::Decode(e.to_string())),
            Err(_) => return Err(RpcError::Transport(format!("HTTP {}", status))),
        };

        if let Some(err) = parsed.error {
            if err.code == METHOD_NOT_FOUND {
                return Err(RpcError::MethodNotFound(method.to_string()));
            }
            return Err(RpcError::Remote { code: err.code, message: err.message });
        }
        Ok(parsed.result.unwrap_or(Value::Null))
    }
}

#[async_trait]
impl CoinDaemon for HttpCoinDaemon {
    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        metrics::inc_rpc_requests();
        let res = self.request(method, params).await;
        match &res {
            Err(RpcError::MethodNotFound(_)) => {}
            Err(e) => {
                metrics::inc_rpc_errors();
                tracing::warn!("RPC {} failed: {}", method, e);
            }
            Ok(_) => {}
        }
        res
    }
}


#[cfg(test)]
mod tests {
    use super::scripted::ScriptedDaemon;
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_client_creation() {
        let daemon = HttpCoinDaemon::new(&DaemonConfig {
            url: "http://127.0.0.1:8232/".into(),
            user: "user".into(),
            password: "pass".into(),
            timeout_secs: 0,
        })
        .unwrap();
        assert_eq!(daemon.auth_header, "Basic dXNlcjpwYXNz");
        assert_eq!(daemon.timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_url_rejected() {
        let cfg = DaemonConfig { url: "not a url".into(), ..DaemonConfig::default() };
        assert!(matches!(HttpCoinDaemon::new(&cfg), Err(RpcError::Transport(_))));
    }

    #[tokio::test]
    async fn test_unreachable_daemon_is_transport_error() {
        let daemon = HttpCoinDaemon::new(&DaemonConfig {
            url: "http://127.0.0.1:1/".into(),
            timeout_secs: 5,
            ..DaemonConfig::default()
        })
        .unwrap();
        let err = daemon.call("getblocktemplate", json!([])).await.unwrap_err();
        assert!(matches!(err, RpcError::Transport(_)));
    }

    #[test]
    fn test_mining_info_fallbacks() {
        let info: MiningInfo = serde_json::from_value(json!({
            "blocks": 10, "difficulty": 3.5, "hashespersec": 100.0
        }))
        .unwrap();
        assert_eq!(info.network_difficulty(), Some(3.5));
        assert_eq!(info.network_hashrate(), Some(100.0));

        let info: MiningInfo = serde_json::from_value(json!({
            "blocks": 10, "difficulty": {"proof-of-work": 1.0}, "powdifficulty": 7.0,
            "networkhashps": 5.0
        }))
        .unwrap();
        assert_eq!(info.network_difficulty(), Some(7.0));
        assert_eq!(info.network_hashrate(), Some(5.0));
    }

    #[tokio::test]
    async fn test_typed_helpers_over_call() {
        let daemon = ScriptedDaemon::default();
        daemon.always("sendmany", Ok(json!("txid1")));
        daemon.always(
            "gettransaction",
            Ok(json!({"txid": "txid1", "confirmations": 3, "blockhash": "bh", "fee": -0.0001})),
        );

        let mut amounts = BTreeMap::new();
        amounts.insert("addr".to_string(), dec!(1.5));
        assert_eq!(daemon.send_many(&amounts).await.unwrap(), "txid1");
        assert_eq!(daemon.calls_to("sendmany")[0], json!(["", {"addr": 1.5}]));

        let tx = daemon.get_transaction("txid1").await.unwrap();
        assert_eq!(tx.confirmations, 3);
        assert_eq!(tx.block_hash.as_deref(), Some("bh"));
        assert_eq!(tx.fee, dec!(-0.0001));

        assert!(matches!(
            daemon.get_block_subsidy().await,
            Err(RpcError::MethodNotFound(_))
        ));
    }

    #[test]
    fn test_decimal_of() {
        assert_eq!(decimal_of(&json!(0.1)), Some(dec!(0.1)));
        assert_eq!(decimal_of(&json!("2.5")), Some(dec!(2.5)));
        assert_eq!(decimal_of(&json!(null)), None);
    }
}
