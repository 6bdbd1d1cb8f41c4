//! JSON-RPC ledger client.
//!
//! Speaks the standard node API over HTTP(S):
//!
//! | Call | Method |
//! |------|--------|
//! | [`head_block_number`](LedgerClient::head_block_number) | `eth_blockNumber` |
//! | [`block`](LedgerClient::block) | `eth_getBlockByNumber` |
//! | [`grant_logs`](LedgerClient::grant_logs) | `eth_getLogs` |
//! | [`is_syncing`](LedgerClient::is_syncing) | `eth_syncing` |
//!
//! Subscriptions are served by a background task that polls `eth_getLogs`
//! for each new block range, so no websocket transport is needed.
//!
//! Every request is bounded by the configured timeout; expiry surfaces as
//! [`LedgerError::Timeout`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use super::{ChainHead, LedgerClient, LedgerError, LogFilter, RawLog, Subscription};

/// Largest block range requested by a single live `eth_getLogs` poll.
pub const MAX_LIVE_BLOCK_RANGE: u64 = 2_000;

/// Buffer of the subscription channel.
const SUBSCRIPTION_BUFFER: usize = 256;

/// [`LedgerClient`] backed by a JSON-RPC node.
#[derive(Clone)]
pub struct JsonRpcLedgerClient {
    endpoint: Uri,
    timeout: Duration,
    poll_interval: Duration,
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    next_id: Arc<AtomicU64>,
}

impl JsonRpcLedgerClient {
    /// Creates a client for `endpoint`.
    ///
    /// `timeout` bounds each request; `poll_interval` paces subscription
    /// polling.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidEndpoint`] if `endpoint` is not an
    /// `http`/`https` URI.
    pub fn new(
        endpoint: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self, LedgerError> {
        let endpoint: Uri = endpoint
            .parse()
            .map_err(|e: http::uri::InvalidUri| LedgerError::InvalidEndpoint(e.to_string()))?;
        match endpoint.scheme_str() {
            Some("http" | "https") => {},
            other => {
                return Err(LedgerError::InvalidEndpoint(format!(
                    "unsupported scheme {other:?} in {endpoint}"
                )));
            },
        }

        let https = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(https);

        Ok(Self {
            endpoint,
            timeout,
            poll_interval,
            client,
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Returns the endpoint this client talks to.
    #[must_use]
    pub const fn endpoint(&self) -> &Uri {
        &self.endpoint
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: Value,
    ) -> Result<T, LedgerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = serde_json::to_vec(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        }))
        .map_err(|e| LedgerError::InvalidResponse(e.to_string()))?;

        let request = Request::builder()
            .method("POST")
            .uri(self.endpoint.clone())
            .header("Content-Type", "application/json")
            .header(
                "User-Agent",
                concat!("clubhouse-daemon/", env!("CARGO_PKG_VERSION")),
            )
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| LedgerError::InvalidEndpoint(e.to_string()))?;

        trace!(method, id, "sending ledger request");

        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e: hyper_util::client::legacy::Error| {
                    LedgerError::Unreachable(e.to_string())
                })?;
            let status = response.status();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| LedgerError::Unreachable(e.to_string()))?
                .to_bytes();
            if status.is_server_error() {
                return Err(LedgerError::Unreachable(format!("HTTP {status}")));
            }
            if !status.is_success() {
                return Err(LedgerError::InvalidResponse(format!("HTTP {status}")));
            }
            Ok(body)
        };

        let body = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| LedgerError::Timeout {
                operation: method,
                timeout: self.timeout,
            })??;

        let envelope: RpcResponse = serde_json::from_slice(&body)
            .map_err(|e| LedgerError::InvalidResponse(format!("{method}: {e}")))?;
        if let Some(error) = envelope.error {
            return Err(LedgerError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        serde_json::from_value(envelope.result)
            .map_err(|e| LedgerError::InvalidResponse(format!("{method}: {e}")))
    }

    /// Polls for logs from `from_block` onwards and forwards them to `sink`
    /// until the receiving side is dropped.
    async fn poll_logs(
        self,
        filter: LogFilter,
        from_block: u64,
        sink: mpsc::Sender<Result<RawLog, LedgerError>>,
    ) {
        let mut next = from_block;
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if sink.is_closed() {
                return;
            }

            let head = match self.head_block_number().await {
                Ok(head) => head,
                Err(e) => {
                    if sink.send(Err(e)).await.is_err() {
                        return;
                    }
                    continue;
                },
            };
            if head < next {
                continue;
            }

            let to = head.min(next.saturating_add(MAX_LIVE_BLOCK_RANGE - 1));
            match self.grant_logs(&filter, next, to).await {
                Ok(logs) => {
                    debug!(from = next, to, logs = logs.len(), "polled live logs");
                    for log in logs {
                        if sink.send(Ok(log)).await.is_err() {
                            return;
                        }
                    }
                    next = to.saturating_add(1);
                },
                Err(e) => {
                    if sink.send(Err(e)).await.is_err() {
                        return;
                    }
                },
            }
        }
    }
}

impl std::fmt::Debug for JsonRpcLedgerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonRpcLedgerClient")
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LedgerClient for JsonRpcLedgerClient {
    async fn head_block_number(&self) -> Result<u64, LedgerError> {
        let quantity: String = self.call("eth_blockNumber", json!([])).await?;
        parse_quantity(&quantity)
    }

    async fn block(&self, number: u64) -> Result<ChainHead, LedgerError> {
        let block: Option<RpcBlock> = self
            .call(
                "eth_getBlockByNumber",
                json!([format_quantity(number), false]),
            )
            .await?;
        block
            .ok_or(LedgerError::NotFound { number })?
            .into_head(number)
    }

    async fn grant_logs(
        &self,
        filter: &LogFilter,
        from: u64,
        to: u64,
    ) -> Result<Vec<RawLog>, LedgerError> {
        let logs: Vec<RpcLog> = self
            .call(
                "eth_getLogs",
                json!([{
                    "address": filter.address,
                    "topics": [filter.topic],
                    "fromBlock": format_quantity(from),
                    "toBlock": format_quantity(to),
                }]),
            )
            .await?;
        logs.into_iter()
            .filter(|log| !log.removed)
            .map(RpcLog::into_raw)
            .collect()
    }

    async fn subscribe(
        &self,
        filter: &LogFilter,
        from_block: u64,
    ) -> Result<Subscription, LedgerError> {
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let producer = tokio::spawn(self.clone().poll_logs(filter.clone(), from_block, sender));
        Ok(Subscription::new(receiver, Some(producer)))
    }

    async fn is_syncing(&self) -> Result<bool, LedgerError> {
        let status: Value = self.call("eth_syncing", json!([])).await?;
        Ok(!matches!(status, Value::Bool(false)))
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct RpcBlock {
    number: Option<String>,
    hash: Option<String>,
    timestamp: Option<String>,
}

impl RpcBlock {
    fn into_head(self, requested: u64) -> Result<ChainHead, LedgerError> {
        let number = self
            .number
            .as_deref()
            .map(parse_quantity)
            .transpose()?
            .unwrap_or(requested);
        let timestamp = self.timestamp.as_deref().map(parse_quantity).transpose()?;
        Ok(ChainHead {
            number,
            hash: self.hash,
            timestamp,
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcLog {
    address: String,
    topics: Vec<String>,
    data: String,
    block_number: Option<String>,
    transaction_hash: Option<String>,
    log_index: Option<String>,
    #[serde(default)]
    removed: bool,
}

impl RpcLog {
    fn into_raw(self) -> Result<RawLog, LedgerError> {
        Ok(RawLog {
            address: self.address,
            topics: self.topics,
            data: self.data,
            block_number: self.block_number.as_deref().map(parse_quantity).transpose()?,
            transaction_hash: self.transaction_hash,
            log_index: self.log_index.as_deref().map(parse_quantity).transpose()?,
        })
    }
}

/// Parses a `0x`-prefixed hex quantity.
///
/// # Errors
///
/// Returns [`LedgerError::InvalidResponse`] if `text` is not a hex quantity
/// that fits in a `u64`.
pub fn parse_quantity(text: &str) -> Result<u64, LedgerError> {
    let digits = text
        .strip_prefix("0x")
        .filter(|d| !d.is_empty())
        .ok_or_else(|| LedgerError::InvalidResponse(format!("not a quantity: {text:?}")))?;
    u64::from_str_radix(digits, 16)
        .map_err(|e| LedgerError::InvalidResponse(format!("bad quantity {text:?}: {e}")))
}

/// Formats `value` as a hex quantity.
#[must_use]
pub fn format_quantity(value: u64) -> String {
    format!("0x{value:x}")
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Mutex;

    use axum::Router;
    use axum::extract::State;
    use axum::routing::post;

    use super::*;

    #[test]
    fn quantities_round_trip() {
        assert_eq!(parse_quantity("0x0").unwrap(), 0);
        assert_eq!(parse_quantity("0x1b4").unwrap(), 436);
        assert_eq!(format_quantity(436), "0x1b4");
        assert!(parse_quantity("1b4").is_err());
        assert!(parse_quantity("0x").is_err());
        assert!(parse_quantity("0x1ffffffffffffffff").is_err());
    }

    #[test]
    fn pending_block_has_no_hash() {
        let block: RpcBlock =
            serde_json::from_value(json!({"number": null, "hash": null, "timestamp": "0x5"}))
                .unwrap();
        let head = block.into_head(9).unwrap();
        assert_eq!(head.number, 9);
        assert!(!head.is_resolved());
        assert_eq!(head.timestamp, Some(5));
    }

    #[test]
    fn log_fields_are_converted() {
        let log: RpcLog = serde_json::from_value(json!({
            "address": "0xabc",
            "topics": ["0x01"],
            "data": "0x",
            "blockNumber": "0x10",
            "transactionHash": "0xfeed",
            "logIndex": "0x2",
        }))
        .unwrap();
        let raw = log.into_raw().unwrap();
        assert_eq!(raw.block_number, Some(16));
        assert_eq!(raw.log_index, Some(2));
        assert_eq!(raw.transaction_hash.as_deref(), Some("0xfeed"));
    }

    #[test]
    fn websocket_endpoint_rejected() {
        let err = JsonRpcLedgerClient::new(
            "wss://node.example.org",
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidEndpoint(_)));
    }

    // ------------------------------------------------------------------------
    // Against a local JSON-RPC stub
    // ------------------------------------------------------------------------

    #[derive(Clone, Default)]
    struct Stub {
        methods: Arc<Mutex<Vec<String>>>,
    }

    async fn answer(State(stub): State<Stub>, body: axum::Json<Value>) -> axum::Json<Value> {
        let method = body["method"].as_str().unwrap_or_default().to_string();
        stub.methods.lock().unwrap().push(method.clone());
        let result = match method.as_str() {
            "eth_blockNumber" => json!("0x2a"),
            "eth_getBlockByNumber" if body["params"][0] == "0x2a" => {
                json!({"number": "0x2a", "hash": "0xbeef", "timestamp": "0x64"})
            },
            "eth_getBlockByNumber" => Value::Null,
            "eth_syncing" => json!({"currentBlock": "0x1", "highestBlock": "0x2"}),
            _ => {
                return axum::Json(json!({
                    "jsonrpc": "2.0",
                    "id": body["id"],
                    "error": {"code": -32601, "message": "method not found"},
                }));
            },
        };
        axum::Json(json!({"jsonrpc": "2.0", "id": body["id"], "result": result}))
    }

    async fn spawn_stub() -> (SocketAddr, Stub) {
        let stub = Stub::default();
        let app = Router::new().route("/", post(answer)).with_state(stub.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        (addr, stub)
    }

    fn client(addr: SocketAddr) -> JsonRpcLedgerClient {
        JsonRpcLedgerClient::new(
            &format!("http://{addr}/"),
            Duration::from_secs(5),
            Duration::from_millis(50),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn reads_head_and_block() {
        let (addr, stub) = spawn_stub().await;
        let client = client(addr);

        assert_eq!(client.head_block_number().await.unwrap(), 42);
        let head = client.block(42).await.unwrap();
        assert_eq!(head.hash.as_deref(), Some("0xbeef"));
        assert_eq!(head.timestamp, Some(100));
        assert_eq!(
            client.block(43).await.unwrap_err(),
            LedgerError::NotFound { number: 43 }
        );

        let methods = stub.methods.lock().unwrap().clone();
        assert_eq!(
            methods,
            vec![
                "eth_blockNumber",
                "eth_getBlockByNumber",
                "eth_getBlockByNumber"
            ]
        );
    }

    #[tokio::test]
    async fn reports_syncing_and_rpc_errors() {
        let (addr, _) = spawn_stub().await;
        let client = client(addr);

        assert!(client.is_syncing().await.unwrap());
        let err = client
            .grant_logs(&LogFilter::new("0xabc", "0x01"), 0, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Rpc { code: -32601, .. }));
    }

    #[tokio::test]
    async fn unreachable_node_is_a_connectivity_error() {
        // Bind then drop to get a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = client(addr).head_block_number().await.unwrap_err();
        assert!(err.is_connectivity(), "{err}");
    }
}
