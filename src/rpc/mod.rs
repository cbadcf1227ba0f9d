//! Daemon RPC clients.
//!
//! One client per chain family, all speaking JSON-RPC over HTTP through the
//! shared [`HttpRpc`] transport and implementing [`ChainDaemon`] so the
//! listener hub and processors stay chain-agnostic.

pub mod bitcoind;
pub mod evm;
pub mod mock;
pub mod monerod;

use std::{future::Future, sync::Arc, time::Duration};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{header::AUTHORIZATION, http::HeaderValue, Method, Request, Uri};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client as HttpClient},
    rt::TokioExecutor,
};
use log::trace;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::{error, timeout};

/// Timeout for RPC connection formation.
const DEFAULT_RPC_CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout for total call completion.
const DEFAULT_RPC_TOTAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Login for daemons behind HTTP Basic authentication.
#[derive(Debug, Clone)]
pub struct DaemonLogin {
    /// Username.
    pub username: String,
    /// Password.
    pub password: String,
}

/// Shared JSON-RPC-over-HTTP transport.
#[derive(Debug, Clone)]
pub(crate) struct HttpRpc {
    client: HttpClient<HttpsConnector<HttpConnector>, Full<Bytes>>,
    url: Uri,
    timeout: Duration,
    auth_header: Option<HeaderValue>,
}

impl HttpRpc {
    pub(crate) fn new(url: Uri, login: Option<DaemonLogin>) -> HttpRpc {
        let mut hyper_connector = HttpConnector::new();
        hyper_connector.set_connect_timeout(Some(DEFAULT_RPC_CONNECTION_TIMEOUT));
        hyper_connector.enforce_http(false);
        hyper_connector.set_keepalive(Some(Duration::from_secs(25)));
        let rustls_connector = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(hyper_connector);
        let client = HttpClient::builder(TokioExecutor::new()).build(rustls_connector);

        let auth_header = login.and_then(|login| {
            let credentials = BASE64.encode(format!("{}:{}", login.username, login.password));
            HeaderValue::from_str(&format!("Basic {credentials}")).ok()
        });

        HttpRpc {
            client,
            url,
            timeout: DEFAULT_RPC_TOTAL_TIMEOUT,
            auth_header,
        }
    }

    /// POST `body` to `endpoint` below the daemon URL and parse the response
    /// as JSON.
    pub(crate) async fn post(&self, endpoint: &str, body: String) -> Result<Value, RpcError> {
        trace!("POST {}{}: {}", self.url, endpoint, body);
        let mut request = Request::builder()
            .method(Method::POST)
            .uri(self.url.to_string() + endpoint)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(body)))?;
        if let Some(auth) = &self.auth_header {
            request.headers_mut().insert(AUTHORIZATION, auth.clone());
        }

        let response = timeout(self.timeout, self.client.request(request))
            .await?
            .map_err(|e| RpcError::Request(Box::new(e)))?;

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| RpcError::Request(Box::new(e)))?
            .to_bytes();
        Ok(serde_json::from_slice(&body)?)
    }

    /// Perform a JSON-RPC 2.0 call against `endpoint`, returning the
    /// `result` member and mapping `error` members to [`RpcError::Rpc`].
    pub(crate) async fn json_rpc(
        &self,
        endpoint: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, RpcError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": "0",
            "method": method,
            "params": params,
        });
        let mut response = self.post(endpoint, body.to_string()).await?;
        let error = response.get("error").cloned().unwrap_or(Value::Null);
        if !error.is_null() {
            return Err(RpcError::Rpc {
                code: error["code"].as_i64().unwrap_or_default(),
                message: error["message"].as_str().unwrap_or_default().to_string(),
            });
        }
        match response.get_mut("result") {
            Some(result) => Ok(result.take()),
            None => Err(RpcError::MissingData("{{ result: ... }}".to_string())),
        }
    }

    pub(crate) fn url(&self) -> String {
        self.url.to_string()
    }
}

/// A transaction as seen by one chain family's daemon.
pub trait ChainTx: Clone + Send + Sync + 'static {
    /// Chain-specific transaction id.
    fn id(&self) -> &str;
}

/// A confirmed block with full transaction bodies.
pub trait ChainBlock: Clone + Send + Sync + 'static {
    /// Transaction type carried by the block.
    type Tx: ChainTx;

    /// Block height.
    fn height(&self) -> u64;

    /// Transactions included in the block.
    fn transactions(&self) -> &[Self::Tx];
}

/// Necessary methods for a chain daemon client. One shared instance serves
/// every invoice flow on its chain.
pub trait ChainDaemon: Clone + Send + Sync + 'static {
    /// Block representation for this chain family.
    type Block: ChainBlock<Tx = Self::Tx>;
    /// Transaction representation for this chain family.
    type Tx: ChainTx;

    /// Height of the chain tip.
    fn tip_height(&self) -> impl Future<Output = Result<u64, RpcError>> + Send;

    /// Fetch the block at the given height, including transaction bodies.
    fn block_by_height(
        &self,
        height: u64,
    ) -> impl Future<Output = Result<Self::Block, RpcError>> + Send;

    /// Ids of transactions currently in the daemon's mempool. Clients backed
    /// by delta-style daemon APIs may return only ids new since the last
    /// call; the hub deduplicates either way.
    fn mempool_txids(&self) -> impl Future<Output = Result<Vec<String>, RpcError>> + Send;

    /// Fetch transaction bodies by id. Ids the daemon no longer knows are
    /// skipped rather than failing the batch.
    fn transactions_by_ids(
        &self,
        ids: &[String],
    ) -> impl Future<Output = Result<Vec<Self::Tx>, RpcError>> + Send;

    /// Height of the block containing the given transaction, or `None` while
    /// it is still in the mempool (or unknown).
    fn tx_height(&self, id: &str) -> impl Future<Output = Result<Option<u64>, RpcError>> + Send;

    /// The URL of the configured daemon.
    fn url(&self) -> String;
}

/// An error originating from a daemon RPC call.
#[derive(Error, Debug)]
pub enum RpcError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    Request(Box<dyn std::error::Error + Send + Sync>),
    /// Failed to build the HTTP request.
    #[error("failed to build HTTP request: {0}")]
    InvalidRequest(#[from] hyper::http::Error),
    /// HTTP request timed out.
    #[error("HTTP request timed out: {0}")]
    Timeout(#[from] error::Elapsed),
    /// The daemon returned a JSON-RPC error object.
    #[error("daemon returned error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code.
        code: i64,
        /// JSON-RPC error message.
        message: String,
    },
    /// Failed to decode a hex value.
    #[error("hex decoding failed: {0}")]
    HexDecode(#[from] hex::FromHexError),
    /// Failed to deserialize a consensus-encoded monero object.
    #[error("monero deserialization failed: {0}")]
    MoneroDecode(#[from] monero::consensus::encode::Error),
    /// RPC response is missing expected data.
    #[error("expected data was not present in RPC response, or was the wrong data type: {0}")]
    MissingData(String),
    /// The response is not valid json.
    #[error("failed to interpret response body as json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    /// The mock daemon has no data for the request.
    #[error("mock daemon has no data for {0}")]
    Mock(Arc<str>),
}
