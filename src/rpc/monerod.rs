//! monerod client.
//!
//! Blocks and transactions come back as consensus-encoded blobs which are
//! decoded with the `monero` crate so the verifier can run view-key output
//! checks on them.

use hyper::Uri;
use monero::{consensus::deserialize, cryptonote::hash::Hashable};
use serde_json::json;

use super::{ChainBlock, ChainDaemon, ChainTx, DaemonLogin, HttpRpc, RpcError};

/// Maximum number of transactions to request at once (the restricted RPC
/// limits this).
const MAX_REQUESTED_TRANSACTIONS: usize = 100;

/// A Monero transaction paired with its hex-encoded hash.
#[derive(Debug, Clone)]
pub struct XmrTx {
    pub(crate) id: String,
    pub(crate) tx: monero::Transaction,
}

impl ChainTx for XmrTx {
    fn id(&self) -> &str {
        &self.id
    }
}

/// A Monero block with full transaction bodies.
#[derive(Debug, Clone)]
pub struct XmrBlock {
    pub(crate) height: u64,
    pub(crate) txs: Vec<XmrTx>,
}

impl ChainBlock for XmrBlock {
    type Tx = XmrTx;

    fn height(&self) -> u64 {
        self.height
    }

    fn transactions(&self) -> &[XmrTx] {
        &self.txs
    }
}

/// A monerod RPC client.
#[derive(Debug, Clone)]
pub struct MonerodRpcClient {
    rpc: HttpRpc,
}

impl MonerodRpcClient {
    /// Returns a client pointing at the specified monero daemon.
    #[must_use]
    pub fn new(url: Uri, login: Option<DaemonLogin>) -> MonerodRpcClient {
        MonerodRpcClient {
            rpc: HttpRpc::new(url, login),
        }
    }

    async fn transactions_by_hashes(&self, hashes: &[String]) -> Result<Vec<XmrTx>, RpcError> {
        let mut transactions = Vec::new();
        for chunk in hashes.chunks(MAX_REQUESTED_TRANSACTIONS) {
            let body = json!({ "txs_hashes": chunk }).to_string();
            let res = self.rpc.post("get_transactions", body).await?;

            let Some(hexes) = res["txs_as_hex"].as_array() else {
                continue;
            };
            for tx_json in hexes {
                let tx_str = tx_json.as_str().ok_or_else(|| {
                    RpcError::MissingData("{{ txs_as_hex: [\"...\"] }}".to_string())
                })?;
                let tx: monero::Transaction = deserialize(&hex::decode(tx_str)?)?;
                transactions.push(XmrTx {
                    id: tx.hash().to_string(),
                    tx,
                });
            }
        }
        Ok(transactions)
    }
}

impl ChainDaemon for MonerodRpcClient {
    type Block = XmrBlock;
    type Tx = XmrTx;

    async fn tip_height(&self) -> Result<u64, RpcError> {
        let res = self
            .rpc
            .json_rpc("json_rpc", "get_block_count", json!({}))
            .await?;
        let count = res["count"]
            .as_u64()
            .ok_or_else(|| RpcError::MissingData("{{ count: ... }}".to_string()))?;
        // The count includes the genesis block; the tip is one below it.
        Ok(count.saturating_sub(1))
    }

    async fn block_by_height(&self, height: u64) -> Result<XmrBlock, RpcError> {
        let res = self
            .rpc
            .json_rpc("json_rpc", "get_block", json!({ "height": height }))
            .await?;
        let block_str = res["blob"]
            .as_str()
            .ok_or_else(|| RpcError::MissingData("{{ blob: \"...\" }}".to_string()))?;
        let block: monero::Block = deserialize(&hex::decode(block_str)?)?;

        let hashes: Vec<String> = block.tx_hashes.iter().map(ToString::to_string).collect();
        let txs = self.transactions_by_hashes(&hashes).await?;
        Ok(XmrBlock { height, txs })
    }

    async fn mempool_txids(&self) -> Result<Vec<String>, RpcError> {
        let res = self
            .rpc
            .post("get_transaction_pool_hashes", String::new())
            .await?;
        let Some(hashes) = res["tx_hashes"].as_array() else {
            // An empty txpool omits the field entirely.
            return Ok(Vec::new());
        };
        hashes
            .iter()
            .map(|h| {
                h.as_str().map(ToString::to_string).ok_or_else(|| {
                    RpcError::MissingData("{{ tx_hashes: [\"...\"] }}".to_string())
                })
            })
            .collect()
    }

    async fn transactions_by_ids(&self, ids: &[String]) -> Result<Vec<XmrTx>, RpcError> {
        self.transactions_by_hashes(ids).await
    }

    async fn tx_height(&self, id: &str) -> Result<Option<u64>, RpcError> {
        let body = json!({ "txs_hashes": [id] }).to_string();
        let res = self.rpc.post("get_transactions", body).await?;
        let Some(tx) = res["txs"].as_array().and_then(|txs| txs.first()) else {
            return Ok(None);
        };
        if tx["in_pool"].as_bool().unwrap_or(false) {
            return Ok(None);
        }
        Ok(tx["block_height"].as_u64())
    }

    fn url(&self) -> String {
        self.rpc.url()
    }
}
