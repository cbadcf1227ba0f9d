//! EVM JSON-RPC client, shared by ETH and BNB Smart Chain.
//!
//! Token transfers only exist as receipt logs, so the client is configured
//! with the set of tracked contract addresses and attaches receipt logs to
//! block transactions addressed to one of them. Pending transactions carry
//! no logs.

use std::{collections::HashSet, sync::Arc};

use hyper::Uri;
use log::debug;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use super::{ChainBlock, ChainDaemon, ChainTx, DaemonLogin, HttpRpc, RpcError};

/// A receipt log entry.
#[derive(Debug, Clone)]
pub struct EvmLog {
    /// Emitting contract address, lowercase.
    pub address: String,
    /// Indexed topics, `0x`-prefixed hex.
    pub topics: Vec<String>,
    /// Unindexed data, `0x`-prefixed hex.
    pub data: String,
}

/// An EVM transaction, with receipt logs attached when the transaction is
/// in a block and addressed to a tracked contract.
#[derive(Debug, Clone)]
pub struct EvmTransaction {
    /// Transaction hash.
    pub hash: String,
    /// Recipient, lowercase; `None` for contract creation.
    pub to: Option<String>,
    /// Transferred value in wei.
    pub value_wei: f64,
    /// Receipt logs of a successful included transaction.
    pub logs: Vec<EvmLog>,
}

impl ChainTx for EvmTransaction {
    fn id(&self) -> &str {
        &self.hash
    }
}

/// An EVM block with full transaction bodies.
#[derive(Debug, Clone)]
pub struct EvmBlock {
    /// Block number.
    pub number: u64,
    /// Included transactions.
    pub txs: Vec<EvmTransaction>,
}

impl ChainBlock for EvmBlock {
    type Tx = EvmTransaction;

    fn height(&self) -> u64 {
        self.number
    }

    fn transactions(&self) -> &[EvmTransaction] {
        &self.txs
    }
}

/// An EVM node RPC client.
#[derive(Debug, Clone)]
pub struct EvmRpcClient {
    rpc: HttpRpc,
    /// Contracts whose receipts are worth fetching.
    watched_contracts: Arc<HashSet<String>>,
    /// Installed pending-transaction filter id, if any.
    pending_filter: Arc<Mutex<Option<String>>>,
}

impl EvmRpcClient {
    /// Returns a client pointing at the specified node, fetching receipts
    /// for transactions addressed to any of `watched_contracts`.
    #[must_use]
    pub fn new(
        url: Uri,
        login: Option<DaemonLogin>,
        watched_contracts: HashSet<String>,
    ) -> EvmRpcClient {
        EvmRpcClient {
            rpc: HttpRpc::new(url, login),
            watched_contracts: Arc::new(
                watched_contracts
                    .into_iter()
                    .map(|c| c.to_lowercase())
                    .collect(),
            ),
            pending_filter: Arc::new(Mutex::new(None)),
        }
    }

    fn parse_transaction(&self, tx: &Value) -> Result<EvmTransaction, RpcError> {
        let hash = tx["hash"]
            .as_str()
            .ok_or_else(|| RpcError::MissingData("{{ hash: \"...\" }}".to_string()))?
            .to_lowercase();
        let to = tx["to"].as_str().map(str::to_lowercase);
        let value_wei = match tx["value"].as_str() {
            Some(quantity) => hex_to_f64(quantity)?,
            None => 0.0,
        };
        Ok(EvmTransaction {
            hash,
            to,
            value_wei,
            logs: Vec::new(),
        })
    }

    async fn attach_receipt_logs(&self, tx: &mut EvmTransaction) -> Result<(), RpcError> {
        let receipt = self
            .rpc
            .json_rpc("", "eth_getTransactionReceipt", json!([tx.hash]))
            .await?;
        if receipt.is_null() {
            return Ok(());
        }
        // Failed transactions emit no credit.
        if receipt["status"].as_str() == Some("0x0") {
            return Ok(());
        }
        let Some(logs) = receipt["logs"].as_array() else {
            return Ok(());
        };
        for log in logs {
            let Some(address) = log["address"].as_str() else {
                continue;
            };
            let topics = log["topics"]
                .as_array()
                .map(|topics| {
                    topics
                        .iter()
                        .filter_map(|t| t.as_str().map(str::to_lowercase))
                        .collect()
                })
                .unwrap_or_default();
            tx.logs.push(EvmLog {
                address: address.to_lowercase(),
                topics,
                data: log["data"].as_str().unwrap_or("0x").to_string(),
            });
        }
        Ok(())
    }
}

impl ChainDaemon for EvmRpcClient {
    type Block = EvmBlock;
    type Tx = EvmTransaction;

    async fn tip_height(&self) -> Result<u64, RpcError> {
        let res = self.rpc.json_rpc("", "eth_blockNumber", json!([])).await?;
        hex_to_u64(
            res.as_str()
                .ok_or_else(|| RpcError::MissingData("eth_blockNumber result".to_string()))?,
        )
    }

    async fn block_by_height(&self, height: u64) -> Result<EvmBlock, RpcError> {
        let res = self
            .rpc
            .json_rpc(
                "",
                "eth_getBlockByNumber",
                json!([format!("{height:#x}"), true]),
            )
            .await?;
        if res.is_null() {
            return Err(RpcError::MissingData(format!("block {height} not found")));
        }

        let mut txs = Vec::new();
        if let Some(transactions) = res["transactions"].as_array() {
            for tx_json in transactions {
                let mut tx = self.parse_transaction(tx_json)?;
                let tracked = tx
                    .to
                    .as_deref()
                    .is_some_and(|to| self.watched_contracts.contains(to));
                if tracked {
                    self.attach_receipt_logs(&mut tx).await?;
                }
                txs.push(tx);
            }
        }
        Ok(EvmBlock {
            number: height,
            txs,
        })
    }

    async fn mempool_txids(&self) -> Result<Vec<String>, RpcError> {
        let mut filter = self.pending_filter.lock().await;
        if filter.is_none() {
            let id = self
                .rpc
                .json_rpc("", "eth_newPendingTransactionFilter", json!([]))
                .await?;
            *filter = Some(
                id.as_str()
                    .ok_or_else(|| RpcError::MissingData("filter id".to_string()))?
                    .to_string(),
            );
        }
        let id = filter.clone().unwrap_or_default();

        match self
            .rpc
            .json_rpc("", "eth_getFilterChanges", json!([id]))
            .await
        {
            Ok(changes) => Ok(changes
                .as_array()
                .map(|hashes| {
                    hashes
                        .iter()
                        .filter_map(|h| h.as_str().map(str::to_lowercase))
                        .collect()
                })
                .unwrap_or_default()),
            Err(RpcError::Rpc { code, message }) => {
                // Nodes expire idle filters; reinstall on the next poll.
                debug!("Pending-tx filter rejected ({code}: {message}); reinstalling");
                *filter = None;
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    async fn transactions_by_ids(&self, ids: &[String]) -> Result<Vec<EvmTransaction>, RpcError> {
        let mut transactions = Vec::with_capacity(ids.len());
        for id in ids {
            let res = self
                .rpc
                .json_rpc("", "eth_getTransactionByHash", json!([id]))
                .await?;
            if res.is_null() {
                debug!("Pending transaction {id} disappeared before it was fetched");
                continue;
            }
            transactions.push(self.parse_transaction(&res)?);
        }
        Ok(transactions)
    }

    async fn tx_height(&self, id: &str) -> Result<Option<u64>, RpcError> {
        let receipt = self
            .rpc
            .json_rpc("", "eth_getTransactionReceipt", json!([id]))
            .await?;
        match receipt["blockNumber"].as_str() {
            Some(number) => Ok(Some(hex_to_u64(number)?)),
            None => Ok(None),
        }
    }

    fn url(&self) -> String {
        self.rpc.url()
    }
}

/// Parse a `0x`-prefixed hex quantity into a `u64`.
pub(crate) fn hex_to_u64(quantity: &str) -> Result<u64, RpcError> {
    let digits = quantity.trim_start_matches("0x");
    u64::from_str_radix(digits, 16)
        .map_err(|e| RpcError::MissingData(format!("bad hex quantity \"{quantity}\": {e}")))
}

/// Parse a `0x`-prefixed hex quantity of arbitrary width into an `f64`.
/// 256-bit token values exceed every integer type here; amounts are
/// compared as doubles anyway.
pub(crate) fn hex_to_f64(quantity: &str) -> Result<f64, RpcError> {
    let digits = quantity.trim_start_matches("0x");
    let mut value = 0.0_f64;
    for c in digits.chars() {
        let digit = c
            .to_digit(16)
            .ok_or_else(|| RpcError::MissingData(format!("bad hex quantity \"{quantity}\"")))?;
        value = value * 16.0 + f64::from(digit);
    }
    Ok(value)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::{hex_to_f64, hex_to_u64};

    #[test]
    fn quantities() {
        assert_eq!(hex_to_u64("0x0").unwrap(), 0);
        assert_eq!(hex_to_u64("0x10").unwrap(), 16);
        assert_eq!(hex_to_u64("0xde0b6b3a7640000").unwrap(), 1_000_000_000_000_000_000);
        assert!(hex_to_u64("0xzz").is_err());
    }

    #[test]
    fn wide_quantities() {
        // One ether in wei.
        let wei = hex_to_f64("0xde0b6b3a7640000").unwrap();
        assert!((wei - 1e18).abs() < 1.0);
        // 25 tokens at 18 decimals (the widths receipts actually carry).
        let raw = hex_to_f64("0x0000000000000000000000000000000000000000000000015af1d78b58c40000")
            .unwrap();
        assert!((raw / 1e18 - 25.0).abs() < 1e-9);
    }
}
