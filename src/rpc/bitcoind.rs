//! bitcoind-compatible client, shared by BTC and LTC.

use hyper::Uri;
use log::debug;
use serde::Deserialize;
use serde_json::{from_value, json};

use super::{ChainBlock, ChainDaemon, ChainTx, DaemonLogin, HttpRpc, RpcError};

/// bitcoind's "no such mempool or blockchain transaction" error code.
const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;

/// A single output of a UTXO-chain transaction, decoded from `getblock`
/// verbosity 2 / verbose `getrawtransaction`.
#[derive(Debug, Clone, Deserialize)]
pub struct UtxoTxOut {
    /// Output value in whole coins.
    pub value: f64,
    /// Output script descriptor.
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: ScriptPubKey,
}

/// The address part of an output script.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ScriptPubKey {
    /// Address form used by modern daemons.
    #[serde(default)]
    pub address: Option<String>,
    /// Address list form used by older daemons.
    #[serde(default)]
    pub addresses: Vec<String>,
}

impl ScriptPubKey {
    /// Returns `true` if this script pays the given address.
    #[must_use]
    pub fn pays_to(&self, address: &str) -> bool {
        self.address.as_deref() == Some(address)
            || (self.addresses.len() == 1 && self.addresses[0] == address)
    }
}

/// A UTXO-chain transaction.
#[derive(Debug, Clone, Deserialize)]
pub struct UtxoTransaction {
    /// Transaction id.
    pub txid: String,
    /// Outputs.
    #[serde(default)]
    pub vout: Vec<UtxoTxOut>,
}

impl ChainTx for UtxoTransaction {
    fn id(&self) -> &str {
        &self.txid
    }
}

/// A UTXO-chain block with full transaction bodies.
#[derive(Debug, Clone, Deserialize)]
pub struct UtxoBlock {
    /// Block height.
    pub height: u64,
    /// Included transactions.
    #[serde(default)]
    pub tx: Vec<UtxoTransaction>,
}

impl ChainBlock for UtxoBlock {
    type Tx = UtxoTransaction;

    fn height(&self) -> u64 {
        self.height
    }

    fn transactions(&self) -> &[UtxoTransaction] {
        &self.tx
    }
}

/// A bitcoind (or litecoind) RPC client.
#[derive(Debug, Clone)]
pub struct BitcoindRpcClient {
    rpc: HttpRpc,
}

impl BitcoindRpcClient {
    /// Returns a client pointing at the specified daemon.
    #[must_use]
    pub fn new(url: Uri, login: Option<DaemonLogin>) -> BitcoindRpcClient {
        BitcoindRpcClient {
            rpc: HttpRpc::new(url, login),
        }
    }

    async fn raw_transaction(&self, txid: &str) -> Result<Option<UtxoTransaction>, RpcError> {
        match self
            .rpc
            .json_rpc("", "getrawtransaction", json!([txid, true]))
            .await
        {
            Ok(value) => Ok(Some(from_value(value)?)),
            // The tx can drop out of the mempool between polls.
            Err(RpcError::Rpc { code, .. }) if code == RPC_INVALID_ADDRESS_OR_KEY => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl ChainDaemon for BitcoindRpcClient {
    type Block = UtxoBlock;
    type Tx = UtxoTransaction;

    async fn tip_height(&self) -> Result<u64, RpcError> {
        let res = self.rpc.json_rpc("", "getblockcount", json!([])).await?;
        res.as_u64()
            .ok_or_else(|| RpcError::MissingData("getblockcount result".to_string()))
    }

    async fn block_by_height(&self, height: u64) -> Result<UtxoBlock, RpcError> {
        let hash = self
            .rpc
            .json_rpc("", "getblockhash", json!([height]))
            .await?;
        let hash = hash
            .as_str()
            .ok_or_else(|| RpcError::MissingData("getblockhash result".to_string()))?;
        let block = self.rpc.json_rpc("", "getblock", json!([hash, 2])).await?;
        Ok(from_value(block)?)
    }

    async fn mempool_txids(&self) -> Result<Vec<String>, RpcError> {
        let res = self.rpc.json_rpc("", "getrawmempool", json!([])).await?;
        Ok(from_value(res)?)
    }

    async fn transactions_by_ids(&self, ids: &[String]) -> Result<Vec<UtxoTransaction>, RpcError> {
        let mut transactions = Vec::with_capacity(ids.len());
        for id in ids {
            match self.raw_transaction(id).await? {
                Some(tx) => transactions.push(tx),
                None => debug!("Mempool transaction {id} disappeared before it was fetched"),
            }
        }
        Ok(transactions)
    }

    async fn tx_height(&self, id: &str) -> Result<Option<u64>, RpcError> {
        let tx = self
            .rpc
            .json_rpc("", "getrawtransaction", json!([id, true]))
            .await;
        let tx = match tx {
            Ok(tx) => tx,
            Err(RpcError::Rpc { code, .. }) if code == RPC_INVALID_ADDRESS_OR_KEY => {
                return Ok(None)
            }
            Err(e) => return Err(e),
        };
        let Some(blockhash) = tx["blockhash"].as_str() else {
            return Ok(None);
        };
        let header = self
            .rpc
            .json_rpc("", "getblockheader", json!([blockhash]))
            .await?;
        Ok(header["height"].as_u64())
    }

    fn url(&self) -> String {
        self.rpc.url()
    }
}
