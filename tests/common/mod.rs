#![allow(dead_code)]

use std::time::Duration;

use chainpay::rpc::{
    bitcoind::{ScriptPubKey, UtxoBlock, UtxoTransaction, UtxoTxOut},
    evm::{EvmBlock, EvmLog, EvmTransaction},
};

/// BIP-32 test vector 1 master public key; derives fine at any
/// non-hardened path.
pub const XPUB: &str = "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8";

/// `keccak256("Transfer(address,address,uint256)")`.
pub const TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// BSC-USD (BEP-20 USDT) contract address.
pub const USDT_BSC: &str = "0x55d398326f99059ff775485246999027b3197955";

/// Generous bound for waiting on a subscriber update.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(20);

/// Initialize the logging implementation.
pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn utxo_tx(txid: &str, address: &str, value: f64) -> UtxoTransaction {
    UtxoTransaction {
        txid: txid.to_string(),
        vout: vec![UtxoTxOut {
            value,
            script_pub_key: ScriptPubKey {
                address: Some(address.to_string()),
                addresses: Vec::new(),
            },
        }],
    }
}

pub fn utxo_block(height: u64, tx: Vec<UtxoTransaction>) -> UtxoBlock {
    UtxoBlock { height, tx }
}

pub fn evm_native_tx(hash: &str, to: &str, value_wei: f64) -> EvmTransaction {
    EvmTransaction {
        hash: hash.to_string(),
        to: Some(to.to_string()),
        value_wei,
        logs: Vec::new(),
    }
}

/// A transaction carrying one ERC-20/BEP-20 `Transfer` log to `recipient`.
pub fn evm_token_tx(hash: &str, contract: &str, recipient: &str, raw_hex: &str) -> EvmTransaction {
    EvmTransaction {
        hash: hash.to_string(),
        to: Some(contract.to_string()),
        value_wei: 0.0,
        logs: vec![EvmLog {
            address: contract.to_string(),
            topics: vec![
                TRANSFER_TOPIC.to_string(),
                format!("0x{:0>64}", "2222"),
                format!("0x000000000000000000000000{}", &recipient[2..]),
            ],
            data: raw_hex.to_string(),
        }],
    }
}

pub fn evm_block(number: u64, txs: Vec<EvmTransaction>) -> EvmBlock {
    EvmBlock { number, txs }
}
