use super::{ChainAdapter, VerifyError, WatchTarget};
use crate::{
    coin::{ChainType, CoinType, Network},
    rpc::bitcoind::UtxoTransaction,
};

/// Adapter for the Bitcoin-like UTXO chains (BTC, LTC). A credit is the sum
/// of all outputs paying the watched address within one transaction.
pub(crate) struct UtxoChain {
    chain: ChainType,
    network: Network,
}

impl UtxoChain {
    pub(crate) fn new(chain: ChainType, network: Network) -> UtxoChain {
        UtxoChain { chain, network }
    }
}

impl ChainAdapter<UtxoTransaction> for UtxoChain {
    fn chain(&self) -> ChainType {
        self.chain
    }

    fn network(&self) -> Network {
        self.network
    }

    fn supports_coin(&self, coin: CoinType) -> bool {
        coin == self.chain.native_coin()
    }

    fn paid_amount(&self, tx: &UtxoTransaction, target: &WatchTarget) -> Result<f64, VerifyError> {
        let mut amount = 0.0;
        for txout in &tx.vout {
            if txout.script_pub_key.pays_to(&target.address) {
                amount += txout.value;
            }
        }
        Ok(amount)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use uuid::Uuid;

    use super::UtxoChain;
    use crate::{
        account::SubIndex,
        coin::{ChainType, CoinType, Network},
        processor::{ChainAdapter, WatchTarget},
        rpc::bitcoind::{ScriptPubKey, UtxoTransaction, UtxoTxOut},
    };

    fn target(address: &str) -> WatchTarget {
        WatchTarget {
            invoice_id: Uuid::new_v4(),
            coin: CoinType::Btc,
            address: address.to_string(),
            sub_index: SubIndex::new(0, 1),
            keys: None,
        }
    }

    fn txout(address: &str, value: f64) -> UtxoTxOut {
        UtxoTxOut {
            value,
            script_pub_key: ScriptPubKey {
                address: Some(address.to_string()),
                addresses: Vec::new(),
            },
        }
    }

    #[test]
    fn sums_outputs_to_watched_address() {
        let adapter = UtxoChain::new(ChainType::Btc, Network::Mainnet);
        let tx = UtxoTransaction {
            txid: "aa".to_string(),
            vout: vec![
                txout("bc1qwatched", 0.004),
                txout("bc1qchange", 1.2),
                txout("bc1qwatched", 0.006),
            ],
        };
        let amount = adapter.paid_amount(&tx, &target("bc1qwatched")).unwrap();
        assert!((amount - 0.01).abs() < 1e-12);
    }

    #[test]
    fn ignores_unrelated_transaction() {
        let adapter = UtxoChain::new(ChainType::Ltc, Network::Mainnet);
        let tx = UtxoTransaction {
            txid: "bb".to_string(),
            vout: vec![txout("ltc1qother", 2.0)],
        };
        assert_eq!(adapter.paid_amount(&tx, &target("ltc1qwatched")).unwrap(), 0.0);
    }

    #[test]
    fn supports_only_the_native_coin() {
        let adapter = UtxoChain::new(ChainType::Btc, Network::Mainnet);
        assert!(adapter.supports_coin(CoinType::Btc));
        assert!(!adapter.supports_coin(CoinType::Ltc));
        assert!(!adapter.supports_coin(CoinType::UsdtErc20));
    }
}
