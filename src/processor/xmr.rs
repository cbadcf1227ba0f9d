use monero::{blockdata::transaction::TxOutTarget, cryptonote::onetime_key::SubKeyChecker, VarInt};

use super::{ChainAdapter, VerifyError, WatchTarget};
use crate::{
    account::ChainKeys,
    coin::{ChainType, CoinType, Network},
    derive,
    rpc::monerod::XmrTx,
};

/// Piconeros per XMR.
const PICONEROS_PER_XMR: f64 = 1e12;

/// Adapter for Monero. Outputs are scanned with the invoice owner's view
/// pair; a credit is the sum of owned outputs at the invoice's subaddress
/// index within one transaction.
pub(crate) struct XmrChain {
    network: Network,
}

impl XmrChain {
    pub(crate) fn new(network: Network) -> XmrChain {
        XmrChain { network }
    }
}

impl ChainAdapter<XmrTx> for XmrChain {
    fn chain(&self) -> ChainType {
        ChainType::Xmr
    }

    fn network(&self) -> Network {
        self.network
    }

    fn supports_coin(&self, coin: CoinType) -> bool {
        coin == CoinType::Xmr
    }

    fn needs_keys(&self) -> bool {
        true
    }

    fn paid_amount(&self, tx: &XmrTx, target: &WatchTarget) -> Result<f64, VerifyError> {
        let Some(ChainKeys::Monero {
            private_view_key,
            public_spend_key,
        }) = &target.keys
        else {
            return Err(VerifyError::MissingKeys);
        };

        // Ignore transactions with non-zero timelocks.
        if tx.tx.prefix().unlock_time != VarInt(0) {
            return Ok(0.0);
        }

        let viewpair = derive::view_pair(private_view_key, public_spend_key)?;
        let index = target.sub_index;
        let checker = SubKeyChecker::new(
            &viewpair,
            index.major..index.major.saturating_add(1),
            index.minor..index.minor.saturating_add(1),
        );
        let owned_outputs = tx
            .tx
            .check_outputs_with(&checker)
            .map_err(|e| VerifyError::Malformed(e.to_string()))?;

        let mut piconeros = 0u64;
        for output in &owned_outputs {
            if output.sub_index().major != index.major || output.sub_index().minor != index.minor {
                continue;
            }
            // Both supported output targets carry a one-time key.
            match output.out().target {
                TxOutTarget::ToKey { .. } | TxOutTarget::ToTaggedKey { .. } => {}
            }
            let amount = output
                .amount()
                .ok_or_else(|| VerifyError::Malformed("unable to unblind amount".to_string()))?;
            piconeros += amount.as_pico();
        }

        #[allow(clippy::cast_precision_loss)]
        Ok(piconeros as f64 / PICONEROS_PER_XMR)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::str::FromStr;

    use monero::{
        blockdata::transaction::{ExtraField, SubField, TransactionPrefix, TxOut, TxOutTarget},
        cryptonote::hash::Hashable,
        util::ringct::RctSig,
        Transaction, VarInt,
    };
    use uuid::Uuid;

    use super::XmrChain;
    use crate::{
        account::{ChainKeys, SubIndex},
        coin::{ChainType, CoinType, Network},
        processor::{ChainAdapter, VerifyError, WatchTarget},
        rpc::monerod::XmrTx,
    };

    const PRIVATE_VIEW_KEY: &str =
        "ad2093a5705b9f33e6f0f0c1bc1f5f639c756cdfc168c8f2ac6127ccbdab3a03";
    const PRIMARY_ADDRESS: &str =
        "4613YiHLM6JMH4zejMB2zJY5TwQCxL8p65ufw8kBP5yxX9itmuGLqp1dS4tkVoTxjyH3aYhYNrtGHbQzJQP5bFus3KHVdmf";

    fn watched_keys() -> ChainKeys {
        let address = monero::Address::from_str(PRIMARY_ADDRESS).unwrap();
        ChainKeys::Monero {
            private_view_key: PRIVATE_VIEW_KEY.to_string(),
            public_spend_key: hex::encode(address.public_spend.as_bytes()),
        }
    }

    fn target(keys: Option<ChainKeys>) -> WatchTarget {
        WatchTarget {
            invoice_id: Uuid::new_v4(),
            coin: CoinType::Xmr,
            address: "8subaddress".to_string(),
            sub_index: SubIndex::new(0, 1),
            keys,
        }
    }

    /// A well-formed transaction paying somebody else entirely.
    fn unrelated_tx(unlock_time: u64) -> XmrTx {
        let address = monero::Address::from_str(PRIMARY_ADDRESS).unwrap();
        let tx = Transaction {
            prefix: TransactionPrefix {
                version: VarInt(1),
                unlock_time: VarInt(unlock_time),
                inputs: Vec::new(),
                outputs: vec![TxOut {
                    amount: VarInt(1_000_000),
                    target: TxOutTarget::ToKey {
                        key: address.public_view.to_bytes(),
                    },
                }],
                extra: ExtraField(vec![SubField::TxPublicKey(address.public_view)]).into(),
            },
            signatures: Vec::new(),
            rct_signatures: RctSig { sig: None, p: None },
        };
        XmrTx {
            id: tx.hash().to_string(),
            tx,
        }
    }

    #[test]
    fn missing_keys_is_an_error() {
        let adapter = XmrChain::new(Network::Mainnet);
        assert!(matches!(
            adapter.paid_amount(&unrelated_tx(0), &target(None)),
            Err(VerifyError::MissingKeys)
        ));
    }

    #[test]
    fn unrelated_transaction_credits_nothing() {
        let adapter = XmrChain::new(Network::Mainnet);
        let amount = adapter
            .paid_amount(&unrelated_tx(0), &target(Some(watched_keys())))
            .unwrap();
        assert_eq!(amount, 0.0);
    }

    #[test]
    fn timelocked_transaction_is_ignored() {
        let adapter = XmrChain::new(Network::Mainnet);
        let amount = adapter
            .paid_amount(&unrelated_tx(100), &target(Some(watched_keys())))
            .unwrap();
        assert_eq!(amount, 0.0);
    }

    #[test]
    fn only_the_native_coin_is_supported() {
        let adapter = XmrChain::new(Network::Stagenet);
        assert_eq!(adapter.chain(), ChainType::Xmr);
        assert!(adapter.supports_coin(CoinType::Xmr));
        assert!(!adapter.supports_coin(CoinType::Btc));
    }
}
