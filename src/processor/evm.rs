use std::collections::HashMap;

use super::{ChainAdapter, VerifyError, WatchTarget};
use crate::{
    coin::{tokens_for_chain, ChainType, CoinType, Network, TokenInfo},
    rpc::evm::{hex_to_f64, EvmTransaction},
};

/// `keccak256("Transfer(address,address,uint256)")`, the topic every ERC-20
/// compatible transfer log carries.
const TRANSFER_TOPIC: &str = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// Wei per native coin.
const WEI_PER_COIN: f64 = 1e18;

/// Adapter shared by the EVM chains (ETH, BNB): the native coin is credited
/// through `to`/`value`, tokens through `Transfer` logs of contracts in the
/// chain's token table. ETH and BNB genuinely share this verification
/// algorithm; only the token table differs.
pub(crate) struct EvmChain {
    chain: ChainType,
    /// Token table: contract address (lowercase) to token info.
    tokens: HashMap<&'static str, TokenInfo>,
}

impl EvmChain {
    pub(crate) fn new(chain: ChainType) -> EvmChain {
        let tokens = tokens_for_chain(chain)
            .iter()
            .map(|token| (token.contract, *token))
            .collect();
        EvmChain { chain, tokens }
    }

    /// Contract addresses this chain tracks, for the RPC client's receipt
    /// prefetch.
    pub(crate) fn tracked_contracts(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.tokens.keys().copied()
    }

    fn token_for(&self, coin: CoinType) -> Option<&TokenInfo> {
        self.tokens.values().find(|token| token.coin == coin)
    }
}

impl ChainAdapter<EvmTransaction> for EvmChain {
    fn chain(&self) -> ChainType {
        self.chain
    }

    fn network(&self) -> Network {
        // EVM addresses are network-independent.
        Network::Mainnet
    }

    fn supports_coin(&self, coin: CoinType) -> bool {
        coin == self.chain.native_coin() || self.token_for(coin).is_some()
    }

    fn paid_amount(&self, tx: &EvmTransaction, target: &WatchTarget) -> Result<f64, VerifyError> {
        if target.coin == self.chain.native_coin() {
            let paid = tx
                .to
                .as_deref()
                .is_some_and(|to| to.eq_ignore_ascii_case(&target.address));
            return Ok(if paid { tx.value_wei / WEI_PER_COIN } else { 0.0 });
        }

        let Some(token) = self.token_for(target.coin) else {
            return Ok(0.0);
        };
        let mut amount = 0.0;
        for log in &tx.logs {
            if log.address != token.contract {
                continue;
            }
            let [topic0, _, recipient] = log.topics.as_slice() else {
                continue;
            };
            if topic0 != TRANSFER_TOPIC || !topic_is_address(recipient, &target.address) {
                continue;
            }
            let raw = hex_to_f64(&log.data)
                .map_err(|e| VerifyError::Malformed(format!("transfer value: {e}")))?;
            amount += raw / 10f64.powi(token.decimals as i32);
        }
        Ok(amount)
    }
}

/// An address occupies the low 20 bytes of a 32-byte log topic.
fn topic_is_address(topic: &str, address: &str) -> bool {
    topic.len() == 66 && topic[26..].eq_ignore_ascii_case(&address[2..])
}
