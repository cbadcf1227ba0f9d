//! Coins, chain families and networks.
//!
//! Wire codes are stable and match the public API enumeration; storage and
//! the RPC layer both round-trip through them.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

macro_rules! coins {
    ($(($variant:ident, $code:literal, $name:literal, $chain:ident)),+ $(,)?) => {
        /// A coin accepted by the payment gateway. Either the native coin of a
        /// supported chain, or a token tracked on one of the EVM chains.
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum CoinType {
            $(
                #[allow(missing_docs)]
                $variant,
            )+
        }

        impl CoinType {
            /// All supported coins, in wire-code order.
            pub const ALL: &'static [CoinType] = &[$(CoinType::$variant),+];

            /// Stable numeric code used on the wire and in storage.
            #[must_use]
            pub fn code(self) -> u32 {
                match self {
                    $(CoinType::$variant => $code,)+
                }
            }

            /// Inverse of [`code`](Self::code).
            ///
            /// # Errors
            ///
            /// Returns [`UnknownCoin`] for codes outside the enumeration.
            pub fn from_code(code: u32) -> Result<CoinType, UnknownCoin> {
                match code {
                    $($code => Ok(CoinType::$variant),)+
                    other => Err(UnknownCoin::Code(other)),
                }
            }

            /// The chain family this coin settles on.
            #[must_use]
            pub fn chain(self) -> ChainType {
                match self {
                    $(CoinType::$variant => ChainType::$chain,)+
                }
            }

            fn name(self) -> &'static str {
                match self {
                    $(CoinType::$variant => $name,)+
                }
            }
        }

        impl FromStr for CoinType {
            type Err = UnknownCoin;

            fn from_str(s: &str) -> Result<CoinType, UnknownCoin> {
                match s {
                    $($name => Ok(CoinType::$variant),)+
                    other => Err(UnknownCoin::Name(other.to_string())),
                }
            }
        }
    };
}

coins! {
    (Xmr, 0, "XMR", Xmr),
    (Btc, 1, "BTC", Btc),
    (Ltc, 2, "LTC", Ltc),
    (Eth, 3, "ETH", Eth),
    (Ton, 4, "TON", Ton),
    // ERC-20
    (UsdtErc20, 5, "USDT_ERC20", Eth),
    (UsdcErc20, 6, "USDC_ERC20", Eth),
    (DaiErc20, 7, "DAI_ERC20", Eth),
    (WbtcErc20, 8, "WBTC_ERC20", Eth),
    (UniErc20, 9, "UNI_ERC20", Eth),
    (LinkErc20, 10, "LINK_ERC20", Eth),
    (AaveErc20, 11, "AAVE_ERC20", Eth),
    (CrvErc20, 12, "CRV_ERC20", Eth),
    (MaticErc20, 13, "MATIC_ERC20", Eth),
    (ShibErc20, 14, "SHIB_ERC20", Eth),
    (BnbErc20, 15, "BNB_ERC20", Eth),
    (ArbErc20, 16, "ARB_ERC20", Eth),
    (Bnb, 17, "BNB", Bnb),
    // BEP-20
    (BscUsdBep20, 18, "BSCUSD_BEP20", Bnb),
    (UsdcBep20, 19, "USDC_BEP20", Bnb),
    (DaiBep20, 20, "DAI_BEP20", Bnb),
    (BusdBep20, 21, "BUSD_BEP20", Bnb),
    (BtcbBep20, 22, "BTCB_BEP20", Bnb),
    (UniBep20, 23, "UNI_BEP20", Bnb),
    (LinkBep20, 24, "LINK_BEP20", Bnb),
    (AaveBep20, 25, "AAVE_BEP20", Bnb),
    (MaticBep20, 26, "MATIC_BEP20", Bnb),
    (EthBep20, 27, "ETH_BEP20", Bnb),
    (XrpBep20, 28, "XRP_BEP20", Bnb),
    (AdaBep20, 29, "ADA_BEP20", Bnb),
    (TrxBep20, 30, "TRX_BEP20", Bnb),
    (DogeBep20, 31, "DOGE_BEP20", Bnb),
    (LtcBep20, 32, "LTC_BEP20", Bnb),
    (BchBep20, 33, "BCH_BEP20", Bnb),
    (TwtBep20, 34, "TWT_BEP20", Bnb),
    (AvaxBep20, 35, "AVAX_BEP20", Bnb),
    (CakeBep20, 36, "CAKE_BEP20", Bnb),
    (AtomErc20, 37, "ATOM_ERC20", Eth),
    (WbtcBep20, 38, "WBTC_BEP20", Bnb),
    (ShibBep20, 39, "SHIB_BEP20", Bnb),
    (AtomBep20, 40, "ATOM_BEP20", Bnb),
    (ArbBep20, 41, "ARB_BEP20", Bnb),
}

impl CoinType {
    /// Returns `true` if this coin is the native coin of its chain rather
    /// than a token.
    #[must_use]
    pub fn is_native(self) -> bool {
        matches!(
            self,
            CoinType::Xmr | CoinType::Btc | CoinType::Ltc | CoinType::Eth | CoinType::Bnb
                | CoinType::Ton
        )
    }
}

impl fmt::Display for CoinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A coin name or code outside the supported enumeration.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum UnknownCoin {
    /// Numeric wire code out of range.
    #[error("unknown coin code {0}")]
    Code(u32),
    /// Unrecognized coin name.
    #[error("unknown coin \"{0}\"")]
    Name(String),
}

/// A chain family watched by one processor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum ChainType {
    Xmr,
    Btc,
    Ltc,
    Eth,
    Bnb,
    Ton,
}

impl ChainType {
    /// The native coin of this chain.
    #[must_use]
    pub fn native_coin(self) -> CoinType {
        match self {
            ChainType::Xmr => CoinType::Xmr,
            ChainType::Btc => CoinType::Btc,
            ChainType::Ltc => CoinType::Ltc,
            ChainType::Eth => CoinType::Eth,
            ChainType::Bnb => CoinType::Bnb,
            ChainType::Ton => CoinType::Ton,
        }
    }
}

impl fmt::Display for ChainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChainType::Xmr => "XMR",
            ChainType::Btc => "BTC",
            ChainType::Ltc => "LTC",
            ChainType::Eth => "ETH",
            ChainType::Bnb => "BNB",
            ChainType::Ton => "TON",
        };
        f.write_str(name)
    }
}

impl FromStr for ChainType {
    type Err = UnknownCoin;

    fn from_str(s: &str) -> Result<ChainType, UnknownCoin> {
        match s {
            "XMR" => Ok(ChainType::Xmr),
            "BTC" => Ok(ChainType::Btc),
            "LTC" => Ok(ChainType::Ltc),
            "ETH" => Ok(ChainType::Eth),
            "BNB" => Ok(ChainType::Bnb),
            "TON" => Ok(ChainType::Ton),
            other => Err(UnknownCoin::Name(other.to_string())),
        }
    }
}

/// Network selection for a configured chain daemon.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Production network.
    #[default]
    Mainnet,
    /// Public test network.
    Testnet,
    /// Monero staging network.
    Stagenet,
    /// Bitcoin-family signet.
    Signet,
    /// Local regression-test network.
    Regtest,
}

/// A token contract tracked on an EVM chain.
#[derive(Debug, Copy, Clone)]
pub struct TokenInfo {
    /// Coin the contract settles.
    pub coin: CoinType,
    /// Contract address, lowercase hex with `0x` prefix.
    pub contract: &'static str,
    /// Token decimals; raw transfer values are scaled down by `10^decimals`.
    pub decimals: u32,
}

/// ERC-20 contracts tracked on Ethereum.
pub const ERC20_TOKENS: &[TokenInfo] = &[
    TokenInfo { coin: CoinType::UsdtErc20, contract: "0xdac17f958d2ee523a2206206994597c13d831ec7", decimals: 6 },
    TokenInfo { coin: CoinType::UsdcErc20, contract: "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48", decimals: 6 },
    TokenInfo { coin: CoinType::DaiErc20, contract: "0x6b175474e89094c44da98b954eedeac495271d0f", decimals: 18 },
    TokenInfo { coin: CoinType::WbtcErc20, contract: "0x2260fac5e5542a773aa44fbcfedf7c193bc2c599", decimals: 8 },
    TokenInfo { coin: CoinType::UniErc20, contract: "0x1f9840a85d5af5bf1d1762f925bdaddc4201f984", decimals: 18 },
    TokenInfo { coin: CoinType::LinkErc20, contract: "0x514910771af9ca656af840dff83e8264ecf986ca", decimals: 18 },
    TokenInfo { coin: CoinType::AaveErc20, contract: "0x7fc66500c84a76ad7e9c93437bfc5ac33e2ddae9", decimals: 18 },
    TokenInfo { coin: CoinType::CrvErc20, contract: "0xd533a949740bb3306d119cc777fa900ba034cd52", decimals: 18 },
    TokenInfo { coin: CoinType::MaticErc20, contract: "0x7d1afa7b718fb893db30a3abc0cfc608aacfebb0", decimals: 18 },
    TokenInfo { coin: CoinType::ShibErc20, contract: "0x95ad61b0a150d79219dcf64e1e6cc01f0b64c4ce", decimals: 18 },
    TokenInfo { coin: CoinType::BnbErc20, contract: "0xb8c77482e45f1f44de1745f52c74426c631bdd52", decimals: 18 },
    TokenInfo { coin: CoinType::AtomErc20, contract: "0x8d983cb9388eac77af0474fa441c4815500cb7bb", decimals: 6 },
    TokenInfo { coin: CoinType::ArbErc20, contract: "0xb50721bcf8d664c30412cfbc6cf7a15145234ad1", decimals: 18 },
];

/// BEP-20 contracts tracked on BNB Smart Chain.
pub const BEP20_TOKENS: &[TokenInfo] = &[
    TokenInfo { coin: CoinType::BscUsdBep20, contract: "0x55d398326f99059ff775485246999027b3197955", decimals: 18 },
    TokenInfo { coin: CoinType::UsdcBep20, contract: "0x8ac76a51cc950d9822d68b83fe1ad97b32cd580d", decimals: 18 },
    TokenInfo { coin: CoinType::DaiBep20, contract: "0x1af3f329e8be154074d8769d1ffa4ee058b1dbc3", decimals: 18 },
    TokenInfo { coin: CoinType::BusdBep20, contract: "0xe9e7cea3dedca5984780bafc599bd69add087d56", decimals: 18 },
    TokenInfo { coin: CoinType::BtcbBep20, contract: "0x7130d2a12b9bcbfae4f2634d864a1ee1ce3ead9c", decimals: 18 },
    TokenInfo { coin: CoinType::UniBep20, contract: "0xbf5140a22578168fd562dccf235e5d43a02ce9b1", decimals: 18 },
    TokenInfo { coin: CoinType::LinkBep20, contract: "0xf8a0bf9cf54bb92f17374d9e9a321e6a111a51bd", decimals: 18 },
    TokenInfo { coin: CoinType::AaveBep20, contract: "0xfb6115445bff7b52feb98650c87f44907e58f802", decimals: 18 },
    TokenInfo { coin: CoinType::MaticBep20, contract: "0xcc42724c6683b7e57334c4e856f4c9965ed682bd", decimals: 18 },
    TokenInfo { coin: CoinType::EthBep20, contract: "0x2170ed0880ac9a755fd29b2688956bd959f933f8", decimals: 18 },
    TokenInfo { coin: CoinType::XrpBep20, contract: "0x1d2f0da169ceb9fc7b3144628db156f3f6c60dbe", decimals: 18 },
    TokenInfo { coin: CoinType::AdaBep20, contract: "0x3ee2200efb3400fabb9aacf31297cbdd1d435d47", decimals: 18 },
    TokenInfo { coin: CoinType::TrxBep20, contract: "0x85eac5ac2f758618dfa09bdbe0cf174e7d574d5b", decimals: 18 },
    TokenInfo { coin: CoinType::DogeBep20, contract: "0xba2ae424d960c26247dd6c32edc70b295c744c43", decimals: 8 },
    TokenInfo { coin: CoinType::LtcBep20, contract: "0x4338665cbb7b2485a8855a139b75d5e34ab0db94", decimals: 18 },
    TokenInfo { coin: CoinType::BchBep20, contract: "0x8ff795a6f4d97e7887c79bea79aba5cc76444adf", decimals: 18 },
    TokenInfo { coin: CoinType::TwtBep20, contract: "0x4b0f1812e5df2a09796481ff14017e6005508003", decimals: 18 },
    TokenInfo { coin: CoinType::AvaxBep20, contract: "0x1ce0c2827e2ef14d5c4f29a091d735a204794041", decimals: 18 },
    TokenInfo { coin: CoinType::CakeBep20, contract: "0x0e09fabb73bd3ade0a17ecc321fd13a19e81ce82", decimals: 18 },
    TokenInfo { coin: CoinType::WbtcBep20, contract: "0x0555e30da8f98308edb960aa94c0db47230d2b9c", decimals: 8 },
    TokenInfo { coin: CoinType::ShibBep20, contract: "0x2859e4544c4bb03966803b044a93563bd2d0dd4d", decimals: 18 },
    TokenInfo { coin: CoinType::AtomBep20, contract: "0x0eb3a705fc54725037cc9e008bdede697f62f335", decimals: 18 },
    TokenInfo { coin: CoinType::ArbBep20, contract: "0xa050ffb3eeb8200eeb7f61ce34ff644420fd3522", decimals: 18 },
];

/// Token table for the given chain, empty for chains without tokens.
#[must_use]
pub fn tokens_for_chain(chain: ChainType) -> &'static [TokenInfo] {
    match chain {
        ChainType::Eth => ERC20_TOKENS,
        ChainType::Bnb => BEP20_TOKENS,
        _ => &[],
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::str::FromStr;

    use super::{tokens_for_chain, ChainType, CoinType, UnknownCoin};

    #[test]
    fn code_round_trip() {
        for &coin in CoinType::ALL {
            assert_eq!(CoinType::from_code(coin.code()), Ok(coin));
        }
    }

    #[test]
    fn name_round_trip() {
        for &coin in CoinType::ALL {
            assert_eq!(CoinType::from_str(&coin.to_string()), Ok(coin));
        }
    }

    #[test]
    fn out_of_range_code() {
        let max = CoinType::ALL.iter().map(|c| c.code()).max().unwrap();
        assert_eq!(CoinType::from_code(max + 1), Err(UnknownCoin::Code(max + 1)));
        assert_eq!(
            CoinType::from_code(u32::MAX),
            Err(UnknownCoin::Code(u32::MAX))
        );
    }

    #[test]
    fn unknown_name() {
        assert!(CoinType::from_str("DOGE").is_err());
    }

    #[test]
    fn tokens_live_on_their_chain() {
        for chain in [ChainType::Eth, ChainType::Bnb] {
            for token in tokens_for_chain(chain) {
                assert_eq!(token.coin.chain(), chain);
                assert!(!token.coin.is_native());
                assert!(token.contract.starts_with("0x"));
                assert_eq!(token.contract.len(), 42);
                assert_eq!(token.contract.to_lowercase(), token.contract);
            }
        }
    }

    #[test]
    fn natives_match_chains() {
        assert_eq!(CoinType::Xmr.chain(), ChainType::Xmr);
        assert_eq!(CoinType::BscUsdBep20.chain(), ChainType::Bnb);
        assert_eq!(ChainType::Ltc.native_coin(), CoinType::Ltc);
        assert!(CoinType::Ton.is_native());
    }
}
