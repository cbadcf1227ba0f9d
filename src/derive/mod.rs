//! Pure address derivation.
//!
//! Each chain family gets one function from key material and a
//! [`SubIndex`](crate::SubIndex) to a receiving address string. Nothing here
//! touches the network or the store, which keeps the cursor-advance
//! transaction free to call straight into these.

mod evm;
mod utxo;
mod xmr;

pub use evm::evm_address;
use thiserror::Error;
pub use utxo::segwit_address;
pub(crate) use xmr::view_pair;
pub use xmr::monero_subaddress;

use crate::{
    account::{ChainKeys, SubIndex},
    coin::{ChainType, Network},
};

/// An error deriving a receiving address.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeriveError {
    /// The registered key material does not parse or cannot derive.
    #[error("invalid key material: {0}")]
    InvalidKey(String),
    /// The configured network is not valid for this chain.
    #[error("invalid network for this chain")]
    InvalidNetwork,
    /// The derivation coordinate is outside the non-hardened range.
    #[error("derivation index out of range")]
    DerivationOutOfRange,
}

/// Derive the receiving address for `chain` at `index` from the registered
/// key record. Dispatches to the chain family's derivation.
///
/// # Errors
///
/// Returns [`DeriveError::InvalidKey`] if the key material does not match
/// the chain or cannot derive, [`DeriveError::InvalidNetwork`] for a
/// network the chain does not have.
pub fn derive_address(
    keys: &ChainKeys,
    chain: ChainType,
    network: Network,
    index: SubIndex,
) -> Result<String, DeriveError> {
    match (chain, keys) {
        (
            ChainType::Xmr,
            ChainKeys::Monero {
                private_view_key,
                public_spend_key,
            },
        ) => monero_subaddress(private_view_key, public_spend_key, index, network),
        (ChainType::Btc | ChainType::Ltc, ChainKeys::Extended { master_public_key }) => {
            segwit_address(master_public_key, index, chain, network)
        }
        (ChainType::Eth | ChainType::Bnb, ChainKeys::Extended { master_public_key }) => {
            evm_address(master_public_key, index)
        }
        _ => Err(DeriveError::InvalidKey(format!(
            "registered keys do not match chain {chain}"
        ))),
    }
}

/// Validate key material for `chain` by running a probe derivation at the
/// cursor origin. Used when keys are registered, so invalid keys are
/// rejected before any invoice is opened against them.
///
/// # Errors
///
/// Returns the same errors as [`derive_address`].
pub fn validate_keys(
    keys: &ChainKeys,
    chain: ChainType,
    network: Network,
) -> Result<(), DeriveError> {
    derive_address(keys, chain, network, SubIndex::default()).map(|_| ())
}
