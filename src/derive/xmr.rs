use std::str::FromStr;

use monero::{cryptonote::subaddress, Network as MoneroNetwork, PrivateKey, PublicKey, ViewPair};

use super::DeriveError;
use crate::{
    account::SubIndex,
    coin::Network,
};

/// Derive a Monero subaddress from a view pair at the given coordinate,
/// encoded with the configured network's address prefix.
///
/// The (0, 0) coordinate yields the wallet's primary address, per the
/// standard subaddress scheme.
///
/// # Errors
///
/// Returns [`DeriveError::InvalidKey`] for keys that do not parse and
/// [`DeriveError::InvalidNetwork`] for Bitcoin-family networks.
pub fn monero_subaddress(
    private_view_key: &str,
    public_spend_key: &str,
    index: SubIndex,
    network: Network,
) -> Result<String, DeriveError> {
    let net = match network {
        Network::Mainnet => MoneroNetwork::Mainnet,
        Network::Stagenet => MoneroNetwork::Stagenet,
        Network::Testnet => MoneroNetwork::Testnet,
        Network::Signet | Network::Regtest => return Err(DeriveError::InvalidNetwork),
    };
    let pair = view_pair(private_view_key, public_spend_key)?;
    let address = subaddress::get_subaddress(
        &pair,
        subaddress::Index {
            major: index.major,
            minor: index.minor,
        },
        Some(net),
    );
    Ok(address.to_string())
}

/// Parse a (private view key, public spend key) pair from hex.
pub(crate) fn view_pair(
    private_view_key: &str,
    public_spend_key: &str,
) -> Result<ViewPair, DeriveError> {
    let view = PrivateKey::from_str(private_view_key)
        .map_err(|e| DeriveError::InvalidKey(format!("private view key: {e}")))?;
    let spend = PublicKey::from_str(public_spend_key)
        .map_err(|e| DeriveError::InvalidKey(format!("public spend key: {e}")))?;
    Ok(ViewPair { view, spend })
}
