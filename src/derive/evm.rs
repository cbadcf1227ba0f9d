use std::str::FromStr;

use bitcoin::{
    bip32::{ChildNumber, Xpub},
    secp256k1::Secp256k1,
};
use sha3::{Digest, Keccak256};

use super::DeriveError;
use crate::account::SubIndex;

/// Derive an EVM account address from an extended public key at the given
/// derivation coordinate.
///
/// The address is the last 20 bytes of the Keccak-256 digest of the child's
/// uncompressed public key without its leading sign byte, rendered as
/// `0x`-prefixed lowercase hex. EIP-55 checksum casing is deliberately not
/// applied; comparisons elsewhere are case-insensitive.
///
/// # Errors
///
/// Returns [`DeriveError::InvalidKey`] if the xpub does not parse or cannot
/// derive at the requested coordinate.
pub fn evm_address(master_public_key: &str, index: SubIndex) -> Result<String, DeriveError> {
    let xpub = Xpub::from_str(master_public_key)
        .map_err(|e| DeriveError::InvalidKey(e.to_string()))?;

    let path = [
        ChildNumber::from_normal_idx(index.major)
            .map_err(|_| DeriveError::DerivationOutOfRange)?,
        ChildNumber::from_normal_idx(index.minor)
            .map_err(|_| DeriveError::DerivationOutOfRange)?,
    ];
    let secp = Secp256k1::verification_only();
    let child = xpub
        .derive_pub(&secp, &path)
        .map_err(|e| DeriveError::InvalidKey(e.to_string()))?;

    let uncompressed = child.public_key.serialize_uncompressed();
    let digest = Keccak256::digest(&uncompressed[1..]);
    Ok(format!("0x{}", hex::encode(&digest[12..])))
}
