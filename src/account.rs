//! User key material and derived receiving addresses.

use std::{cmp, fmt};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::coin::ChainType;

/// A two-level derivation coordinate. The minor index increments once per
/// address allocation and carries into the major index when it saturates at
/// `i32::MAX`.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SubIndex {
    /// Major (account) index.
    pub major: u32,
    /// Minor (address) index.
    pub minor: u32,
}

/// Highest minor index before the cursor carries into the major index.
pub const MAX_MINOR_INDEX: u32 = i32::MAX as u32;

impl SubIndex {
    /// Create a new index from major and minor parts.
    #[must_use]
    pub fn new(major: u32, minor: u32) -> SubIndex {
        SubIndex { major, minor }
    }

    /// The next derivation coordinate, carrying the major index when the
    /// minor index saturates.
    #[must_use]
    pub fn next(self) -> SubIndex {
        if self.minor >= MAX_MINOR_INDEX {
            SubIndex::new(self.major + 1, 0)
        } else {
            SubIndex::new(self.major, self.minor + 1)
        }
    }
}

impl Ord for SubIndex {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
    }
}

impl PartialOrd for SubIndex {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SubIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.major, self.minor)
    }
}

/// Public key material registered for one chain. The gateway never holds
/// spend authority: an extended *public* key for the UTXO and EVM chains, a
/// view key plus public spend key for Monero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainKeys {
    /// Monero view pair, both hex encoded.
    Monero {
        /// Private view key (read-only capability).
        private_view_key: String,
        /// Public spend key.
        public_spend_key: String,
    },
    /// BIP-32 extended public key for a UTXO or EVM chain.
    Extended {
        /// Serialized xpub.
        master_public_key: String,
    },
}

/// A per-(user, chain) key row: the registered keys and the last derivation
/// coordinate handed out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    /// Registered key material.
    pub keys: ChainKeys,
    /// Cursor of the most recently allocated address.
    pub last_index: SubIndex,
}

impl KeyRecord {
    /// A fresh record with the cursor at the origin.
    #[must_use]
    pub fn new(keys: ChainKeys) -> KeyRecord {
        KeyRecord {
            keys,
            last_index: SubIndex::default(),
        }
    }
}

/// An allocated receiving address. Addresses are never deleted; when the
/// invoice using one reaches a terminal status it is merely released for
/// reuse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoAddress {
    /// Chain the address lives on.
    pub chain: ChainType,
    /// Chain-specific address string, unique within the chain.
    pub address: String,
    /// Owning user.
    pub user_id: Uuid,
    /// Whether a non-terminal invoice currently references this address.
    pub is_occupied: bool,
    /// Derivation coordinate the address was generated at.
    pub sub_index: SubIndex,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::{SubIndex, MAX_MINOR_INDEX};

    #[test]
    fn minor_increments() {
        assert_eq!(SubIndex::new(0, 0).next(), SubIndex::new(0, 1));
        assert_eq!(SubIndex::new(3, 41).next(), SubIndex::new(3, 42));
    }

    #[test]
    fn minor_carries_into_major() {
        assert_eq!(
            SubIndex::new(0, MAX_MINOR_INDEX).next(),
            SubIndex::new(1, 0)
        );
        assert_eq!(
            SubIndex::new(7, MAX_MINOR_INDEX).next(),
            SubIndex::new(8, 0)
        );
    }

    #[test]
    fn ordering_is_major_then_minor() {
        assert!(SubIndex::new(0, 100) < SubIndex::new(1, 0));
        assert!(SubIndex::new(2, 5) < SubIndex::new(2, 6));
    }
}
