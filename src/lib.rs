//! # `ChainPay`: accept cryptocurrency payments in your application
//!
//! This library tracks invoice payments across multiple blockchains. For
//! each invoice it derives a fresh receiving address from key material the
//! owning user registered (an extended public key for the Bitcoin-like and
//! EVM chains, a view pair for Monero), watches the chain's daemon for
//! transactions crediting that address, and streams status transitions
//! (`PENDING` → `PENDING_MEMPOOL` → `CONFIRMED`, or `EXPIRED`) to any
//! number of subscribers.
//!
//! ## Key properties
//! * No hot wallet: only public key material and Monero view keys are ever
//!   stored; the gateway cannot spend anything.
//! * One fresh address per invoice, derived at a monotonically advancing
//!   (major, minor) index per user and chain.
//! * Pending invoices are persisted, so a crash or restart never drops a
//!   payment; expiry deadlines are shifted by a grace window on reload.
//! * Multiple chains are watched concurrently, each through a single
//!   shared daemon poller.
//!
//! ## Supported chains
//!
//! Monero, Bitcoin, Litecoin, Ethereum and BNB Smart Chain, with ERC-20 /
//! BEP-20 token tracking on the EVM chains.
//!
//! ```no_run
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use std::time::Duration;
//!
//! use chainpay::{
//!     storage::stores::InMemory, CoinType, DaemonConfig, DaemonsConfig, NewInvoiceRequest,
//!     PaymentGatewayBuilder,
//! };
//!
//! let gateway = PaymentGatewayBuilder::new(InMemory::new())
//!     .daemons(DaemonsConfig {
//!         btc: Some(DaemonConfig {
//!             url: "http://localhost:8332".to_string(),
//!             ..Default::default()
//!         }),
//!         ..Default::default()
//!     })
//!     .build()?;
//! gateway.run().await?;
//!
//! let user = gateway.register_user(None).await?;
//! gateway
//!     .update_extended_key(user, chainpay::ChainType::Btc, "xpub...".to_string())
//!     .await?;
//!
//! let invoice = gateway
//!     .new_invoice(NewInvoiceRequest {
//!         user_id: user,
//!         coin: CoinType::Btc,
//!         amount: 0.01,
//!         timeout: Duration::from_secs(3600),
//!         confirmations: 2,
//!     })
//!     .await?;
//! println!("pay to {}", invoice.crypto_address);
//!
//! let mut updates = gateway.subscribe();
//! while let Some(update) = updates.recv().await {
//!     println!("{update}");
//! }
//! #   Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![warn(missing_docs)]
#![warn(clippy::panic)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![allow(clippy::module_name_repetitions)]

mod account;
mod coin;
mod derive;
mod gateway;
mod invoice;
mod listener;
mod processor;
mod pubsub;
pub mod rpc;
pub mod storage;

use std::time::Duration;

pub use account::{ChainKeys, CryptoAddress, KeyRecord, SubIndex, MAX_MINOR_INDEX};
pub use coin::{
    tokens_for_chain, ChainType, CoinType, Network, TokenInfo, UnknownCoin, BEP20_TOKENS,
    ERC20_TOKENS,
};
pub use derive::{
    derive_address, evm_address, monero_subaddress, segwit_address, validate_keys, DeriveError,
};
pub use gateway::{DaemonConfig, DaemonsConfig, PaymentGateway, PaymentGatewayBuilder};
pub use invoice::{Invoice, InvoiceStatus, NewInvoiceRequest};
pub use pubsub::{Subscriber, SubscriberError};
use rpc::RpcError;
use storage::StorageError;
use thiserror::Error as ThisError;
use uuid::Uuid;

/// Floor on the daemon poll interval for RPC-backed chains.
pub const MIN_SYNC_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-subscriber delivery timeout; slower subscribers are evicted.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);
/// Grace window during which an expired invoice can still confirm, and by
/// which expiry deadlines are shifted on restart.
pub const PERSIST_CACHE_TIMEOUT: Duration = Duration::from_secs(60);

/// Library's error type.
#[derive(ThisError, Debug)]
pub enum Error {
    /// The user does not exist.
    #[error("no user with id {0}")]
    NoSuchUser(Uuid),
    /// A user with this id already exists.
    #[error("user {0} already exists")]
    UserExists(Uuid),
    /// No configured processor accepts the coin.
    #[error("coin {0} is not supported by any configured chain")]
    UnsupportedCoin(CoinType),
    /// The user has not registered keys for the chain.
    #[error("no {0} keys registered for user")]
    KeysNotRegistered(ChainType),
    /// Address derivation failed.
    #[error("address derivation failed: {0}")]
    Derive(#[from] DeriveError),
    /// A daemon RPC call failed.
    #[error("daemon RPC error: {0}")]
    Rpc(#[from] RpcError),
    /// The storage layer failed.
    #[error("storage error: {0}")]
    Storage(StorageError),
    /// Failure to parse an input value.
    #[error("failed to parse {datatype} from \"{input}\": {error}")]
    Parse {
        /// Type to parse.
        datatype: &'static str,
        /// Input to parse.
        input: String,
        /// Error encountered.
        error: String,
    },
    /// The payment gateway is already running.
    #[error("payment gateway is already running")]
    AlreadyRunning,
}

impl From<StorageError> for Error {
    fn from(e: StorageError) -> Error {
        // Domain failures surface under their own variants; everything
        // else is a storage-internal error.
        match e {
            StorageError::UserExists(id) => Error::UserExists(id),
            StorageError::NoSuchUser(id) => Error::NoSuchUser(id),
            StorageError::KeysNotRegistered(chain) => Error::KeysNotRegistered(chain),
            StorageError::Derivation(e) => Error::Derive(e),
            other => Error::Storage(other),
        }
    }
}

/// Coarse classification of an [`Error`], mirroring RPC status code
/// families.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller supplied an invalid value.
    InvalidArgument,
    /// A referenced entity does not exist.
    NotFound,
    /// The entity to create already exists.
    AlreadyExists,
    /// The operation is not supported by this configuration.
    Unsupported,
    /// A required upstream service cannot be reached.
    Unavailable,
    /// An internal failure.
    Internal,
}

impl Error {
    /// The error's coarse classification.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NoSuchUser(_) | Error::KeysNotRegistered(_) => ErrorKind::NotFound,
            Error::UserExists(_) => ErrorKind::AlreadyExists,
            Error::UnsupportedCoin(_) => ErrorKind::Unsupported,
            Error::Derive(_) | Error::Parse { .. } => ErrorKind::InvalidArgument,
            Error::Rpc(_) => ErrorKind::Unavailable,
            Error::Storage(_) | Error::AlreadyRunning => ErrorKind::Internal,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use uuid::Uuid;

    use super::{Error, ErrorKind};
    use crate::{coin::CoinType, derive::DeriveError, storage::StorageError};

    #[test]
    fn storage_domain_errors_lift_to_their_own_variants() {
        let id = Uuid::new_v4();
        assert!(matches!(
            Error::from(StorageError::NoSuchUser(id)),
            Error::NoSuchUser(other) if other == id
        ));
        assert!(matches!(
            Error::from(StorageError::UserExists(id)),
            Error::UserExists(_)
        ));
        assert!(matches!(
            Error::from(StorageError::Database("boom".to_string())),
            Error::Storage(_)
        ));
    }

    #[test]
    fn kinds() {
        assert_eq!(
            Error::NoSuchUser(Uuid::new_v4()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            Error::UnsupportedCoin(CoinType::Ton).kind(),
            ErrorKind::Unsupported
        );
        assert_eq!(
            Error::Derive(DeriveError::InvalidNetwork).kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            Error::Storage(StorageError::Receive).kind(),
            ErrorKind::Internal
        );
    }
}
