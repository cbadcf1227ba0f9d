//! Storage layer.
//!
//! The gateway can use a storage layer of your choosing: one of the
//! existing stores in [`stores`], or your own implementation of the
//! [`Storage`] trait. All access goes through the [`Client`] actor so that
//! blocking store work stays off the caller's task and every compound
//! operation is serialized on one owner.

pub mod stores;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::error;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::{
    account::{ChainKeys, CryptoAddress, KeyRecord, SubIndex},
    coin::{ChainType, CoinType},
    derive::DeriveError,
    invoice::Invoice,
};

/// Derivation callback run inside the allocation transaction, so the
/// cursor advance and the address insertion commit or fail together.
pub type DeriveFn = dyn Fn(&ChainKeys, SubIndex) -> Result<String, DeriveError> + Send + Sync;

/// Parameters for allocating a new invoice together with its address.
#[derive(Debug, Clone)]
pub struct InvoiceAllocation {
    /// Owning user; must exist.
    pub user_id: Uuid,
    /// Invoice coin.
    pub coin: CoinType,
    /// Chain whose key cursor is advanced.
    pub chain: ChainType,
    /// Amount due in the coin's native unit.
    pub amount: f64,
    /// Required confirmation depth.
    pub confirmations: u32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Expiry deadline.
    pub expires_at: DateTime<Utc>,
}

/// User and key records.
pub trait UserStorage {
    /// Create a user, with the provided id or a generated one.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UserExists`] on id collision.
    fn create_user(&mut self, id: Option<Uuid>) -> Result<Uuid, StorageError>;

    /// Whether the user exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn user_exists(&self, id: Uuid) -> Result<bool, StorageError>;

    /// Register or replace the user's keys for one chain. Replacing resets
    /// the derivation cursor and releases the chain's allocated addresses.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NoSuchUser`] if the user does not exist.
    fn upsert_chain_keys(
        &mut self,
        user_id: Uuid,
        chain: ChainType,
        keys: ChainKeys,
    ) -> Result<(), StorageError>;

    /// The user's key record for one chain, if registered.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn chain_keys(
        &self,
        user_id: Uuid,
        chain: ChainType,
    ) -> Result<Option<KeyRecord>, StorageError>;
}

/// Allocated receiving addresses. Addresses are created by
/// [`Storage::allocate_invoice`] and never deleted, only released.
pub trait AddressStorage {
    /// Look up an allocated address.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn get_address(
        &self,
        chain: ChainType,
        address: &str,
    ) -> Result<Option<CryptoAddress>, StorageError>;
}

/// Invoice records.
pub trait InvoiceStorage {
    /// Overwrite an existing invoice.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NoSuchInvoice`] if it was never inserted.
    fn update_invoice(&mut self, invoice: &Invoice) -> Result<(), StorageError>;

    /// Retrieve an invoice, `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn get_invoice(&self, id: Uuid) -> Result<Option<Invoice>, StorageError>;

    /// All invoices in a non-terminal status.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn pending_invoices(&self) -> Result<Vec<Invoice>, StorageError>;

    /// Push `expires_at` forward by `by` for every invoice that has not
    /// confirmed, returning how many rows changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn shift_expirations(&mut self, by: ChronoDuration) -> Result<usize, StorageError>;
}

/// Last-delivered block heights, per chain.
pub trait HeightStorage {
    /// Stored height for a chain, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn get_height(&self, chain: ChainType) -> Result<Option<u64>, StorageError>;

    /// Store the last-delivered height for a chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn upsert_height(&mut self, chain: ChainType, height: u64) -> Result<(), StorageError>;
}

/// A supertrait of all necessary storage capabilities, plus the two
/// compound operations that must be transactional.
pub trait Storage:
    UserStorage + AddressStorage + InvoiceStorage + HeightStorage + Send + 'static
{
    /// Allocate a new invoice: read and advance the chain's derivation
    /// cursor, derive the receiving address, insert the occupied address
    /// row and the pending invoice row. All of it commits or fails as one
    /// unit, so concurrent allocations can never share an address.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NoSuchUser`],
    /// [`StorageError::KeysNotRegistered`], a derivation error, or a store
    /// failure (after rollback).
    fn allocate_invoice(
        &mut self,
        allocation: &InvoiceAllocation,
        derive: &DeriveFn,
    ) -> Result<(Invoice, CryptoAddress), StorageError>;

    /// Write an invoice update and, if its status is terminal, release its
    /// address in the same transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NoSuchInvoice`] or a store failure (after
    /// rollback).
    fn finalize_invoice(&mut self, invoice: &Invoice) -> Result<(), StorageError>;

    /// Flush all changes to disk. The default implementation does nothing,
    /// for stores that flush on write.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush does not succeed.
    fn flush(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// The storage manager takes messages from a channel and runs the
/// corresponding store method, keeping all store access on one task.
struct Manager<S: Storage> {
    store: S,
    receiver: mpsc::Receiver<Method>,
}

impl<S: Storage> Manager<S> {
    fn handle(&mut self, message: Method) {
        match message {
            Method::CreateUser { id, response } => {
                respond(response, self.store.create_user(id), "CreateUser");
            }
            Method::UserExists { id, response } => {
                respond(response, self.store.user_exists(id), "UserExists");
            }
            Method::UpsertChainKeys {
                user_id,
                chain,
                keys,
                response,
            } => {
                respond(
                    response,
                    self.store.upsert_chain_keys(user_id, chain, keys),
                    "UpsertChainKeys",
                );
            }
            Method::ChainKeys {
                user_id,
                chain,
                response,
            } => {
                respond(response, self.store.chain_keys(user_id, chain), "ChainKeys");
            }
            Method::AllocateInvoice {
                allocation,
                derive,
                response,
            } => {
                respond(
                    response,
                    self.store.allocate_invoice(&allocation, derive.as_ref()),
                    "AllocateInvoice",
                );
            }
            Method::FinalizeInvoice { invoice, response } => {
                respond(
                    response,
                    self.store.finalize_invoice(&invoice),
                    "FinalizeInvoice",
                );
            }
            Method::UpdateInvoice { invoice, response } => {
                respond(
                    response,
                    self.store.update_invoice(&invoice),
                    "UpdateInvoice",
                );
            }
            Method::GetInvoice { id, response } => {
                respond(response, self.store.get_invoice(id), "GetInvoice");
            }
            Method::PendingInvoices { response } => {
                respond(response, self.store.pending_invoices(), "PendingInvoices");
            }
            Method::ShiftExpirations { by, response } => {
                respond(
                    response,
                    self.store.shift_expirations(by),
                    "ShiftExpirations",
                );
            }
            Method::GetAddress {
                chain,
                address,
                response,
            } => {
                respond(
                    response,
                    self.store.get_address(chain, &address),
                    "GetAddress",
                );
            }
            Method::GetHeight { chain, response } => {
                respond(response, self.store.get_height(chain), "GetHeight");
            }
            Method::UpsertHeight {
                chain,
                height,
                response,
            } => {
                respond(
                    response,
                    self.store.upsert_height(chain, height),
                    "UpsertHeight",
                );
            }
            Method::Flush { response } => {
                respond(response, self.store.flush(), "Flush");
            }
        }
    }
}

fn respond<T>(
    response: oneshot::Sender<Result<T, StorageError>>,
    result: Result<T, StorageError>,
    method: &str,
) {
    if response.send(result).is_err() {
        error!("Failed to send {method} response to storage client.");
    }
}

enum Method {
    CreateUser {
        id: Option<Uuid>,
        response: oneshot::Sender<Result<Uuid, StorageError>>,
    },
    UserExists {
        id: Uuid,
        response: oneshot::Sender<Result<bool, StorageError>>,
    },
    UpsertChainKeys {
        user_id: Uuid,
        chain: ChainType,
        keys: ChainKeys,
        response: oneshot::Sender<Result<(), StorageError>>,
    },
    ChainKeys {
        user_id: Uuid,
        chain: ChainType,
        response: oneshot::Sender<Result<Option<KeyRecord>, StorageError>>,
    },
    AllocateInvoice {
        allocation: InvoiceAllocation,
        derive: Box<DeriveFn>,
        response: oneshot::Sender<Result<(Invoice, CryptoAddress), StorageError>>,
    },
    FinalizeInvoice {
        invoice: Invoice,
        response: oneshot::Sender<Result<(), StorageError>>,
    },
    UpdateInvoice {
        invoice: Invoice,
        response: oneshot::Sender<Result<(), StorageError>>,
    },
    GetInvoice {
        id: Uuid,
        response: oneshot::Sender<Result<Option<Invoice>, StorageError>>,
    },
    PendingInvoices {
        response: oneshot::Sender<Result<Vec<Invoice>, StorageError>>,
    },
    ShiftExpirations {
        by: ChronoDuration,
        response: oneshot::Sender<Result<usize, StorageError>>,
    },
    GetAddress {
        chain: ChainType,
        address: String,
        response: oneshot::Sender<Result<Option<CryptoAddress>, StorageError>>,
    },
    GetHeight {
        chain: ChainType,
        response: oneshot::Sender<Result<Option<u64>, StorageError>>,
    },
    UpsertHeight {
        chain: ChainType,
        height: u64,
        response: oneshot::Sender<Result<(), StorageError>>,
    },
    Flush {
        response: oneshot::Sender<Result<(), StorageError>>,
    },
}

/// Async handle to the storage manager.
pub(crate) struct Client(mpsc::Sender<Method>);

impl Client {
    pub(crate) fn new<S: Storage>(store: S) -> Self {
        let (sender, receiver) = mpsc::channel(64);
        let mut manager = Manager { store, receiver };

        tokio::spawn(async move {
            while let Some(message) = manager.receiver.recv().await {
                manager.handle(message);
            }
        });

        Self(sender)
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, StorageError>>) -> Method,
    ) -> Result<T, StorageError> {
        let (sender, receiver) = oneshot::channel();
        self.0
            .send(build(sender))
            .await
            .map_err(|_| StorageError::Send)?;
        receiver.await.map_err(|_| StorageError::Receive)?
    }

    pub(crate) async fn create_user(&self, id: Option<Uuid>) -> Result<Uuid, StorageError> {
        self.call(|response| Method::CreateUser { id, response })
            .await
    }

    pub(crate) async fn user_exists(&self, id: Uuid) -> Result<bool, StorageError> {
        self.call(|response| Method::UserExists { id, response })
            .await
    }

    pub(crate) async fn upsert_chain_keys(
        &self,
        user_id: Uuid,
        chain: ChainType,
        keys: ChainKeys,
    ) -> Result<(), StorageError> {
        self.call(|response| Method::UpsertChainKeys {
            user_id,
            chain,
            keys,
            response,
        })
        .await
    }

    pub(crate) async fn chain_keys(
        &self,
        user_id: Uuid,
        chain: ChainType,
    ) -> Result<Option<KeyRecord>, StorageError> {
        self.call(|response| Method::ChainKeys {
            user_id,
            chain,
            response,
        })
        .await
    }

    pub(crate) async fn allocate_invoice(
        &self,
        allocation: InvoiceAllocation,
        derive: Box<DeriveFn>,
    ) -> Result<(Invoice, CryptoAddress), StorageError> {
        self.call(|response| Method::AllocateInvoice {
            allocation,
            derive,
            response,
        })
        .await
    }

    pub(crate) async fn finalize_invoice(&self, invoice: Invoice) -> Result<(), StorageError> {
        self.call(|response| Method::FinalizeInvoice { invoice, response })
            .await
    }

    pub(crate) async fn update_invoice(&self, invoice: Invoice) -> Result<(), StorageError> {
        self.call(|response| Method::UpdateInvoice { invoice, response })
            .await
    }

    pub(crate) async fn get_invoice(&self, id: Uuid) -> Result<Option<Invoice>, StorageError> {
        self.call(|response| Method::GetInvoice { id, response })
            .await
    }

    pub(crate) async fn pending_invoices(&self) -> Result<Vec<Invoice>, StorageError> {
        self.call(|response| Method::PendingInvoices { response })
            .await
    }

    pub(crate) async fn shift_expirations(
        &self,
        by: ChronoDuration,
    ) -> Result<usize, StorageError> {
        self.call(|response| Method::ShiftExpirations { by, response })
            .await
    }

    pub(crate) async fn get_address(
        &self,
        chain: ChainType,
        address: String,
    ) -> Result<Option<CryptoAddress>, StorageError> {
        self.call(|response| Method::GetAddress {
            chain,
            address,
            response,
        })
        .await
    }

    pub(crate) async fn get_height(&self, chain: ChainType) -> Result<Option<u64>, StorageError> {
        self.call(|response| Method::GetHeight { chain, response })
            .await
    }

    pub(crate) async fn upsert_height(
        &self,
        chain: ChainType,
        height: u64,
    ) -> Result<(), StorageError> {
        self.call(|response| Method::UpsertHeight {
            chain,
            height,
            response,
        })
        .await
    }

    pub(crate) async fn flush(&self) -> Result<(), StorageError> {
        self.call(|response| Method::Flush { response }).await
    }
}

impl Clone for Client {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

/// An error occurring while storing or retrieving records.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Attempted to create a user with an id that is taken.
    #[error("user {0} already exists")]
    UserExists(Uuid),
    /// The referenced user does not exist.
    #[error("no user with id {0}")]
    NoSuchUser(Uuid),
    /// The user has no keys registered for the chain.
    #[error("no {0} keys registered for user")]
    KeysNotRegistered(ChainType),
    /// The derived address is already allocated.
    #[error("address {0} is already allocated")]
    DuplicateAddress(String),
    /// The referenced invoice does not exist.
    #[error("no invoice with id {0}")]
    NoSuchInvoice(Uuid),
    /// Address derivation failed inside the allocation transaction.
    #[error("address derivation failed: {0}")]
    Derivation(#[from] DeriveError),
    /// An error caused by the database, or some interaction with it.
    #[error("database error: {0}")]
    Database(String),
    /// Failed to send a message to the storage manager.
    #[error("failed to send message to the storage manager")]
    Send,
    /// Failed to receive a result from the storage manager.
    #[error("failed to receive result from the storage manager")]
    Receive,
}
