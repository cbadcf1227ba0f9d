use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::Duration as ChronoDuration;
use uuid::Uuid;

use crate::{
    account::{ChainKeys, CryptoAddress, KeyRecord},
    coin::ChainType,
    invoice::Invoice,
    storage::{
        AddressStorage, DeriveFn, HeightStorage, InvoiceAllocation, InvoiceStorage, Storage,
        StorageError, UserStorage,
    },
};

/// In-memory store. Invoices held in memory are not recoverable on power
/// loss; use a durable store in production.
#[derive(Default)]
pub struct InMemory {
    users: HashSet<Uuid>,
    keys: HashMap<(Uuid, ChainType), KeyRecord>,
    addresses: BTreeMap<(ChainType, String), CryptoAddress>,
    invoices: BTreeMap<Uuid, Invoice>,
    heights: HashMap<ChainType, u64>,
}

impl InMemory {
    /// Create a new in-memory store.
    #[must_use]
    pub fn new() -> InMemory {
        InMemory::default()
    }
}

impl UserStorage for InMemory {
    fn create_user(&mut self, id: Option<Uuid>) -> Result<Uuid, StorageError> {
        let id = id.unwrap_or_else(Uuid::new_v4);
        if !self.users.insert(id) {
            return Err(StorageError::UserExists(id));
        }
        Ok(id)
    }

    fn user_exists(&self, id: Uuid) -> Result<bool, StorageError> {
        Ok(self.users.contains(&id))
    }

    fn upsert_chain_keys(
        &mut self,
        user_id: Uuid,
        chain: ChainType,
        keys: ChainKeys,
    ) -> Result<(), StorageError> {
        if !self.users.contains(&user_id) {
            return Err(StorageError::NoSuchUser(user_id));
        }
        self.keys.insert((user_id, chain), KeyRecord::new(keys));
        // New keys derive a new address space; release the old addresses.
        for address in self.addresses.values_mut() {
            if address.user_id == user_id && address.chain == chain {
                address.is_occupied = false;
            }
        }
        Ok(())
    }

    fn chain_keys(
        &self,
        user_id: Uuid,
        chain: ChainType,
    ) -> Result<Option<KeyRecord>, StorageError> {
        Ok(self.keys.get(&(user_id, chain)).cloned())
    }
}

impl AddressStorage for InMemory {
    fn get_address(
        &self,
        chain: ChainType,
        address: &str,
    ) -> Result<Option<CryptoAddress>, StorageError> {
        Ok(self.addresses.get(&(chain, address.to_string())).cloned())
    }
}

impl InvoiceStorage for InMemory {
    fn update_invoice(&mut self, invoice: &Invoice) -> Result<(), StorageError> {
        if !self.invoices.contains_key(&invoice.id) {
            return Err(StorageError::NoSuchInvoice(invoice.id));
        }
        self.invoices.insert(invoice.id, invoice.clone());
        Ok(())
    }

    fn get_invoice(&self, id: Uuid) -> Result<Option<Invoice>, StorageError> {
        Ok(self.invoices.get(&id).cloned())
    }

    fn pending_invoices(&self) -> Result<Vec<Invoice>, StorageError> {
        Ok(self
            .invoices
            .values()
            .filter(|invoice| !invoice.is_terminal())
            .cloned()
            .collect())
    }

    fn shift_expirations(&mut self, by: ChronoDuration) -> Result<usize, StorageError> {
        let mut changed = 0;
        for invoice in self.invoices.values_mut() {
            if invoice.status != crate::invoice::InvoiceStatus::Confirmed {
                invoice.expires_at += by;
                changed += 1;
            }
        }
        Ok(changed)
    }
}

impl HeightStorage for InMemory {
    fn get_height(&self, chain: ChainType) -> Result<Option<u64>, StorageError> {
        Ok(self.heights.get(&chain).copied())
    }

    fn upsert_height(&mut self, chain: ChainType, height: u64) -> Result<(), StorageError> {
        self.heights.insert(chain, height);
        Ok(())
    }
}

impl Storage for InMemory {
    fn allocate_invoice(
        &mut self,
        allocation: &InvoiceAllocation,
        derive: &DeriveFn,
    ) -> Result<(Invoice, CryptoAddress), StorageError> {
        if !self.users.contains(&allocation.user_id) {
            return Err(StorageError::NoSuchUser(allocation.user_id));
        }
        let record = self
            .keys
            .get(&(allocation.user_id, allocation.chain))
            .ok_or(StorageError::KeysNotRegistered(allocation.chain))?;

        // Run every fallible step before mutating anything, so a failure
        // leaves the store untouched.
        let next_index = record.last_index.next();
        let address_string = derive(&record.keys, next_index)?;
        if let Some(existing) = self
            .addresses
            .get(&(allocation.chain, address_string.clone()))
        {
            if existing.is_occupied {
                return Err(StorageError::DuplicateAddress(address_string));
            }
        }

        let address = CryptoAddress {
            chain: allocation.chain,
            address: address_string.clone(),
            user_id: allocation.user_id,
            is_occupied: true,
            sub_index: next_index,
        };
        let invoice = Invoice {
            id: Uuid::new_v4(),
            user_id: allocation.user_id,
            coin: allocation.coin,
            crypto_address: address_string.clone(),
            required_amount: allocation.amount,
            actual_amount: None,
            confirmations_required: allocation.confirmations,
            status: crate::invoice::InvoiceStatus::Pending,
            created_at: allocation.created_at,
            confirmed_at: None,
            expires_at: allocation.expires_at,
            tx_id: None,
        };

        if let Some(record) = self.keys.get_mut(&(allocation.user_id, allocation.chain)) {
            record.last_index = next_index;
        }
        self.addresses
            .insert((allocation.chain, address_string), address.clone());
        self.invoices.insert(invoice.id, invoice.clone());

        Ok((invoice, address))
    }

    fn finalize_invoice(&mut self, invoice: &Invoice) -> Result<(), StorageError> {
        self.update_invoice(invoice)?;
        if invoice.is_terminal() {
            if let Some(address) = self
                .addresses
                .get_mut(&(invoice.coin.chain(), invoice.crypto_address.clone()))
            {
                address.is_occupied = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::InMemory;
    use crate::{
        account::{ChainKeys, SubIndex, MAX_MINOR_INDEX},
        coin::{ChainType, CoinType},
        derive::DeriveError,
        invoice::InvoiceStatus,
        storage::{AddressStorage, InvoiceAllocation, Storage, StorageError, UserStorage},
    };

    fn allocation(user_id: Uuid) -> InvoiceAllocation {
        let now = Utc::now();
        InvoiceAllocation {
            user_id,
            coin: CoinType::Btc,
            chain: ChainType::Btc,
            amount: 0.01,
            confirmations: 2,
            created_at: now,
            expires_at: now + chrono::Duration::seconds(3600),
        }
    }

    fn store_with_user() -> (InMemory, Uuid) {
        let mut store = InMemory::new();
        let user = store.create_user(None).unwrap();
        store
            .upsert_chain_keys(
                user,
                ChainType::Btc,
                ChainKeys::Extended {
                    master_public_key: "xpub-under-test".to_string(),
                },
            )
            .unwrap();
        (store, user)
    }

    #[test]
    fn duplicate_user_rejected() {
        let mut store = InMemory::new();
        let id = Uuid::new_v4();
        store.create_user(Some(id)).unwrap();
        assert!(matches!(
            store.create_user(Some(id)),
            Err(StorageError::UserExists(other)) if other == id
        ));
    }

    #[test]
    fn allocation_advances_cursor_once() {
        let (mut store, user) = store_with_user();
        let derive = |_keys: &ChainKeys, index: SubIndex| -> Result<String, DeriveError> {
            Ok(format!("addr-{index}"))
        };

        let (invoice, address) = store.allocate_invoice(&allocation(user), &derive).unwrap();
        assert_eq!(address.sub_index, SubIndex::new(0, 1));
        assert_eq!(invoice.crypto_address, "addr-0/1");
        assert_eq!(invoice.status, InvoiceStatus::Pending);
        assert!(address.is_occupied);

        let (_, address) = store.allocate_invoice(&allocation(user), &derive).unwrap();
        assert_eq!(address.sub_index, SubIndex::new(0, 2));
    }

    #[test]
    fn minor_overflow_carries_major() {
        let (mut store, user) = store_with_user();
        store
            .keys
            .get_mut(&(user, ChainType::Btc))
            .unwrap()
            .last_index = SubIndex::new(0, MAX_MINOR_INDEX);

        let derive = |_keys: &ChainKeys, index: SubIndex| -> Result<String, DeriveError> {
            Ok(format!("addr-{index}"))
        };
        let (_, address) = store.allocate_invoice(&allocation(user), &derive).unwrap();
        assert_eq!(address.sub_index, SubIndex::new(1, 0));
    }

    #[test]
    fn failed_derivation_leaves_cursor_alone() {
        let (mut store, user) = store_with_user();
        let derive = |_keys: &ChainKeys, _index: SubIndex| -> Result<String, DeriveError> {
            Err(DeriveError::DerivationOutOfRange)
        };
        assert!(store.allocate_invoice(&allocation(user), &derive).is_err());

        let derive = |_keys: &ChainKeys, index: SubIndex| -> Result<String, DeriveError> {
            Ok(format!("addr-{index}"))
        };
        let (_, address) = store.allocate_invoice(&allocation(user), &derive).unwrap();
        assert_eq!(address.sub_index, SubIndex::new(0, 1));
    }

    #[test]
    fn finalize_releases_address() {
        let (mut store, user) = store_with_user();
        let derive = |_keys: &ChainKeys, index: SubIndex| -> Result<String, DeriveError> {
            Ok(format!("addr-{index}"))
        };
        let (mut invoice, address) = store.allocate_invoice(&allocation(user), &derive).unwrap();

        invoice.status = InvoiceStatus::Expired;
        store.finalize_invoice(&invoice).unwrap();

        let stored = AddressStorage::get_address(&store, ChainType::Btc, &address.address)
            .unwrap()
            .unwrap();
        assert!(!stored.is_occupied);
    }
}
