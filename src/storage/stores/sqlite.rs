use std::str::FromStr;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use log::debug;
use sqlite::{version, Connection, ConnectionWithFullMutex, State, Statement, Value};
use uuid::Uuid;

use crate::{
    account::{ChainKeys, CryptoAddress, KeyRecord, SubIndex},
    coin::{ChainType, CoinType},
    invoice::{Invoice, InvoiceStatus},
    storage::{
        AddressStorage, DeriveFn, HeightStorage, InvoiceAllocation, InvoiceStorage, Storage,
        StorageError, UserStorage,
    },
};

/// `SQLite` database. Users, key records, addresses and invoices live in
/// their own tables; the two compound operations run inside `BEGIN
/// IMMEDIATE` transactions.
pub struct Sqlite {
    db: ConnectionWithFullMutex,
}

impl Sqlite {
    /// Open a `SQLite` database at the specified location, creating the
    /// schema if it does not exist. Pass `":memory:"` for an ephemeral
    /// database.
    ///
    /// # Errors
    ///
    /// Returns an error if the database could not be opened at the
    /// specified path.
    pub fn new(path: &str) -> Result<Sqlite, StorageError> {
        let db = Connection::open_with_full_mutex(path)?;
        debug!("Connection to SQLite v{} database established", version());

        db.execute(
            "CREATE TABLE IF NOT EXISTS users (
                id TEXT NOT NULL PRIMARY KEY
            );",
        )?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS crypto_keys (
                user_id           TEXT NOT NULL,
                chain             TEXT NOT NULL,
                private_view_key  TEXT,
                public_spend_key  TEXT,
                master_public_key TEXT,
                last_major        INTEGER NOT NULL,
                last_minor        INTEGER NOT NULL,
                PRIMARY KEY (user_id, chain)
            );",
        )?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS crypto_addresses (
                chain       TEXT NOT NULL,
                address     TEXT NOT NULL,
                user_id     TEXT NOT NULL,
                is_occupied INTEGER NOT NULL,
                major       INTEGER NOT NULL,
                minor       INTEGER NOT NULL,
                PRIMARY KEY (chain, address)
            );",
        )?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS invoices (
                id                     TEXT NOT NULL PRIMARY KEY,
                user_id                TEXT NOT NULL,
                coin                   INTEGER NOT NULL,
                crypto_address         TEXT NOT NULL,
                required_amount        REAL NOT NULL,
                actual_amount          REAL,
                confirmations_required INTEGER NOT NULL,
                status                 INTEGER NOT NULL,
                created_at             INTEGER NOT NULL,
                confirmed_at           INTEGER,
                expires_at             INTEGER NOT NULL,
                tx_id                  TEXT
            );",
        )?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS chain_heights (
                chain  TEXT NOT NULL PRIMARY KEY,
                height INTEGER NOT NULL
            );",
        )?;

        Ok(Sqlite { db })
    }

    fn in_transaction<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        self.db.execute("BEGIN IMMEDIATE")?;
        match f(self) {
            Ok(value) => {
                self.db.execute("COMMIT")?;
                Ok(value)
            }
            Err(e) => {
                // Preserve the original error even if the rollback fails.
                let _ = self.db.execute("ROLLBACK");
                Err(e)
            }
        }
    }

    fn write_invoice(&self, invoice: &Invoice) -> Result<usize, StorageError> {
        let mut statement = self.db.prepare(
            "UPDATE invoices SET
                actual_amount = :actual_amount,
                status = :status,
                confirmed_at = :confirmed_at,
                expires_at = :expires_at,
                tx_id = :tx_id
            WHERE id = :id",
        )?;
        statement.bind::<&[(_, Value)]>(
            &[
                (":actual_amount", option_float(invoice.actual_amount)),
                (":status", i64::from(invoice.status.code()).into()),
                (
                    ":confirmed_at",
                    option_int(invoice.confirmed_at.map(|t| t.timestamp_millis())),
                ),
                (":expires_at", invoice.expires_at.timestamp_millis().into()),
                (":tx_id", option_text(invoice.tx_id.clone())),
                (":id", invoice.id.to_string().into()),
            ][..],
        )?;
        drain(&mut statement)?;
        Ok(self.db.change_count())
    }
}

impl UserStorage for Sqlite {
    fn create_user(&mut self, id: Option<Uuid>) -> Result<Uuid, StorageError> {
        let id = id.unwrap_or_else(Uuid::new_v4);
        let mut statement = self
            .db
            .prepare("INSERT OR IGNORE INTO users (id) VALUES (:id)")?;
        statement.bind((":id", id.to_string().as_str()))?;
        drain(&mut statement)?;
        if self.db.change_count() == 0 {
            return Err(StorageError::UserExists(id));
        }
        Ok(id)
    }

    fn user_exists(&self, id: Uuid) -> Result<bool, StorageError> {
        let mut statement = self.db.prepare("SELECT 1 FROM users WHERE id = :id")?;
        statement.bind((":id", id.to_string().as_str()))?;
        Ok(statement.next()? == State::Row)
    }

    fn upsert_chain_keys(
        &mut self,
        user_id: Uuid,
        chain: ChainType,
        keys: ChainKeys,
    ) -> Result<(), StorageError> {
        if !self.user_exists(user_id)? {
            return Err(StorageError::NoSuchUser(user_id));
        }
        self.in_transaction(|store| {
            let (private_view_key, public_spend_key, master_public_key) = match &keys {
                ChainKeys::Monero {
                    private_view_key,
                    public_spend_key,
                } => (
                    Some(private_view_key.clone()),
                    Some(public_spend_key.clone()),
                    None,
                ),
                ChainKeys::Extended { master_public_key } => {
                    (None, None, Some(master_public_key.clone()))
                }
            };

            let mut statement = store.db.prepare(
                "INSERT INTO crypto_keys
                    (user_id, chain, private_view_key, public_spend_key, master_public_key,
                     last_major, last_minor)
                VALUES (:user_id, :chain, :view, :spend, :master, 0, 0)
                ON CONFLICT (user_id, chain) DO UPDATE SET
                    private_view_key = :view,
                    public_spend_key = :spend,
                    master_public_key = :master,
                    last_major = 0,
                    last_minor = 0",
            )?;
            statement.bind::<&[(_, Value)]>(
                &[
                    (":user_id", user_id.to_string().into()),
                    (":chain", chain.to_string().into()),
                    (":view", option_text(private_view_key)),
                    (":spend", option_text(public_spend_key)),
                    (":master", option_text(master_public_key)),
                ][..],
            )?;
            drain(&mut statement)?;

            // New keys derive a new address space; release the old
            // addresses.
            let mut statement = store.db.prepare(
                "UPDATE crypto_addresses SET is_occupied = 0
                WHERE user_id = :user_id AND chain = :chain",
            )?;
            statement.bind::<&[(_, Value)]>(
                &[
                    (":user_id", user_id.to_string().into()),
                    (":chain", chain.to_string().into()),
                ][..],
            )?;
            drain(&mut statement)?;
            Ok(())
        })
    }

    fn chain_keys(
        &self,
        user_id: Uuid,
        chain: ChainType,
    ) -> Result<Option<KeyRecord>, StorageError> {
        let mut statement = self.db.prepare(
            "SELECT private_view_key, public_spend_key, master_public_key,
                    last_major, last_minor
            FROM crypto_keys WHERE user_id = :user_id AND chain = :chain",
        )?;
        statement.bind::<&[(_, Value)]>(
            &[
                (":user_id", user_id.to_string().into()),
                (":chain", chain.to_string().into()),
            ][..],
        )?;
        if statement.next()? == State::Done {
            return Ok(None);
        }
        Ok(Some(read_key_record(&statement)?))
    }
}

impl AddressStorage for Sqlite {
    fn get_address(
        &self,
        chain: ChainType,
        address: &str,
    ) -> Result<Option<CryptoAddress>, StorageError> {
        let mut statement = self.db.prepare(
            "SELECT chain, address, user_id, is_occupied, major, minor
            FROM crypto_addresses WHERE chain = :chain AND address = :address",
        )?;
        statement.bind::<&[(_, Value)]>(
            &[
                (":chain", chain.to_string().into()),
                (":address", address.into()),
            ][..],
        )?;
        if statement.next()? == State::Done {
            return Ok(None);
        }
        Ok(Some(read_address(&statement)?))
    }
}

impl InvoiceStorage for Sqlite {
    fn update_invoice(&mut self, invoice: &Invoice) -> Result<(), StorageError> {
        if self.write_invoice(invoice)? == 0 {
            return Err(StorageError::NoSuchInvoice(invoice.id));
        }
        Ok(())
    }

    fn get_invoice(&self, id: Uuid) -> Result<Option<Invoice>, StorageError> {
        let mut statement = self
            .db
            .prepare(&format!("{INVOICE_SELECT} WHERE id = :id"))?;
        statement.bind((":id", id.to_string().as_str()))?;
        if statement.next()? == State::Done {
            return Ok(None);
        }
        Ok(Some(read_invoice(&statement)?))
    }

    fn pending_invoices(&self) -> Result<Vec<Invoice>, StorageError> {
        let mut statement = self.db.prepare(&format!(
            "{INVOICE_SELECT} WHERE status IN (:pending, :mempool)"
        ))?;
        statement.bind::<&[(_, Value)]>(
            &[
                (
                    ":pending",
                    i64::from(InvoiceStatus::Pending.code()).into(),
                ),
                (
                    ":mempool",
                    i64::from(InvoiceStatus::PendingMempool.code()).into(),
                ),
            ][..],
        )?;
        let mut invoices = Vec::new();
        while statement.next()? == State::Row {
            invoices.push(read_invoice(&statement)?);
        }
        Ok(invoices)
    }

    fn shift_expirations(&mut self, by: ChronoDuration) -> Result<usize, StorageError> {
        let mut statement = self.db.prepare(
            "UPDATE invoices SET expires_at = expires_at + :shift
            WHERE status != :confirmed",
        )?;
        statement.bind::<&[(_, Value)]>(
            &[
                (":shift", by.num_milliseconds().into()),
                (
                    ":confirmed",
                    i64::from(InvoiceStatus::Confirmed.code()).into(),
                ),
            ][..],
        )?;
        drain(&mut statement)?;
        Ok(self.db.change_count())
    }
}

impl HeightStorage for Sqlite {
    fn get_height(&self, chain: ChainType) -> Result<Option<u64>, StorageError> {
        let mut statement = self
            .db
            .prepare("SELECT height FROM chain_heights WHERE chain = :chain")?;
        statement.bind((":chain", chain.to_string().as_str()))?;
        if statement.next()? == State::Done {
            return Ok(None);
        }
        let height = statement.read::<i64, _>("height")?;
        Ok(u64::try_from(height).ok())
    }

    fn upsert_height(&mut self, chain: ChainType, height: u64) -> Result<(), StorageError> {
        let mut statement = self.db.prepare(
            "INSERT INTO chain_heights (chain, height) VALUES (:chain, :height)
            ON CONFLICT (chain) DO UPDATE SET height = :height",
        )?;
        let height = i64::try_from(height)
            .map_err(|_| StorageError::Database(format!("height {height} out of range")))?;
        statement.bind::<&[(_, Value)]>(
            &[
                (":chain", chain.to_string().into()),
                (":height", height.into()),
            ][..],
        )?;
        drain(&mut statement)?;
        Ok(())
    }
}

impl Storage for Sqlite {
    fn allocate_invoice(
        &mut self,
        allocation: &InvoiceAllocation,
        derive: &DeriveFn,
    ) -> Result<(Invoice, CryptoAddress), StorageError> {
        self.in_transaction(|store| {
            if !store.user_exists(allocation.user_id)? {
                return Err(StorageError::NoSuchUser(allocation.user_id));
            }
            let record = store
                .chain_keys(allocation.user_id, allocation.chain)?
                .ok_or(StorageError::KeysNotRegistered(allocation.chain))?;

            let next_index = record.last_index.next();
            let address_string = derive(&record.keys, next_index)?;

            if let Some(existing) = store.get_address(allocation.chain, &address_string)? {
                if existing.is_occupied {
                    return Err(StorageError::DuplicateAddress(address_string));
                }
            }

            // Advance the cursor.
            let mut statement = store.db.prepare(
                "UPDATE crypto_keys SET last_major = :major, last_minor = :minor
                WHERE user_id = :user_id AND chain = :chain",
            )?;
            statement.bind::<&[(_, Value)]>(
                &[
                    (":major", i64::from(next_index.major).into()),
                    (":minor", i64::from(next_index.minor).into()),
                    (":user_id", allocation.user_id.to_string().into()),
                    (":chain", allocation.chain.to_string().into()),
                ][..],
            )?;
            drain(&mut statement)?;

            // Insert (or reclaim) the address as occupied.
            let mut statement = store.db.prepare(
                "INSERT INTO crypto_addresses (chain, address, user_id, is_occupied, major, minor)
                VALUES (:chain, :address, :user_id, 1, :major, :minor)
                ON CONFLICT (chain, address) DO UPDATE SET
                    user_id = :user_id, is_occupied = 1, major = :major, minor = :minor",
            )?;
            statement.bind::<&[(_, Value)]>(
                &[
                    (":chain", allocation.chain.to_string().into()),
                    (":address", address_string.clone().into()),
                    (":user_id", allocation.user_id.to_string().into()),
                    (":major", i64::from(next_index.major).into()),
                    (":minor", i64::from(next_index.minor).into()),
                ][..],
            )?;
            drain(&mut statement)?;

            let invoice = Invoice {
                id: Uuid::new_v4(),
                user_id: allocation.user_id,
                coin: allocation.coin,
                crypto_address: address_string.clone(),
                required_amount: allocation.amount,
                actual_amount: None,
                confirmations_required: allocation.confirmations,
                status: InvoiceStatus::Pending,
                created_at: allocation.created_at,
                confirmed_at: None,
                expires_at: allocation.expires_at,
                tx_id: None,
            };
            let mut statement = store.db.prepare(
                "INSERT INTO invoices
                    (id, user_id, coin, crypto_address, required_amount, actual_amount,
                     confirmations_required, status, created_at, confirmed_at, expires_at, tx_id)
                VALUES
                    (:id, :user_id, :coin, :crypto_address, :required_amount, NULL,
                     :confirmations_required, :status, :created_at, NULL, :expires_at, NULL)",
            )?;
            statement.bind::<&[(_, Value)]>(
                &[
                    (":id", invoice.id.to_string().into()),
                    (":user_id", invoice.user_id.to_string().into()),
                    (":coin", i64::from(invoice.coin.code()).into()),
                    (":crypto_address", address_string.clone().into()),
                    (":required_amount", invoice.required_amount.into()),
                    (
                        ":confirmations_required",
                        i64::from(invoice.confirmations_required).into(),
                    ),
                    (":status", i64::from(invoice.status.code()).into()),
                    (":created_at", invoice.created_at.timestamp_millis().into()),
                    (":expires_at", invoice.expires_at.timestamp_millis().into()),
                ][..],
            )?;
            drain(&mut statement)?;

            let address = CryptoAddress {
                chain: allocation.chain,
                address: address_string,
                user_id: allocation.user_id,
                is_occupied: true,
                sub_index: next_index,
            };
            Ok((invoice, address))
        })
    }

    fn finalize_invoice(&mut self, invoice: &Invoice) -> Result<(), StorageError> {
        self.in_transaction(|store| {
            if store.write_invoice(invoice)? == 0 {
                return Err(StorageError::NoSuchInvoice(invoice.id));
            }
            if invoice.is_terminal() {
                let mut statement = store.db.prepare(
                    "UPDATE crypto_addresses SET is_occupied = 0
                    WHERE chain = :chain AND address = :address",
                )?;
                statement.bind::<&[(_, Value)]>(
                    &[
                        (":chain", invoice.coin.chain().to_string().into()),
                        (":address", invoice.crypto_address.clone().into()),
                    ][..],
                )?;
                drain(&mut statement)?;
            }
            Ok(())
        })
    }
}

const INVOICE_SELECT: &str = "SELECT id, user_id, coin, crypto_address, required_amount,
    actual_amount, confirmations_required, status, created_at, confirmed_at, expires_at, tx_id
    FROM invoices";

/// Step a mutation statement to completion, discarding any rows.
fn drain(statement: &mut Statement<'_>) -> Result<(), StorageError> {
    while statement.next()? == State::Row {}
    Ok(())
}

fn option_text(value: Option<String>) -> Value {
    value.map_or(Value::Null, Value::String)
}

fn option_float(value: Option<f64>) -> Value {
    value.map_or(Value::Null, Value::Float)
}

fn option_int(value: Option<i64>) -> Value {
    value.map_or(Value::Null, Value::Integer)
}

fn read_uuid(statement: &Statement<'_>, column: &str) -> Result<Uuid, StorageError> {
    let text = statement.read::<String, _>(column)?;
    Uuid::parse_str(&text).map_err(|e| StorageError::Database(format!("bad uuid: {e}")))
}

fn read_timestamp(millis: i64) -> Result<DateTime<Utc>, StorageError> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| StorageError::Database(format!("bad timestamp {millis}")))
}

fn read_key_record(statement: &Statement<'_>) -> Result<KeyRecord, StorageError> {
    let private_view_key = statement.read::<Option<String>, _>("private_view_key")?;
    let public_spend_key = statement.read::<Option<String>, _>("public_spend_key")?;
    let master_public_key = statement.read::<Option<String>, _>("master_public_key")?;
    let keys = match (private_view_key, public_spend_key, master_public_key) {
        (Some(private_view_key), Some(public_spend_key), _) => ChainKeys::Monero {
            private_view_key,
            public_spend_key,
        },
        (_, _, Some(master_public_key)) => ChainKeys::Extended { master_public_key },
        _ => {
            return Err(StorageError::Database(
                "key row is missing key material".to_string(),
            ))
        }
    };
    Ok(KeyRecord {
        keys,
        last_index: SubIndex::new(
            read_u32(statement, "last_major")?,
            read_u32(statement, "last_minor")?,
        ),
    })
}

fn read_address(statement: &Statement<'_>) -> Result<CryptoAddress, StorageError> {
    let chain = statement.read::<String, _>("chain")?;
    Ok(CryptoAddress {
        chain: ChainType::from_str(&chain)
            .map_err(|e| StorageError::Database(e.to_string()))?,
        address: statement.read::<String, _>("address")?,
        user_id: read_uuid(statement, "user_id")?,
        is_occupied: statement.read::<i64, _>("is_occupied")? != 0,
        sub_index: SubIndex::new(read_u32(statement, "major")?, read_u32(statement, "minor")?),
    })
}

fn read_invoice(statement: &Statement<'_>) -> Result<Invoice, StorageError> {
    let coin = read_u32(statement, "coin")?;
    let status = read_u32(statement, "status")?;
    Ok(Invoice {
        id: read_uuid(statement, "id")?,
        user_id: read_uuid(statement, "user_id")?,
        coin: CoinType::from_code(coin).map_err(|e| StorageError::Database(e.to_string()))?,
        crypto_address: statement.read::<String, _>("crypto_address")?,
        required_amount: statement.read::<f64, _>("required_amount")?,
        actual_amount: statement.read::<Option<f64>, _>("actual_amount")?,
        confirmations_required: read_u32(statement, "confirmations_required")?,
        status: InvoiceStatus::from_code(status)
            .ok_or_else(|| StorageError::Database(format!("bad status code {status}")))?,
        created_at: read_timestamp(statement.read::<i64, _>("created_at")?)?,
        confirmed_at: statement
            .read::<Option<i64>, _>("confirmed_at")?
            .map(read_timestamp)
            .transpose()?,
        expires_at: read_timestamp(statement.read::<i64, _>("expires_at")?)?,
        tx_id: statement.read::<Option<String>, _>("tx_id")?,
    })
}

fn read_u32(statement: &Statement<'_>, column: &str) -> Result<u32, StorageError> {
    let value = statement.read::<i64, _>(column)?;
    u32::try_from(value)
        .map_err(|_| StorageError::Database(format!("column {column} out of range: {value}")))
}

impl From<sqlite::Error> for StorageError {
    fn from(e: sqlite::Error) -> StorageError {
        StorageError::Database(e.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Utc;

    use super::Sqlite;
    use crate::{
        account::{ChainKeys, SubIndex},
        coin::{ChainType, CoinType},
        derive::DeriveError,
        invoice::InvoiceStatus,
        storage::{
            AddressStorage, HeightStorage, InvoiceAllocation, InvoiceStorage, Storage,
            UserStorage,
        },
    };

    fn test_store() -> Sqlite {
        Sqlite::new(":memory:").unwrap()
    }

    fn derive(_keys: &ChainKeys, index: SubIndex) -> Result<String, DeriveError> {
        Ok(format!("addr-{index}"))
    }

    fn allocate(store: &mut Sqlite) -> (crate::invoice::Invoice, uuid::Uuid) {
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
        let now = Utc::now();
        let (invoice, _) = store
            .allocate_invoice(
                &InvoiceAllocation {
                    user_id: user,
                    coin: CoinType::Btc,
                    chain: ChainType::Btc,
                    amount: 0.25,
                    confirmations: 3,
                    created_at: now,
                    expires_at: now + chrono::Duration::seconds(600),
                },
                &derive,
            )
            .unwrap();
        (invoice, user)
    }

    #[test]
    fn allocate_and_read_back() {
        let mut store = test_store();
        let (invoice, user) = allocate(&mut store);

        let read = store.get_invoice(invoice.id).unwrap().unwrap();
        assert_eq!(read, invoice);
        assert_eq!(read.user_id, user);
        assert_eq!(read.status, InvoiceStatus::Pending);

        let address = store
            .get_address(ChainType::Btc, &invoice.crypto_address)
            .unwrap()
            .unwrap();
        assert!(address.is_occupied);
        assert_eq!(address.sub_index, SubIndex::new(0, 1));

        let keys = store.chain_keys(user, ChainType::Btc).unwrap().unwrap();
        assert_eq!(keys.last_index, SubIndex::new(0, 1));
    }

    #[test]
    fn pending_excludes_terminal() {
        let mut store = test_store();
        let (mut invoice, _) = allocate(&mut store);
        assert_eq!(store.pending_invoices().unwrap().len(), 1);

        invoice.status = InvoiceStatus::Confirmed;
        invoice.confirmed_at = Some(Utc::now());
        store.finalize_invoice(&invoice).unwrap();

        assert!(store.pending_invoices().unwrap().is_empty());
        let address = store
            .get_address(ChainType::Btc, &invoice.crypto_address)
            .unwrap()
            .unwrap();
        assert!(!address.is_occupied);
    }

    #[test]
    fn shift_moves_unconfirmed_only() {
        let mut store = test_store();
        let (invoice, _) = allocate(&mut store);

        let shifted = store.shift_expirations(chrono::Duration::seconds(60)).unwrap();
        assert_eq!(shifted, 1);

        let read = store.get_invoice(invoice.id).unwrap().unwrap();
        assert_eq!(
            read.expires_at.timestamp_millis(),
            invoice.expires_at.timestamp_millis() + 60_000
        );
    }

    #[test]
    fn heights_round_trip() {
        let mut store = test_store();
        assert_eq!(store.get_height(ChainType::Btc).unwrap(), None);
        store.upsert_height(ChainType::Btc, 812_345).unwrap();
        store.upsert_height(ChainType::Btc, 812_346).unwrap();
        assert_eq!(store.get_height(ChainType::Btc).unwrap(), Some(812_346));
        assert_eq!(store.get_height(ChainType::Eth).unwrap(), None);
    }
}
