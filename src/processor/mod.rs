//! Per-chain payment processors.
//!
//! One processor per configured chain. A processor owns the in-memory index
//! from receiving address to pending invoice, consumes the block and
//! mempool streams of its chain's [`DaemonHub`], runs verification through
//! its [`ChainAdapter`], writes state transitions through the store, and
//! publishes every post-image on the gateway's fan-in channel.

pub(crate) mod evm;
pub(crate) mod utxo;
pub(crate) mod xmr;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, info, trace, warn};
use thiserror::Error as ThisError;
use tokio::{
    select,
    sync::{broadcast::error::RecvError, mpsc, watch, Mutex},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use uuid::Uuid;

use crate::{
    account::{ChainKeys, SubIndex},
    coin::{ChainType, CoinType, Network},
    derive::{self, DeriveError},
    invoice::{Invoice, InvoiceStatus, NewInvoiceRequest},
    listener::DaemonHub,
    rpc::{ChainBlock, ChainDaemon, ChainTx},
    storage::{Client as StorageClient, InvoiceAllocation},
    Error, PERSIST_CACHE_TIMEOUT,
};

/// Default wall-clock expiry sweep interval.
pub(crate) const DEFAULT_EXPIRY_INTERVAL: Duration = Duration::from_secs(15);

/// An invoice the processor is watching, keyed by receiving address.
#[derive(Debug, Clone)]
pub(crate) struct WatchTarget {
    pub invoice_id: Uuid,
    pub coin: CoinType,
    pub address: String,
    pub sub_index: SubIndex,
    /// Key material for verifiers that need it (Monero output scanning).
    pub keys: Option<ChainKeys>,
}

/// A block-confirmed transaction that paid its invoice in full and is
/// waiting for depth.
#[derive(Debug, Clone)]
struct PaidTx {
    txid: String,
    amount: f64,
    height: u64,
}

#[derive(Debug, Clone)]
struct WatchedInvoice {
    target: WatchTarget,
    paid: Option<PaidTx>,
    /// Set when the invoice expired; the entry is kept for the grace window
    /// so a late transaction can still confirm it.
    expired_at: Option<chrono::DateTime<Utc>>,
}

/// Chain-specific verification behaviour, injected into the shared
/// processor skeleton.
pub(crate) trait ChainAdapter<Tx: ChainTx>: Send + Sync + 'static {
    /// The chain this adapter verifies.
    fn chain(&self) -> ChainType;

    /// Configured network, used for address derivation.
    fn network(&self) -> Network;

    /// Whether `coin` is the chain's native coin or a tracked token.
    fn supports_coin(&self, coin: CoinType) -> bool;

    /// Whether verification needs the owning user's keys.
    fn needs_keys(&self) -> bool {
        false
    }

    /// Amount `tx` credits to the watched address, in the invoice coin's
    /// native unit. Zero means the transaction is irrelevant.
    fn paid_amount(&self, tx: &Tx, target: &WatchTarget) -> Result<f64, VerifyError>;
}

/// The capability set the façade needs from each processor.
#[async_trait]
pub(crate) trait Processor: Send + Sync {
    fn chain(&self) -> ChainType;

    fn supports_coin(&self, coin: CoinType) -> bool;

    /// Allocate and start watching a new invoice.
    async fn create_invoice(&self, req: &NewInvoiceRequest) -> Result<Invoice, Error>;

    /// Re-attach an already-persisted pending invoice (reload path).
    async fn attach_invoice(&self, invoice: Invoice) -> Result<(), Error>;

    /// Start the block, mempool and expiry loops. Returns once the stream
    /// subscriptions are established.
    async fn start(&self) -> Result<(), Error>;

    /// Abort the processor's tasks.
    async fn shutdown(&self);
}

/// The shared per-chain pipeline, parameterised over the daemon client and
/// the chain adapter.
pub(crate) struct ChainProcessor<D: ChainDaemon, A: ChainAdapter<D::Tx>> {
    inner: Arc<Inner<D, A>>,
}

struct Inner<D: ChainDaemon, A: ChainAdapter<D::Tx>> {
    adapter: A,
    hub: Arc<DaemonHub<D>>,
    store: StorageClient,
    events: mpsc::Sender<Invoice>,
    watched: Mutex<HashMap<String, WatchedInvoice>>,
    /// Highest block height observed on this chain.
    tip: AtomicU64,
    /// Height up to which blocks have been processed.
    last_processed: AtomicU64,
    expiry_interval: Duration,
    shutdown: watch::Receiver<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<D: ChainDaemon, A: ChainAdapter<D::Tx>> Clone for ChainProcessor<D, A> {
    fn clone(&self) -> Self {
        ChainProcessor {
            inner: self.inner.clone(),
        }
    }
}

impl<D: ChainDaemon, A: ChainAdapter<D::Tx>> ChainProcessor<D, A> {
    pub(crate) fn new(
        adapter: A,
        hub: Arc<DaemonHub<D>>,
        store: StorageClient,
        events: mpsc::Sender<Invoice>,
        expiry_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> ChainProcessor<D, A> {
        ChainProcessor {
            inner: Arc::new(Inner {
                adapter,
                hub,
                store,
                events,
                watched: Mutex::new(HashMap::new()),
                tip: AtomicU64::new(0),
                last_processed: AtomicU64::new(0),
                expiry_interval,
                shutdown,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }
}

impl<D: ChainDaemon, A: ChainAdapter<D::Tx>> Inner<D, A> {
    async fn publish(&self, invoice: Invoice) {
        if self.events.send(invoice).await.is_err() {
            error!("Invoice fan-in channel closed; update dropped");
        }
    }

    /// Load the keys a verifier needs for one user, if the adapter wants
    /// them.
    async fn verifier_keys(&self, user_id: Uuid) -> Result<Option<ChainKeys>, Error> {
        if !self.adapter.needs_keys() {
            return Ok(None);
        }
        Ok(self
            .store
            .chain_keys(user_id, self.adapter.chain())
            .await?
            .map(|record| record.keys))
    }

    async fn watch(&self, invoice: &Invoice, sub_index: SubIndex, keys: Option<ChainKeys>) {
        let entry = WatchedInvoice {
            target: WatchTarget {
                invoice_id: invoice.id,
                coin: invoice.coin,
                address: invoice.crypto_address.clone(),
                sub_index,
                keys,
            },
            paid: None,
            expired_at: (invoice.status == InvoiceStatus::Expired).then(Utc::now),
        };
        self.watched
            .lock()
            .await
            .insert(invoice.crypto_address.clone(), entry);
    }

    async fn process_block(&self, height: u64, block: &D::Block) {
        self.tip.fetch_max(height, Ordering::Relaxed);

        for tx in block.transactions() {
            self.process_tx(tx, Some(height)).await;
        }
        self.confirmation_sweep().await;

        self.last_processed.fetch_max(height, Ordering::Relaxed);
        if let Err(e) = self
            .store
            .upsert_height(self.adapter.chain(), height)
            .await
        {
            error!("Failed to persist last-seen height {height}: {e}");
        }
        if let Err(e) = self.store.flush().await {
            error!("Failed to flush the store: {e}");
        }
    }

    /// Re-fetch blocks the broadcast buffer dropped. Resumes from the last
    /// processed height so nothing is skipped.
    async fn rescan(&self) {
        let client = self.hub.client();
        let tip = match client.tip_height().await {
            Ok(tip) => tip,
            Err(e) => {
                warn!("Rescan aborted, failed to fetch tip height: {e}");
                return;
            }
        };
        let start = self.last_processed.load(Ordering::Relaxed) + 1;
        info!("Rescanning {} blocks {start}..={tip}", self.adapter.chain());
        for height in start..=tip {
            match client.block_by_height(height).await {
                Ok(block) => self.process_block(height, &block).await,
                Err(e) => {
                    warn!("Rescan aborted at height {height}: {e}");
                    return;
                }
            }
        }
    }

    async fn process_tx(&self, tx: &D::Tx, height: Option<u64>) {
        let targets: Vec<WatchTarget> = {
            let watched = self.watched.lock().await;
            watched.values().map(|w| w.target.clone()).collect()
        };

        for target in targets {
            let amount = match self.adapter.paid_amount(tx, &target) {
                Ok(amount) => amount,
                Err(e) => {
                    // One bad transaction must never block the others.
                    warn!("Failed to verify transaction {}: {e}", tx.id());
                    continue;
                }
            };
            if amount <= 0.0 {
                continue;
            }
            trace!(
                "Transaction {} credits {amount} to watched address {}",
                tx.id(),
                target.address
            );
            if let Err(e) = self.apply_credit(&target, tx.id(), amount, height).await {
                error!(
                    "Failed to apply credit from transaction {} to invoice {}: {e}",
                    tx.id(),
                    target.invoice_id
                );
            }
        }
    }

    /// Apply one observed credit to its invoice, per the invoice state
    /// machine. The invoice row is re-read first; it is the source of
    /// truth.
    async fn apply_credit(
        &self,
        target: &WatchTarget,
        txid: &str,
        amount: f64,
        height: Option<u64>,
    ) -> Result<(), Error> {
        let Some(invoice) = self.store.get_invoice(target.invoice_id).await? else {
            warn!("Watched invoice {} vanished from storage", target.invoice_id);
            self.watched.lock().await.remove(&target.address);
            return Ok(());
        };
        if invoice.status == InvoiceStatus::Confirmed {
            // First qualifying transaction wins; later ones are ignored.
            return Ok(());
        }

        // A transaction seen in the mempool and again in a block must not
        // count itself twice.
        let prior = if invoice.tx_id.as_deref() == Some(txid) {
            0.0
        } else {
            invoice.actual_amount.unwrap_or(0.0)
        };
        let sufficient = prior + amount >= invoice.required_amount;

        if sufficient {
            if let Some(height) = height {
                let mut watched = self.watched.lock().await;
                if let Some(entry) = watched.get_mut(&target.address) {
                    entry.paid = Some(PaidTx {
                        txid: txid.to_string(),
                        amount,
                        height,
                    });
                }
            }
            let confirmed = match height {
                Some(height) => self.confirmations(height) >= u64::from(invoice.confirmations_required),
                // Zero-confirmation invoices settle straight from the
                // mempool.
                None => invoice.confirmations_required == 0,
            };
            if confirmed {
                self.confirm(invoice, txid.to_string(), amount).await?;
            } else if invoice.status != InvoiceStatus::Expired {
                self.record_credit(invoice, txid, amount).await?;
            }
            // An expired invoice only changes again once the payment is
            // deep enough to confirm inside the grace window.
        } else if height.is_none() && invoice.status != InvoiceStatus::Expired {
            // Only mempool-observed partial credits move a pending invoice
            // to PENDING_MEMPOOL; an insufficient credit in a block leaves
            // it untouched.
            self.record_credit(invoice, txid, amount).await?;
        }
        Ok(())
    }

    fn confirmations(&self, height: u64) -> u64 {
        let tip = self.tip.load(Ordering::Relaxed).max(height);
        tip - height + 1
    }

    /// Store an observed (but not yet confirming) credit, moving the
    /// invoice to `PendingMempool`.
    async fn record_credit(
        &self,
        mut invoice: Invoice,
        txid: &str,
        amount: f64,
    ) -> Result<(), Error> {
        let before = invoice.clone();
        if invoice.status == InvoiceStatus::Pending {
            invoice.status = InvoiceStatus::PendingMempool;
        }
        invoice.actual_amount = Some(amount);
        invoice.tx_id = Some(txid.to_string());
        if invoice == before {
            return Ok(());
        }
        self.store.update_invoice(invoice.clone()).await?;
        self.publish(invoice).await;
        Ok(())
    }

    async fn confirm(&self, mut invoice: Invoice, txid: String, amount: f64) -> Result<(), Error> {
        invoice.status = InvoiceStatus::Confirmed;
        invoice.confirmed_at = Some(Utc::now());
        invoice.actual_amount = Some(amount);
        invoice.tx_id = Some(txid);
        self.store.finalize_invoice(invoice.clone()).await?;
        self.watched.lock().await.remove(&invoice.crypto_address);
        info!("Invoice {} confirmed", invoice.id);
        self.publish(invoice).await;
        Ok(())
    }

    /// Promote fully-paid invoices whose transaction has reached the
    /// required depth.
    async fn confirmation_sweep(&self) {
        let candidates: Vec<(WatchTarget, PaidTx)> = {
            let watched = self.watched.lock().await;
            watched
                .values()
                .filter_map(|w| w.paid.clone().map(|paid| (w.target.clone(), paid)))
                .collect()
        };

        for (target, paid) in candidates {
            let invoice = match self.store.get_invoice(target.invoice_id).await {
                Ok(Some(invoice)) => invoice,
                Ok(None) => {
                    self.watched.lock().await.remove(&target.address);
                    continue;
                }
                Err(e) => {
                    error!("Failed to load invoice {}: {e}", target.invoice_id);
                    continue;
                }
            };
            if invoice.status == InvoiceStatus::Confirmed {
                self.watched.lock().await.remove(&target.address);
                continue;
            }
            if self.confirmations(paid.height) >= u64::from(invoice.confirmations_required) {
                if let Err(e) = self.confirm(invoice, paid.txid, paid.amount).await {
                    error!("Failed to confirm invoice {}: {e}", target.invoice_id);
                }
            }
        }
    }

    /// Expire overdue invoices and drop entries whose grace window has
    /// closed.
    async fn expiry_sweep(&self) {
        let now = Utc::now();
        let entries: Vec<(String, Uuid, Option<chrono::DateTime<Utc>>)> = {
            let watched = self.watched.lock().await;
            watched
                .iter()
                .map(|(address, w)| (address.clone(), w.target.invoice_id, w.expired_at))
                .collect()
        };

        for (address, invoice_id, expired_at) in entries {
            if let Some(expired_at) = expired_at {
                if (now - expired_at).to_std().unwrap_or_default() > PERSIST_CACHE_TIMEOUT {
                    debug!("Dropping expired invoice {invoice_id} after its grace window");
                    self.watched.lock().await.remove(&address);
                }
                continue;
            }

            let invoice = match self.store.get_invoice(invoice_id).await {
                Ok(Some(invoice)) => invoice,
                Ok(None) => {
                    self.watched.lock().await.remove(&address);
                    continue;
                }
                Err(e) => {
                    error!("Failed to load invoice {invoice_id}: {e}");
                    continue;
                }
            };
            if !invoice.is_past_expiry(now) || invoice.is_terminal() {
                continue;
            }

            let mut expired = invoice;
            expired.status = InvoiceStatus::Expired;
            if let Err(e) = self.store.finalize_invoice(expired.clone()).await {
                error!("Failed to expire invoice {invoice_id}: {e}");
                continue;
            }
            if let Some(entry) = self.watched.lock().await.get_mut(&address) {
                entry.expired_at = Some(now);
            }
            info!("Invoice {invoice_id} expired");
            self.publish(expired).await;
        }
    }
}

#[async_trait]
impl<D: ChainDaemon, A: ChainAdapter<D::Tx>> Processor for ChainProcessor<D, A> {
    fn chain(&self) -> ChainType {
        self.inner.adapter.chain()
    }

    fn supports_coin(&self, coin: CoinType) -> bool {
        self.inner.adapter.supports_coin(coin)
    }

    async fn create_invoice(&self, req: &NewInvoiceRequest) -> Result<Invoice, Error> {
        let inner = &self.inner;
        if !inner.adapter.supports_coin(req.coin) {
            return Err(Error::UnsupportedCoin(req.coin));
        }
        if !inner.store.user_exists(req.user_id).await? {
            return Err(Error::NoSuchUser(req.user_id));
        }

        let now = Utc::now();
        let allocation = InvoiceAllocation {
            user_id: req.user_id,
            coin: req.coin,
            chain: inner.adapter.chain(),
            amount: req.amount,
            confirmations: req.confirmations,
            created_at: now,
            expires_at: now + req.timeout,
        };
        let chain = inner.adapter.chain();
        let network = inner.adapter.network();
        let derive = move |keys: &ChainKeys, index: SubIndex| -> Result<String, DeriveError> {
            derive::derive_address(keys, chain, network, index)
        };
        let (invoice, address) = inner
            .store
            .allocate_invoice(allocation, Box::new(derive))
            .await?;

        let keys = inner.verifier_keys(req.user_id).await?;
        inner.watch(&invoice, address.sub_index, keys).await;
        debug!(
            "Now tracking invoice {} to address {}",
            invoice.id, invoice.crypto_address
        );

        inner.publish(invoice.clone()).await;
        Ok(invoice)
    }

    async fn attach_invoice(&self, invoice: Invoice) -> Result<(), Error> {
        let inner = &self.inner;
        let sub_index = inner
            .store
            .get_address(inner.adapter.chain(), invoice.crypto_address.clone())
            .await?
            .map(|address| address.sub_index)
            .unwrap_or_default();
        let keys = inner.verifier_keys(invoice.user_id).await?;
        inner.watch(&invoice, sub_index, keys).await;

        // If a payment was already observed in a block, recover its height
        // so confirmation tracking picks up where it left off.
        if let Some(txid) = invoice.tx_id.clone() {
            match inner.hub.client().tx_height(&txid).await {
                Ok(Some(height)) => {
                    let mut watched = inner.watched.lock().await;
                    if let Some(entry) = watched.get_mut(&invoice.crypto_address) {
                        entry.paid = Some(PaidTx {
                            txid,
                            amount: invoice.actual_amount.unwrap_or_default(),
                            height,
                        });
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to look up transaction {txid} on reload: {e}"),
            }
        }
        debug!(
            "Re-attached invoice {} at address {}",
            invoice.id, invoice.crypto_address
        );
        Ok(())
    }

    async fn start(&self) -> Result<(), Error> {
        let inner = &self.inner;
        let chain = inner.adapter.chain();

        // Initialize the height trackers before consuming any event.
        let stored = inner.store.get_height(chain).await?;
        let start_height = match stored {
            Some(height) => height,
            None => inner.hub.client().tip_height().await?,
        };
        inner.tip.store(start_height, Ordering::Relaxed);
        inner.last_processed.store(start_height, Ordering::Relaxed);
        inner.hub.resume_after(start_height).await;

        let mut blocks = inner.hub.subscribe_blocks();
        let mut mempool = inner.hub.subscribe_mempool();
        let mut tasks = inner.tasks.lock().await;

        let block_inner = self.inner.clone();
        let mut block_shutdown = inner.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                select! {
                    _ = block_shutdown.changed() => break,
                    event = blocks.recv() => match event {
                        Ok(event) => block_inner.process_block(event.height, &event.block).await,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Block stream lagged by {skipped} events; rescanning");
                            block_inner.rescan().await;
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        }));

        let mempool_inner = self.inner.clone();
        let mut mempool_shutdown = inner.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                select! {
                    _ = mempool_shutdown.changed() => break,
                    event = mempool.recv() => match event {
                        Ok(tx) => mempool_inner.process_tx(&tx, None).await,
                        Err(RecvError::Lagged(skipped)) => {
                            // Dropped mempool transactions resurface in
                            // blocks; nothing to re-fetch here.
                            warn!("Mempool stream lagged by {skipped} events");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        }));

        let expiry_inner = self.inner.clone();
        let mut expiry_shutdown = inner.shutdown.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = time::interval(expiry_inner.expiry_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                select! {
                    _ = expiry_shutdown.changed() => break,
                    _ = ticker.tick() => expiry_inner.expiry_sweep().await,
                }
            }
        }));

        info!("{chain} processor started at height {start_height}");
        Ok(())
    }

    async fn shutdown(&self) {
        let mut tasks = self.inner.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

/// An error verifying a transaction against a watched invoice.
#[derive(ThisError, Debug)]
pub(crate) enum VerifyError {
    /// The verifier needs the user's keys and none are attached.
    #[error("verification requires keys that are not registered")]
    MissingKeys,
    /// Attached key material does not parse.
    #[error("invalid key material: {0}")]
    Keys(#[from] DeriveError),
    /// The transaction could not be interpreted.
    #[error("malformed transaction: {0}")]
    Malformed(String),
}
