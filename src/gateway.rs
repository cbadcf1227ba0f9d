//! The payment gateway façade.
//!
//! Owns one processor per configured chain, the fan-in channel, the
//! subscriber registry and the shutdown signal. The RPC layer talks to
//! this type only.

use std::{str::FromStr, sync::Arc, time::Duration};

use chrono::Duration as ChronoDuration;
use hyper::Uri;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex};
use uuid::Uuid;

use crate::{
    account::ChainKeys,
    coin::{ChainType, Network},
    derive,
    invoice::{Invoice, NewInvoiceRequest},
    listener::DaemonHub,
    processor::{
        evm::EvmChain, utxo::UtxoChain, xmr::XmrChain, ChainAdapter, ChainProcessor, Processor,
        DEFAULT_EXPIRY_INTERVAL,
    },
    pubsub::{Publisher, Subscriber},
    rpc::{
        bitcoind::BitcoindRpcClient, evm::EvmRpcClient, monerod::MonerodRpcClient, ChainDaemon,
        DaemonLogin,
    },
    storage::{Client as StorageClient, Storage},
    Error, MIN_SYNC_TIMEOUT, PERSIST_CACHE_TIMEOUT, SEND_TIMEOUT,
};

/// Capacity of the fan-in channel between processors and the dispatcher.
const FAN_IN_CAPACITY: usize = 1024;

/// Connection settings for one chain daemon. An empty URL disables the
/// chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DaemonConfig {
    /// Daemon RPC URL.
    pub url: String,
    /// Optional RPC username.
    #[serde(default)]
    pub user: Option<String>,
    /// Optional RPC password.
    #[serde(default)]
    pub pass: Option<String>,
    /// Network the daemon runs on.
    #[serde(default)]
    pub network: Network,
}

impl DaemonConfig {
    fn login(&self) -> Option<DaemonLogin> {
        if self.user.is_none() && self.pass.is_none() {
            return None;
        }
        Some(DaemonLogin {
            username: self.user.clone().unwrap_or_default(),
            password: self.pass.clone().unwrap_or_default(),
        })
    }

    fn uri(&self) -> Result<Uri, Error> {
        Uri::from_str(&self.url).map_err(|e| Error::Parse {
            datatype: "Uri",
            input: self.url.clone(),
            error: e.to_string(),
        })
    }

    fn enabled(&self) -> bool {
        !self.url.is_empty()
    }
}

/// Daemon configuration for every supported chain. Chains without a config
/// (or with an empty URL) are disabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DaemonsConfig {
    /// Monero daemon.
    #[serde(default)]
    pub xmr: Option<DaemonConfig>,
    /// Bitcoin daemon.
    #[serde(default)]
    pub btc: Option<DaemonConfig>,
    /// Litecoin daemon.
    #[serde(default)]
    pub ltc: Option<DaemonConfig>,
    /// Ethereum node.
    #[serde(default)]
    pub eth: Option<DaemonConfig>,
    /// BNB Smart Chain node.
    #[serde(default)]
    pub bnb: Option<DaemonConfig>,
}

type HubStarter = Box<dyn FnOnce(watch::Receiver<bool>) -> tokio::task::JoinHandle<()> + Send>;
type ChainInit = Box<dyn FnOnce(&BuildContext) -> (Box<dyn Processor>, HubStarter) + Send>;

struct BuildContext {
    store: StorageClient,
    events: mpsc::Sender<Invoice>,
    shutdown: watch::Receiver<bool>,
    expiry_interval: Duration,
}

fn chain_init<D, A>(adapter: A, daemon: D, poll_interval: Duration) -> ChainInit
where
    D: ChainDaemon,
    A: ChainAdapter<D::Tx>,
{
    Box::new(move |ctx| {
        let hub = Arc::new(DaemonHub::new(daemon, poll_interval));
        let processor: Box<dyn Processor> = Box::new(ChainProcessor::new(
            adapter,
            hub.clone(),
            ctx.store.clone(),
            ctx.events.clone(),
            ctx.expiry_interval,
            ctx.shutdown.clone(),
        ));
        let starter: HubStarter = Box::new(move |shutdown| hub.spawn(shutdown));
        (processor, starter)
    })
}

/// A builder for the payment gateway. Configure your store, daemons and
/// intervals, then [`build`](Self::build).
pub struct PaymentGatewayBuilder<S> {
    store: S,
    daemons: DaemonsConfig,
    poll_interval: Duration,
    expiry_interval: Duration,
    extra_chains: Vec<ChainInit>,
}

impl<S: Storage> PaymentGatewayBuilder<S> {
    /// Create a new payment gateway builder over the given store.
    #[must_use]
    pub fn new(store: S) -> PaymentGatewayBuilder<S> {
        PaymentGatewayBuilder {
            store,
            daemons: DaemonsConfig::default(),
            poll_interval: MIN_SYNC_TIMEOUT,
            expiry_interval: DEFAULT_EXPIRY_INTERVAL,
            extra_chains: Vec::new(),
        }
    }

    /// Configure the chain daemons to watch. Chains with an empty URL are
    /// skipped.
    #[must_use]
    pub fn daemons(mut self, daemons: DaemonsConfig) -> PaymentGatewayBuilder<S> {
        self.daemons = daemons;
        self
    }

    /// Set the daemon poll interval. Daemons built from
    /// [`DaemonsConfig`] are never polled more often than
    /// [`MIN_SYNC_TIMEOUT`].
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> PaymentGatewayBuilder<S> {
        self.poll_interval = interval;
        self
    }

    /// Set the wall-clock expiry sweep interval. Defaults to 15 seconds.
    #[must_use]
    pub fn expiry_interval(mut self, interval: Duration) -> PaymentGatewayBuilder<S> {
        self.expiry_interval = interval;
        self
    }

    /// Add a Bitcoin-family chain backed by the given daemon client.
    /// Intended for tests with mock daemons; production chains come from
    /// [`daemons`](Self::daemons).
    #[doc(hidden)]
    #[must_use]
    pub fn utxo_chain_with_daemon<D>(
        mut self,
        chain: ChainType,
        network: Network,
        daemon: D,
    ) -> PaymentGatewayBuilder<S>
    where
        D: ChainDaemon<Tx = crate::rpc::bitcoind::UtxoTransaction>,
    {
        let poll = self.poll_interval;
        self.extra_chains
            .push(chain_init(UtxoChain::new(chain, network), daemon, poll));
        self
    }

    /// Add an EVM chain backed by the given daemon client.
    #[doc(hidden)]
    #[must_use]
    pub fn evm_chain_with_daemon<D>(mut self, chain: ChainType, daemon: D) -> PaymentGatewayBuilder<S>
    where
        D: ChainDaemon<Tx = crate::rpc::evm::EvmTransaction>,
    {
        let poll = self.poll_interval;
        self.extra_chains
            .push(chain_init(EvmChain::new(chain), daemon, poll));
        self
    }

    /// Add a Monero chain backed by the given daemon client.
    #[doc(hidden)]
    #[must_use]
    pub fn xmr_chain_with_daemon<D>(
        mut self,
        network: Network,
        daemon: D,
    ) -> PaymentGatewayBuilder<S>
    where
        D: ChainDaemon<Tx = crate::rpc::monerod::XmrTx>,
    {
        let poll = self.poll_interval;
        self.extra_chains
            .push(chain_init(XmrChain::new(network), daemon, poll));
        self
    }

    /// Build the payment gateway. Spawns the storage actor; the event
    /// loops start on [`PaymentGateway::run`].
    ///
    /// # Errors
    ///
    /// Returns an error if a configured daemon URL cannot be parsed.
    pub fn build(self) -> Result<PaymentGateway, Error> {
        let mut inits = self.extra_chains;
        let rpc_poll = self.poll_interval.max(MIN_SYNC_TIMEOUT);

        if let Some(config) = self.daemons.xmr.as_ref().filter(|c| c.enabled()) {
            let client = MonerodRpcClient::new(config.uri()?, config.login());
            inits.push(chain_init(XmrChain::new(config.network), client, rpc_poll));
        }
        for (chain, config) in [
            (ChainType::Btc, self.daemons.btc.as_ref()),
            (ChainType::Ltc, self.daemons.ltc.as_ref()),
        ] {
            if let Some(config) = config.filter(|c| c.enabled()) {
                let client = BitcoindRpcClient::new(config.uri()?, config.login());
                inits.push(chain_init(
                    UtxoChain::new(chain, config.network),
                    client,
                    rpc_poll,
                ));
            }
        }
        for (chain, config) in [
            (ChainType::Eth, self.daemons.eth.as_ref()),
            (ChainType::Bnb, self.daemons.bnb.as_ref()),
        ] {
            if let Some(config) = config.filter(|c| c.enabled()) {
                let adapter = EvmChain::new(chain);
                let contracts = adapter.tracked_contracts().map(str::to_string).collect();
                let client = EvmRpcClient::new(config.uri()?, config.login(), contracts);
                inits.push(chain_init(adapter, client, rpc_poll));
            }
        }

        let store = StorageClient::new(self.store);
        let (events_tx, events_rx) = mpsc::channel(FAN_IN_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = BuildContext {
            store: store.clone(),
            events: events_tx,
            shutdown: shutdown_rx.clone(),
            expiry_interval: self.expiry_interval,
        };

        let mut processors = Vec::with_capacity(inits.len());
        let mut hub_starters = Vec::with_capacity(inits.len());
        for init in inits {
            let (processor, starter) = init(&ctx);
            debug!("Configured {} processor", processor.chain());
            processors.push(processor);
            hub_starters.push(starter);
        }

        Ok(PaymentGateway(Arc::new(GatewayInner {
            store,
            processors,
            publisher: Arc::new(Publisher::new(SEND_TIMEOUT)),
            events_rx: Mutex::new(Some(events_rx)),
            hub_starters: Mutex::new(hub_starters),
            shutdown_tx,
            shutdown_rx,
        })))
    }
}

/// The payment gateway: tracks invoices across all configured chains and
/// streams status transitions to subscribers.
#[derive(Clone)]
pub struct PaymentGateway(Arc<GatewayInner>);

struct GatewayInner {
    store: StorageClient,
    processors: Vec<Box<dyn Processor>>,
    publisher: Arc<Publisher>,
    events_rx: Mutex<Option<mpsc::Receiver<Invoice>>>,
    hub_starters: Mutex<Vec<HubStarter>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl PaymentGateway {
    /// Create a user. With `Some(id)` the id must be unused; with `None` a
    /// fresh id is generated.
    ///
    /// # Errors
    ///
    /// Returns an error on id collision or storage failure.
    pub async fn register_user(&self, id: Option<Uuid>) -> Result<Uuid, Error> {
        let user_id = self.0.store.create_user(id).await?;
        info!("Registered user {user_id}");
        Ok(user_id)
    }

    /// Register (or replace) a user's Monero view pair. Replacing resets
    /// the subaddress cursor.
    ///
    /// # Errors
    ///
    /// Returns an error if the keys do not parse or the user does not
    /// exist.
    pub async fn update_monero_keys(
        &self,
        user_id: Uuid,
        private_view_key: String,
        public_spend_key: String,
    ) -> Result<(), Error> {
        let keys = ChainKeys::Monero {
            private_view_key,
            public_spend_key,
        };
        derive::validate_keys(&keys, ChainType::Xmr, Network::Mainnet)?;
        self.0
            .store
            .upsert_chain_keys(user_id, ChainType::Xmr, keys)
            .await?;
        Ok(())
    }

    /// Register (or replace) a user's extended public key for one of the
    /// UTXO or EVM chains. Replacing resets the derivation cursor.
    ///
    /// # Errors
    ///
    /// Returns an error if the key does not parse, cannot derive, or the
    /// user does not exist.
    pub async fn update_extended_key(
        &self,
        user_id: Uuid,
        chain: ChainType,
        master_public_key: String,
    ) -> Result<(), Error> {
        let keys = ChainKeys::Extended { master_public_key };
        derive::validate_keys(&keys, chain, Network::Mainnet)?;
        self.0.store.upsert_chain_keys(user_id, chain, keys).await?;
        Ok(())
    }

    /// Allocate a new invoice on the processor supporting the requested
    /// coin and return it. Subscribers receive the initial `PENDING`
    /// post-image.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedCoin`] if no configured processor
    /// accepts the coin, [`Error::NoSuchUser`] for an unknown user, and
    /// derivation or storage errors otherwise.
    pub async fn new_invoice(&self, req: NewInvoiceRequest) -> Result<Invoice, Error> {
        for processor in &self.0.processors {
            if processor.supports_coin(req.coin) {
                return processor.create_invoice(&req).await;
            }
        }
        Err(Error::UnsupportedCoin(req.coin))
    }

    /// Returns a [`Subscriber`] receiving every invoice status transition.
    #[must_use]
    pub fn subscribe(&self) -> Subscriber {
        self.0.publisher.subscribe()
    }

    /// Get the up-to-date invoice with the given id, if it exists.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub async fn get_invoice(&self, id: Uuid) -> Result<Option<Invoice>, Error> {
        Ok(self.0.store.get_invoice(id).await?)
    }

    /// Run the payment gateway: reload persisted pending invoices into
    /// their processors, then start the daemon pollers, processor loops
    /// and the fan-out dispatcher.
    ///
    /// Expiry deadlines of all non-confirmed invoices are first pushed
    /// forward by the grace window, so a gateway that was down does not
    /// drop payments that arrived in the meantime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyRunning`] on a second call, and storage or
    /// RPC errors from the reload.
    pub async fn run(&self) -> Result<(), Error> {
        let inner = &self.0;
        let Some(events_rx) = inner.events_rx.lock().await.take() else {
            return Err(Error::AlreadyRunning);
        };

        let grace = ChronoDuration::from_std(PERSIST_CACHE_TIMEOUT)
            .unwrap_or_else(|_| ChronoDuration::seconds(60));
        let shifted = inner.store.shift_expirations(grace).await?;
        if shifted > 0 {
            debug!("Shifted expiry of {shifted} non-confirmed invoices by the grace window");
        }

        let pending = inner.store.pending_invoices().await?;
        info!("Reloading {} pending invoices", pending.len());
        for invoice in pending {
            let Some(processor) = inner
                .processors
                .iter()
                .find(|p| p.supports_coin(invoice.coin))
            else {
                warn!(
                    "No configured processor supports pending invoice {} ({})",
                    invoice.id, invoice.coin
                );
                continue;
            };
            processor.attach_invoice(invoice).await?;
        }

        for processor in &inner.processors {
            processor.start().await?;
        }
        for starter in inner.hub_starters.lock().await.drain(..) {
            let _ = starter(inner.shutdown_rx.clone());
        }
        let _ = inner
            .publisher
            .spawn(events_rx, inner.shutdown_rx.clone());

        info!("Payment gateway running");
        Ok(())
    }

    /// Stop the payment gateway: all pollers, processor loops and the
    /// dispatcher wind down without mutating any invoice.
    pub async fn stop(&self) {
        let _ = self.0.shutdown_tx.send(true);
        for processor in &self.0.processors {
            processor.shutdown().await;
        }
        info!("Payment gateway stopped");
    }
}
