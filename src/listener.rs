//! Daemon listener hub.
//!
//! One hub per configured chain. A single poller task holds the only
//! in-flight RPC call, emits every new block in strictly ascending height
//! order and every newly seen mempool transaction, and broadcasts both to
//! any number of processor subscriptions over bounded per-subscriber
//! buffers. A subscriber that lags far enough to be dropped from its buffer
//! receives a `Lagged` error and is expected to rescan from its own
//! last-seen height.

use std::{sync::Arc, time::Duration};

use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use log::{debug, trace, warn};
use tokio::{
    select,
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};

use crate::rpc::{ChainBlock, ChainDaemon, RpcError};

/// Bound on per-subscriber event buffers.
const EVENT_CHANNEL_CAPACITY: usize = 1024;
/// Cap on the retry interval when the daemon is unreachable.
const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// A new block at the chain tip.
#[derive(Debug, Clone)]
pub(crate) struct BlockEvent<B> {
    pub height: u64,
    pub block: B,
}

struct HubState {
    /// Height of the last block delivered to subscribers.
    last_height: Option<u64>,
    /// Txids seen in the previous mempool poll.
    seen_txids: std::collections::HashSet<String>,
}

/// Shared poller for one chain daemon.
pub(crate) struct DaemonHub<D: ChainDaemon> {
    client: D,
    poll_interval: Duration,
    blocks: broadcast::Sender<BlockEvent<D::Block>>,
    mempool: broadcast::Sender<D::Tx>,
    state: Mutex<HubState>,
}

impl<D: ChainDaemon> DaemonHub<D> {
    pub(crate) fn new(client: D, poll_interval: Duration) -> DaemonHub<D> {
        let (blocks, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (mempool, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        DaemonHub {
            client,
            poll_interval,
            blocks,
            mempool,
            state: Mutex::new(HubState {
                last_height: None,
                seen_txids: std::collections::HashSet::new(),
            }),
        }
    }

    pub(crate) fn client(&self) -> &D {
        &self.client
    }

    pub(crate) fn subscribe_blocks(&self) -> broadcast::Receiver<BlockEvent<D::Block>> {
        self.blocks.subscribe()
    }

    pub(crate) fn subscribe_mempool(&self) -> broadcast::Receiver<D::Tx> {
        self.mempool.subscribe()
    }

    /// Resume block delivery after `height`; blocks at or below it are
    /// considered already handled. Without this the first poll starts at
    /// the current tip.
    pub(crate) async fn resume_after(&self, height: u64) {
        self.state.lock().await.last_height = Some(height);
    }

    /// One poll cycle: new blocks first, then the mempool delta.
    ///
    /// Partial progress is kept on error, so an interrupted cycle resumes
    /// where it stopped instead of skipping heights.
    pub(crate) async fn poll_once(&self) -> Result<(), RpcError> {
        let mut state = self.state.lock().await;

        let tip = self.client.tip_height().await?;
        let start = match state.last_height {
            Some(last) => last + 1,
            // First poll with no resume point: only watch from the tip on.
            None => {
                state.last_height = Some(tip);
                tip + 1
            }
        };
        for height in start..=tip {
            let block = self.client.block_by_height(height).await?;
            trace!(
                "New block {} with {} transactions",
                height,
                block.transactions().len()
            );
            let _ = self.blocks.send(BlockEvent { height, block });
            state.last_height = Some(height);
        }

        let snapshot: std::collections::HashSet<String> =
            self.client.mempool_txids().await?.into_iter().collect();
        let new_ids: Vec<String> = snapshot
            .iter()
            .filter(|id| !state.seen_txids.contains(*id))
            .cloned()
            .collect();
        if !new_ids.is_empty() {
            debug!("{} new mempool transactions", new_ids.len());
            for tx in self.client.transactions_by_ids(&new_ids).await? {
                let _ = self.mempool.send(tx);
            }
        }
        state.seen_txids = snapshot;

        Ok(())
    }

    /// Spawn the poller task. It runs until `shutdown` flips or its sender
    /// is dropped, retrying failed polls with capped exponential backoff.
    pub(crate) fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut poll = time::interval(hub.poll_interval);
            poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut backoff = retry_backoff();
            loop {
                select! {
                    _ = shutdown.changed() => break,
                    _ = poll.tick() => match hub.poll_once().await {
                        Ok(()) => backoff.reset(),
                        Err(e) => {
                            warn!("Failed to poll daemon at {}: {}", hub.client.url(), e);
                            if let Some(delay) = backoff.next_backoff() {
                                select! {
                                    _ = shutdown.changed() => break,
                                    () = time::sleep(delay) => {}
                                }
                            }
                        }
                    },
                }
            }
            debug!("Daemon poller for {} stopped", hub.client.url());
        })
    }
}

fn retry_backoff() -> ExponentialBackoff {
    ExponentialBackoffBuilder::default()
        .with_max_elapsed_time(None)
        .with_max_interval(MAX_RETRY_INTERVAL)
        .build()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::rpc::{
        bitcoind::{ScriptPubKey, UtxoBlock, UtxoTransaction, UtxoTxOut},
        mock::MockDaemon,
    };

    fn tx(id: &str, address: &str, value: f64) -> UtxoTransaction {
        UtxoTransaction {
            txid: id.to_string(),
            vout: vec![UtxoTxOut {
                value,
                script_pub_key: ScriptPubKey {
                    address: Some(address.to_string()),
                    addresses: Vec::new(),
                },
            }],
        }
    }

    fn block(height: u64, txs: Vec<UtxoTransaction>) -> UtxoBlock {
        UtxoBlock { height, tx: txs }
    }

    #[tokio::test]
    async fn emits_blocks_in_ascending_order() {
        let daemon = MockDaemon::<UtxoBlock>::new();
        daemon.push_block(block(0, Vec::new()));
        let hub = DaemonHub::new(daemon.clone(), Duration::from_millis(10));
        let mut blocks = hub.subscribe_blocks();

        hub.poll_once().await.unwrap();

        daemon.push_block(block(1, Vec::new()));
        daemon.push_block(block(2, Vec::new()));
        daemon.push_block(block(3, Vec::new()));
        hub.poll_once().await.unwrap();

        for expected in 1..=3 {
            let event = blocks.try_recv().unwrap();
            assert_eq!(event.height, expected);
        }
        assert!(blocks.try_recv().is_err());
    }

    #[tokio::test]
    async fn resumes_after_stored_height() {
        let daemon = MockDaemon::<UtxoBlock>::new();
        for height in 0..=4 {
            daemon.push_block(block(height, Vec::new()));
        }
        let hub = DaemonHub::new(daemon, Duration::from_millis(10));
        hub.resume_after(2).await;
        let mut blocks = hub.subscribe_blocks();

        hub.poll_once().await.unwrap();

        assert_eq!(blocks.try_recv().unwrap().height, 3);
        assert_eq!(blocks.try_recv().unwrap().height, 4);
        assert!(blocks.try_recv().is_err());
    }

    #[tokio::test]
    async fn mempool_txs_are_emitted_once() {
        let daemon = MockDaemon::<UtxoBlock>::new();
        daemon.push_block(block(0, Vec::new()));
        let hub = DaemonHub::new(daemon.clone(), Duration::from_millis(10));
        let mut mempool = hub.subscribe_mempool();

        daemon.add_mempool_tx(tx("aa", "bc1qsomewhere", 0.5));
        hub.poll_once().await.unwrap();
        hub.poll_once().await.unwrap();

        assert_eq!(mempool.try_recv().unwrap().txid, "aa");
        assert!(mempool.try_recv().is_err());
    }
}
