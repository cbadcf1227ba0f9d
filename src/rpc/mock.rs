//! A programmable mock daemon. Returns whatever state the test pushed into
//! it, for exercising processors without a network.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
};

use super::{ChainBlock, ChainDaemon, ChainTx, RpcError};

struct MockState<B: ChainBlock> {
    blocks: BTreeMap<u64, B>,
    mempool: Vec<B::Tx>,
    tip: u64,
}

/// A mock chain daemon over any block type. Tests push blocks and mempool
/// transactions; the client serves them like a real daemon would.
pub struct MockDaemon<B: ChainBlock> {
    state: Arc<Mutex<MockState<B>>>,
}

impl<B: ChainBlock> Clone for MockDaemon<B> {
    fn clone(&self) -> Self {
        MockDaemon {
            state: self.state.clone(),
        }
    }
}

impl<B: ChainBlock> Default for MockDaemon<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: ChainBlock> MockDaemon<B> {
    /// A mock daemon with an empty chain. Push at least one block before
    /// pointing a hub at it.
    #[must_use]
    pub fn new() -> MockDaemon<B> {
        MockDaemon {
            state: Arc::new(Mutex::new(MockState {
                blocks: BTreeMap::new(),
                mempool: Vec::new(),
                tip: 0,
            })),
        }
    }

    /// Append a block, advancing the tip to its height.
    pub fn push_block(&self, block: B) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.tip = state.tip.max(block.height());
        state.blocks.insert(block.height(), block);
    }

    /// Add a transaction to the mempool.
    pub fn add_mempool_tx(&self, tx: B::Tx) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .mempool
            .push(tx);
    }

    /// Empty the mempool, as a daemon does when transactions are mined.
    pub fn clear_mempool(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .mempool
            .clear();
    }
}

impl<B: ChainBlock> ChainDaemon for MockDaemon<B> {
    type Block = B;
    type Tx = B::Tx;

    async fn tip_height(&self) -> Result<u64, RpcError> {
        Ok(self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .tip)
    }

    async fn block_by_height(&self, height: u64) -> Result<B, RpcError> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .blocks
            .get(&height)
            .cloned()
            .ok_or_else(|| RpcError::Mock(format!("block {height}").into()))
    }

    async fn mempool_txids(&self) -> Result<Vec<String>, RpcError> {
        Ok(self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .mempool
            .iter()
            .map(|tx| tx.id().to_string())
            .collect())
    }

    async fn transactions_by_ids(&self, ids: &[String]) -> Result<Vec<B::Tx>, RpcError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state
            .mempool
            .iter()
            .filter(|tx| ids.iter().any(|id| id == tx.id()))
            .cloned()
            .collect())
    }

    async fn tx_height(&self, id: &str) -> Result<Option<u64>, RpcError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        for (height, block) in &state.blocks {
            if block.transactions().iter().any(|tx| tx.id() == id) {
                return Ok(Some(*height));
            }
        }
        Ok(None)
    }

    fn url(&self) -> String {
        "mock://daemon".to_string()
    }
}
