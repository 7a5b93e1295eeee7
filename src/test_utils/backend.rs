//! Mock chain backend for testing.
//!
//! The mock maintains an in-memory best chain plus every block it has ever
//! fabricated (so header walks across reorged-out forks resolve), and lets
//! tests drive the notifier by emitting chain events by hand.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use dashcore::blockdata::constants::genesis_block;
use dashcore::hashes::Hash;
use dashcore::{
    block::Header as BlockHeader, Block, BlockHash, Network, OutPoint, Transaction, TxOut, Txid,
};
use tokio::sync::mpsc;

use crate::chain::{ChainBackend, ChainEvent};
use crate::error::{BackendError, BackendResult};
use crate::types::BlockEpoch;

struct ChainData {
    /// Best chain block hashes, indexed by height.
    chain: Vec<BlockHash>,
    /// Every block ever fabricated, with the height it was built at.
    blocks: HashMap<BlockHash, (Block, i32)>,
    tx_index_enabled: bool,
    watched_outpoints: Vec<OutPoint>,
    blocks_subscribed: bool,
    nonce: u32,
}

/// Mock chain backend.
pub struct MockChainBackend {
    state: Mutex<ChainData>,
    event_tx: mpsc::UnboundedSender<ChainEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<ChainEvent>>>,
}

fn make_header(prev: BlockHash, nonce: u32) -> BlockHeader {
    BlockHeader {
        version: dashcore::block::Version::from_consensus(1),
        prev_blockhash: prev,
        merkle_root: dashcore::hashes::sha256d::Hash::all_zeros().into(),
        time: 1_700_000_000 + nonce,
        bits: dashcore::CompactTarget::from_consensus(0x207fffff),
        nonce,
    }
}

impl MockChainBackend {
    /// Create a backend whose chain holds only the regtest genesis block.
    pub fn new() -> Self {
        Self::with_chain_height(0)
    }

    /// Create a backend with a chain of empty blocks up to `height`.
    pub fn with_chain_height(height: i32) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let genesis = genesis_block(Network::Regtest);
        let genesis_hash = genesis.header.block_hash();

        let mut data = ChainData {
            chain: vec![genesis_hash],
            blocks: HashMap::from([(genesis_hash, (genesis, 0))]),
            tx_index_enabled: true,
            watched_outpoints: Vec::new(),
            blocks_subscribed: false,
            nonce: 0,
        };

        for _ in 0..height {
            Self::append_block(&mut data, Vec::new());
        }

        Self {
            state: Mutex::new(data),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
        }
    }

    fn append_block(data: &mut ChainData, txs: Vec<Transaction>) -> BlockEpoch {
        data.nonce += 1;
        let prev = *data.chain.last().expect("chain always has genesis");
        let header = make_header(prev, data.nonce);
        let hash = header.block_hash();
        let height = data.chain.len() as i32;

        data.blocks.insert(
            hash,
            (
                Block {
                    header,
                    txdata: txs,
                },
                height,
            ),
        );
        data.chain.push(hash);

        BlockEpoch {
            height,
            hash,
        }
    }

    /// The current best block.
    pub fn tip(&self) -> BlockEpoch {
        let data = self.state.lock().unwrap();
        BlockEpoch {
            height: (data.chain.len() - 1) as i32,
            hash: *data.chain.last().unwrap(),
        }
    }

    /// The best-chain block at `height`.
    pub fn block_epoch_at(&self, height: i32) -> BlockEpoch {
        let data = self.state.lock().unwrap();
        BlockEpoch {
            height,
            hash: data.chain[height as usize],
        }
    }

    /// Append a block to the best chain without emitting an event.
    pub fn extend_tip(&self, txs: Vec<Transaction>) -> BlockEpoch {
        let mut data = self.state.lock().unwrap();
        Self::append_block(&mut data, txs)
    }

    /// Append a block and emit `BlockConnected` for it.
    pub fn mine_block(&self, txs: Vec<Transaction>) -> BlockEpoch {
        let epoch = self.extend_tip(txs);
        self.emit(ChainEvent::BlockConnected {
            height: epoch.height,
            hash: epoch.hash,
        });
        epoch
    }

    /// Mine `count` empty blocks, emitting `BlockConnected` for each.
    pub fn mine_empty_blocks(&self, count: usize) -> Vec<BlockEpoch> {
        (0..count).map(|_| self.mine_block(Vec::new())).collect()
    }

    /// Pop the best block and emit `BlockDisconnected` for it.
    pub fn disconnect_tip(&self) -> BlockEpoch {
        let epoch = {
            let mut data = self.state.lock().unwrap();
            assert!(data.chain.len() > 1, "cannot disconnect genesis");
            let hash = data.chain.pop().unwrap();
            BlockEpoch {
                height: data.chain.len() as i32,
                hash,
            }
        };
        self.emit(ChainEvent::BlockDisconnected {
            height: epoch.height,
            hash: epoch.hash,
        });
        epoch
    }

    /// Fabricate a side chain branching off the best-chain block at
    /// `fork_height`, one entry per element of `txs_per_block`. The fork is
    /// recorded but the best chain is left untouched.
    pub fn build_fork_with_txs(
        &self,
        fork_height: i32,
        txs_per_block: Vec<Vec<Transaction>>,
    ) -> Vec<BlockEpoch> {
        let mut data = self.state.lock().unwrap();
        let mut prev = data.chain[fork_height as usize];
        let mut epochs = Vec::new();

        for (offset, txs) in txs_per_block.into_iter().enumerate() {
            data.nonce += 1;
            let header = make_header(prev, data.nonce);
            let hash = header.block_hash();
            let height = fork_height + offset as i32 + 1;

            data.blocks.insert(
                hash,
                (
                    Block {
                        header,
                        txdata: txs,
                    },
                    height,
                ),
            );
            prev = hash;
            epochs.push(BlockEpoch {
                height,
                hash,
            });
        }

        epochs
    }

    /// Fabricate `length` empty side-chain blocks branching at `fork_height`.
    pub fn build_fork(&self, fork_height: i32, length: usize) -> Vec<BlockEpoch> {
        self.build_fork_with_txs(fork_height, vec![Vec::new(); length])
    }

    /// Make a previously built fork the best chain. No events are emitted;
    /// tests decide what the backend reports.
    pub fn adopt_fork(&self, fork: &[BlockEpoch]) {
        let mut data = self.state.lock().unwrap();
        let first = fork.first().expect("fork must not be empty");
        data.chain.truncate(first.height as usize);
        for epoch in fork {
            assert_eq!(data.chain.len() as i32, epoch.height, "fork must be contiguous");
            data.chain.push(epoch.hash);
        }
    }

    /// Emit a chain event to the notifier.
    pub fn emit(&self, event: ChainEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Emit `BlockConnected` for the given epoch.
    pub fn emit_connected(&self, epoch: BlockEpoch) {
        self.emit(ChainEvent::BlockConnected {
            height: epoch.height,
            hash: epoch.hash,
        });
    }

    /// Enable or disable the simulated transaction index.
    pub fn set_tx_index(&self, enabled: bool) {
        self.state.lock().unwrap().tx_index_enabled = enabled;
    }

    /// Outpoints handed to `notify_spent`.
    pub fn watched_outpoints(&self) -> Vec<OutPoint> {
        self.state.lock().unwrap().watched_outpoints.clone()
    }

    /// Whether `notify_blocks` has been called.
    pub fn blocks_subscribed(&self) -> bool {
        self.state.lock().unwrap().blocks_subscribed
    }
}

impl Default for MockChainBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChainBackend for MockChainBackend {
    async fn best_block(&self) -> BackendResult<(BlockHash, i32)> {
        let data = self.state.lock().unwrap();
        Ok((*data.chain.last().unwrap(), (data.chain.len() - 1) as i32))
    }

    async fn block_hash(&self, height: i32) -> BackendResult<BlockHash> {
        let data = self.state.lock().unwrap();
        if height < 0 {
            return Err(BackendError::NotFound(format!("no block at height {}", height)));
        }
        data.chain
            .get(height as usize)
            .copied()
            .ok_or_else(|| BackendError::NotFound(format!("no block at height {}", height)))
    }

    async fn block_header(&self, hash: &BlockHash) -> BackendResult<BlockHeader> {
        let data = self.state.lock().unwrap();
        data.blocks
            .get(hash)
            .map(|(block, _)| block.header)
            .ok_or_else(|| BackendError::NotFound(format!("no header for block {}", hash)))
    }

    async fn block_header_height(&self, hash: &BlockHash) -> BackendResult<i32> {
        let data = self.state.lock().unwrap();
        data.blocks
            .get(hash)
            .map(|&(_, height)| height)
            .ok_or_else(|| BackendError::NotFound(format!("no header for block {}", hash)))
    }

    async fn block(&self, hash: &BlockHash) -> BackendResult<Block> {
        let data = self.state.lock().unwrap();
        data.blocks
            .get(hash)
            .map(|(block, _)| block.clone())
            .ok_or_else(|| BackendError::NotFound(format!("no block {}", hash)))
    }

    async fn raw_transaction_block_hash(&self, txid: &Txid) -> BackendResult<Option<BlockHash>> {
        let data = self.state.lock().unwrap();
        if !data.tx_index_enabled {
            return Err(BackendError::NoTxIndex);
        }
        for hash in &data.chain {
            let (block, _) = &data.blocks[hash];
            if block.txdata.iter().any(|tx| tx.txid() == *txid) {
                return Ok(Some(*hash));
            }
        }
        Ok(None)
    }

    async fn tx_out(
        &self,
        outpoint: &OutPoint,
        _include_mempool: bool,
    ) -> BackendResult<Option<TxOut>> {
        let data = self.state.lock().unwrap();
        let mut found = None;

        for hash in &data.chain {
            let (block, _) = &data.blocks[hash];
            for tx in &block.txdata {
                if tx.txid() == outpoint.txid {
                    found = tx.output.get(outpoint.vout as usize).cloned();
                }
                if tx.input.iter().any(|input| input.previous_output == *outpoint) {
                    // Spent on the best chain.
                    return Ok(None);
                }
            }
        }

        Ok(found)
    }

    async fn notify_blocks(&self) -> BackendResult<()> {
        self.state.lock().unwrap().blocks_subscribed = true;
        Ok(())
    }

    async fn notify_spent(&self, outpoints: &[OutPoint]) -> BackendResult<()> {
        self.state.lock().unwrap().watched_outpoints.extend_from_slice(outpoints);
        Ok(())
    }

    fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<ChainEvent>> {
        self.event_rx.lock().unwrap().take()
    }
}
