//! The capability set the notifier requires from a chain backend.
//!
//! Concrete transports (RPC, ZMQ, P2P) live outside this crate; the notifier
//! consumes them exclusively through the [`ChainBackend`] trait.

use async_trait::async_trait;
use dashcore::{block::Header as BlockHeader, Block, BlockHash, OutPoint, Transaction, TxOut, Txid};
use tokio::sync::mpsc;

use crate::error::BackendResult;

/// Metadata of the block a relevant transaction was mined in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMeta {
    /// Hash of the containing block.
    pub hash: BlockHash,

    /// Height of the containing block.
    pub height: i32,

    /// Timestamp from the containing block's header.
    pub time: u32,
}

/// A transaction the backend flagged as relevant to a watched outpoint.
#[derive(Debug, Clone)]
pub struct RelevantTx {
    /// The transaction itself.
    pub tx: Transaction,

    /// The containing block, or `None` for a mempool transaction.
    pub block: Option<BlockMeta>,
}

/// Chain events pushed by the backend after [`ChainBackend::notify_blocks`]
/// and [`ChainBackend::notify_spent`] subscriptions are active.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    /// A block was connected to the backend's best chain.
    BlockConnected {
        height: i32,
        hash: BlockHash,
    },

    /// A block was disconnected from the backend's best chain.
    BlockDisconnected {
        height: i32,
        hash: BlockHash,
    },

    /// A transaction touching a watched outpoint appeared in the mempool or
    /// in a block.
    RelevantTx(RelevantTx),
}

/// Chain backend trait abstracting the node the notifier observes.
///
/// The backend may miss blocks, reconnect at a stale tip, or deliver
/// reorgs; the notifier reconciles all of that. Implementations only need
/// to answer the queries below truthfully for the chain they currently
/// consider best (and for headers of reorged-out blocks they have seen).
#[async_trait]
pub trait ChainBackend: Send + Sync {
    /// Get the hash and height of the backend's current best block.
    async fn best_block(&self) -> BackendResult<(BlockHash, i32)>;

    /// Get the hash of the best-chain block at the given height.
    async fn block_hash(&self, height: i32) -> BackendResult<BlockHash>;

    /// Get the header for the given block hash. Must also resolve headers
    /// of stale blocks within the reorg safety horizon.
    async fn block_header(&self, hash: &BlockHash) -> BackendResult<BlockHeader>;

    /// Get the height of the block with the given hash.
    async fn block_header_height(&self, hash: &BlockHash) -> BackendResult<i32>;

    /// Get the full block for the given hash.
    async fn block(&self, hash: &BlockHash) -> BackendResult<Block>;

    /// Look up the hash of the block containing the given transaction via
    /// the backend's transaction index.
    ///
    /// Returns `Ok(None)` when the transaction is known but unconfirmed, and
    /// [`crate::error::BackendError::NoTxIndex`] when the index is not
    /// enabled; callers fall back to a manual block scan in both cases.
    async fn raw_transaction_block_hash(&self, txid: &Txid) -> BackendResult<Option<BlockHash>>;

    /// Look up an unspent output, optionally considering mempool spends.
    /// Returns `Ok(None)` if the output is absent from the UTXO set.
    async fn tx_out(&self, outpoint: &OutPoint, include_mempool: bool)
        -> BackendResult<Option<TxOut>>;

    /// Subscribe to block connect/disconnect events.
    async fn notify_blocks(&self) -> BackendResult<()>;

    /// Add outpoints to the backend's spend watch list.
    async fn notify_spent(&self, outpoints: &[OutPoint]) -> BackendResult<()>;

    /// Take the backend's event stream. Yields `None` after the first call;
    /// the stream is owned by the notification dispatcher.
    fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<ChainEvent>>;
}
