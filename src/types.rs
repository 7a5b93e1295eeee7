//! Common type definitions for the chain notification engine.
//!
//! This module contains:
//! - The core event payloads (`BlockEpoch`, `TxConfirmation`, `SpendDetail`)
//! - The subscriber-facing event handles returned by the registration calls
//! - The internal one-shot confirmation cell with retraction support

use std::sync::{Arc, Mutex};

use dashcore::{BlockHash, OutPoint, Transaction, Txid};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

/// A block that became part of the best chain.
///
/// The `(height, hash)` pair uniquely identifies a block on a specific fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEpoch {
    /// Height of the block in the best chain.
    pub height: i32,

    /// Hash of the block.
    pub hash: BlockHash,
}

/// The position of a confirmed transaction within a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxConfirmation {
    /// Hash of the block containing the transaction.
    pub block_hash: BlockHash,

    /// Height of the block containing the transaction.
    pub block_height: u32,

    /// Index of the transaction within the block.
    pub tx_index: u32,
}

/// Full description of a spend of a watched outpoint.
#[derive(Debug, Clone)]
pub struct SpendDetail {
    /// The outpoint that was spent.
    pub spent_outpoint: OutPoint,

    /// Txid of the spending transaction.
    pub spender_tx_hash: Txid,

    /// The spending transaction itself.
    pub spending_tx: Transaction,

    /// Index of the input within the spending transaction that consumes
    /// the outpoint.
    pub spender_input_index: u32,

    /// Height of the block containing the spend, or best height + 1 when
    /// the spend was only seen in the mempool.
    pub spending_height: i32,
}

/// Cancellation messages submitted from subscriber handles to the dispatcher.
#[derive(Debug, Clone, Copy)]
pub(crate) enum CancelRequest {
    Spend {
        outpoint: OutPoint,
        spend_id: u64,
    },
    Epoch {
        epoch_id: u64,
    },
}

// ============ One-shot confirmation cell ============

#[derive(Debug, Default)]
struct ConfirmedState {
    value: Option<TxConfirmation>,
    closed: bool,
}

#[derive(Debug, Default)]
struct ConfirmedShared {
    state: Mutex<ConfirmedState>,
    notify: Notify,
}

/// Receiving half of the one-shot confirmation cell.
///
/// Yields at most one [`TxConfirmation`], then `None`. The notifier may
/// retract an undelivered value when a reorg rolls back the confirming
/// block; a retracted value is never observed by the subscriber.
#[derive(Debug)]
pub struct ConfirmedReceiver {
    shared: Arc<ConfirmedShared>,
}

impl ConfirmedReceiver {
    /// Receive the confirmation, or `None` once the cell is closed.
    pub async fn recv(&mut self) -> Option<TxConfirmation> {
        loop {
            {
                let mut state = self.shared.state.lock().unwrap();
                if let Some(conf) = state.value.take() {
                    return Some(conf);
                }
                if state.closed {
                    return None;
                }
            }
            self.shared.notify.notified().await;
        }
    }
}

/// Sending half of the one-shot confirmation cell. Dropping it closes the
/// cell, releasing any buffered value to the subscriber first.
#[derive(Debug)]
pub(crate) struct ConfirmedSender {
    shared: Arc<ConfirmedShared>,
}

impl ConfirmedSender {
    /// Deliver the confirmation and close the cell.
    pub(crate) fn send(&self, conf: TxConfirmation) {
        let mut state = self.shared.state.lock().unwrap();
        if state.closed && state.value.is_none() {
            // Cancelled before delivery.
            return;
        }
        state.value = Some(conf);
        state.closed = true;
        drop(state);
        self.shared.notify.notify_one();
    }

    /// Take back an undelivered confirmation, reopening the cell.
    ///
    /// Returns false if the subscriber already consumed the value, in which
    /// case the retraction is a no-op.
    pub(crate) fn retract(&self) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        if state.value.take().is_some() {
            state.closed = false;
            true
        } else {
            false
        }
    }
}

impl Drop for ConfirmedSender {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock().unwrap();
        state.closed = true;
        drop(state);
        self.shared.notify.notify_one();
    }
}

/// Create a connected one-shot confirmation cell pair.
pub(crate) fn confirmation_channel() -> (ConfirmedSender, ConfirmedReceiver) {
    let shared = Arc::new(ConfirmedShared::default());
    (
        ConfirmedSender {
            shared: shared.clone(),
        },
        ConfirmedReceiver {
            shared,
        },
    )
}

// ============ Subscriber event handles ============

/// Subscriber handle for a transaction confirmation registration.
///
/// All streams close with no final value if the notifier shuts down.
#[derive(Debug)]
pub struct ConfirmationEvent {
    /// Yields the confirmation once the transaction reaches its requested
    /// depth on the best chain. At most one value is ever produced.
    pub confirmed: ConfirmedReceiver,

    /// Ticks with the number of confirmations still required, emitted each
    /// time the best chain advances while the registration is pending.
    pub updates: mpsc::UnboundedReceiver<u32>,

    /// Reserved for reorgs that exceed the handling the engine performs
    /// internally. Closed at teardown.
    pub negative_conf: mpsc::UnboundedReceiver<i32>,
}

/// Subscriber handle for an outpoint spend registration.
#[derive(Debug)]
pub struct SpendEvent {
    pub(crate) spend: mpsc::Receiver<SpendDetail>,
    pub(crate) outpoint: OutPoint,
    pub(crate) spend_id: u64,
    pub(crate) cancel_tx: mpsc::Sender<CancelRequest>,
    pub(crate) shutdown: CancellationToken,
}

impl SpendEvent {
    /// Receive the spend details, or `None` once the channel closes.
    ///
    /// At most one [`SpendDetail`] is ever delivered; the channel closes
    /// immediately after it.
    pub async fn recv(&mut self) -> Option<SpendDetail> {
        self.spend.recv().await
    }

    /// The identifier of this registration.
    pub fn spend_id(&self) -> u64 {
        self.spend_id
    }

    /// Cancel the registration.
    ///
    /// If a spend fires concurrently, the subscriber observes either the
    /// single spend followed by the close, or the close alone. After this
    /// returns no further values can arrive.
    pub async fn cancel(mut self) {
        let msg = CancelRequest::Spend {
            outpoint: self.outpoint,
            spend_id: self.spend_id,
        };
        tokio::select! {
            res = self.cancel_tx.send(msg) => {
                if res.is_ok() {
                    // Drain until the dispatcher closes the channel so a
                    // concurrent fire cannot race the cancellation.
                    while self.spend.recv().await.is_some() {}
                }
            }
            _ = self.shutdown.cancelled() => {}
        }
    }
}

/// Subscriber handle for a block epoch registration.
#[derive(Debug)]
pub struct BlockEpochEvent {
    pub(crate) epochs: mpsc::Receiver<BlockEpoch>,
    pub(crate) epoch_id: u64,
    pub(crate) cancel_tx: mpsc::Sender<CancelRequest>,
    pub(crate) shutdown: CancellationToken,
}

impl BlockEpochEvent {
    /// Receive the next block epoch, or `None` once the channel closes.
    ///
    /// Epochs arrive in strictly increasing height with no gaps, starting
    /// from the height this subscriber was caught up to.
    pub async fn recv(&mut self) -> Option<BlockEpoch> {
        self.epochs.recv().await
    }

    /// The identifier of this registration.
    pub fn epoch_id(&self) -> u64 {
        self.epoch_id
    }

    /// Cancel the registration, draining any in-flight epochs.
    pub async fn cancel(mut self) {
        let msg = CancelRequest::Epoch {
            epoch_id: self.epoch_id,
        };
        tokio::select! {
            res = self.cancel_tx.send(msg) => {
                if res.is_ok() {
                    while self.epochs.recv().await.is_some() {}
                }
            }
            _ = self.shutdown.cancelled() => {}
        }
    }
}
